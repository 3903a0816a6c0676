//! Delivery scheduling: per-actor queues, worker pools, retry with backoff.

pub mod backoff;
pub mod scheduler;

pub use backoff::BackoffConfig;
pub use scheduler::{
    DEFAULT_DELIVER_TIMEOUT, DeliverError, DeliveryItem, DeliveryScheduler, SchedulerConfig,
};
