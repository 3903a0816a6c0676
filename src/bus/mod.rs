//! Durable WAL event bus.
//!
//! Every event accepted by the engine is appended here before anything
//! downstream sees it. Records are length-prefixed JSON with a CRC32C
//! trailer, stored in size-rotated segment files. Subscribers replay from an
//! offset and then stream new appends.

pub mod frame;
pub mod segment;
pub mod wal;

pub use wal::{BusError, CompactionConfig, EventBus, FsyncPolicy, TailedEvent, Tailer, WalConfig};
