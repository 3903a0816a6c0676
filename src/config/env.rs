//! `${VAR_NAME}` environment references in connector configs.
//!
//! Substitution runs once at load time over every string leaf of the opaque
//! config mappings. A reference to an unset variable fails validation with
//! the variable name in the error, before any connector is instantiated.

use serde_json::{Map, Value};

use super::validate::ConfigError;

/// Resolves `${VAR}` references in all string leaves of `config`, in place.
///
/// `lookup` abstracts the process environment for testability.
pub fn substitute_env(
    config: &mut Map<String, Value>,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    for value in config.values_mut() {
        substitute_value(value, lookup)?;
    }
    Ok(())
}

fn substitute_value(
    value: &mut Value,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    match value {
        Value::String(s) => {
            if s.contains("${") {
                *s = substitute_string(s, lookup)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                substitute_value(item, lookup)?;
            }
            Ok(())
        }
        Value::Object(map) => substitute_env(map, lookup),
        _ => Ok(()),
    }
}

/// Replaces every `${NAME}` occurrence in `input`.
fn substitute_string(
    input: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let Some(end) = after.find('}') else {
            // Unterminated reference: leave it verbatim. Connectors that
            // want literal "${" in a value get exactly what they wrote.
            out.push_str(&rest[start..]);
            return Ok(out);
        };

        let name = &after[..end];
        if name.is_empty() || !is_valid_var_name(name) {
            out.push_str(&rest[start..start + 2 + end + 1]);
        } else {
            match lookup(name) {
                Some(resolved) => out.push_str(&resolved),
                None => {
                    return Err(ConfigError::MissingEnvVar {
                        name: name.to_string(),
                    });
                }
            }
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

fn is_valid_var_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lookup(name: &str) -> Option<String> {
        match name {
            "TOKEN" => Some("s3cret".to_string()),
            "HOST" => Some("example.test".to_string()),
            _ => None,
        }
    }

    fn substitute(value: Value) -> Result<Value, ConfigError> {
        let mut map = value.as_object().unwrap().clone();
        substitute_env(&mut map, &lookup)?;
        Ok(Value::Object(map))
    }

    #[test]
    fn replaces_simple_reference() {
        let out = substitute(json!({"token": "${TOKEN}"})).unwrap();
        assert_eq!(out, json!({"token": "s3cret"}));
    }

    #[test]
    fn replaces_embedded_and_multiple_references() {
        let out = substitute(json!({"url": "https://${HOST}/api?key=${TOKEN}"})).unwrap();
        assert_eq!(out, json!({"url": "https://example.test/api?key=s3cret"}));
    }

    #[test]
    fn recurses_into_nested_structures() {
        let out = substitute(json!({
            "nested": {"auth": ["${TOKEN}", "static"]},
            "count": 3
        }))
        .unwrap();
        assert_eq!(
            out,
            json!({"nested": {"auth": ["s3cret", "static"]}, "count": 3})
        );
    }

    #[test]
    fn missing_variable_names_the_variable() {
        let err = substitute(json!({"token": "${UNSET_VAR}"})).unwrap_err();
        match err {
            ConfigError::MissingEnvVar { name } => assert_eq!(name, "UNSET_VAR"),
            other => panic!("expected MissingEnvVar, got {other}"),
        }
    }

    #[test]
    fn unterminated_reference_left_verbatim() {
        let out = substitute(json!({"v": "${not closed"})).unwrap();
        assert_eq!(out, json!({"v": "${not closed"}));
    }

    #[test]
    fn invalid_names_left_verbatim() {
        let out = substitute(json!({"v": "${1BAD} and ${}"})).unwrap();
        assert_eq!(out, json!({"v": "${1BAD} and ${}"}));
    }

    #[test]
    fn non_string_leaves_untouched() {
        let out = substitute(json!({"n": 42, "b": true, "nil": null})).unwrap();
        assert_eq!(out, json!({"n": 42, "b": true, "nil": null}));
    }
}
