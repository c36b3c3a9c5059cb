//! JSON-Schema-subset validation for tool arguments.
//!
//! Supported keywords: `type`, `required`, `properties`, `enum`,
//! `minimum`/`maximum`, `pattern`, `items`, `minItems`/`maxItems`. Failures
//! carry a stable code so callers (and tests) can match on them.

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

/// A validation failure with a stable code.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct SchemaViolation {
    pub code: &'static str,
    pub message: String,
}

pub mod codes {
    pub const WRONG_TYPE: &str = "wrong_type";
    pub const MISSING_REQUIRED: &str = "missing_required";
    pub const NOT_IN_ENUM: &str = "not_in_enum";
    pub const BELOW_MINIMUM: &str = "below_minimum";
    pub const ABOVE_MAXIMUM: &str = "above_maximum";
    pub const PATTERN_MISMATCH: &str = "pattern_mismatch";
    pub const BAD_PATTERN: &str = "bad_pattern";
    pub const TOO_FEW_ITEMS: &str = "too_few_items";
    pub const TOO_MANY_ITEMS: &str = "too_many_items";
}

fn violation(code: &'static str, message: String) -> SchemaViolation {
    SchemaViolation { code, message }
}

/// Validates `value` against `schema`. The first failure wins.
pub fn validate(value: &Value, schema: &Value) -> Result<(), SchemaViolation> {
    validate_at(value, schema, "$")
}

fn validate_at(value: &Value, schema: &Value, path: &str) -> Result<(), SchemaViolation> {
    if let Some(expected) = schema.get("type").and_then(|t| t.as_str()) {
        if !type_matches(value, expected) {
            return Err(violation(
                codes::WRONG_TYPE,
                format!("{path}: expected {expected}, got {}", type_name(value)),
            ));
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(|e| e.as_array()) {
        if !allowed.contains(value) {
            return Err(violation(
                codes::NOT_IN_ENUM,
                format!("{path}: value not in enum"),
            ));
        }
    }

    if let Some(n) = value.as_f64() {
        if let Some(min) = schema.get("minimum").and_then(|m| m.as_f64()) {
            if n < min {
                return Err(violation(
                    codes::BELOW_MINIMUM,
                    format!("{path}: {n} below minimum {min}"),
                ));
            }
        }
        if let Some(max) = schema.get("maximum").and_then(|m| m.as_f64()) {
            if n > max {
                return Err(violation(
                    codes::ABOVE_MAXIMUM,
                    format!("{path}: {n} above maximum {max}"),
                ));
            }
        }
    }

    if let (Some(s), Some(pattern)) = (value.as_str(), schema.get("pattern").and_then(|p| p.as_str()))
    {
        let re = Regex::new(pattern)
            .map_err(|e| violation(codes::BAD_PATTERN, format!("{path}: {e}")))?;
        if !re.is_match(s) {
            return Err(violation(
                codes::PATTERN_MISMATCH,
                format!("{path}: value does not match {pattern}"),
            ));
        }
    }

    if let Some(obj) = value.as_object() {
        if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
            for name in required.iter().filter_map(|r| r.as_str()) {
                if !obj.contains_key(name) {
                    return Err(violation(
                        codes::MISSING_REQUIRED,
                        format!("{path}: missing required property '{name}'"),
                    ));
                }
            }
        }
        if let Some(props) = schema.get("properties").and_then(|p| p.as_object()) {
            for (name, sub) in props {
                if let Some(v) = obj.get(name) {
                    validate_at(v, sub, &format!("{path}.{name}"))?;
                }
            }
        }
    }

    if let Some(items) = value.as_array() {
        if let Some(min) = schema.get("minItems").and_then(|m| m.as_u64()) {
            if (items.len() as u64) < min {
                return Err(violation(
                    codes::TOO_FEW_ITEMS,
                    format!("{path}: fewer than {min} items"),
                ));
            }
        }
        if let Some(max) = schema.get("maxItems").and_then(|m| m.as_u64()) {
            if (items.len() as u64) > max {
                return Err(violation(
                    codes::TOO_MANY_ITEMS,
                    format!("{path}: more than {max} items"),
                ));
            }
        }
        if let Some(item_schema) = schema.get("items") {
            for (i, item) in items.iter().enumerate() {
                validate_at(item, item_schema, &format!("{path}[{i}]"))?;
            }
        }
    }

    Ok(())
}

fn type_matches(value: &Value, expected: &str) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "pattern": "^/" },
                "limit": { "type": "integer", "minimum": 1, "maximum": 100 },
                "mode": { "type": "string", "enum": ["fast", "slow"] },
                "tags": { "type": "array", "items": { "type": "string" }, "maxItems": 3 }
            },
            "required": ["path"]
        })
    }

    #[test]
    fn valid_arguments_are_accepted() {
        let args = json!({ "path": "/a", "limit": 10, "mode": "fast", "tags": ["x"] });
        assert!(validate(&args, &schema()).is_ok());
    }

    #[test]
    fn each_violation_has_a_stable_code() {
        let cases = [
            (json!({}), codes::MISSING_REQUIRED),
            (json!({ "path": 7 }), codes::WRONG_TYPE),
            (json!({ "path": "a" }), codes::PATTERN_MISMATCH),
            (json!({ "path": "/a", "limit": 0 }), codes::BELOW_MINIMUM),
            (json!({ "path": "/a", "limit": 1000 }), codes::ABOVE_MAXIMUM),
            (json!({ "path": "/a", "mode": "warp" }), codes::NOT_IN_ENUM),
            (
                json!({ "path": "/a", "tags": ["1", "2", "3", "4"] }),
                codes::TOO_MANY_ITEMS,
            ),
        ];
        for (args, code) in cases {
            let err = validate(&args, &schema()).unwrap_err();
            assert_eq!(err.code, code, "args: {args}");
        }
    }

    #[test]
    fn validation_is_stable_across_repeats() {
        let args = json!({ "path": 7 });
        let a = validate(&args, &schema()).unwrap_err();
        let b = validate(&args, &schema()).unwrap_err();
        assert_eq!(a, b);
    }
}
