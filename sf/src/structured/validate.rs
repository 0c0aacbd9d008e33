//! JSON Schema validation against the canonical schema
//!
//! Shared by structured-output handling and tool-argument checking, so both
//! report violations in the same shape.

use serde_json::Value;

/// A failed validation: every violation with its instance path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    pub violations: Vec<String>,
}

impl std::fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.violations.join("; "))
    }
}

/// Validate `instance` against the canonical `schema`
pub fn validate(schema: &Value, instance: &Value) -> Result<(), SchemaViolation> {
    let validator = match jsonschema::validator_for(schema) {
        Ok(v) => v,
        Err(e) => {
            return Err(SchemaViolation {
                violations: vec![format!("schema itself is invalid: {e}")],
            });
        }
    };

    let violations: Vec<String> = validator
        .iter_errors(instance)
        .map(|error| format!("{} at {}", error, error.instance_path))
        .collect();

    if violations.is_empty() {
        Ok(())
    } else {
        Err(SchemaViolation { violations })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn level_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "level": { "type": "integer", "minimum": 1, "maximum": 3 }
            },
            "required": ["level"]
        })
    }

    #[test]
    fn test_valid_instance() {
        assert!(validate(&level_schema(), &json!({"level": 2})).is_ok());
    }

    #[test]
    fn test_out_of_range_integer() {
        let err = validate(&level_schema(), &json!({"level": 5})).unwrap_err();
        assert_eq!(err.violations.len(), 1);
        assert!(err.to_string().contains("maximum"), "got: {err}");
    }

    #[test]
    fn test_missing_required_field() {
        let err = validate(&level_schema(), &json!({})).unwrap_err();
        assert!(err.to_string().contains("level"), "got: {err}");
    }

    #[test]
    fn test_multiple_violations_reported() {
        let schema = json!({
            "type": "object",
            "properties": {
                "a": { "type": "integer" },
                "b": { "type": "string" }
            },
            "required": ["a", "b"]
        });

        let err = validate(&schema, &json!({"a": "not-int", "b": 7})).unwrap_err();
        assert!(err.violations.len() >= 2, "got: {:?}", err.violations);
    }
}
