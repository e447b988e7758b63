//! Minimal JSON Schema validation for structured agent output and tool
//! arguments. Covers the subset the agents declare: type, required,
//! properties, items, enum, and numeric bounds. Anything the schema does
//! not mention is accepted.

use serde_json::Value;

/// Validate `value` against `schema`. Returns the first violation found.
pub fn validate(value: &Value, schema: &Value) -> Result<(), String> {
    validate_at(value, schema, "$")
}

fn validate_at(value: &Value, schema: &Value, path: &str) -> Result<(), String> {
    if let Some(expected) = schema["type"].as_str() {
        let ok = match expected {
            "object" => value.is_object(),
            "array" => value.is_array(),
            "string" => value.is_string(),
            "integer" => value.is_i64() || value.is_u64(),
            "number" => value.is_number(),
            "boolean" => value.is_boolean(),
            "null" => value.is_null(),
            _ => true,
        };
        if !ok {
            return Err(format!("{path}: expected {expected}"));
        }
    }

    if let Some(options) = schema["enum"].as_array()
        && !options.contains(value)
    {
        return Err(format!("{path}: value not in enum"));
    }

    if let Some(minimum) = schema["minimum"].as_f64()
        && let Some(number) = value.as_f64()
        && number < minimum
    {
        return Err(format!("{path}: {number} below minimum {minimum}"));
    }
    if let Some(maximum) = schema["maximum"].as_f64()
        && let Some(number) = value.as_f64()
        && number > maximum
    {
        return Err(format!("{path}: {number} above maximum {maximum}"));
    }

    if let Some(object) = value.as_object() {
        if let Some(required) = schema["required"].as_array() {
            for key in required.iter().filter_map(|k| k.as_str()) {
                if !object.contains_key(key) {
                    return Err(format!("{path}: missing required field {key}"));
                }
            }
        }
        if let Some(properties) = schema["properties"].as_object() {
            for (key, sub_schema) in properties {
                if let Some(sub_value) = object.get(key) {
                    validate_at(sub_value, sub_schema, &format!("{path}.{key}"))?;
                }
            }
        }
    }

    if let Some(items) = value.as_array()
        && schema["items"].is_object()
    {
        for (index, item) in items.iter().enumerate() {
            validate_at(item, &schema["items"], &format!("{path}[{index}]"))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn qualification_schema() -> Value {
        json!({
            "type": "object",
            "required": ["score", "tier", "rationale"],
            "properties": {
                "score": { "type": "integer", "minimum": 0, "maximum": 100 },
                "tier": { "type": "string", "enum": ["hot", "warm", "cold", "unqualified"] },
                "rationale": { "type": "string" },
            },
        })
    }

    #[test]
    fn accepts_valid_payload() {
        let value = json!({ "score": 85, "tier": "hot", "rationale": "strong fit" });
        assert!(validate(&value, &qualification_schema()).is_ok());
    }

    #[test]
    fn rejects_missing_required() {
        let value = json!({ "score": 85, "tier": "hot" });
        let err = validate(&value, &qualification_schema()).unwrap_err();
        assert!(err.contains("rationale"));
    }

    #[test]
    fn rejects_out_of_range_and_bad_enum() {
        let value = json!({ "score": 120, "tier": "hot", "rationale": "x" });
        assert!(validate(&value, &qualification_schema()).is_err());

        let value = json!({ "score": 50, "tier": "boiling", "rationale": "x" });
        assert!(validate(&value, &qualification_schema()).is_err());
    }

    #[test]
    fn validates_array_items() {
        let schema = json!({
            "type": "array",
            "items": { "type": "object", "required": ["name"] },
        });
        assert!(validate(&json!([{ "name": "a" }]), &schema).is_ok());
        assert!(validate(&json!([{ "title": "a" }]), &schema).is_err());
    }
}
