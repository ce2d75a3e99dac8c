//! Typed coercion of free-form text into JSON values.
//!
//! Browser forms hand us strings. A value is interpreted by trying, in order:
//! number, boolean, null, JSON object/array, and finally plain string.

use serde_json::{Map, Number, Value};

/// Result of coercing one piece of text.
#[derive(Debug, Clone, PartialEq)]
pub enum Coerced {
    Number(Number),
    Bool(bool),
    Null,
    Json(Value),
    String(String),
}

impl Coerced {
    pub fn parse(text: &str) -> Self {
        let trimmed = text.trim();

        if let Some(number) = parse_number(trimmed) {
            return Coerced::Number(number);
        }
        match trimmed {
            "true" => return Coerced::Bool(true),
            "false" => return Coerced::Bool(false),
            "null" => return Coerced::Null,
            _ => {}
        }
        if (trimmed.starts_with('{') || trimmed.starts_with('['))
            && let Ok(value) = serde_json::from_str::<Value>(trimmed)
        {
            return Coerced::Json(value);
        }
        Coerced::String(text.to_string())
    }

    pub fn into_value(self) -> Value {
        match self {
            Coerced::Number(n) => Value::Number(n),
            Coerced::Bool(b) => Value::Bool(b),
            Coerced::Null => Value::Null,
            Coerced::Json(v) => v,
            Coerced::String(s) => Value::String(s),
        }
    }

    /// The value as a non-negative integer, if it is one.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Coerced::Number(n) => n.as_u64(),
            _ => None,
        }
    }
}

fn parse_number(text: &str) -> Option<Number> {
    if text.is_empty() {
        return None;
    }
    if let Ok(i) = text.parse::<i64>() {
        return Some(Number::from(i));
    }
    text.parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .and_then(Number::from_f64)
}

/// Build a JSON object from form fields, coercing each value.
pub fn coerce_fields(fields: &Map<String, Value>) -> Map<String, Value> {
    fields
        .iter()
        .filter(|(key, _)| !key.trim().is_empty())
        .map(|(key, value)| {
            let value = match value {
                Value::String(text) => Coerced::parse(text).into_value(),
                other => other.clone(),
            };
            (key.trim().to_string(), value)
        })
        .collect()
}
