use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::EncodeError;

/// A dynamically shaped payload value attached to custom events, signal
/// metadata and crash environments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

pub type ValueMap = BTreeMap<String, Value>;

impl Value {
    /// Encode into the collector's JSON representation.
    ///
    /// Non-finite doubles have no JSON form and fail the whole value rather
    /// than being silently rewritten to `null`.
    pub fn to_json(&self) -> Result<serde_json::Value, EncodeError> {
        self.encode_at("$")
    }

    fn encode_at(&self, path: &str) -> Result<serde_json::Value, EncodeError> {
        Ok(match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Double(d) => serde_json::Number::from_f64(*d)
                .map(serde_json::Value::Number)
                .ok_or_else(|| EncodeError::NonFiniteNumber {
                    path: path.to_string(),
                })?,
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => serde_json::Value::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(idx, item)| item.encode_at(&format!("{path}[{idx}]")))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            Value::Map(map) => serde_json::Value::Object(encode_entries(map, path)?),
        })
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

/// Encode a whole map, e.g. an event payload or crash environment.
pub fn encode_map(map: &ValueMap) -> Result<serde_json::Map<String, serde_json::Value>, EncodeError> {
    encode_entries(map, "$")
}

fn encode_entries(
    map: &ValueMap,
    path: &str,
) -> Result<serde_json::Map<String, serde_json::Value>, EncodeError> {
    let mut out = serde_json::Map::with_capacity(map.len());
    for (key, value) in map {
        out.insert(key.clone(), value.encode_at(&format!("{path}.{key}"))?);
    }
    Ok(out)
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        i64::try_from(value)
            .map(Value::Int)
            .unwrap_or(Value::Double(value as f64))
    }
}

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        Value::from(value as u64)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(value: Vec<T>) -> Self {
        Value::Array(value.into_iter().map(Into::into).collect())
    }
}

impl From<ValueMap> for Value {
    fn from(value: ValueMap) -> Self {
        Value::Map(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_values_encode_to_json() {
        let mut inner = ValueMap::new();
        inner.insert("retries".into(), Value::from(3));
        inner.insert("ratio".into(), Value::from(0.5));

        let value = Value::Map(
            [
                ("screen".to_string(), Value::from("checkout")),
                ("flags".to_string(), Value::from(vec![true, false])),
                ("inner".to_string(), Value::Map(inner)),
                ("missing".to_string(), Value::from(None::<String>)),
            ]
            .into_iter()
            .collect(),
        );

        let json = value.to_json().unwrap();
        assert_eq!(json["screen"], "checkout");
        assert_eq!(json["flags"][1], false);
        assert_eq!(json["inner"]["retries"], 3);
        assert_eq!(json["inner"]["ratio"], 0.5);
        assert!(json["missing"].is_null());
    }

    #[test]
    fn non_finite_double_reports_its_path() {
        let mut map = ValueMap::new();
        map.insert("samples".into(), Value::Array(vec![Value::from(1.0), Value::Double(f64::NAN)]));

        let err = encode_map(&map).unwrap_err();
        assert_eq!(
            err,
            EncodeError::NonFiniteNumber {
                path: "$.samples[1]".into()
            }
        );
    }

    #[test]
    fn untagged_serde_keeps_integers_and_doubles_apart() {
        let parsed: Value = serde_json::from_str(r#"{"a": 1, "b": 1.5, "c": null}"#).unwrap();
        let Value::Map(map) = parsed else {
            panic!("expected map");
        };
        assert_eq!(map["a"], Value::Int(1));
        assert_eq!(map["b"], Value::Double(1.5));
        assert_eq!(map["c"], Value::Null);
    }
}
