//! YAML parsing utilities using yaml-rust2
//!
//! Provides YAML parsing with conversion to serde_json::Value for typed deserialization.

use serde_json::{Map, Number, Value};
use yaml_rust2::{Yaml, YamlLoader};

use crate::Error;

/// Parse a YAML string into a serde_json::Value.
///
/// For multi-document YAML, returns only the first document.
/// Returns `Value::Null` for empty input.
pub fn parse_yaml(input: &str) -> Result<Value, Error> {
    let docs = YamlLoader::load_from_str(input)
        .map_err(|e| Error::serialization_for_kind("yaml", e.to_string()))?;
    match docs.into_iter().next() {
        Some(doc) => yaml_to_json(doc),
        None => Ok(Value::Null),
    }
}

/// Convert one YAML node; aliases and unparseable scalars are errors
fn yaml_to_json(yaml: Yaml) -> Result<Value, Error> {
    Ok(match yaml {
        Yaml::Null => Value::Null,
        Yaml::Boolean(b) => Value::Bool(b),
        Yaml::Integer(i) => Value::from(i),
        Yaml::Real(text) => real_to_json(&text)?,
        Yaml::String(s) => Value::String(s),
        Yaml::Array(items) => Value::Array(
            items
                .into_iter()
                .map(yaml_to_json)
                .collect::<Result<_, _>>()?,
        ),
        Yaml::Hash(entries) => {
            let mut object = Map::with_capacity(entries.len());
            for (key, value) in entries {
                object.insert(mapping_key(key)?, yaml_to_json(value)?);
            }
            Value::Object(object)
        }
        Yaml::Alias(_) => {
            return Err(Error::serialization_for_kind("yaml", "aliases are not supported"))
        }
        Yaml::BadValue => return Err(Error::serialization_for_kind("yaml", "bad value")),
    })
}

/// Non-finite floats have no JSON form and become null
fn real_to_json(text: &str) -> Result<Value, Error> {
    let parsed: f64 = text.parse().map_err(|e| {
        Error::serialization_for_kind("yaml", format!("invalid float '{text}': {e}"))
    })?;
    Ok(Number::from_f64(parsed).map_or(Value::Null, Value::Number))
}

/// Scalar keys are stringified; collection keys are rejected
fn mapping_key(key: Yaml) -> Result<String, Error> {
    match key {
        Yaml::String(s) | Yaml::Real(s) => Ok(s),
        Yaml::Integer(i) => Ok(i.to_string()),
        Yaml::Boolean(b) => Ok(b.to_string()),
        Yaml::Null => Ok("null".to_string()),
        _ => Err(Error::serialization_for_kind("yaml", "mapping keys must be scalars")),
    }
}
