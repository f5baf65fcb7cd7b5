//! Conversions between the typed state and its mapping form.

use serde_json::{Map, Value};

use super::container::CodeGenerationState;
use super::keys;
use crate::errors::{FlowError, FlowResult};

/// Loosely typed form of the state used at interop boundaries.
pub type StateMap = Map<String, Value>;

impl CodeGenerationState {
    /// Converts the state into its mapping form.
    ///
    /// Absent optional fields are omitted; annotations become top-level keys.
    pub fn to_mapping(&self) -> FlowResult<StateMap> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(FlowError::TypeMismatch(format!(
                "state serialized to {other} instead of an object"
            ))),
        }
    }

    /// Builds a state from its mapping form.
    ///
    /// Missing fields take their defaults. A non-empty `issue_url` wins over
    /// `url`; either spelling may appear alone. Keys with no typed
    /// counterpart are kept as annotations so that a round trip is lossless.
    pub fn from_mapping(map: &StateMap) -> FlowResult<Self> {
        let mut map = map.clone();
        if let Some(alias) = map.remove(keys::ISSUE_URL) {
            match alias {
                Value::String(url) if !url.is_empty() => {
                    map.insert(keys::URL.to_string(), Value::String(url));
                }
                Value::String(_) | Value::Null => {}
                other => {
                    return Err(FlowError::TypeMismatch(format!(
                        "'{}' must be a string, got {other}",
                        keys::ISSUE_URL
                    )))
                }
            }
        }
        Ok(serde_json::from_value(Value::Object(map))?)
    }
}
