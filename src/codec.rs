//! Typed payload boundary.
//!
//! All durable payloads (activity inputs/outputs, orchestration inputs,
//! external-event data) travel as strings; typed callers go through this
//! codec so that a malformed payload surfaces as a schema error instead
//! of a panic.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// JSON codec used by the typed client/context/registry helpers.
pub struct Json;

impl Json {
    pub fn encode<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
        serde_json::to_string(value)
    }

    pub fn decode<T: DeserializeOwned>(raw: &str) -> Result<T, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
