use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque version of a persisted task document.
///
/// Every read returns one and every write must present the current one.
/// Backends encode whatever they use for compare-and-swap (sequence number
/// and term, row version, KV revision); the scheduler only compares tokens
/// for equality and never looks inside.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConcurrencyToken(String);

impl ConcurrencyToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConcurrencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
