//! Per-message envelope
//!
//! A `Header` precedes every body on the wire, in both directions.

use serde::{Deserialize, Serialize};

/// Message header
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Remote operation, formatted as `"Service.Method"`
    pub service_method: String,
    /// Correlates a response with its request
    pub seq: u64,
    /// Empty on success, otherwise the server-side failure text
    pub error: String,
}

impl Header {
    pub fn new(service_method: impl Into<String>, seq: u64) -> Self {
        Self {
            service_method: service_method.into(),
            seq,
            error: String::new(),
        }
    }

    /// Whether the peer reported a failure for this message
    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }
}

/// Split a `"Service.Method"` name at its last dot
pub fn split_service_method(name: &str) -> Option<(&str, &str)> {
    let (service, method) = name.rsplit_once('.')?;
    if service.is_empty() || method.is_empty() {
        return None;
    }
    Some((service, method))
}
