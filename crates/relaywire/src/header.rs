//! # Call Header
//!
//! Every request and every response travels as a `Header` frame followed by
//! exactly one body frame.

use serde::Deserialize;
use serde::Serialize;

/// Routing and status information for one call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Target in `Service.Method` form.
    pub service_method: String,
    /// Correlates a response with the request that caused it.
    pub seq: u64,
    /// Empty on success.
    pub error: String,
}

impl Header {
    pub fn request(service_method: impl Into<String>, seq: u64) -> Self {
        Self {
            service_method: service_method.into(),
            seq,
            error: String::new(),
        }
    }

    /// Turns this header into an error-bearing response for the same call.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = error.into();
        self
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }
}
