//! Request IDs for correlating log lines.
//!
//! A client-supplied `x-request-id` is reused as-is; otherwise a UUID is
//! generated.

use uuid::Uuid;

/// Generate a new UUID-based request ID.
pub fn generate_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Request ID attached to request logs and echoed back to the client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestId(String);

impl RequestId {
    /// Create a new random request ID.
    pub fn new() -> Self {
        Self(generate_request_id())
    }

    /// Use an existing ID, e.g. one taken from a request header.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the request ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
