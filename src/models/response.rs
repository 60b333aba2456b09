//! Response model produced for an intercepted request.

use serde::{Deserialize, Serialize};

/// Where a response came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseSource {
    /// Forwarded to and returned by the network
    Network,
    /// Served from a local store
    Store,
    /// Built locally by the dispatch policy
    Synthesized,
}

/// Response relayed back to the original requester
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterceptedResponse {
    /// HTTP status code
    pub status_code: u16,
    /// HTTP status message
    pub status_message: Option<String>,
    /// Response headers in wire order; repeated names (`set-cookie`) are
    /// separate entries
    pub headers: Vec<(String, String)>,
    /// Response body
    pub body: Vec<u8>,
    /// Origin of this response
    pub source: ResponseSource,
}

impl InterceptedResponse {
    /// Build a response synthesized locally
    pub fn synthesized(status_code: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status_code,
            status_message: None,
            headers: Vec::new(),
            body: body.into(),
            source: ResponseSource::Synthesized,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}
