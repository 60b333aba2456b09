//! Intercepted request model
//!
//! Represents a single outbound request issued by a client context and
//! routed through the interceptor.

use serde::{Deserialize, Serialize};
use std::fmt;

/// HTTP methods. Anything outside the standard set is carried verbatim as
/// an extension method (`PURGE`, `PROPFIND`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
    Connect,
    Trace,
    Extension(String),
}

impl HttpMethod {
    /// Map a method token as received on the wire. Methods are
    /// case-sensitive, so only the exact standard spellings map to the
    /// named variants.
    pub fn from_token(token: &str) -> Self {
        match token {
            "GET" => HttpMethod::Get,
            "POST" => HttpMethod::Post,
            "PUT" => HttpMethod::Put,
            "PATCH" => HttpMethod::Patch,
            "DELETE" => HttpMethod::Delete,
            "HEAD" => HttpMethod::Head,
            "OPTIONS" => HttpMethod::Options,
            "CONNECT" => HttpMethod::Connect,
            "TRACE" => HttpMethod::Trace,
            other => HttpMethod::Extension(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Connect => "CONNECT",
            HttpMethod::Trace => "TRACE",
            HttpMethod::Extension(token) => token,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lenient parse for configured values: standard names match in any case.
impl std::str::FromStr for HttpMethod {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(());
        }
        match HttpMethod::from_token(&s.to_ascii_uppercase()) {
            HttpMethod::Extension(_) => Ok(HttpMethod::Extension(s.to_string())),
            known => Ok(known),
        }
    }
}

impl From<&http::Method> for HttpMethod {
    fn from(method: &http::Method) -> Self {
        HttpMethod::from_token(method.as_str())
    }
}

impl TryFrom<&HttpMethod> for http::Method {
    type Error = http::method::InvalidMethod;

    fn try_from(method: &HttpMethod) -> Result<Self, Self::Error> {
        http::Method::from_bytes(method.as_str().as_bytes())
    }
}

/// Decode a raw header value into text. Every byte maps to the char with
/// the same code point (ISO-8859-1), so [`header_value_bytes`] gives the
/// original bytes back.
pub fn header_value_to_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Encode header text for the wire. Text produced by
/// [`header_value_to_string`] maps back byte for byte; text with chars
/// beyond U+00FF is sent as UTF-8.
pub fn header_value_bytes(value: &str) -> Vec<u8> {
    if value.chars().all(|c| u32::from(c) <= 0xFF) {
        value.chars().map(|c| u32::from(c) as u8).collect()
    } else {
        value.as_bytes().to_vec()
    }
}

/// Identity of a client context (e.g. a browsing session) whose requests may
/// be routed through an interceptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(String);

impl ClientId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for ClientId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable descriptor of an outbound request.
///
/// Fields are private so that nothing downstream of the host can alter the
/// request it is asked to satisfy; use the builder methods to construct one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterceptedRequest {
    id: String,
    method: HttpMethod,
    url: String,
    headers: Vec<(String, String)>,
    body: Option<Vec<u8>>,
}

impl InterceptedRequest {
    /// Create a new request descriptor for the given target
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    /// Append a header; repeated names are kept in order.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_headers<I>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.headers.extend(headers);
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn method(&self) -> &HttpMethod {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// All headers in arrival order
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Case-insensitive header lookup; the first value wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    /// Host portion of the target URL, lowercased. Empty if the URL has no
    /// authority.
    pub fn host(&self) -> String {
        split_url(&self.url).0.to_ascii_lowercase()
    }

    /// Path (including query string) of the target URL.
    pub fn path(&self) -> &str {
        split_url(&self.url).1
    }

    /// Key identifying this request in a local store.
    pub fn identity(&self) -> String {
        format!("{} {}", self.method, self.url)
    }
}

/// Split `scheme://authority/path?query` into (host, path). Ports and
/// userinfo are stripped from the host.
fn split_url(url: &str) -> (&str, &str) {
    let rest = match url.find("://") {
        Some(idx) => &url[idx + 3..],
        None => return ("", url),
    };
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    let authority = authority.rsplit('@').next().unwrap_or(authority);
    let host = if authority.starts_with('[') {
        authority
            .find(']')
            .map(|end| &authority[..=end])
            .unwrap_or(authority)
    } else {
        authority.split(':').next().unwrap_or(authority)
    };
    (host, path)
}
