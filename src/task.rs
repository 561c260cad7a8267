//! Request tasks, options and payloads

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::Method;

use crate::network::Target;
use crate::{GeofetchError, Result};

/// Text encoding used to decode a response body
///
/// Bytes that do not decode are replaced rather than rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// UTF-8
    Utf8,
    /// ISO-8859-1
    Latin1,
}

impl Encoding {
    /// Decode `bytes` into text
    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            Self::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Self::Latin1 => bytes.iter().map(|&b| char::from(b)).collect(),
        }
    }
}

impl FromStr for Encoding {
    type Err = GeofetchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "utf-8" | "utf8" => Ok(Self::Utf8),
            "latin-1" | "latin1" | "iso-8859-1" | "iso8859-1" => Ok(Self::Latin1),
            other => Err(GeofetchError::Other(format!("Unsupported encoding: {other}"))),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Utf8 => f.write_str("utf-8"),
            Self::Latin1 => f.write_str("iso-8859-1"),
        }
    }
}

/// Successful response payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Raw body, when no encoding was requested
    Bytes(Bytes),
    /// Decoded body
    Text(String),
}

impl Payload {
    /// Body as bytes
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Bytes(bytes) => &bytes[..],
            Self::Text(text) => text.as_bytes(),
        }
    }

    /// Decoded text, if an encoding was applied
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Bytes(_) => None,
        }
    }

    /// Body as text, decoding raw bytes as UTF-8
    pub fn into_text(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Bytes(bytes) => Encoding::Utf8.decode(&bytes),
        }
    }

    /// Whether the body is empty or only whitespace
    pub fn is_blank(&self) -> bool {
        match self {
            Self::Text(text) => text.trim().is_empty(),
            Self::Bytes(bytes) => bytes.iter().all(u8::is_ascii_whitespace),
        }
    }
}

/// Per-call options for the public request functions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOptions {
    /// Decode the body with this encoding; `None` returns raw bytes
    pub encoding: Option<Encoding>,
    /// Retries allowed after a broken connection
    pub retry: u32,
    /// Headers added over the defaults
    pub headers: Vec<(String, String)>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            encoding: None,
            retry: 1,
            headers: Vec::new(),
        }
    }
}

impl RequestOptions {
    /// Decode the body with `encoding`
    #[must_use]
    pub fn encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = Some(encoding);
        self
    }

    /// Set the retry budget
    #[must_use]
    pub fn retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }

    /// Add a header
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// One request as handed to a worker
///
/// Immutable; a retry is a new task with a smaller budget.
#[derive(Debug, Clone)]
pub struct RequestTask {
    method: Method,
    target: Target,
    body: Option<Bytes>,
    encoding: Option<Encoding>,
    retry: u32,
    headers: HeaderMap,
}

impl RequestTask {
    /// Build a task, validating the URL and caller headers
    ///
    /// # Errors
    ///
    /// Returns error if the URL is not absolute http(s) or a header is invalid
    pub fn new(
        method: Method,
        url: &str,
        body: Option<Bytes>,
        options: &RequestOptions,
    ) -> Result<Self> {
        let target = Target::parse(url)?;
        let headers = header_map(&options.headers)?;

        Ok(Self {
            method,
            target,
            body,
            encoding: options.encoding,
            retry: options.retry,
            headers,
        })
    }

    /// HTTP method
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Parsed URL
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// URL as given
    pub fn url(&self) -> &str {
        self.target.url()
    }

    /// Request body
    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Requested encoding
    pub fn encoding(&self) -> Option<Encoding> {
        self.encoding
    }

    /// Remaining retry budget
    pub fn retry(&self) -> u32 {
        self.retry
    }

    /// Caller-supplied headers
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Same request with a different retry budget
    #[must_use]
    pub fn with_retry(&self, retry: u32) -> Self {
        Self {
            retry,
            ..self.clone()
        }
    }

    /// Turn a response body into the payload the caller asked for
    pub fn payload(&self, body: Bytes) -> Payload {
        match self.encoding {
            Some(encoding) => Payload::Text(encoding.decode(&body)),
            None => Payload::Bytes(body),
        }
    }
}

/// Convert `(name, value)` pairs into a header map, later pairs winning
///
/// # Errors
///
/// Returns error if a name or value is not valid HTTP
pub fn header_map(pairs: &[(String, String)]) -> Result<HeaderMap> {
    let mut headers = HeaderMap::with_capacity(pairs.len());
    for (name, value) in pairs {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| GeofetchError::InvalidHeader(format!("'{name}': {e}")))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|e| GeofetchError::InvalidHeader(format!("'{name}': {e}")))?;
        headers.insert(header_name, header_value);
    }
    Ok(headers)
}
