//! Request targets and per-host pool keys

use std::fmt;

use hyper::Uri;

use crate::{GeofetchError, Result};

/// URL scheme supported by the connector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// Plain TCP
    Http,
    /// TLS over TCP
    Https,
}

impl Scheme {
    /// Port used when the URL does not give one
    pub fn default_port(self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }

    /// Lowercase scheme name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

/// `scheme:authority` key identifying one independent set of connection slots
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostKey(String);

impl HostKey {
    /// Key as text, e.g. `https:api.example.com`
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A parsed absolute URL, split into what the pool and the wire need
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    url: String,
    scheme: Scheme,
    host: String,
    port: u16,
    authority: String,
    path: String,
    key: HostKey,
}

impl Target {
    /// Parse an absolute `http` or `https` URL
    ///
    /// # Errors
    ///
    /// Returns error if the URL is relative, has no host or uses another scheme
    pub fn parse(url: &str) -> Result<Self> {
        let uri = url
            .parse::<Uri>()
            .map_err(|e| GeofetchError::InvalidUrl(format!("'{url}': {e}")))?;

        let scheme = match uri.scheme_str() {
            Some(s) if s.eq_ignore_ascii_case("http") => Scheme::Http,
            Some(s) if s.eq_ignore_ascii_case("https") => Scheme::Https,
            Some(other) => {
                return Err(GeofetchError::InvalidUrl(format!(
                    "'{url}': unsupported scheme '{other}'"
                )))
            }
            None => {
                return Err(GeofetchError::InvalidUrl(format!(
                    "'{url}': not an absolute URL"
                )))
            }
        };

        let authority = uri
            .authority()
            .ok_or_else(|| GeofetchError::InvalidUrl(format!("'{url}': missing host")))?;

        let host = authority
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        if host.is_empty() {
            return Err(GeofetchError::InvalidUrl(format!("'{url}': missing host")));
        }

        let port = authority.port_u16().unwrap_or_else(|| scheme.default_port());

        // Requests go out with the relative form: path and query only
        let path = match uri.path_and_query().map(|pq| pq.as_str()) {
            Some(pq) if pq.starts_with('/') => pq.to_string(),
            Some(pq) => format!("/{pq}"),
            None => "/".to_string(),
        };

        let key = HostKey(format!("{}:{}", scheme.as_str(), authority.as_str()));

        Ok(Self {
            url: url.to_string(),
            scheme,
            host,
            port,
            authority: authority.as_str().to_string(),
            path,
            key,
        })
    }

    /// The URL as given
    pub fn url(&self) -> &str {
        &self.url
    }

    /// URL scheme
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Host name or address, without brackets or port
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port to dial
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Authority as written in the URL, used for the `Host` header
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Path and query, always starting with `/`
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Pool key for this URL's host
    pub fn key(&self) -> &HostKey {
        &self.key
    }

    /// Whether this target is a loopback service
    pub fn is_local(&self) -> bool {
        ["localhost", "127.0.0.1", "::1"]
            .iter()
            .any(|local| self.host.eq_ignore_ascii_case(local))
    }
}
