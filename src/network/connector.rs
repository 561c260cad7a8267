//! Transport connections: how one is opened and how a request goes over it

use std::error::Error as StdError;
use std::future::Future;
use std::io;
use std::sync::Arc;

use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Bytes;
use hyper::client::conn::http1;
use hyper::header::CONNECTION;
use hyper::{HeaderMap, Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::config::LimitsConfig;
use crate::{GeofetchError, Result, TransientKind};

use super::{Scheme, Target};

/// Request as it goes over an established connection
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    /// HTTP method
    pub method: Method,
    /// Path and query (relative form)
    pub path: String,
    /// Complete header set, including `Host`
    pub headers: HeaderMap,
    /// Request body, empty for GET
    pub body: Bytes,
}

/// Fully read response
#[derive(Debug, Clone)]
pub struct RawResponse {
    /// HTTP status code
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body
    pub body: Bytes,
}

impl RawResponse {
    /// Whether the status is in the 2xx range
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Whether the server allows the connection to be reused
    pub fn keep_alive(&self) -> bool {
        !self.headers.get_all(CONNECTION).iter().any(|value| {
            value.to_str().is_ok_and(|value| {
                value
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("close"))
            })
        })
    }
}

/// An open connection that can carry one request at a time
///
/// Dropping the connection closes it.
pub trait Transport: Send + 'static {
    /// Send `request` and read the whole response body
    fn send(&mut self, request: &OutboundRequest)
        -> impl Future<Output = Result<RawResponse>> + Send;

    /// Whether the peer or the connection driver has already closed it
    fn is_closed(&self) -> bool;
}

/// Opens new connections for the pool
pub trait Connector: Send + Sync + 'static {
    /// Connection type produced by this connector
    type Connection: Transport;

    /// Open a new connection to `target`'s host
    fn connect(&self, target: &Target) -> impl Future<Output = Result<Self::Connection>> + Send;
}

/// HTTP/1.1 connector over TCP, with TLS for `https`
#[derive(Clone)]
pub struct HttpConnector {
    tls: TlsConnector,
    max_response_size: usize,
}

impl HttpConnector {
    /// Create a connector trusting the bundled web PKI roots
    #[must_use]
    pub fn new(limits: &LimitsConfig) -> Self {
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Self {
            tls: TlsConnector::from(Arc::new(config)),
            max_response_size: limits.max_response_size,
        }
    }
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self::new(&LimitsConfig::default())
    }
}

impl Connector for HttpConnector {
    type Connection = HttpConnection;

    async fn connect(&self, target: &Target) -> Result<HttpConnection> {
        info!("Establishing connection to {}", target.authority());

        let connect_error = |source: io::Error| GeofetchError::Connect {
            authority: target.authority().to_string(),
            source,
        };

        let stream = TcpStream::connect((target.host(), target.port()))
            .await
            .map_err(connect_error)?;
        stream.set_nodelay(true).ok();

        match target.scheme() {
            Scheme::Http => {
                handshake(TokioIo::new(stream), target, self.max_response_size).await
            }
            Scheme::Https => {
                let domain = ServerName::try_from(target.host().to_string()).map_err(|e| {
                    connect_error(io::Error::new(io::ErrorKind::InvalidInput, e))
                })?;
                let stream = self
                    .tls
                    .connect(domain, stream)
                    .await
                    .map_err(connect_error)?;
                handshake(TokioIo::new(stream), target, self.max_response_size).await
            }
        }
    }
}

/// Run the HTTP/1.1 handshake and drive the connection on its own task
async fn handshake<I>(io: I, target: &Target, max_response_size: usize) -> Result<HttpConnection>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let (sender, connection) = http1::handshake(io).await.map_err(classify)?;

    let authority = target.authority().to_string();
    let driver = tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("Connection to {} ended: {}", authority, e);
        }
    });

    Ok(HttpConnection {
        sender,
        driver,
        max_response_size,
    })
}

/// A persistent HTTP/1.1 connection
pub struct HttpConnection {
    sender: http1::SendRequest<Full<Bytes>>,
    driver: JoinHandle<()>,
    max_response_size: usize,
}

impl Transport for HttpConnection {
    async fn send(&mut self, request: &OutboundRequest) -> Result<RawResponse> {
        // A keep-alive connection the server has since closed fails here
        self.sender.ready().await.map_err(classify)?;

        let mut http_request = Request::builder()
            .method(request.method.clone())
            .uri(request.path.as_str())
            .body(Full::new(request.body.clone()))
            .map_err(|e| GeofetchError::Http(format!("Failed to build request: {e}")))?;
        *http_request.headers_mut() = request.headers.clone();

        let response = self
            .sender
            .send_request(http_request)
            .await
            .map_err(classify)?;

        // Always read the whole body so the connection can be reused
        let (parts, body) = response.into_parts();
        let body = Limited::new(body, self.max_response_size)
            .collect()
            .await
            .map_err(|e| classify_body(e, self.max_response_size))?
            .to_bytes();

        Ok(RawResponse {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }

    fn is_closed(&self) -> bool {
        self.sender.is_closed() || self.driver.is_finished()
    }
}

impl Drop for HttpConnection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Map a hyper error onto the broken-connection taxonomy
fn classify(error: hyper::Error) -> GeofetchError {
    let message = error.to_string();

    if error.is_parse() {
        return GeofetchError::transient(TransientKind::BadStatusLine, message);
    }
    if error.is_body_write_aborted() {
        return GeofetchError::transient(TransientKind::BrokenPipe, message);
    }
    if error.is_incomplete_message() || error.is_canceled() || error.is_closed() {
        return GeofetchError::transient(TransientKind::ConnectionReset, message);
    }

    match find_io_error(&error).map(io::Error::kind) {
        Some(io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted) => {
            GeofetchError::transient(TransientKind::ConnectionReset, message)
        }
        Some(io::ErrorKind::BrokenPipe) => {
            GeofetchError::transient(TransientKind::BrokenPipe, message)
        }
        _ => GeofetchError::Http(message),
    }
}

fn classify_body(error: Box<dyn StdError + Send + Sync>, limit: usize) -> GeofetchError {
    if error.is::<LengthLimitError>() {
        return GeofetchError::ResponseTooLarge { limit };
    }
    match error.downcast::<hyper::Error>() {
        Ok(error) => classify(*error),
        Err(error) => GeofetchError::Http(error.to_string()),
    }
}

fn find_io_error(error: &hyper::Error) -> Option<&io::Error> {
    let mut source = error.source();
    while let Some(err) = source {
        if let Some(io_error) = err.downcast_ref::<io::Error>() {
            return Some(io_error);
        }
        source = err.source();
    }
    None
}
