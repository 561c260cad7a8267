//! Public request entry point: GET/POST, retry policy and JSON decoding

use std::sync::Arc;

use bytes::Bytes;
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::Method;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::config::Config;
use crate::network::{ConnectionPool, Connector, HttpConnector};
use crate::task::{self, Encoding, Payload, RequestOptions, RequestTask};
use crate::worker::WorkerPool;
use crate::{FailureKind, GeofetchError, Result};

/// Shared network resource manager
///
/// Construct once at startup inside a tokio runtime and hand an
/// `Arc<Dispatcher>` to every collaborator that makes requests. Call
/// [`Dispatcher::terminate`] once at shutdown.
pub struct Dispatcher<C: Connector = HttpConnector> {
    pool: Arc<ConnectionPool<C>>,
    workers: WorkerPool<C>,
}

impl Dispatcher<HttpConnector> {
    /// Create a dispatcher using real HTTP connections
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_connector(config, HttpConnector::new(&config.limits))
    }
}

impl<C: Connector> Dispatcher<C> {
    /// Create a dispatcher over any connector
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime
    pub fn with_connector(config: &Config, connector: C) -> Result<Self> {
        config.validate()?;

        let pool = Arc::new(ConnectionPool::new(connector, &config.pool));
        let headers = default_headers(config)?;
        let workers = WorkerPool::new(Arc::clone(&pool), config.pool.size, headers);

        Ok(Self { pool, workers })
    }

    /// HTTP GET
    ///
    /// # Errors
    ///
    /// Returns error if the request fails after retries
    pub async fn get(&self, url: &str, options: &RequestOptions) -> Result<Payload> {
        self.request(Method::GET, url, None, options).await
    }

    /// HTTP POST
    ///
    /// # Errors
    ///
    /// Returns error if the request fails after retries
    pub async fn post(
        &self,
        url: &str,
        body: impl Into<Bytes>,
        options: &RequestOptions,
    ) -> Result<Payload> {
        self.request(Method::POST, url, Some(body.into()), options)
            .await
    }

    /// HTTP GET, response parsed as JSON
    ///
    /// Decodes as UTF-8 unless `options` names another encoding.
    ///
    /// # Errors
    ///
    /// Returns error if the request fails or the body is blank or not JSON
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        options: &RequestOptions,
    ) -> Result<T> {
        self.request_json(Method::GET, url, None, options).await
    }

    /// HTTP POST, response parsed as JSON
    ///
    /// # Errors
    ///
    /// Returns error if the request fails or the body is blank or not JSON
    pub async fn post_json<T: DeserializeOwned>(
        &self,
        url: &str,
        body: impl Into<Bytes>,
        options: &RequestOptions,
    ) -> Result<T> {
        self.request_json(Method::POST, url, Some(body.into()), options)
            .await
    }

    /// Make a request, retrying on broken connections
    ///
    /// # Errors
    ///
    /// Returns the definitive failure: a permanent error at once, a transient
    /// one after `options.retry` retries, or a termination error.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<Bytes>,
        options: &RequestOptions,
    ) -> Result<Payload> {
        if !self.is_alive() {
            return Err(GeofetchError::PoolTerminated);
        }

        let mut task = RequestTask::new(method, url, body, options)?;
        loop {
            debug!("{} {}", task.method(), task.url());

            let error = match self.workers.submit(task.clone()).await {
                Ok(payload) => return Ok(payload),
                Err(e) => e,
            };

            // Nothing is retried or reported once shutting down
            if !self.is_alive() {
                return Err(error);
            }

            match error.kind() {
                FailureKind::Transient if task.retry() > 0 => {
                    debug!("{} {}: {}, retrying", task.method(), task.url(), error);
                    task = task.with_retry(task.retry() - 1);
                }
                FailureKind::Terminated => return Err(error),
                _ => {
                    warn!("{} {} failed: {}", task.method(), task.url(), error);
                    return Err(error);
                }
            }
        }
    }

    async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        body: Option<Bytes>,
        options: &RequestOptions,
    ) -> Result<T> {
        let options = RequestOptions {
            encoding: Some(options.encoding.unwrap_or(Encoding::Utf8)),
            ..options.clone()
        };

        let mut payload = self
            .request(method.clone(), url, body.clone(), &options)
            .await?;

        // A blank body usually means a stale connection
        if payload.is_blank() && options.retry > 0 {
            debug!("{} {}: blank response, resetting connection", method, url);
            self.pool.reset(url).await?;
            payload = self.request(method, url, body, &options).await?;
        }

        if payload.is_blank() {
            warn!("Failed to parse JSON from {}: received blank", url);
            return Err(GeofetchError::Decode(
                "Expected JSON, received blank".to_string(),
            ));
        }

        serde_json::from_str(&payload.into_text()).map_err(|e| {
            warn!("Failed to parse JSON from {}: {}", url, e);
            GeofetchError::Decode(e.to_string())
        })
    }

    /// Terminate both pools
    ///
    /// Returns without waiting for in-flight requests; they fail or finish on
    /// their own and their connections are closed rather than returned.
    pub fn terminate(&self) {
        self.pool.terminate();
        self.workers.terminate();
    }

    /// Whether requests are still accepted
    pub fn is_alive(&self) -> bool {
        self.pool.is_alive()
    }

    /// The underlying connection pool
    pub fn connection_pool(&self) -> &ConnectionPool<C> {
        &self.pool
    }

    /// The underlying worker pool
    pub fn workers(&self) -> &WorkerPool<C> {
        &self.workers
    }
}

/// Keep-alive, user agent and configured extra headers
fn default_headers(config: &Config) -> Result<HeaderMap> {
    let extra: Vec<(String, String)> = config
        .client
        .extra_headers
        .iter()
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    let mut headers = HeaderMap::new();
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        header::USER_AGENT,
        HeaderValue::from_str(&config.client.user_agent)
            .map_err(|e| GeofetchError::ConfigError(format!("Invalid user agent: {e}")))?,
    );
    for (name, value) in &task::header_map(&extra)? {
        headers.insert(name.clone(), value.clone());
    }

    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::mock::{MockConnector, Step};
    use crate::TransientKind;
    use serde_json::Value;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    const URL: &str = "https://api.example.com/v1/route";

    fn dispatcher(connector: MockConnector) -> Dispatcher<MockConnector> {
        let mut config = Config::default();
        config.pool.size = 2;
        Dispatcher::with_connector(&config, connector).unwrap()
    }

    #[tokio::test]
    async fn test_get_text() {
        let connector = MockConnector::scripted([Step::Respond(200, "hello")]);
        let dispatcher = dispatcher(connector);

        let options = RequestOptions::default().encoding(Encoding::Utf8);
        let payload = dispatcher.get(URL, &options).await.unwrap();
        assert_eq!(payload, Payload::Text("hello".to_string()));
    }

    #[tokio::test]
    async fn test_default_headers() {
        let connector = MockConnector::default();
        let state = Arc::clone(&connector.state);
        let mut config = Config::default();
        config
            .client
            .extra_headers
            .insert("Accept-Language".to_string(), "fi".to_string());
        let dispatcher = Dispatcher::with_connector(&config, connector).unwrap();

        dispatcher
            .post(URL, "{\"locations\": []}", &RequestOptions::default())
            .await
            .unwrap();

        let request = &state.requests()[0];
        assert_eq!(request.method, Method::POST);
        assert_eq!(request.body, Bytes::from_static(b"{\"locations\": []}"));
        assert_eq!(request.headers.get(header::CONNECTION).unwrap(), "keep-alive");
        let user_agent = request.headers.get(header::USER_AGENT).unwrap();
        assert!(user_agent.to_str().unwrap().starts_with("geofetch/"));
        assert_eq!(request.headers.get("accept-language").unwrap(), "fi");
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let connector = MockConnector::scripted([
            Step::Fail(TransientKind::ConnectionReset),
            Step::Respond(200, "second"),
        ]);
        let state = Arc::clone(&connector.state);
        let dispatcher = dispatcher(connector);

        let payload = dispatcher.get(URL, &RequestOptions::default()).await.unwrap();
        assert_eq!(payload.as_bytes(), b"second");
        assert_eq!(state.sends.load(Ordering::SeqCst), 2);
        // The broken connection was closed and replaced
        assert_eq!(state.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_zero_budget_fails_without_retry() {
        let connector = MockConnector::scripted([
            Step::Fail(TransientKind::BadStatusLine),
            Step::Respond(200, "unused"),
        ]);
        let state = Arc::clone(&connector.state);
        let dispatcher = dispatcher(connector);

        let error = dispatcher
            .get(URL, &RequestOptions::default().retry(0))
            .await
            .unwrap_err();
        assert_eq!(error.kind(), FailureKind::Transient);
        assert_eq!(state.sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_budget_is_exhausted() {
        let connector = MockConnector::scripted([
            Step::Fail(TransientKind::BrokenPipe),
            Step::Fail(TransientKind::BrokenPipe),
            Step::Fail(TransientKind::BrokenPipe),
        ]);
        let state = Arc::clone(&connector.state);
        let dispatcher = dispatcher(connector);

        let error = dispatcher
            .get(URL, &RequestOptions::default().retry(2))
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            GeofetchError::Transient {
                kind: TransientKind::BrokenPipe,
                ..
            }
        ));
        assert_eq!(state.sends.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_status_is_never_retried() {
        let connector = MockConnector::scripted([
            Step::Respond(500, "boom"),
            Step::Respond(200, "unused"),
        ]);
        let state = Arc::clone(&connector.state);
        let dispatcher = dispatcher(connector);

        let error = dispatcher
            .get(URL, &RequestOptions::default().retry(3))
            .await
            .unwrap_err();
        assert!(matches!(error, GeofetchError::Status { status: 500, .. }));
        assert_eq!(state.sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_json() {
        let connector = MockConnector::scripted([Step::Respond(200, r#"{"items": [1, 2, 3]}"#)]);
        let dispatcher = dispatcher(connector);

        let value: Value = dispatcher.get_json(URL, &RequestOptions::default()).await.unwrap();
        assert_eq!(value["items"].as_array().map(Vec::len), Some(3));
    }

    #[tokio::test]
    async fn test_blank_json_resets_once() {
        let connector = MockConnector::scripted([
            Step::Respond(200, "  \n"),
            Step::Respond(200, "[\"ok\"]"),
        ]);
        let state = Arc::clone(&connector.state);
        let dispatcher = dispatcher(connector);

        let value: Vec<String> = dispatcher
            .post_json(URL, "{}", &RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(value, vec!["ok".to_string()]);
        assert_eq!(dispatcher.connection_pool().stats().resets, 1);
        assert_eq!(state.sends.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_blank_json_twice_is_decode_error() {
        let connector = MockConnector::scripted([Step::Respond(200, ""), Step::Respond(200, " ")]);
        let dispatcher = dispatcher(connector);

        let result: Result<Value> = dispatcher.get_json(URL, &RequestOptions::default()).await;
        assert!(matches!(result, Err(GeofetchError::Decode(_))));
        assert_eq!(dispatcher.connection_pool().stats().resets, 1);
    }

    #[tokio::test]
    async fn test_blank_json_without_budget() {
        let connector = MockConnector::scripted([Step::Respond(200, "")]);
        let state = Arc::clone(&connector.state);
        let dispatcher = dispatcher(connector);

        let result: Result<Value> = dispatcher
            .get_json(URL, &RequestOptions::default().retry(0))
            .await;
        assert!(matches!(result, Err(GeofetchError::Decode(_))));
        assert_eq!(dispatcher.connection_pool().stats().resets, 0);
        assert_eq!(state.sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_json_is_not_retried() {
        let connector = MockConnector::scripted([Step::Respond(200, "<html>")]);
        let state = Arc::clone(&connector.state);
        let dispatcher = dispatcher(connector);

        let result: Result<Value> = dispatcher.get_json(URL, &RequestOptions::default()).await;
        assert!(matches!(result, Err(GeofetchError::Decode(_))));
        assert_eq!(state.sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let dispatcher = dispatcher(MockConnector::default());
        let result = dispatcher.get("example.com/route", &RequestOptions::default()).await;
        assert!(matches!(result, Err(GeofetchError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_terminate_rejects_requests() {
        let dispatcher = dispatcher(MockConnector::default());
        dispatcher.get(URL, &RequestOptions::default()).await.unwrap();

        dispatcher.terminate();
        assert!(!dispatcher.is_alive());

        let result = tokio::time::timeout(
            Duration::from_millis(100),
            dispatcher.get(URL, &RequestOptions::default()),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(GeofetchError::PoolTerminated)));

        let result: Result<Value> = dispatcher
            .post_json("https://other.example.com/", "{}", &RequestOptions::default())
            .await;
        assert!(matches!(result, Err(GeofetchError::PoolTerminated)));
    }

    #[tokio::test]
    async fn test_terminate_during_request_is_not_retried() {
        let connector = MockConnector::scripted([Step::Stall]);
        let state = Arc::clone(&connector.state);
        let dispatcher = Arc::new(dispatcher(connector));

        let in_flight = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                dispatcher.get(URL, &RequestOptions::default().retry(5)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        dispatcher.terminate();
        assert!(started.elapsed() < Duration::from_millis(100));

        let result = tokio::time::timeout(Duration::from_secs(1), in_flight)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap_err().kind(), FailureKind::Terminated);
        assert_eq!(state.sends.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalid_config() {
        let mut config = Config::default();
        config.pool.size = 0;
        let result = Dispatcher::with_connector(&config, MockConnector::default());
        assert!(matches!(result, Err(GeofetchError::ConfigError(_))));
    }
}
