//! Scripted connector for exercising pool, worker and retry behavior

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use std::sync::{Arc, Mutex};

use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONNECTION};
use hyper::{HeaderMap, StatusCode};

use crate::{GeofetchError, Result, TransientKind};

use super::{Connector, OutboundRequest, RawResponse, Target, Transport};

/// What the next `send` on any mock connection does
#[derive(Debug, Clone)]
pub(crate) enum Step {
    Respond(u16, &'static str),
    /// Respond with `Connection: close`, then close
    Closing(u16, &'static str),
    /// Respond `200 ok` after a delay
    Slow(u64),
    Fail(TransientKind),
    Stall,
}

#[derive(Default)]
pub(crate) struct MockState {
    script: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<OutboundRequest>>,
    pub connects: AtomicUsize,
    pub sends: AtomicUsize,
    pub closes: AtomicUsize,
    /// Connections with a lower id were closed by the server
    hung_up: AtomicUsize,
}

impl MockState {
    pub fn requests(&self) -> Vec<OutboundRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Mark every connection opened so far as closed by the server
    pub fn hang_up(&self) {
        let opened = self.connects.load(Ordering::SeqCst);
        self.hung_up.store(opened, Ordering::SeqCst);
    }
}

/// Connector whose connections follow a shared script
///
/// Once the script runs out every send answers `200 ok`.
#[derive(Clone, Default)]
pub(crate) struct MockConnector {
    pub state: Arc<MockState>,
}

impl MockConnector {
    pub fn scripted(steps: impl IntoIterator<Item = Step>) -> Self {
        let connector = Self::default();
        connector.state.script.lock().unwrap().extend(steps);
        connector
    }
}

impl Connector for MockConnector {
    type Connection = MockConnection;

    async fn connect(&self, _target: &Target) -> Result<MockConnection> {
        let id = self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(MockConnection {
            id,
            closed: false,
            state: Arc::clone(&self.state),
        })
    }
}

pub(crate) struct MockConnection {
    pub id: usize,
    pub closed: bool,
    state: Arc<MockState>,
}

impl Transport for MockConnection {
    async fn send(&mut self, request: &OutboundRequest) -> Result<RawResponse> {
        self.state.sends.fetch_add(1, Ordering::SeqCst);
        self.state.requests.lock().unwrap().push(request.clone());

        let step = self
            .state
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Step::Respond(200, "ok"));

        match step {
            Step::Respond(status, body) => Ok(response(status, body, HeaderMap::new())),
            Step::Closing(status, body) => {
                self.closed = true;
                let mut headers = HeaderMap::new();
                headers.insert(CONNECTION, HeaderValue::from_static("close"));
                Ok(response(status, body, headers))
            }
            Step::Slow(millis) => {
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok(response(200, "ok", HeaderMap::new()))
            }
            Step::Fail(kind) => Err(GeofetchError::transient(kind, "scripted failure")),
            Step::Stall => std::future::pending().await,
        }
    }

    fn is_closed(&self) -> bool {
        self.closed || self.id < self.state.hung_up.load(Ordering::SeqCst)
    }
}

fn response(status: u16, body: &'static str, headers: HeaderMap) -> RawResponse {
    RawResponse {
        status: StatusCode::from_u16(status).unwrap(),
        headers,
        body: Bytes::from_static(body.as_bytes()),
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
    }
}
