//! Fixed-size worker pool that performs the network I/O

use std::sync::Arc;

use hyper::header::{self, HeaderMap, HeaderValue};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::network::{
    ConnectionPool, Connector, LifoStack, OutboundRequest, RawResponse, Transport,
};
use crate::task::{Payload, RequestTask};
use crate::{GeofetchError, Result};

/// Message on a worker's private task channel
enum Message {
    /// Run one request and answer on `reply`
    Job {
        task: RequestTask,
        reply: oneshot::Sender<Result<Payload>>,
    },
    /// Exit the worker loop
    Stop,
}

/// Handle to an idle worker
#[derive(Clone)]
struct WorkerHandle {
    id: usize,
    tasks: mpsc::Sender<Message>,
}

/// Pool of `size` workers, each with its own task channel
///
/// A caller borrows one idle worker for a single request/response round trip,
/// so at most `size` requests are in flight at once. A worker goes back on the
/// idle stack by itself once its job is done, even if the caller has gone.
pub struct WorkerPool<C: Connector> {
    pool: Arc<ConnectionPool<C>>,
    idle: Arc<LifoStack<WorkerHandle>>,
    size: usize,
}

impl<C: Connector> WorkerPool<C> {
    /// Spawn `size` workers on the current tokio runtime
    ///
    /// `default_headers` go on every request, under the caller's headers.
    ///
    /// # Panics
    ///
    /// Panics if `size` is 0 or when called outside a tokio runtime
    #[must_use]
    pub fn new(pool: Arc<ConnectionPool<C>>, size: usize, default_headers: HeaderMap) -> Self {
        assert!(size > 0, "worker pool size must be > 0");

        let default_headers = Arc::new(default_headers);
        let channels: Vec<_> = (0..size)
            .map(|id| {
                let (tasks, rx) = mpsc::channel(1);
                (WorkerHandle { id, tasks }, rx)
            })
            .collect();
        let idle = Arc::new(LifoStack::with_items(
            channels.iter().map(|(handle, _)| handle.clone()).collect(),
        ));

        for (handle, rx) in channels {
            tokio::spawn(run_worker(
                handle,
                Arc::clone(&idle),
                Arc::clone(&pool),
                Arc::clone(&default_headers),
                rx,
            ));
        }

        Self { pool, idle, size }
    }

    /// Run `task` on an idle worker and wait for its result
    ///
    /// # Errors
    ///
    /// Returns the task's own error, or [`GeofetchError::PoolClosed`] if the
    /// pool is terminated while waiting for a worker or for the result.
    pub async fn submit(&self, task: RequestTask) -> Result<Payload> {
        let liveness = self.pool.liveness();
        let worker = self
            .idle
            .pop(liveness)
            .await
            .ok_or(GeofetchError::PoolClosed)?;

        // An idle worker's channel is empty, so this never waits
        let (reply, result) = oneshot::channel();
        worker
            .tasks
            .try_send(Message::Job { task, reply })
            .map_err(|_| GeofetchError::PoolClosed)?;

        tokio::select! {
            biased;
            outcome = result => outcome.map_err(|_| GeofetchError::PoolClosed)?,
            () = liveness.terminated() => Err(GeofetchError::PoolClosed),
        }
    }

    /// Stop the idle workers
    ///
    /// Busy workers exit after their current request, when the idle stack
    /// refuses them. Never waits on a worker.
    pub fn terminate(&self) {
        for handle in self.idle.drain() {
            debug!("Stopping idle worker {}", handle.id);
            let _ = handle.tasks.try_send(Message::Stop);
        }
    }

    /// Number of workers
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of workers not currently serving a request
    pub fn idle(&self) -> usize {
        self.idle.len()
    }
}

async fn run_worker<C: Connector>(
    handle: WorkerHandle,
    idle: Arc<LifoStack<WorkerHandle>>,
    pool: Arc<ConnectionPool<C>>,
    default_headers: Arc<HeaderMap>,
    mut rx: mpsc::Receiver<Message>,
) {
    let id = handle.id;
    debug!("Worker {} started", id);

    while let Some(Message::Job { task, reply }) = rx.recv().await {
        let outcome = tokio::select! {
            biased;
            () = pool.liveness().terminated() => Err(GeofetchError::PoolClosed),
            outcome = execute(&pool, &default_headers, &task) => outcome,
        };
        if reply.send(outcome).is_err() {
            debug!("Worker {}: caller gone before result delivered", id);
        }

        // Rejected once terminated
        if idle.push(handle.clone()).is_err() {
            break;
        }
    }

    debug!("Worker {} stopped", id);
}

/// Perform one request over a pooled connection
async fn execute<C: Connector>(
    pool: &ConnectionPool<C>,
    default_headers: &HeaderMap,
    task: &RequestTask,
) -> Result<Payload> {
    let target = task.target();
    let mut connection = pool.checkout(target).await?;

    let request = OutboundRequest {
        method: task.method().clone(),
        path: target.path().to_string(),
        headers: build_headers(default_headers, task)?,
        body: task.body().cloned().unwrap_or_default(),
    };

    let timeout = pool.timeout_for(target);
    let outcome = match tokio::time::timeout(timeout, connection.transport().send(&request)).await
    {
        Ok(result) => result.and_then(check_status),
        Err(_) => Err(GeofetchError::Timeout {
            authority: target.authority().to_string(),
            after: timeout,
        }),
    };

    match outcome {
        Ok(response) => {
            if response.keep_alive() {
                pool.release(connection);
            } else {
                debug!("{} asked to close the connection", target.authority());
                pool.discard(connection);
            }
            Ok(task.payload(response.body))
        }
        Err(e) => {
            pool.discard(connection);
            Err(e)
        }
    }
}

/// Defaults, then caller headers, then `Host`
fn build_headers(default_headers: &HeaderMap, task: &RequestTask) -> Result<HeaderMap> {
    let mut headers = default_headers.clone();
    for (name, value) in task.headers() {
        headers.insert(name.clone(), value.clone());
    }

    let host = HeaderValue::from_str(task.target().authority())
        .map_err(|e| GeofetchError::InvalidHeader(format!("Host: {e}")))?;
    headers.insert(header::HOST, host);

    Ok(headers)
}

fn check_status(response: RawResponse) -> Result<RawResponse> {
    if response.is_success() {
        return Ok(response);
    }

    Err(GeofetchError::Status {
        status: response.status.as_u16(),
        reason: response
            .status
            .canonical_reason()
            .unwrap_or("Unknown")
            .to_string(),
    })
}
