//! Per-host connection pool with bounded capacity

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::config::PoolConfig;
use crate::{GeofetchError, Result};

use super::{Connector, HostKey, LifoStack, Liveness, Target, Transport};

/// Slot in a host's set: a live connection, or capacity not yet connected
type Slot<T> = Option<T>;

/// Snapshot of pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Hosts seen so far
    pub hosts: usize,
    /// Slots sitting idle across all hosts (connected or not)
    pub idle: usize,
    /// Connections established
    pub connects: usize,
    /// Forced resets
    pub resets: usize,
}

/// Connection pool that keeps at most `capacity` connections per host
///
/// Slots are created lazily as empty placeholders the first time a host is
/// seen and connected on first use. The most recently returned connection is
/// handed out first.
pub struct ConnectionPool<C: Connector> {
    connector: C,
    capacity: usize,
    hosts: DashMap<HostKey, Arc<LifoStack<Slot<C::Connection>>>>,
    liveness: Liveness,
    local_timeout: Duration,
    remote_timeout: Duration,
    connects: AtomicUsize,
    resets: AtomicUsize,
}

impl<C: Connector> ConnectionPool<C> {
    /// Create a new connection pool
    ///
    /// # Panics
    ///
    /// Panics if `config.size` is 0
    #[must_use]
    pub fn new(connector: C, config: &PoolConfig) -> Self {
        assert!(config.size > 0, "pool size must be > 0");

        Self {
            connector,
            capacity: config.size,
            hosts: DashMap::new(),
            liveness: Liveness::new(),
            local_timeout: config.local_timeout(),
            remote_timeout: config.remote_timeout(),
            connects: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
        }
    }

    /// Check out a connection to `url`'s host, waiting for a free slot
    ///
    /// # Errors
    ///
    /// Returns [`GeofetchError::PoolTerminated`] if the pool is or becomes
    /// terminated while waiting, or the connect error if a new connection
    /// could not be opened.
    pub async fn acquire(&self, url: &str) -> Result<PooledConnection<C>> {
        let target = Target::parse(url)?;
        self.checkout(&target).await
    }

    pub(crate) async fn checkout(&self, target: &Target) -> Result<PooledConnection<C>> {
        if !self.liveness.is_alive() {
            return Err(GeofetchError::PoolTerminated);
        }

        let slots = self.slots(target.key());
        let slot = slots
            .pop(&self.liveness)
            .await
            .ok_or(GeofetchError::PoolTerminated)?;

        // The server may have closed an idle keep-alive connection
        let slot = slot.filter(|connection| {
            let closed = connection.is_closed();
            if closed {
                debug!("Idle connection to {} was closed, reconnecting", target.authority());
            }
            !closed
        });

        let connection = match slot {
            Some(connection) => connection,
            None => match self.connect(target).await {
                Ok(connection) => connection,
                Err(e) => {
                    // Give the placeholder back so capacity is not lost
                    let _ = slots.push(None);
                    return Err(e);
                }
            },
        };

        Ok(PooledConnection {
            connection: Some(connection),
            slots,
            liveness: self.liveness.clone(),
            target: target.clone(),
            reusable: false,
        })
    }

    /// Return a healthy connection for reuse
    ///
    /// A connection that has been closed meanwhile is discarded instead. Once
    /// the pool is terminated this only closes the connection.
    pub fn release(&self, mut connection: PooledConnection<C>) {
        connection.reusable = connection
            .connection
            .as_ref()
            .is_some_and(|transport| !transport.is_closed());
    }

    /// Close a connection and free its slot for a fresh connect
    pub fn discard(&self, connection: PooledConnection<C>) {
        drop(connection);
    }

    /// Close one connection to `url`'s host so the next checkout reconnects
    ///
    /// # Errors
    ///
    /// Returns error if a slot cannot be acquired
    pub async fn reset(&self, url: &str) -> Result<()> {
        if !self.liveness.is_alive() {
            return Ok(());
        }

        let connection = self.acquire(url).await?;
        self.resets.fetch_add(1, Ordering::Relaxed);
        debug!("Resetting connection to {}", connection.target().authority());
        self.discard(connection);
        Ok(())
    }

    /// Terminate the pool
    ///
    /// Marks the pool dead first, so every waiting and future checkout fails
    /// at once, then closes the idle connections. Checked-out connections are
    /// left to their holders and closed when they come back.
    pub fn terminate(&self) {
        if !self.liveness.terminate() {
            return;
        }

        let mut closed = 0;
        for entry in self.hosts.iter() {
            closed += entry.value().drain().into_iter().flatten().count();
        }

        info!(
            "Connection pool terminated: {} hosts, {} idle connections closed",
            self.hosts.len(),
            closed
        );
    }

    /// Whether the pool is still in use
    pub fn is_alive(&self) -> bool {
        self.liveness.is_alive()
    }

    /// The pool's liveness flag
    pub fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    /// Maximum connections per host
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Connect and exchange timeout for `target`
    pub fn timeout_for(&self, target: &Target) -> Duration {
        if target.is_local() {
            self.local_timeout
        } else {
            self.remote_timeout
        }
    }

    /// Current counters
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hosts: self.hosts.len(),
            idle: self.hosts.iter().map(|entry| entry.value().len()).sum(),
            connects: self.connects.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
        }
    }

    /// Get or atomically create the slot set for `key`
    fn slots(&self, key: &HostKey) -> Arc<LifoStack<Slot<C::Connection>>> {
        self.hosts
            .entry(key.clone())
            .or_insert_with(|| {
                debug!("Allocating {} connection slots for {}", self.capacity, key);
                let placeholders = std::iter::repeat_with(|| None).take(self.capacity).collect();
                Arc::new(LifoStack::with_items(placeholders))
            })
            .clone()
    }

    async fn connect(&self, target: &Target) -> Result<C::Connection> {
        let timeout = self.timeout_for(target);
        let connection = tokio::time::timeout(timeout, self.connector.connect(target))
            .await
            .map_err(|_| GeofetchError::Timeout {
                authority: target.authority().to_string(),
                after: timeout,
            })??;

        self.connects.fetch_add(1, Ordering::Relaxed);
        Ok(connection)
    }
}

/// A checked-out connection
///
/// Hand it back with [`ConnectionPool::release`] when the exchange succeeded.
/// Dropping it any other way closes the connection and frees the slot for a
/// fresh connect.
pub struct PooledConnection<C: Connector> {
    connection: Option<C::Connection>,
    slots: Arc<LifoStack<Slot<C::Connection>>>,
    liveness: Liveness,
    target: Target,
    reusable: bool,
}

impl<C: Connector> PooledConnection<C> {
    /// Target the connection was checked out for
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// The underlying connection
    ///
    /// # Panics
    ///
    /// Never panics; the connection is only taken out when the guard drops
    pub fn transport(&mut self) -> &mut C::Connection {
        self.connection
            .as_mut()
            .expect("connection is present until drop")
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        let connection = self.connection.take();
        let slot = if self.reusable { connection } else { None };

        // After termination the slot is not put back
        if self.liveness.is_alive() {
            let _ = self.slots.push(slot);
        }
    }
}
