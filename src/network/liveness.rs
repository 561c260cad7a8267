//! One-way liveness switch

use std::sync::Arc;

use tokio::sync::watch;

/// Process-wide "open" flag that flips to terminated exactly once
///
/// Clones share the same flag. Waiters select on [`Liveness::terminated`]
/// next to their real queue, so a flip wakes every one of them at once.
#[derive(Debug, Clone)]
pub struct Liveness {
    alive: Arc<watch::Sender<bool>>,
}

impl Liveness {
    /// Create an open flag
    #[must_use]
    pub fn new() -> Self {
        let (alive, _) = watch::channel(true);
        Self {
            alive: Arc::new(alive),
        }
    }

    /// `true` until [`Liveness::terminate`] has been called
    pub fn is_alive(&self) -> bool {
        *self.alive.borrow()
    }

    /// Flip to terminated
    ///
    /// Returns `true` only for the call that performed the flip.
    pub fn terminate(&self) -> bool {
        self.alive.send_if_modified(|alive| {
            let was_alive = *alive;
            *alive = false;
            was_alive
        })
    }

    /// Resolve once the flag is terminated (immediately if it already is)
    pub async fn terminated(&self) {
        let mut rx = self.alive.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|alive| !*alive).await;
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}
