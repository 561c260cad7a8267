//! Bounded LIFO hand-out stack shared by the connection and worker pools

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Semaphore;

use super::Liveness;

/// Most-recently-pushed-first stack with an async pop
///
/// The semaphore holds one permit per item in `items`; a pop waits for a
/// permit and then takes the top item under the lock. Closing the semaphore
/// (see [`LifoStack::drain`]) rejects later pushes and wakes every waiter.
pub(crate) struct LifoStack<T> {
    items: Mutex<Vec<T>>,
    available: Semaphore,
}

impl<T> LifoStack<T> {
    /// Create a stack pre-filled with `items`
    pub fn with_items(items: Vec<T>) -> Self {
        let count = items.len();
        Self {
            items: Mutex::new(items),
            available: Semaphore::new(count),
        }
    }

    /// Take the top item, waiting until one is pushed
    ///
    /// Returns `None` once `liveness` is terminated or the stack is drained.
    pub async fn pop(&self, liveness: &Liveness) -> Option<T> {
        if !liveness.is_alive() {
            return None;
        }

        tokio::select! {
            biased;
            () = liveness.terminated() => None,
            permit = self.available.acquire() => {
                permit.ok()?.forget();
                self.lock().pop()
            }
        }
    }

    /// Put `item` on top
    ///
    /// Hands the item back if the stack has been drained.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut items = self.lock();
        if self.available.is_closed() {
            return Err(item);
        }
        items.push(item);
        self.available.add_permits(1);
        Ok(())
    }

    /// Close the stack and take every idle item, top first
    ///
    /// Items currently popped are left to their holders; pushing them back
    /// later fails.
    pub fn drain(&self) -> Vec<T> {
        let mut items = self.lock();
        self.available.close();
        let mut drained = std::mem::take(&mut *items);
        drained.reverse();
        drained
    }

    /// Number of idle items
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
