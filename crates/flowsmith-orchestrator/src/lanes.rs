//! Admission control
//!
//! A [`SessionLane`] admits at most one unit of work per key; a
//! [`GlobalLane`] bounds total concurrency across every caller. Both give
//! the slot back when the admitted future finishes or unwinds, because the
//! permit is dropped with it.

use flowsmith_core::{FlowError, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Await `fut` unless the token fires first
pub(crate) async fn until_cancelled<T, F>(token: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(FlowError::Cancelled),
        result = fut => result,
    }
}

/// Wait for a permit, or fail with the caller's cancellation
async fn admit(token: &CancellationToken, slot: Arc<Semaphore>) -> Result<OwnedSemaphorePermit> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(FlowError::Cancelled),
        permit = slot.acquire_owned() => permit.map_err(|_| FlowError::Cancelled),
    }
}

/// One slot per key
///
/// A key's entry lives only while someone holds or waits for its slot.
#[derive(Default)]
pub struct SessionLane {
    slots: Mutex<HashMap<String, Arc<Semaphore>>>,
}

/// Held for the admitted unit of work; gives the slot back on drop
struct SessionPermit<'a> {
    lane: &'a SessionLane,
    key: &'a str,
    slot: Arc<Semaphore>,
    permit: Option<OwnedSemaphorePermit>,
}

impl Drop for SessionPermit<'_> {
    fn drop(&mut self) {
        self.permit.take();
        self.lane.release(self.key, &self.slot);
    }
}

impl SessionLane {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Arc<Semaphore> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    /// Forget the key once the map and `slot` hold the only references
    fn release(&self, key: &str, slot: &Arc<Semaphore>) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let idle = slots
            .get(key)
            .is_some_and(|s| Arc::ptr_eq(s, slot) && Arc::strong_count(slot) == 2);
        if idle {
            slots.remove(key);
        }
    }

    /// Keys currently held or waited on
    pub fn active_keys(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Run `f` once the key's slot is free
    ///
    /// An empty key is not serialized against anything.
    pub async fn run<F, Fut, T>(&self, token: &CancellationToken, key: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let key = key.trim();
        if key.is_empty() {
            if token.is_cancelled() {
                return Err(FlowError::Cancelled);
            }
            return f().await;
        }

        let slot = self.slot(key);
        let permit = match admit(token, slot.clone()).await {
            Ok(permit) => permit,
            Err(e) => {
                self.release(key, &slot);
                return Err(e);
            }
        };
        let _held = SessionPermit {
            lane: self,
            key,
            slot,
            permit: Some(permit),
        };
        debug!("session lane admitted {}", key);
        f().await
    }
}

/// A fixed pool of slots shared by all callers
pub struct GlobalLane {
    slots: Arc<Semaphore>,
    limit: usize,
}

impl GlobalLane {
    /// A limit of zero is treated as one
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            slots: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Slots not currently held
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    pub async fn run<F, Fut, T>(&self, token: &CancellationToken, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _permit = admit(token, self.slots.clone()).await?;
        f().await
    }
}

impl Default for GlobalLane {
    fn default() -> Self {
        Self::new(4)
    }
}
