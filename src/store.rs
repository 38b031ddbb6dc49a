//! The pluggable store capability and the default in-memory implementation.
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration as StdDuration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::sync::Notify;

/// Errors a [`Store`] implementation may report.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The backend itself failed (connection, protocol, serialization on
    /// the backend's own wire format, etc).
    #[error("session store error: {0}")]
    Backend(String),
}

/// The minimum contract a session store must satisfy.
///
/// `token` is whatever key the [`SessionManager`](crate::manager::SessionManager)
/// passes in — plaintext or, when `hash_token_in_store` is enabled, its
/// SHA-256 hex digest. The store itself is oblivious to which.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Look up a record. Implementations MUST return `Ok(None)` for
    /// entries whose stored expiry is at or before now, even if the row
    /// has not yet been swept.
    async fn find(&self, token: &str) -> Result<Option<Vec<u8>>, Error>;

    /// Upsert a record. Overwriting an existing token is mandatory.
    ///
    /// Last-writer-wins: concurrent commits to the same token may race,
    /// and the store is not required to offer compare-and-set semantics.
    async fn commit(&self, token: &str, bytes: Vec<u8>, expiry: OffsetDateTime)
        -> Result<(), Error>;

    /// Delete a record. Idempotent: deleting a missing token is not an
    /// error.
    async fn delete(&self, token: &str) -> Result<(), Error>;

    /// Enumerate every non-expired record, keyed by token.
    ///
    /// This is the optional `All` capability from the store contract.
    /// Stores that cannot enumerate their contents return `Ok(None)`; the
    /// manager turns that into [`crate::error::Error::IterationUnsupported`].
    async fn all(&self) -> Result<Option<HashMap<String, Vec<u8>>>, Error> {
        Ok(None)
    }
}

struct Record {
    bytes: Vec<u8>,
    expiry: OffsetDateTime,
}

impl Record {
    fn is_expired(&self) -> bool {
        self.expiry <= OffsetDateTime::now_utc()
    }
}

struct Inner {
    records: Mutex<HashMap<String, Record>>,
    stop: Notify,
    /// Count of live `MemoryStore` handles, excluding the sweeper task's
    /// own `Arc` clone. The task holds a permanent reference for its whole
    /// lifetime, so `Arc::strong_count` alone can never tell us when the
    /// last *handle* (as opposed to the last reference) has gone away.
    handles: AtomicUsize,
}

/// The default in-memory store: a mutex-guarded map plus a background
/// sweeper task.
///
/// Cloning shares the underlying map and sweeper; dropping the last clone
/// stops the sweeper.
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Clone for MemoryStore {
    fn clone(&self) -> Self {
        self.inner.handles.fetch_add(1, Ordering::Relaxed);
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("len", &self.inner.records.lock().len())
            .finish()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(StdDuration::from_secs(60))
    }
}

impl MemoryStore {
    /// Creates a store and spawns its background sweeper on the given
    /// interval. Requires a `tokio` runtime to already be running.
    pub fn new(sweep_interval: StdDuration) -> Self {
        let (inner, _sweeper) = Self::spawn_sweeper(sweep_interval);
        Self { inner }
    }

    /// Builds the shared state and spawns the sweeper loop, handing back
    /// its `JoinHandle` so tests can await the task's exit directly
    /// instead of inferring it from side effects.
    fn spawn_sweeper(sweep_interval: StdDuration) -> (Arc<Inner>, tokio::task::JoinHandle<()>) {
        let inner = Arc::new(Inner {
            records: Mutex::new(HashMap::new()),
            stop: Notify::new(),
            handles: AtomicUsize::new(1),
        });

        let task_inner = Arc::clone(&inner);
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            // The first tick fires immediately; skip it so we don't sweep
            // an empty store on startup.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let mut records = task_inner.records.lock();
                        let before = records.len();
                        records.retain(|_, record| !record.is_expired());
                        let removed = before - records.len();
                        drop(records);
                        if removed > 0 {
                            tracing::trace!(removed, "swept expired sessions");
                        }
                    }
                    _ = task_inner.stop.notified() => {
                        tracing::trace!("session sweeper stopping");
                        break;
                    }
                }
            }
        });

        (inner, sweeper)
    }

    /// Like [`new`](Self::new), but also returns the sweeper task's
    /// `JoinHandle` so tests can assert it actually exits on teardown.
    #[cfg(test)]
    fn new_with_sweeper_handle(sweep_interval: StdDuration) -> (Self, tokio::task::JoinHandle<()>) {
        let (inner, sweeper) = Self::spawn_sweeper(sweep_interval);
        (Self { inner }, sweeper)
    }

    /// Number of records currently held, expired or not (for tests).
    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.records.lock().len()
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        // `handles` excludes the sweeper task's own `Arc` clone, so it
        // reaches zero exactly when the last `MemoryStore` handle (as
        // opposed to the last `Arc` reference, which also counts the
        // task) goes away.
        if self.inner.handles.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.stop.notify_one();
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find(&self, token: &str) -> Result<Option<Vec<u8>>, Error> {
        let records = self.inner.records.lock();
        Ok(records.get(token).and_then(|record| {
            if record.is_expired() {
                None
            } else {
                Some(record.bytes.clone())
            }
        }))
    }

    async fn commit(
        &self,
        token: &str,
        bytes: Vec<u8>,
        expiry: OffsetDateTime,
    ) -> Result<(), Error> {
        self.inner
            .records
            .lock()
            .insert(token.to_owned(), Record { bytes, expiry });
        Ok(())
    }

    async fn delete(&self, token: &str) -> Result<(), Error> {
        self.inner.records.lock().remove(token);
        Ok(())
    }

    async fn all(&self) -> Result<Option<HashMap<String, Vec<u8>>>, Error> {
        let now = OffsetDateTime::now_utc();
        let snapshot = self
            .inner
            .records
            .lock()
            .iter()
            .filter(|(_, record)| record.expiry > now)
            .map(|(token, record)| (token.clone(), record.bytes.clone()))
            .collect();
        Ok(Some(snapshot))
    }
}
