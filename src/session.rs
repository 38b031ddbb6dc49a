//! The per-request session object: a token, a value map, a deadline, and a
//! dirty-tracking status, guarded by a per-session mutex.
use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use time::OffsetDateTime;

use crate::value::Value;

/// The lifecycle state of a [`Session`] over the course of one request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// No mutating operation has been called.
    Unmodified,
    /// At least one mutating operation has been called since the session
    /// was loaded.
    Modified,
    /// [`Session::destroy`] was called. Terminal: further mutations are
    /// still permitted on the in-memory map, but commit must delete the
    /// record from the store and the middleware must emit an expiring
    /// cookie rather than a fresh one.
    Destroyed,
}

struct SessionData {
    token: Option<String>,
    values: HashMap<String, Value>,
    deadline: OffsetDateTime,
    status: Status,
    /// Per-session override of the manager's `Cookie.Persist` default, set
    /// via `SessionManager::remember_me`.
    remember_me: Option<bool>,
}

/// The server-side mutable state associated with one client for the
/// duration of a request.
///
/// A session with no token has never been persisted; [`SessionManager::commit`](crate::manager::SessionManager::commit)
/// assigns one before writing to the store. All operations here are
/// synchronous — they only ever touch the in-memory map — and acquire the
/// session's own mutex for their duration, so a `Session` may be cloned and
/// shared with helper tasks within the same request without extra
/// synchronization.
#[derive(Clone)]
pub struct Session {
    data: Arc<Mutex<SessionData>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let data = self.data.lock();
        f.debug_struct("Session")
            .field("token", &data.token.as_deref().unwrap_or("<none>"))
            .field("status", &data.status)
            .field("keys", &data.values.len())
            .finish()
    }
}

impl Session {
    /// Creates a fresh, tokenless session with the given deadline and
    /// `Unmodified` status.
    pub(crate) fn new(deadline: OffsetDateTime) -> Self {
        Self {
            data: Arc::new(Mutex::new(SessionData {
                token: None,
                values: HashMap::new(),
                deadline,
                status: Status::Unmodified,
                remember_me: None,
            })),
        }
    }

    /// Reconstructs a session that was loaded from the store.
    pub(crate) fn from_parts(
        token: String,
        values: HashMap<String, Value>,
        deadline: OffsetDateTime,
    ) -> Self {
        Self {
            data: Arc::new(Mutex::new(SessionData {
                token: Some(token),
                values,
                deadline,
                status: Status::Unmodified,
                remember_me: None,
            })),
        }
    }

    /// The session's token, if it has ever been persisted.
    pub fn token(&self) -> Option<String> {
        self.data.lock().token.clone()
    }

    pub(crate) fn set_token(&self, token: String) {
        self.data.lock().token = Some(token);
    }

    /// Clears the token, forcing the next commit to assign a fresh one.
    /// Used by `RenewToken`.
    pub(crate) fn clear_token(&self) {
        self.data.lock().token = None;
    }

    /// Marks the session `Modified` without otherwise touching it. Used by
    /// `RenewToken` and `RememberMe`, which must force a `Set-Cookie` even
    /// when no key/value mutation occurred.
    pub(crate) fn touch(&self) {
        Self::mark_modified(&mut self.data.lock());
    }

    /// The per-session `RememberMe` override, if one was set.
    pub fn remember_me_override(&self) -> Option<bool> {
        self.data.lock().remember_me
    }

    pub(crate) fn set_remember_me(&self, remember: bool) {
        self.data.lock().remember_me = Some(remember);
    }

    /// The absolute instant at which this session expires regardless of
    /// activity.
    pub fn deadline(&self) -> OffsetDateTime {
        self.data.lock().deadline
    }

    pub(crate) fn set_deadline(&self, deadline: OffsetDateTime) {
        self.data.lock().deadline = deadline;
    }

    /// Current dirty-tracking status.
    pub fn status(&self) -> Status {
        self.data.lock().status
    }

    fn mark_modified(data: &mut SessionData) {
        if data.status != Status::Destroyed {
            data.status = Status::Modified;
        }
    }

    /// Reads a value by key. Does not change `status`.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.data.lock().values.get(key).cloned()
    }

    /// Reads then removes a value by key. Marks `Modified` if the key
    /// existed.
    pub fn pop(&self, key: &str) -> Option<Value> {
        let mut data = self.data.lock();
        let value = data.values.remove(key);
        if value.is_some() {
            Self::mark_modified(&mut data);
        }
        value
    }

    /// Stores a value, marking the session `Modified`.
    pub fn put(&self, key: impl Into<String>, value: impl Into<Value>) {
        let mut data = self.data.lock();
        data.values.insert(key.into(), value.into());
        Self::mark_modified(&mut data);
    }

    /// Deletes a key. Marks `Modified` if the key existed.
    pub fn remove(&self, key: &str) {
        let mut data = self.data.lock();
        if data.values.remove(key).is_some() {
            Self::mark_modified(&mut data);
        }
    }

    /// Empties the value map, marking the session `Modified`.
    pub fn clear(&self) {
        let mut data = self.data.lock();
        data.values.clear();
        Self::mark_modified(&mut data);
    }

    /// A sorted snapshot of the session's keys.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.lock().values.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Whether `key` is present.
    pub fn exists(&self, key: &str) -> bool {
        self.data.lock().values.contains_key(key)
    }

    /// Marks the session `Destroyed` and empties the value map.
    pub fn destroy(&self) {
        let mut data = self.data.lock();
        data.values.clear();
        data.status = Status::Destroyed;
    }

    /// A snapshot of the full value map, used by the manager when
    /// encoding for commit or merging another session's data in.
    pub(crate) fn snapshot(&self) -> HashMap<String, Value> {
        self.data.lock().values.clone()
    }

    /// Overwrites the current key with incoming values, used by
    /// `MergeSession` (incoming overwrites current on conflict).
    pub(crate) fn merge_in(&self, incoming: HashMap<String, Value>) {
        let mut data = self.data.lock();
        data.values.extend(incoming);
        Self::mark_modified(&mut data);
    }

    // -- Typed accessors -----------------------------------------------
    //
    // These never error: a missing key or a type mismatch yields the
    // requested type's zero value.

    pub fn get_string(&self, key: &str) -> String {
        self.get(key)
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_default()
    }

    pub fn get_int(&self, key: &str) -> i64 {
        self.get(key).and_then(|v| v.as_i64()).unwrap_or_default()
    }

    pub fn get_float(&self, key: &str) -> f64 {
        self.get(key).and_then(|v| v.as_f64()).unwrap_or_default()
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key).and_then(|v| v.as_bool()).unwrap_or_default()
    }

    pub fn get_bytes(&self, key: &str) -> Vec<u8> {
        self.get(key)
            .and_then(|v| v.as_bytes().map(<[u8]>::to_vec))
            .unwrap_or_default()
    }

    /// Reads `key` as a [`time::OffsetDateTime`], defaulting to the Unix
    /// epoch when absent or of a different type.
    pub fn get_time(&self, key: &str) -> OffsetDateTime {
        self.get(key)
            .and_then(|v| v.as_time())
            .unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }

    pub fn pop_string(&self, key: &str) -> String {
        self.pop(key)
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_default()
    }

    pub fn pop_int(&self, key: &str) -> i64 {
        self.pop(key).and_then(|v| v.as_i64()).unwrap_or_default()
    }

    pub fn pop_float(&self, key: &str) -> f64 {
        self.pop(key).and_then(|v| v.as_f64()).unwrap_or_default()
    }

    pub fn pop_bool(&self, key: &str) -> bool {
        self.pop(key).and_then(|v| v.as_bool()).unwrap_or_default()
    }

    pub fn pop_bytes(&self, key: &str) -> Vec<u8> {
        self.pop(key)
            .and_then(|v| v.as_bytes().map(<[u8]>::to_vec))
            .unwrap_or_default()
    }

    pub fn pop_time(&self, key: &str) -> OffsetDateTime {
        self.pop(key)
            .and_then(|v| v.as_time())
            .unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }
}
