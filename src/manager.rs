//! Configuration holder and public API surface: token issuance, state
//! mutation operations, load/commit orchestration, renewal, destruction.
use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use http::Extensions;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};
use tower_cookies::cookie::SameSite;

use crate::{
    codec::{Codec, JsonCodec, Payload},
    error::Error,
    session::{Session, Status},
    store::Store,
};

/// Cookie attributes a [`SessionManager`] writes on commit/destroy.
#[derive(Clone, Debug)]
pub struct CookieConfig {
    pub name: String,
    pub domain: Option<String>,
    pub path: String,
    pub http_only: bool,
    pub secure: bool,
    pub same_site: SameSite,
    /// Whether the cookie outlives the browser session by default. Can be
    /// overridden per-session via [`SessionManager::remember_me`].
    pub persist: bool,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            name: "session".to_string(),
            domain: None,
            path: "/".to_string(),
            http_only: true,
            secure: false,
            same_site: SameSite::Lax,
            persist: true,
        }
    }
}

/// Process-wide configuration for a [`SessionManager`].
#[derive(Clone, Debug)]
pub struct SessionManagerConfig {
    /// Absolute maximum session age.
    pub lifetime: Duration,
    /// Expires sessions after inactivity. `None` disables idle expiry.
    pub idle_timeout: Option<Duration>,
    pub cookie: CookieConfig,
    /// When true, the store is keyed by the SHA-256 hex digest of the
    /// token rather than the token itself.
    pub hash_token_in_store: bool,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            lifetime: Duration::hours(24),
            idle_timeout: None,
            cookie: CookieConfig::default(),
            hash_token_in_store: false,
        }
    }
}

/// A process-unique marker a [`SessionManager`] uses to find its own
/// `Session` among any others attached to the same request, so multiple
/// managers can be layered on one service without colliding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContextKey(u64);

impl ContextKey {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Holds every manager's attached `Session` for the current request,
/// keyed by [`ContextKey`]. Inserted into `http::Extensions` lazily by
/// whichever manager is first to touch the request.
#[derive(Default)]
struct SessionSlots(HashMap<ContextKey, Session>);

/// Configuration holder and public API surface for the session lifecycle.
///
/// Cloning a `SessionManager` is cheap (it is built on an inner `Arc`) and
/// shares the same store, codec, and context key; this is how the
/// [`LoadAndSave`](crate::middleware::LoadAndSave) middleware and handler
/// code both reach the same sessions.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: SessionManagerConfig,
    store: Arc<dyn Store>,
    codec: Arc<dyn Codec>,
    context_key: ContextKey,
    error_handler: Arc<dyn Fn(Error) + Send + Sync>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("config", &self.inner.config)
            .field("context_key", &self.inner.context_key)
            .finish()
    }
}

fn default_error_handler(err: Error) {
    tracing::error!(err = %err, "session middleware error");
}

impl SessionManager {
    /// Creates a manager over the given store with default configuration
    /// and the default JSON codec.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config: SessionManagerConfig::default(),
                store,
                codec: Arc::new(JsonCodec),
                context_key: ContextKey::next(),
                error_handler: Arc::new(default_error_handler),
            }),
        }
    }

    fn with_inner(self, f: impl FnOnce(&mut Inner)) -> Self {
        // Builders are called during setup, before the manager is shared,
        // so unwrapping the Arc here is always safe.
        let mut inner = match Arc::try_unwrap(self.inner) {
            Ok(inner) => inner,
            Err(arc) => arc.clone_for_builder(),
        };
        f(&mut inner);
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn with_codec(self, codec: impl Codec) -> Self {
        self.with_inner(|inner| inner.codec = Arc::new(codec))
    }

    pub fn with_lifetime(self, lifetime: Duration) -> Self {
        self.with_inner(|inner| inner.config.lifetime = lifetime)
    }

    pub fn with_idle_timeout(self, idle_timeout: Duration) -> Self {
        self.with_inner(|inner| inner.config.idle_timeout = Some(idle_timeout))
    }

    pub fn with_cookie_name(self, name: impl Into<String>) -> Self {
        self.with_inner(|inner| inner.config.cookie.name = name.into())
    }

    pub fn with_domain(self, domain: impl Into<String>) -> Self {
        self.with_inner(|inner| inner.config.cookie.domain = Some(domain.into()))
    }

    pub fn with_path(self, path: impl Into<String>) -> Self {
        self.with_inner(|inner| inner.config.cookie.path = path.into())
    }

    pub fn with_http_only(self, http_only: bool) -> Self {
        self.with_inner(|inner| inner.config.cookie.http_only = http_only)
    }

    pub fn with_secure(self, secure: bool) -> Self {
        self.with_inner(|inner| inner.config.cookie.secure = secure)
    }

    pub fn with_same_site(self, same_site: SameSite) -> Self {
        self.with_inner(|inner| inner.config.cookie.same_site = same_site)
    }

    pub fn with_persist(self, persist: bool) -> Self {
        self.with_inner(|inner| inner.config.cookie.persist = persist)
    }

    pub fn with_hash_token_in_store(self, hash: bool) -> Self {
        self.with_inner(|inner| inner.config.hash_token_in_store = hash)
    }

    pub fn with_error_handler(self, handler: impl Fn(Error) + Send + Sync + 'static) -> Self {
        self.with_inner(|inner| inner.error_handler = Arc::new(handler))
    }

    pub fn config(&self) -> &SessionManagerConfig {
        &self.inner.config
    }

    pub(crate) fn report_error(&self, err: Error) {
        (self.inner.error_handler)(err);
    }

    fn storage_key(&self, token: &str) -> String {
        if self.inner.config.hash_token_in_store {
            hex::encode(Sha256::digest(token.as_bytes()))
        } else {
            token.to_owned()
        }
    }

    fn generate_token() -> String {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }

    async fn issue_token(&self) -> Result<String, Error> {
        let mut token = Self::generate_token();
        for _ in 0..2 {
            let key = self.storage_key(&token);
            match self.inner.store.find(&key).await? {
                None => return Ok(token),
                Some(_) => token = Self::generate_token(),
            }
        }
        Err(Error::TokenGeneration(
            "generated token collided with an existing session twice".to_string(),
        ))
    }

    // -- Lifecycle -------------------------------------------------------

    /// Returns a fresh session with no token and `deadline = now + Lifetime`.
    pub fn load_new(&self) -> Session {
        Session::new(OffsetDateTime::now_utc() + self.inner.config.lifetime)
    }

    /// Loads a session by token. Returns a fresh session if `token` is
    /// empty, not found, undecodable, or past its deadline.
    pub async fn load(&self, token: &str) -> Session {
        if token.is_empty() {
            return self.load_new();
        }

        let key = self.storage_key(token);
        let found = match self.inner.store.find(&key).await {
            Ok(found) => found,
            Err(err) => {
                tracing::warn!(err = %err, "store error while loading session, starting fresh");
                return self.load_new();
            }
        };

        let Some(bytes) = found else {
            return self.load_new();
        };

        match self.inner.codec.decode(&bytes) {
            Ok(payload) if payload.deadline > OffsetDateTime::now_utc() => {
                Session::from_parts(token.to_owned(), payload.values, payload.deadline)
            }
            Ok(_) => {
                tracing::trace!("session past its deadline, starting fresh");
                self.load_new()
            }
            Err(err) => {
                tracing::warn!(err = %err, "corrupt session payload, starting fresh");
                self.load_new()
            }
        }
    }

    /// Persists a `Modified` session, assigning it a token first if it
    /// does not have one. No-op for `Unmodified`/`Destroyed` sessions.
    pub async fn commit(&self, session: &Session) -> Result<(String, OffsetDateTime), Error> {
        if session.status() != Status::Modified {
            return Ok((session.token().unwrap_or_default(), session.deadline()));
        }

        let token = match session.token() {
            Some(token) => token,
            None => {
                let token = self.issue_token().await?;
                session.set_token(token.clone());
                token
            }
        };

        let deadline = session.deadline();
        let payload = Payload {
            deadline,
            values: session.snapshot(),
        };
        let bytes = self.inner.codec.encode(&payload)?;
        let expiry = match self.inner.config.idle_timeout {
            Some(idle) => std::cmp::min(deadline, OffsetDateTime::now_utc() + idle),
            None => deadline,
        };

        let key = self.storage_key(&token);
        self.inner.store.commit(&key, bytes, expiry).await?;

        Ok((token, deadline))
    }

    /// Deletes the session's token from the store (if any), then marks it
    /// `Destroyed` and empties its values.
    pub async fn destroy(&self, session: &Session) -> Result<(), Error> {
        if let Some(token) = session.token() {
            let key = self.storage_key(&token);
            self.inner.store.delete(&key).await?;
        }
        session.destroy();
        Ok(())
    }

    /// Deletes the previous token from the store (idempotently) and
    /// clears the session's token so the next commit assigns a new one.
    /// Values and deadline are preserved. Used on privilege change to
    /// prevent session fixation.
    pub async fn renew_token(&self, session: &Session) -> Result<(), Error> {
        if let Some(old_token) = session.token() {
            let key = self.storage_key(&old_token);
            if let Err(err) = self.inner.store.delete(&key).await {
                tracing::warn!(err = %err, "non-fatal: failed deleting old token during renew");
            }
        }
        session.clear_token();
        session.touch();
        Ok(())
    }

    /// Loads another stored session by token and merges its keys into
    /// `session`. On key conflict, the incoming value overwrites the
    /// current one.
    pub async fn merge_session(&self, session: &Session, token: &str) -> Result<(), Error> {
        let key = self.storage_key(token);
        let Some(bytes) = self.inner.store.find(&key).await? else {
            return Ok(());
        };
        let payload = self.inner.codec.decode(&bytes)?;
        session.merge_in(payload.values);
        Ok(())
    }

    /// Commits whatever `Session` is attached to `ext` under this
    /// manager's context key.
    ///
    /// Unlike the read/write delegators below (`put`, `get`, ...), a
    /// caller asking to commit or destroy a request's session with none
    /// attached is a usage error rather than something to paper over with
    /// a freshly-vivified session — there, [`Error::NoSession`] is
    /// returned instead.
    pub async fn commit_attached(&self, ext: &Extensions) -> Result<(String, OffsetDateTime), Error> {
        let session = self.attached(ext).ok_or(Error::NoSession)?;
        self.commit(&session).await
    }

    /// Destroys whatever `Session` is attached to `ext`. Returns
    /// [`Error::NoSession`] if none is attached; see [`Self::commit_attached`].
    pub async fn destroy_attached(&self, ext: &Extensions) -> Result<(), Error> {
        let session = self.attached(ext).ok_or(Error::NoSession)?;
        self.destroy(&session).await
    }

    /// Renews the token of whatever `Session` is attached to `ext`.
    /// Returns [`Error::NoSession`] if none is attached; see
    /// [`Self::commit_attached`].
    pub async fn renew_token_attached(&self, ext: &Extensions) -> Result<(), Error> {
        let session = self.attached(ext).ok_or(Error::NoSession)?;
        self.renew_token(&session).await
    }

    /// Merges another stored session's keys into whatever `Session` is
    /// attached to `ext`. Returns [`Error::NoSession`] if none is
    /// attached; see [`Self::commit_attached`].
    pub async fn merge_session_attached(&self, ext: &Extensions, token: &str) -> Result<(), Error> {
        let session = self.attached(ext).ok_or(Error::NoSession)?;
        self.merge_session(&session, token).await
    }

    /// Per-session override of `Cookie.Persist`.
    pub fn remember_me(&self, session: &Session, remember: bool) {
        session.set_remember_me(remember);
        session.touch();
    }

    /// Whether a cookie written for `session` should carry
    /// `Max-Age`/`Expires`, accounting for any `RememberMe` override.
    pub fn effective_persist(&self, session: &Session) -> bool {
        session
            .remember_me_override()
            .unwrap_or(self.inner.config.cookie.persist)
    }

    /// Enumerates every stored session via the store's optional iteration
    /// capability, decoding each into a transient `Session`, invoking
    /// `f`, and committing/deleting per `f`'s mutations. Halts and
    /// returns the first error encountered.
    pub async fn iterate<F, Fut>(&self, mut f: F) -> Result<(), Error>
    where
        F: FnMut(Session) -> Fut,
        Fut: Future<Output = Result<(), Error>>,
    {
        let all = self
            .inner
            .store
            .all()
            .await?
            .ok_or(Error::IterationUnsupported)?;

        let now = OffsetDateTime::now_utc();
        for (storage_key, bytes) in all {
            let payload = match self.inner.codec.decode(&bytes) {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::warn!(err = %err, "skipping corrupt session during iteration");
                    continue;
                }
            };
            if payload.deadline <= now {
                continue;
            }

            let session = Session::from_parts(storage_key.clone(), payload.values, payload.deadline);
            f(session.clone()).await?;

            match session.status() {
                Status::Modified => {
                    // The session already carries the resolved storage
                    // key as its token, so we write through the store
                    // directly rather than re-deriving (and potentially
                    // re-hashing) a storage key from it.
                    let payload = Payload {
                        deadline: session.deadline(),
                        values: session.snapshot(),
                    };
                    let bytes = self.inner.codec.encode(&payload)?;
                    let expiry = match self.inner.config.idle_timeout {
                        Some(idle) => std::cmp::min(session.deadline(), now + idle),
                        None => session.deadline(),
                    };
                    self.inner.store.commit(&storage_key, bytes, expiry).await?;
                }
                Status::Destroyed => {
                    self.inner.store.delete(&storage_key).await?;
                }
                Status::Unmodified => {}
            }
        }

        Ok(())
    }

    // -- Context-attached delegation -------------------------------------
    //
    // Every operation below first obtains the Session attached to `ext`
    // under this manager's context key, creating a fresh one if none is
    // attached yet (so these also work outside a `LoadAndSave` deployment,
    // e.g. in unit tests).

    pub(crate) fn attach(&self, ext: &mut Extensions, session: Session) {
        match ext.get_mut::<SessionSlots>() {
            Some(slots) => {
                slots.0.insert(self.inner.context_key, session);
            }
            None => {
                let mut slots = SessionSlots::default();
                slots.0.insert(self.inner.context_key, session);
                ext.insert(slots);
            }
        }
    }

    /// The `Session` attached to `ext` under this manager's context key,
    /// if any.
    pub fn attached(&self, ext: &Extensions) -> Option<Session> {
        ext.get::<SessionSlots>()
            .and_then(|slots| slots.0.get(&self.inner.context_key))
            .cloned()
    }

    fn attached_or_fresh(&self, ext: &mut Extensions) -> Session {
        if let Some(session) = self.attached(ext) {
            return session;
        }
        let session = self.load_new();
        self.attach(ext, session.clone());
        session
    }

    pub fn put(&self, ext: &mut Extensions, key: impl Into<String>, value: impl Into<crate::value::Value>) {
        self.attached_or_fresh(ext).put(key, value);
    }

    pub fn get(&self, ext: &mut Extensions, key: &str) -> Option<crate::value::Value> {
        self.attached_or_fresh(ext).get(key)
    }

    pub fn get_string(&self, ext: &mut Extensions, key: &str) -> String {
        self.attached_or_fresh(ext).get_string(key)
    }

    pub fn get_int(&self, ext: &mut Extensions, key: &str) -> i64 {
        self.attached_or_fresh(ext).get_int(key)
    }

    pub fn get_float(&self, ext: &mut Extensions, key: &str) -> f64 {
        self.attached_or_fresh(ext).get_float(key)
    }

    pub fn get_bool(&self, ext: &mut Extensions, key: &str) -> bool {
        self.attached_or_fresh(ext).get_bool(key)
    }

    pub fn get_bytes(&self, ext: &mut Extensions, key: &str) -> Vec<u8> {
        self.attached_or_fresh(ext).get_bytes(key)
    }

    pub fn get_time(&self, ext: &mut Extensions, key: &str) -> OffsetDateTime {
        self.attached_or_fresh(ext).get_time(key)
    }

    pub fn pop(&self, ext: &mut Extensions, key: &str) -> Option<crate::value::Value> {
        self.attached_or_fresh(ext).pop(key)
    }

    pub fn pop_string(&self, ext: &mut Extensions, key: &str) -> String {
        self.attached_or_fresh(ext).pop_string(key)
    }

    pub fn pop_int(&self, ext: &mut Extensions, key: &str) -> i64 {
        self.attached_or_fresh(ext).pop_int(key)
    }

    pub fn pop_float(&self, ext: &mut Extensions, key: &str) -> f64 {
        self.attached_or_fresh(ext).pop_float(key)
    }

    pub fn pop_bool(&self, ext: &mut Extensions, key: &str) -> bool {
        self.attached_or_fresh(ext).pop_bool(key)
    }

    pub fn pop_bytes(&self, ext: &mut Extensions, key: &str) -> Vec<u8> {
        self.attached_or_fresh(ext).pop_bytes(key)
    }

    pub fn pop_time(&self, ext: &mut Extensions, key: &str) -> OffsetDateTime {
        self.attached_or_fresh(ext).pop_time(key)
    }

    pub fn remove(&self, ext: &mut Extensions, key: &str) {
        self.attached_or_fresh(ext).remove(key);
    }

    pub fn exists(&self, ext: &mut Extensions, key: &str) -> bool {
        self.attached_or_fresh(ext).exists(key)
    }

    pub fn keys(&self, ext: &mut Extensions) -> Vec<String> {
        self.attached_or_fresh(ext).keys()
    }

    pub fn clear(&self, ext: &mut Extensions) {
        self.attached_or_fresh(ext).clear();
    }

    pub fn status(&self, ext: &mut Extensions) -> Status {
        self.attached_or_fresh(ext).status()
    }

    pub fn token(&self, ext: &mut Extensions) -> Option<String> {
        self.attached_or_fresh(ext).token()
    }
}

impl Inner {
    fn clone_for_builder(&self) -> Self {
        Self {
            config: self.config.clone(),
            store: Arc::clone(&self.store),
            codec: Arc::clone(&self.codec),
            context_key: self.context_key,
            error_handler: Arc::clone(&self.error_handler),
        }
    }
}
