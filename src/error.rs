//! Error taxonomy for the session lifecycle engine.
//!
//! Read-side failures (a malformed cookie, a corrupt payload, a missing
//! record) are absorbed by [`SessionManager::load`](crate::manager::SessionManager::load)
//! into a fresh, empty session rather than surfaced here. The variants below
//! are the ones that can reach a caller: an explicit `Commit`/`Destroy`/
//! `Iterate` call, or the middleware's error hook.

/// Errors surfaced by the store, codec, and manager.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The manager was asked to commit/destroy/iterate but no session is
    /// attached to the request (or none was supplied to the standalone
    /// call). Read helpers never raise this; they return zero values.
    #[error("no session attached to this request")]
    NoSession,

    /// The backing store reported a failure (connection, protocol, or
    /// internal error).
    #[error(transparent)]
    Store(#[from] crate::store::Error),

    /// The codec could not decode a stored payload. This is only ever
    /// surfaced directly when a caller decodes outside of `Load` (e.g.
    /// `MergeSession`); `Load` itself treats a codec error the same as a
    /// missing session.
    #[error(transparent)]
    Codec(#[from] crate::codec::Error),

    /// `Iterate` was called against a store whose [`all`](crate::store::Store::all)
    /// returns `None`.
    #[error("store does not support iteration")]
    IterationUnsupported,

    /// The random source used for token generation could not produce
    /// enough entropy, or a generated token kept colliding. Fatal to the
    /// request that triggered it.
    #[error("failed to generate a session token: {0}")]
    TokenGeneration(String),

    /// A store operation did not complete within the middleware's bounded
    /// best-effort deadline.
    #[error("session store operation timed out")]
    Timeout,
}

pub(crate) type Result<T> = std::result::Result<T, Error>;
