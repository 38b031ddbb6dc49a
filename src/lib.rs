#![warn(
    clippy::correctness,
    clippy::perf,
    clippy::suspicious,
    clippy::complexity,
    missing_debug_implementations
)]
#![allow(clippy::module_name_repetitions)]
#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Server-side HTTP session management for `tower`.
//!
//! Issues opaque session tokens to clients via cookies, keeps per-session
//! key/value state behind a pluggable [`Store`](store::Store), and loads
//! and persists that state around each request through [`SessionManagerLayer`](middleware::SessionManagerLayer).
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use scs::{manager::SessionManager, middleware::SessionManagerLayer, store::MemoryStore};
//! use tower::ServiceBuilder;
//!
//! let manager = SessionManager::new(Arc::new(MemoryStore::default()))
//!     .with_cookie_name("my.sid")
//!     .with_secure(true);
//! let layer = SessionManagerLayer::new(manager);
//!
//! # async fn handler() {}
//! # fn build<S>(svc: S) where S: Clone {
//! let _ = ServiceBuilder::new().layer(layer);
//! # }
//! ```

pub mod codec;
pub mod cookie;
pub mod error;
pub mod manager;
pub mod middleware;
pub mod session;
pub mod store;
pub mod value;

#[cfg(feature = "axum")]
#[cfg_attr(docsrs, doc(cfg(feature = "axum")))]
pub mod extract;

pub use error::Error;
pub use manager::SessionManager;
pub use session::Session;
