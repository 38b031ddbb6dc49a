//! Optional `axum` integration: lets handlers take a [`Session`] directly
//! as an extractor argument instead of reaching into `req.extensions()`.
use axum_core::extract::{FromRef, FromRequestParts};
use http::{request::Parts, StatusCode};

use crate::{manager::SessionManager, session::Session};

/// Extracts the [`Session`] attached by the [`SessionManagerLayer`](crate::middleware::SessionManagerLayer)
/// for the [`SessionManager`] found in application state.
///
/// Requires `SessionManager: FromRef<S>` on the router's state, following
/// the same `FromRef` pattern `axum` itself uses for `State<T>`.
impl<AppState> FromRequestParts<AppState> for Session
where
    AppState: Send + Sync,
    SessionManager: FromRef<AppState>,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let manager = SessionManager::from_ref(state);
        manager.attached(&parts.extensions).ok_or((
            StatusCode::INTERNAL_SERVER_ERROR,
            "no session attached to this request; is SessionManagerLayer installed?",
        ))
    }
}
