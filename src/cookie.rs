//! Builds the `Set-Cookie` value for a response, given the session's
//! token, effective persistence, and deadline.
use time::{Duration, OffsetDateTime};
use tower_cookies::{
    cookie::{CookieBuilder, SameSite},
    Cookie,
};

use crate::manager::CookieConfig;

/// Builds the cookie that carries `token`, honoring `persist` and the
/// manager's cookie attributes.
///
/// When `persist` is true the cookie carries `Max-Age`/`Expires` set to
/// `deadline` (floored to zero); when false it is a session cookie with
/// neither attribute, left to the browser to discard on its own schedule.
pub fn build(config: &CookieConfig, token: String, persist: bool, deadline: OffsetDateTime) -> Cookie<'static> {
    let mut builder = base_builder(config, token);
    if persist {
        let max_age = (deadline - OffsetDateTime::now_utc()).max(Duration::ZERO);
        builder = builder.max_age(max_age).expires(deadline);
    }
    builder.build()
}

/// Builds the expiring cookie that tells the browser to delete the
/// session cookie immediately, used when a session was destroyed.
pub fn build_removal(config: &CookieConfig) -> Cookie<'static> {
    let epoch_plus_one = OffsetDateTime::UNIX_EPOCH + Duration::seconds(1);
    base_builder(config, String::new())
        .max_age(Duration::ZERO)
        .expires(epoch_plus_one)
        .build()
}

fn base_builder(config: &CookieConfig, value: String) -> CookieBuilder<'static> {
    // Browsers reject `SameSite::None` unless `Secure` is also set.
    let secure = config.secure || config.same_site == SameSite::None;

    let mut builder = Cookie::build((config.name.clone(), value))
        .path(config.path.clone())
        .http_only(config.http_only)
        .secure(secure)
        .same_site(config.same_site);

    if let Some(domain) = &config.domain {
        builder = builder.domain(domain.clone());
    }

    builder
}
