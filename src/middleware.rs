//! Bridges HTTP request/response to the session lifecycle: reads the
//! request cookie, loads the session, attaches it to the request's
//! extensions, lets the inner service run, then writes back the
//! `Set-Cookie` header and commits/deletes in the store.
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration as StdDuration,
};

use http::{
    header::{self, HeaderValue},
    Request, Response, StatusCode,
};
use tower_cookies::cookie::Cookie as RawCookie;
use tower_layer::Layer;
use tower_service::Service;

use crate::{error::Error, manager::SessionManager, session::Status};

const DEFAULT_TIMEOUT: StdDuration = StdDuration::from_secs(5);

/// A [`tower::Layer`] that installs session load/save around a service.
///
/// Safe to install multiple times with distinct [`SessionManager`]s: each
/// manager attaches its own [`Session`](crate::session::Session) under its
/// own context key, so layering two of these does not collide.
#[derive(Clone)]
pub struct SessionManagerLayer {
    manager: SessionManager,
    timeout: StdDuration,
}

impl SessionManagerLayer {
    /// Wraps a service with load/save for `manager`'s sessions, bounding
    /// every commit/delete to the default 5 second timeout.
    pub fn new(manager: SessionManager) -> Self {
        Self {
            manager,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Overrides the bound placed on store commit/delete calls. A store
    /// operation that does not finish within this window is treated as a
    /// failure and routed to the manager's error handler.
    pub fn with_timeout(mut self, timeout: StdDuration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl<S> Layer<S> for SessionManagerLayer {
    type Service = LoadAndSave<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoadAndSave {
            inner,
            manager: self.manager.clone(),
            timeout: self.timeout,
        }
    }
}

/// The service installed by [`SessionManagerLayer`]. See the module docs.
#[derive(Clone)]
pub struct LoadAndSave<S> {
    inner: S,
    manager: SessionManager,
    timeout: StdDuration,
}

impl<ReqBody, ResBody, S> Service<Request<ReqBody>> for LoadAndSave<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send,
    ReqBody: Send + 'static,
    ResBody: Send,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    #[inline]
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        let manager = self.manager.clone();
        let timeout = self.timeout;

        // The inner service can panic if called before it is ready, so we
        // only ever call the clone we know is ready.
        //
        // See: https://docs.rs/tower/latest/tower/trait.Service.html#be-careful-when-cloning-inner-services
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let cookie_name = manager.config().cookie.name.clone();
            let token = extract_cookie(req.headers(), &cookie_name).unwrap_or_default();

            let session = manager.load(&token).await;
            manager.attach(req.extensions_mut(), session.clone());

            let mut res = inner.call(req).await?;

            res.headers_mut()
                .append(header::VARY, HeaderValue::from_static("Cookie"));
            append_no_cache_set_cookie(res.headers_mut());

            match session.status() {
                Status::Modified => {
                    match tokio::time::timeout(timeout, manager.commit(&session)).await {
                        Ok(Ok((token, deadline))) => {
                            let persist = manager.effective_persist(&session);
                            let cookie = crate::cookie::build(&manager.config().cookie, token, persist, deadline);
                            insert_set_cookie(res.headers_mut(), &cookie);
                        }
                        Ok(Err(err)) => {
                            manager.report_error(err);
                            *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                        }
                        Err(_) => {
                            manager.report_error(Error::Timeout);
                            *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                        }
                    }
                }
                Status::Destroyed => {
                    match tokio::time::timeout(timeout, manager.destroy(&session)).await {
                        Ok(Ok(())) => {
                            let cookie = crate::cookie::build_removal(&manager.config().cookie);
                            insert_set_cookie(res.headers_mut(), &cookie);
                        }
                        Ok(Err(err)) => {
                            manager.report_error(err);
                            *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                        }
                        Err(_) => {
                            manager.report_error(Error::Timeout);
                            *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                        }
                    }
                }
                Status::Unmodified => {}
            }

            Ok(res)
        })
    }
}

fn extract_cookie(headers: &http::HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .into_iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|raw| RawCookie::parse(raw.trim().to_owned()).ok())
        .find(|cookie| cookie.name() == name)
        .map(|cookie| cookie.value().to_owned())
}

fn insert_set_cookie(headers: &mut http::HeaderMap, cookie: &RawCookie<'static>) {
    if let Ok(value) = HeaderValue::from_str(&cookie.to_string()) {
        headers.append(header::SET_COOKIE, value);
    } else {
        tracing::error!("built a session cookie that is not a valid header value");
    }
}

fn append_no_cache_set_cookie(headers: &mut http::HeaderMap) {
    headers.append(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache=\"Set-Cookie\""),
    );
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use http::{Request, Response, StatusCode};
    use time::Duration;
    use tower::{ServiceBuilder, ServiceExt};

    use super::*;
    use crate::store::MemoryStore;

    fn manager() -> SessionManager {
        SessionManager::new(Arc::new(MemoryStore::default()))
    }

    fn extract_set_cookie_token(res: &Response<String>) -> Option<String> {
        let value = res.headers().get(header::SET_COOKIE)?.to_str().ok()?;
        let cookie = RawCookie::parse(value.to_owned()).ok()?;
        Some(cookie.value().to_owned())
    }

    fn cookie_header(token: &str) -> String {
        format!("session={token}")
    }

    fn request(token: Option<&str>) -> Request<String> {
        let mut builder = Request::builder();
        if let Some(token) = token {
            builder = builder.header(header::COOKIE, cookie_header(token));
        }
        builder.body(String::new()).unwrap()
    }

    #[tokio::test]
    async fn basic_round_trip() {
        let manager = manager();
        let layer = SessionManagerLayer::new(manager.clone());

        let put = |req: Request<String>| {
            let manager = manager.clone();
            async move {
                let mut req = req;
                manager.put(req.extensions_mut(), "foo", "bar");
                Ok::<_, anyhow::Error>(Response::new(String::new()))
            }
        };
        let get = |req: Request<String>| {
            let manager = manager.clone();
            async move {
                let mut req = req;
                match manager.get(req.extensions_mut(), "foo") {
                    Some(value) => Ok::<_, anyhow::Error>(Response::new(value.as_str().unwrap_or_default().to_owned())),
                    None => {
                        let mut res = Response::new("foo does not exist in session".to_string());
                        *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                        Ok(res)
                    }
                }
            }
        };

        let put_svc = ServiceBuilder::new().layer(layer.clone()).service(tower::service_fn(put));
        let get_svc = ServiceBuilder::new().layer(layer).service(tower::service_fn(get));

        let res = put_svc.clone().oneshot(request(None)).await.unwrap();
        let token = extract_set_cookie_token(&res).expect("Set-Cookie on first write");

        let res = get_svc.clone().oneshot(request(Some(&token))).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.body(), "bar");
        assert!(res.headers().get(header::SET_COOKIE).is_none());

        let res = put_svc.oneshot(request(Some(&token))).await.unwrap();
        // Put always marks Modified, so a new Set-Cookie is expected even
        // though no distinct value was written, carrying the same token.
        assert_eq!(extract_set_cookie_token(&res).as_deref(), Some(token.as_str()));
    }

    #[tokio::test]
    async fn lifetime_expiry_returns_a_fresh_session() {
        let manager = manager().with_lifetime(Duration::milliseconds(500));
        let layer = SessionManagerLayer::new(manager.clone());

        let put = |req: Request<String>| {
            let manager = manager.clone();
            async move {
                let mut req = req;
                manager.put(req.extensions_mut(), "foo", "bar");
                Ok::<_, anyhow::Error>(Response::new(String::new()))
            }
        };
        let get = |req: Request<String>| {
            let manager = manager.clone();
            async move {
                let mut req = req;
                match manager.get(req.extensions_mut(), "foo") {
                    Some(value) => Ok::<_, anyhow::Error>(Response::new(value.as_str().unwrap_or_default().to_owned())),
                    None => {
                        let mut res = Response::new("foo does not exist in session".to_string());
                        *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                        Ok(res)
                    }
                }
            }
        };

        let put_svc = ServiceBuilder::new().layer(layer.clone()).service(tower::service_fn(put));
        let get_svc = ServiceBuilder::new().layer(layer).service(tower::service_fn(get));

        let res = put_svc.oneshot(request(None)).await.unwrap();
        let token = extract_set_cookie_token(&res).unwrap();

        tokio::time::sleep(StdDuration::from_millis(600)).await;

        let res = get_svc.oneshot(request(Some(&token))).await.unwrap();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(res.body(), "foo does not exist in session");
    }

    #[tokio::test]
    async fn idle_expiry_invalidates_after_a_gap_but_not_before() {
        let manager = manager().with_idle_timeout(Duration::milliseconds(200));
        let layer = SessionManagerLayer::new(manager.clone());

        let put = |req: Request<String>| {
            let manager = manager.clone();
            async move {
                let mut req = req;
                manager.put(req.extensions_mut(), "foo", "bar");
                Ok::<_, anyhow::Error>(Response::new(String::new()))
            }
        };
        let get = |req: Request<String>| {
            let manager = manager.clone();
            async move {
                let mut req = req;
                match manager.get(req.extensions_mut(), "foo") {
                    Some(_) => Ok::<_, anyhow::Error>(Response::new(String::new())),
                    None => {
                        let mut res = Response::new(String::new());
                        *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                        Ok(res)
                    }
                }
            }
        };

        let put_svc = ServiceBuilder::new().layer(layer.clone()).service(tower::service_fn(put));
        let get_svc = ServiceBuilder::new().layer(layer).service(tower::service_fn(get));

        let res = put_svc.oneshot(request(None)).await.unwrap();
        let token = extract_set_cookie_token(&res).unwrap();

        tokio::time::sleep(StdDuration::from_millis(100)).await;
        let res = get_svc.clone().oneshot(request(Some(&token))).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        tokio::time::sleep(StdDuration::from_millis(250)).await;
        let res = get_svc.oneshot(request(Some(&token))).await.unwrap();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn destroy_emits_an_expiring_cookie_and_invalidates_the_token() {
        let manager = manager();
        let layer = SessionManagerLayer::new(manager.clone());

        let put = |req: Request<String>| {
            let manager = manager.clone();
            async move {
                let mut req = req;
                manager.put(req.extensions_mut(), "foo", "bar");
                Ok::<_, anyhow::Error>(Response::new(String::new()))
            }
        };
        let delete = |req: Request<String>| {
            let manager = manager.clone();
            async move {
                if let Some(session) = manager.attached(req.extensions()) {
                    session.destroy();
                }
                Ok::<_, anyhow::Error>(Response::new(String::new()))
            }
        };
        let get = |req: Request<String>| {
            let manager = manager.clone();
            async move {
                let mut req = req;
                match manager.get(req.extensions_mut(), "foo") {
                    Some(_) => Ok::<_, anyhow::Error>(Response::new(String::new())),
                    None => {
                        let mut res = Response::new(String::new());
                        *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                        Ok(res)
                    }
                }
            }
        };

        let put_svc = ServiceBuilder::new().layer(layer.clone()).service(tower::service_fn(put));
        let delete_svc = ServiceBuilder::new().layer(layer.clone()).service(tower::service_fn(delete));
        let get_svc = ServiceBuilder::new().layer(layer).service(tower::service_fn(get));

        let res = put_svc.oneshot(request(None)).await.unwrap();
        let token = extract_set_cookie_token(&res).unwrap();

        let res = delete_svc.oneshot(request(Some(&token))).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let set_cookie = res.headers().get(header::SET_COOKIE).unwrap().to_str().unwrap();
        assert!(set_cookie.starts_with("session=;"));
        assert!(set_cookie.contains("Max-Age=0"));
        assert!(set_cookie.contains("1970"));

        let res = get_svc.oneshot(request(Some(&token))).await.unwrap();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn renew_issues_a_new_token_but_keeps_the_values() {
        let manager = manager();
        let layer = SessionManagerLayer::new(manager.clone());

        let put = |req: Request<String>| {
            let manager = manager.clone();
            async move {
                let mut req = req;
                manager.put(req.extensions_mut(), "foo", "bar");
                Ok::<_, anyhow::Error>(Response::new(String::new()))
            }
        };
        let renew = |req: Request<String>| {
            let manager = manager.clone();
            async move {
                if let Some(session) = manager.attached(req.extensions()) {
                    manager.renew_token(&session).await?;
                }
                Ok::<_, anyhow::Error>(Response::new(String::new()))
            }
        };
        let get = |req: Request<String>| {
            let manager = manager.clone();
            async move {
                let mut req = req;
                match manager.get(req.extensions_mut(), "foo") {
                    Some(value) => Ok::<_, anyhow::Error>(Response::new(value.as_str().unwrap_or_default().to_owned())),
                    None => {
                        let mut res = Response::new(String::new());
                        *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                        Ok(res)
                    }
                }
            }
        };

        let put_svc = ServiceBuilder::new().layer(layer.clone()).service(tower::service_fn(put));
        let renew_svc = ServiceBuilder::new().layer(layer.clone()).service(tower::service_fn(renew));
        let get_svc = ServiceBuilder::new().layer(layer).service(tower::service_fn(get));

        let res = put_svc.oneshot(request(None)).await.unwrap();
        let token1 = extract_set_cookie_token(&res).unwrap();

        let res = renew_svc.oneshot(request(Some(&token1))).await.unwrap();
        let token2 = extract_set_cookie_token(&res).expect("renew always writes a cookie");
        assert_ne!(token1, token2);

        let res = get_svc.oneshot(request(Some(&token2))).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.body(), "bar");
    }

    #[tokio::test]
    async fn remember_me_overrides_manager_wide_persist() {
        let manager = manager().with_persist(false);
        let layer = SessionManagerLayer::new(manager.clone());

        let normal = |req: Request<String>| {
            let manager = manager.clone();
            async move {
                let mut req = req;
                manager.put(req.extensions_mut(), "foo", "bar");
                Ok::<_, anyhow::Error>(Response::new(String::new()))
            }
        };
        let remember_true = |req: Request<String>| {
            let manager = manager.clone();
            async move {
                let mut req = req;
                manager.put(req.extensions_mut(), "foo", "bar");
                if let Some(session) = manager.attached(req.extensions()) {
                    manager.remember_me(&session, true);
                }
                Ok::<_, anyhow::Error>(Response::new(String::new()))
            }
        };
        let remember_false = |req: Request<String>| {
            let manager = manager.clone();
            async move {
                let mut req = req;
                manager.put(req.extensions_mut(), "foo", "bar");
                if let Some(session) = manager.attached(req.extensions()) {
                    manager.remember_me(&session, false);
                }
                Ok::<_, anyhow::Error>(Response::new(String::new()))
            }
        };

        let normal_svc = ServiceBuilder::new().layer(layer.clone()).service(tower::service_fn(normal));
        let true_svc = ServiceBuilder::new().layer(layer.clone()).service(tower::service_fn(remember_true));
        let false_svc = ServiceBuilder::new().layer(layer).service(tower::service_fn(remember_false));

        let res = normal_svc.oneshot(request(None)).await.unwrap();
        let set_cookie = res.headers().get(header::SET_COOKIE).unwrap().to_str().unwrap();
        assert!(!set_cookie.contains("Max-Age"));

        let res = true_svc.oneshot(request(None)).await.unwrap();
        let set_cookie = res.headers().get(header::SET_COOKIE).unwrap().to_str().unwrap();
        assert!(set_cookie.contains("Max-Age"));
        assert!(set_cookie.contains("Expires"));

        let res = false_svc.oneshot(request(None)).await.unwrap();
        let set_cookie = res.headers().get(header::SET_COOKIE).unwrap().to_str().unwrap();
        assert!(!set_cookie.contains("Max-Age"));
    }

    /// A fake [`crate::store::Store`] whose `commit` hangs for a
    /// configurable delay, used to exercise the middleware's
    /// `with_timeout` bound.
    struct SlowStore {
        commit_delay: StdDuration,
        records: std::sync::Mutex<std::collections::HashMap<String, Vec<u8>>>,
    }

    #[async_trait::async_trait]
    impl crate::store::Store for SlowStore {
        async fn find(&self, token: &str) -> Result<Option<Vec<u8>>, crate::store::Error> {
            Ok(self.records.lock().unwrap().get(token).cloned())
        }

        async fn commit(
            &self,
            token: &str,
            bytes: Vec<u8>,
            _expiry: time::OffsetDateTime,
        ) -> Result<(), crate::store::Error> {
            tokio::time::sleep(self.commit_delay).await;
            self.records.lock().unwrap().insert(token.to_owned(), bytes);
            Ok(())
        }

        async fn delete(&self, token: &str) -> Result<(), crate::store::Error> {
            self.records.lock().unwrap().remove(token);
            Ok(())
        }
    }

    #[tokio::test]
    async fn commit_past_the_timeout_yields_500_and_reports_a_timeout_error() {
        let reported = Arc::new(std::sync::Mutex::new(None));
        let reported_in_handler = Arc::clone(&reported);

        let store = Arc::new(SlowStore {
            commit_delay: StdDuration::from_millis(200),
            records: std::sync::Mutex::new(std::collections::HashMap::new()),
        });
        let manager = SessionManager::new(store).with_error_handler(move |err| {
            *reported_in_handler.lock().unwrap() = Some(err.to_string());
        });
        let layer = SessionManagerLayer::new(manager.clone()).with_timeout(StdDuration::from_millis(20));

        let put = |req: Request<String>| {
            let manager = manager.clone();
            async move {
                let mut req = req;
                manager.put(req.extensions_mut(), "foo", "bar");
                Ok::<_, anyhow::Error>(Response::new(String::new()))
            }
        };

        let svc = ServiceBuilder::new().layer(layer).service(tower::service_fn(put));
        let res = svc.oneshot(request(None)).await.unwrap();

        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(res.headers().get(header::SET_COOKIE).is_none());
        assert_eq!(
            reported.lock().unwrap().as_deref(),
            Some("session store operation timed out")
        );
    }
}
