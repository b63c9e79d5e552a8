// Copyright (C) 2025 icalproxy contributors
//
// This file is part of icalproxy.
//
// icalproxy is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// icalproxy is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with icalproxy.  If not,
// see <http://www.gnu.org/licenses/>.

//! # server
//!
//! The request-path cache: `GET|HEAD /?url=...` plus the small operational surface (`/stats`,
//! `/healthz`, `/favicon.ico`).
//!
//! The cache handler is an ordered decision tree:
//!
//! 1. validate the `url` param (400 on failure)
//! 2. load the metadata row; a *store* failure here (or anywhere below) drops to the fallback
//!    path, where icalproxy acts as a naked reverse proxy
//! 3. answer the caller's conditional GET from metadata alone (304)
//! 4. serve from the stores if the row is inside its TTL (`Ical-Proxy-Cached: true`)
//! 5. otherwise refetch the origin synchronously, commit, and serve
//!
//! Origin failures are *proxied*, never swallowed: every origin/transport error is delivered as
//! **421** with the real status in `Ical-Proxy-Origin-Error`. One status for all origin failures
//! keeps `status >= 400` checks working for callers without teaching them every hosting
//! provider's idea of an error code, and 421 can't be confused with an error from icalproxy
//! itself.

use std::{collections::HashMap, sync::Arc, time::SystemTime};

use axum::{
    Json, Router,
    body::Body,
    extract::{Query, Request, State},
    http::{HeaderValue, Method, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use base64::Engine as _;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tower_http::{
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::error;
use url::Url;

use crate::{
    counter_add,
    feed::{self, Feed, FetchOutcome},
    icalproxy::IcalProxy,
    metrics::{Registration, Sort},
    storage,
};

/// Prefix on every served `Etag`. Bumping it invalidates every client-held conditional-GET state
/// at once, which is the lever for changing response *semantics* without changing bodies.
pub static ETAG_BUSTER: &str = "v1";

static FAVICON: &[u8] = include_bytes!("favicon.ico");

inventory::submit! { Registration::new("server.requests.served", Sort::IntegralCounter) }

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        error responses                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Serializable body for HTTP error responses.
#[derive(Debug, Deserialize, Serialize)]
pub struct ErrorResponseBody {
    pub error: String,
}

impl ErrorResponseBody {
    fn new(error: impl Into<String>) -> ErrorResponseBody {
        ErrorResponseBody { error: error.into() }
    }
}

impl IntoResponse for ErrorResponseBody {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           routing                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Counter-based request IDs: less entropy than a UUID, but readable in logs and a free gauge of
/// how long the process has been up.
#[derive(Clone, Debug, Default)]
struct RequestIdGenerator {
    counter: Arc<std::sync::atomic::AtomicU64>,
}

impl MakeRequestId for RequestIdGenerator {
    fn make_request_id<B>(&mut self, _request: &axum::http::Request<B>) -> Option<RequestId> {
        let id = self
            .counter
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        HeaderValue::from_str(&id.to_string()).ok().map(RequestId::new)
    }
}

/// Assemble the router. The cache and stats endpoints sit behind the API-key middleware (a no-op
/// when no key is configured); the health and favicon endpoints do not-- load balancers don't
/// carry credentials.
pub fn make_router(state: Arc<IcalProxy>) -> Router {
    let guarded = Router::new()
        .route("/", get(handle))
        .route("/stats", get(stats))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));
    Router::new()
        .merge(guarded)
        .route("/healthz", get(healthz))
        .route("/favicon.ico", get(favicon))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(RequestIdGenerator::default()))
        .with_state(state)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       api-key middleware                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

fn strconstcmp(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Accept `Authorization: Apikey <key>`, or HTTP Basic with the key as the password (calendar
/// clients usually can't set arbitrary headers, but can do Basic auth). Comparisons are
/// constant-time.
async fn require_api_key(
    State(state): State<Arc<IcalProxy>>,
    request: Request,
    next: Next,
) -> Response {
    let key = &state.config.api_key;
    if key.is_empty() {
        return next.run(request).await;
    }
    let auth = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if auth.starts_with("Apikey") {
        if strconstcmp(auth, &format!("Apikey {key}")) {
            return next.run(request).await;
        }
        return (
            StatusCode::UNAUTHORIZED,
            ErrorResponseBody::new("Header required or incorrect: 'Authorization: Apikey [value]'"),
        )
            .into_response();
    }
    if let Some(encoded) = auth.strip_prefix("Basic ") {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok());
        if let Some(userpass) = decoded {
            let password = userpass.split_once(':').map(|(_, p)| p).unwrap_or("");
            if strconstcmp(password, key) {
                return next.run(request).await;
            }
        }
    }
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=Restricted")],
        ErrorResponseBody::new("Header required or incorrect: 'Authorization: Apikey [value]'"),
    )
        .into_response()
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        the cache handler                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn handle(
    State(state): State<Arc<IcalProxy>>,
    method: Method,
    headers: axum::http::HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    // (1) Validate the URL. Anything wrong with it is the caller's problem, never a fallback.
    let url = match params.get("url").filter(|u| !u.is_empty()) {
        Some(raw) => match Url::parse(raw) {
            Ok(url) => url,
            Err(err) => {
                return (
                    StatusCode::BAD_REQUEST,
                    ErrorResponseBody::new(format!("'url' is invalid: {err}")),
                )
                    .into_response();
            }
        },
        None => {
            return (
                StatusCode::BAD_REQUEST,
                ErrorResponseBody::new("'url' query param is required"),
            )
                .into_response();
        }
    };

    // (2) Load metadata. The store being down is OUR problem; degrade to a plain proxy.
    let row = match state.storage.fetch_feed_row(&url).await {
        Ok(row) => row,
        Err(err) => {
            error!(url = %url, error = %err, "fetch_feed_row_error");
            return run_as_proxy(&state, &method, &url).await;
        }
    };

    // (3) The caller's own conditional GET, answered from metadata alone.
    if let Some(row) = &row {
        if let Some(response) = conditional_get_check(&headers, row) {
            return response;
        }
    }

    // (4) Serve from the stores if the content is inside its TTL.
    if let Some(row) = &row {
        let ttl = feed::ttl_for(&url, &state.config.ical_ttl_map);
        if Utc::now() - row.contents_last_modified <= ttl.as_chrono() {
            match state
                .storage
                .fetch_contents_as_feed(&*state.bodies, &url)
                .await
            {
                Ok(Some(fd)) => {
                    counter_add!(
                        state.instruments,
                        "server.requests.served",
                        1,
                        &[KeyValue::new("source", "cache")]
                    );
                    return serve_feed(&method, &fd, true, false);
                }
                // Row vanished or its body object is gone: treat as a cache miss & refetch.
                Ok(None) => (),
                Err(err) if err.is_body_missing() => (),
                Err(err) => {
                    error!(url = %url, error = %err, "fetch_contents_error");
                    return run_as_proxy(&state, &method, &url).await;
                }
            }
        }
    }

    // (5) Synchronous refetch, conditional on whatever we knew about the feed.
    refetch_and_serve(&state, &method, &url, row).await
}

/// Answer the client's `If-None-Match` / `If-Modified-Since`, if they allow a 304. This can
/// never pass for a URL we've not stored, and the etag check only applies to content (not error)
/// rows.
fn conditional_get_check(
    headers: &axum::http::HeaderMap,
    row: &storage::FeedRow,
) -> Option<Response> {
    if let Some(etag) = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
    {
        if !row.contents_md5.is_empty()
            && strconstcmp(etag, &format!("{ETAG_BUSTER}{}", row.contents_md5))
        {
            return Some(StatusCode::NOT_MODIFIED.into_response());
        }
    }
    if let Some(since) = headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|value| value.to_str().ok())
        .and_then(|text| httpdate::parse_http_date(text).ok())
    {
        let since = DateTime::<Utc>::from(since);
        if row.contents_last_modified <= since {
            return Some(StatusCode::NOT_MODIFIED.into_response());
        }
    }
    None
}

async fn refetch_and_serve(
    state: &Arc<IcalProxy>,
    method: &Method,
    url: &Url,
    row: Option<storage::FeedRow>,
) -> Response {
    let mut previous_headers = row.map(|row| row.fetch_headers);
    // At most two passes: a NotModified whose stored body has gone missing expires the row and
    // retries unconditionally (so the origin must hand the body back); a second miss is a real
    // error, not a reason to loop.
    for attempt in 0..2 {
        let outcome = feed::fetch(
            &state.client,
            url,
            previous_headers.as_ref(),
            state.config.request_timeout(),
        )
        .await;
        match outcome {
            FetchOutcome::Ok(fd) => {
                // A change served through the request path doesn't webhook: the notifier exists
                // for consumers who *aren't* the one currently asking.
                if let Err(err) = state
                    .storage
                    .commit_feed(&*state.bodies, &fd, storage::CommitFeedOptions::default())
                    .await
                {
                    error!(url = %url, error = %err, "commit_feed_error");
                }
                counter_add!(
                    state.instruments,
                    "server.requests.served",
                    1,
                    &[KeyValue::new("source", "origin")]
                );
                return serve_feed(method, &fd, false, false);
            }
            FetchOutcome::OriginError(fd) | FetchOutcome::Transport(fd) => {
                if let Err(err) = state
                    .storage
                    .commit_feed(&*state.bodies, &fd, storage::CommitFeedOptions::default())
                    .await
                {
                    error!(url = %url, error = %err, "commit_feed_error");
                }
                counter_add!(
                    state.instruments,
                    "server.requests.served",
                    1,
                    &[KeyValue::new("source", "origin-error")]
                );
                return serve_feed(method, &fd, false, false);
            }
            FetchOutcome::NotModified { fetched_at } => {
                if let Err(err) = state.storage.commit_unchanged(url, fetched_at).await {
                    error!(url = %url, error = %err, "commit_unchanged_error");
                }
                match state
                    .storage
                    .fetch_contents_as_feed(&*state.bodies, url)
                    .await
                {
                    Ok(Some(fd)) => {
                        counter_add!(
                            state.instruments,
                            "server.requests.served",
                            1,
                            &[KeyValue::new("source", "cache")]
                        );
                        return serve_feed(method, &fd, false, false);
                    }
                    Ok(None) | Err(storage::Error::BodyMissing { .. }) if attempt == 0 => {
                        // The metadata says "unchanged" but the body store disagrees (truncated
                        // bucket, say). Expire the row & refetch without conditional state.
                        if let Err(err) = state.storage.expire_feed(url).await {
                            error!(url = %url, error = %err, "expire_feed_error");
                        }
                        previous_headers = None;
                        continue;
                    }
                    Ok(None) | Err(storage::Error::BodyMissing { .. }) => {
                        return (
                            StatusCode::BAD_GATEWAY,
                            ErrorResponseBody::new("feed body unavailable after refetch"),
                        )
                            .into_response();
                    }
                    Err(err) => {
                        error!(url = %url, error = %err, "fetch_contents_error");
                        return run_as_proxy(state, method, url).await;
                    }
                }
            }
        }
    }
    unreachable!("refetch loop always returns within two attempts")
}

/// The degraded path: no store reads, no store writes, the larger timeout, and a header so
/// operators can spot it in the wild.
async fn run_as_proxy(state: &Arc<IcalProxy>, method: &Method, url: &Url) -> Response {
    counter_add!(
        state.instruments,
        "server.requests.served",
        1,
        &[KeyValue::new("source", "fallback")]
    );
    let outcome = feed::fetch(&state.client, url, None, state.config.request_max_timeout()).await;
    let fd = match outcome {
        FetchOutcome::Ok(fd)
        | FetchOutcome::OriginError(fd)
        | FetchOutcome::Transport(fd) => fd,
        FetchOutcome::NotModified { .. } => {
            // We sent no conditional headers, so a 304 here is the origin misbehaving.
            return (
                StatusCode::BAD_GATEWAY,
                ErrorResponseBody::new("origin returned 304 to an unconditional request"),
            )
                .into_response();
        }
    };
    serve_feed(method, &fd, false, true)
}

/// Render a [Feed] as the HTTP response: 200 with the canonical calendar headers, or 421 for a
/// stored/live origin failure. `HEAD` gets the headers with no body.
fn serve_feed(method: &Method, fd: &Feed, cached: bool, fallback: bool) -> Response {
    let mut builder = Response::builder();
    if cached {
        builder = builder.header("Ical-Proxy-Cached", "true");
    }
    if fallback {
        builder = builder.header("Ical-Proxy-Fallback", "true");
    }
    let builder = if fd.is_error() {
        builder
            .status(StatusCode::MISDIRECTED_REQUEST)
            .header("Ical-Proxy-Origin-Error", fd.http_status.to_string())
            .header(header::CONTENT_TYPE, fd.content_type())
            .header(header::CONTENT_LENGTH, fd.body.len())
    } else {
        builder
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, feed::CALENDAR_CONTENT_TYPE)
            .header(header::CONTENT_LENGTH, fd.body.len())
            .header(header::ETAG, format!("{ETAG_BUSTER}{}", fd.md5))
            .header(
                header::LAST_MODIFIED,
                httpdate::fmt_http_date(SystemTime::from(fd.fetched_at)),
            )
    };
    let body = if method == Method::HEAD {
        Body::empty()
    } else {
        Body::from(fd.body.clone())
    };
    builder
        .body(body)
        .unwrap_or_else(|err| {
            // Only reachable if an origin header value is unrepresentable; surface it rather
            // than panic in the handler.
            error!(error = %err, "serve_feed_response_build_error");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                     operational endpoints                                      //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn stats(State(state): State<Arc<IcalProxy>>) -> Response {
    let count_start = std::time::Instant::now();
    let pending_refresh = match state
        .storage
        .count_pending_refresh(Utc::now(), &state.config.ical_ttl_map)
        .await
    {
        Ok(count) => count,
        Err(err) => {
            error!(error = %err, "counting_rows_awaiting_refresh");
            -1
        }
    };
    let db_count_latency = count_start.elapsed().as_secs_f64();
    let pending_webhooks = match state.storage.count_pending_webhooks().await {
        Ok(count) => count,
        Err(err) => {
            error!(error = %err, "counting_rows_pending_webhook");
            -1
        }
    };
    Json(serde_json::json!({
        "pending_refresh_count": pending_refresh,
        "db_count_latency": db_count_latency,
        "pending_webhooks": pending_webhooks,
    }))
    .into_response()
}

async fn healthz(State(state): State<Arc<IcalProxy>>) -> Response {
    let start = std::time::Instant::now();
    let latency = match state.storage.ping().await {
        Ok(()) => start.elapsed().as_secs_f64(),
        Err(_) => -1.0,
    };
    Json(serde_json::json!({"g": 1, "d": latency})).into_response()
}

async fn favicon() -> Response {
    ([(header::CONTENT_TYPE, "image/x-icon")], FAVICON).into_response()
}

#[cfg(test)]
mod test {
    use super::*;

    use chrono::SubsecRound;
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method as wm_method, path as wm_path},
    };

    use crate::{bodystore, config::Config, metrics::Instruments, storage::Backend as _, types::TTL};

    struct Fixture {
        router: Router,
        storage: Arc<storage::InMemory>,
        bodies: Arc<bodystore::InMemory>,
    }

    fn make_fixture(mutate: impl FnOnce(&mut Config)) -> Fixture {
        let mut config = Config {
            api_key: String::new(),
            database_url: String::new(),
            database_connection_pool_url: String::new(),
            debug: false,
            http_request_timeout: 0,
            ical_ttl_map: Default::default(),
            log_format: String::new(),
            log_level: "info".into(),
            port: 0,
            refresh_page_size: 100,
            refresh_timeout: 30,
            request_timeout: 5,
            request_max_timeout: 5,
            s3_access_key_id: String::new(),
            s3_access_key_secret: String::new(),
            s3_bucket: String::new(),
            s3_endpoint: String::new(),
            s3_prefix: String::new(),
            webhook_page_size: 100,
            webhook_url: String::new(),
        };
        mutate(&mut config);
        let storage = Arc::new(storage::InMemory::new());
        let bodies = Arc::new(bodystore::InMemory::new());
        let state = Arc::new(IcalProxy {
            config: Arc::new(config),
            storage: storage.clone(),
            bodies: bodies.clone(),
            client: reqwest::Client::new(),
            instruments: Arc::new(Instruments::new("icalproxy-test")),
        });
        Fixture {
            router: make_router(state),
            storage,
            bodies,
        }
    }

    async fn request(
        router: &Router,
        method: Method,
        uri: &str,
        headers: &[(&str, &str)],
    ) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
        let mut builder = axum::http::Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let response = router
            .clone()
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, headers, body.to_vec())
    }

    fn request_uri(origin: &MockServer) -> String {
        // url::Url round-trips the origin's URI, so no query-escaping gymnastics are needed for
        // a host:port/path shape.
        format!("/?url={}/feed.ics", origin.uri())
    }

    async fn seed(fixture: &Fixture, url: &str, status: u16, body: &[u8], age: chrono::Duration) {
        let fd = Feed::new(
            Url::parse(url).unwrap(),
            feed::HeaderMap::new(),
            status,
            body.to_vec(),
            Utc::now().trunc_subsecs(0) - age,
        );
        fixture
            .storage
            .commit_feed(&*fixture.bodies, &fd, storage::CommitFeedOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_and_invalid_urls_get_400() {
        let fixture = make_fixture(|_| ());
        let (status, _, _) = request(&fixture.router, Method::GET, "/", &[]).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _, _) = request(
            &fixture.router,
            Method::GET,
            "/?url=https%3A%2F%2Fa.co%3Am%2Fx%3Ay%2Fz",
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn uncached_feeds_are_fetched_committed_and_served_with_headers() {
        let origin = MockServer::start().await;
        Mock::given(wm_method("GET"))
            .and(wm_path("/feed.ics"))
            .respond_with(ResponseTemplate::new(200).set_body_string("VEVENT"))
            .expect(1)
            .mount(&origin)
            .await;
        let fixture = make_fixture(|_| ());

        let (status, headers, body) =
            request(&fixture.router, Method::GET, &request_uri(&origin), &[]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"VEVENT");
        assert_eq!(
            headers.get("Content-Type").unwrap(),
            "text/calendar; charset=utf-8"
        );
        assert_eq!(headers.get("Content-Length").unwrap(), "6");
        assert_eq!(
            headers.get("Etag").unwrap(),
            "v1a2ec0c77b7bea23455185bcc75535bf7"
        );
        assert!(headers.contains_key("Last-Modified"));
        assert!(!headers.contains_key("Ical-Proxy-Cached"));

        // Second request inside the TTL: served from the stores, no second origin hit (the
        // mock's expect(1) enforces that).
        let (status, headers, body) =
            request(&fixture.router, Method::GET, &request_uri(&origin), &[]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"VEVENT");
        assert_eq!(headers.get("Ical-Proxy-Cached").unwrap(), "true");
    }

    #[tokio::test]
    async fn conditional_gets_are_answered_from_metadata() {
        let origin = MockServer::start().await;
        let fixture = make_fixture(|_| ());
        let url = format!("{}/feed.ics", origin.uri());
        seed(&fixture, &url, 200, b"VEVENT", chrono::Duration::zero()).await;

        let (status, _, _) = request(
            &fixture.router,
            Method::GET,
            &request_uri(&origin),
            &[("If-None-Match", "v1a2ec0c77b7bea23455185bcc75535bf7")],
        )
        .await;
        assert_eq!(status, StatusCode::NOT_MODIFIED);

        let (status, _, _) = request(
            &fixture.router,
            Method::GET,
            &request_uri(&origin),
            &[("If-None-Match", "failsmatch")],
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let now = httpdate::fmt_http_date(SystemTime::now());
        let (status, _, _) = request(
            &fixture.router,
            Method::GET,
            &request_uri(&origin),
            &[("If-Modified-Since", &now)],
        )
        .await;
        assert_eq!(status, StatusCode::NOT_MODIFIED);

        let stale =
            httpdate::fmt_http_date(SystemTime::now() - std::time::Duration::from_secs(20 * 3600));
        let (status, _, _) = request(
            &fixture.router,
            Method::GET,
            &request_uri(&origin),
            &[("If-Modified-Since", &stale)],
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn origin_errors_are_proxied_as_421() {
        let origin = MockServer::start().await;
        Mock::given(wm_method("GET"))
            .and(wm_path("/feed.ics"))
            .respond_with(
                ResponseTemplate::new(403)
                    .set_body_string("nope")
                    .insert_header("Content-Type", "application/custom"),
            )
            .mount(&origin)
            .await;
        let fixture = make_fixture(|_| ());
        let (status, headers, body) =
            request(&fixture.router, Method::GET, &request_uri(&origin), &[]).await;
        assert_eq!(status, StatusCode::MISDIRECTED_REQUEST);
        assert_eq!(body, b"nope");
        assert_eq!(headers.get("Content-Type").unwrap(), "application/custom");
        assert_eq!(headers.get("Ical-Proxy-Origin-Error").unwrap(), "403");
    }

    #[tokio::test]
    async fn cached_origin_errors_are_served_as_421() {
        let origin = MockServer::start().await;
        let fixture = make_fixture(|_| ());
        let url = format!("{}/feed.ics", origin.uri());
        let fd = Feed::new(
            Url::parse(&url).unwrap(),
            feed::HeaderMap::from([("Content-Type".to_owned(), "application/custom".to_owned())]),
            403,
            b"nope".to_vec(),
            Utc::now(),
        );
        fixture
            .storage
            .commit_feed(&*fixture.bodies, &fd, Default::default())
            .await
            .unwrap();

        let (status, headers, body) =
            request(&fixture.router, Method::GET, &request_uri(&origin), &[]).await;
        assert_eq!(status, StatusCode::MISDIRECTED_REQUEST);
        assert_eq!(body, b"nope");
        assert_eq!(headers.get("Content-Type").unwrap(), "application/custom");
        assert_eq!(headers.get("Ical-Proxy-Origin-Error").unwrap(), "403");
    }

    #[tokio::test]
    async fn expired_rows_are_refetched_from_the_origin() {
        let origin = MockServer::start().await;
        Mock::given(wm_method("GET"))
            .and(wm_path("/feed.ics"))
            .respond_with(ResponseTemplate::new(200).set_body_string("VERSION2"))
            .mount(&origin)
            .await;
        let fixture = make_fixture(|_| ());
        let url = format!("{}/feed.ics", origin.uri());
        seed(&fixture, &url, 200, b"VERSION1", chrono::Duration::hours(5)).await;

        let (status, _, body) =
            request(&fixture.router, Method::GET, &request_uri(&origin), &[]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"VERSION2");

        let row = fixture
            .storage
            .fetch_feed_row(&Url::parse(&url).unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.contents_md5.as_str(), "e09e7582b0849d4b27f9af87ae6703ea");
    }

    #[tokio::test]
    async fn not_modified_refetches_serve_the_stored_body() {
        let origin = MockServer::start().await;
        Mock::given(wm_method("GET"))
            .and(wm_path("/feed.ics"))
            .respond_with(ResponseTemplate::new(304))
            .mount(&origin)
            .await;
        let fixture = make_fixture(|_| ());
        let url = format!("{}/feed.ics", origin.uri());
        seed(&fixture, &url, 200, b"VERSION1", chrono::Duration::hours(5)).await;

        let (status, _, body) =
            request(&fixture.router, Method::GET, &request_uri(&origin), &[]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"VERSION1");
    }

    #[tokio::test]
    async fn a_truncated_body_store_heals_via_expire_and_refetch() {
        let origin = MockServer::start().await;
        // First request is conditional & answered 304; the handler then notices the body is
        // gone, expires the row, and refetches unconditionally.
        Mock::given(wm_method("GET"))
            .and(wm_path("/feed.ics"))
            .respond_with(ResponseTemplate::new(304))
            .up_to_n_times(1)
            .mount(&origin)
            .await;
        Mock::given(wm_method("GET"))
            .and(wm_path("/feed.ics"))
            .respond_with(ResponseTemplate::new(200).set_body_string("FETCHED"))
            .mount(&origin)
            .await;
        let fixture = make_fixture(|_| ());
        let url = format!("{}/feed.ics", origin.uri());
        seed(
            &fixture,
            &url,
            200,
            b"GONE",
            // Stored headers make the first refetch conditional.
            chrono::Duration::hours(5),
        )
        .await;
        fixture.bodies.clear();

        let (status, _, body) =
            request(&fixture.router, Method::GET, &request_uri(&origin), &[]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"FETCHED");
    }

    #[tokio::test]
    async fn store_failures_fall_back_to_plain_proxying() {
        let origin = MockServer::start().await;
        Mock::given(wm_method("GET"))
            .and(wm_path("/feed.ics"))
            .respond_with(
                ResponseTemplate::new(403)
                    .set_body_string("nope")
                    .insert_header("Content-Type", "application/custom"),
            )
            .mount(&origin)
            .await;
        let fixture = make_fixture(|_| ());
        fixture.storage.poison();

        let (status, headers, body) =
            request(&fixture.router, Method::GET, &request_uri(&origin), &[]).await;
        assert_eq!(status, StatusCode::MISDIRECTED_REQUEST);
        assert_eq!(body, b"nope");
        assert_eq!(headers.get("Ical-Proxy-Fallback").unwrap(), "true");
        assert_eq!(headers.get("Ical-Proxy-Origin-Error").unwrap(), "403");
        assert_eq!(headers.get("Content-Type").unwrap(), "application/custom");
    }

    #[tokio::test]
    async fn fallback_success_serves_the_origin_body() {
        let origin = MockServer::start().await;
        Mock::given(wm_method("GET"))
            .and(wm_path("/feed.ics"))
            .respond_with(ResponseTemplate::new(200).set_body_string("FETCHED"))
            .mount(&origin)
            .await;
        let fixture = make_fixture(|_| ());
        fixture.storage.poison();

        let (status, headers, body) =
            request(&fixture.router, Method::GET, &request_uri(&origin), &[]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"FETCHED");
        assert_eq!(headers.get("Ical-Proxy-Fallback").unwrap(), "true");
    }

    #[tokio::test]
    async fn head_responds_like_get_with_no_body() {
        let origin = MockServer::start().await;
        Mock::given(wm_method("GET"))
            .and(wm_path("/feed.ics"))
            .respond_with(ResponseTemplate::new(200).set_body_string("FETCHED"))
            .mount(&origin)
            .await;
        let fixture = make_fixture(|_| ());
        let (status, headers, body) =
            request(&fixture.router, Method::HEAD, &request_uri(&origin), &[]).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());
        assert_eq!(headers.get("Content-Length").unwrap(), "7");
    }

    #[tokio::test]
    async fn api_key_guards_the_cache_endpoint() {
        let origin = MockServer::start().await;
        Mock::given(wm_method("GET"))
            .and(wm_path("/feed.ics"))
            .respond_with(ResponseTemplate::new(200).set_body_string("VEVENT"))
            .mount(&origin)
            .await;
        let fixture = make_fixture(|cfg| cfg.api_key = "sekret".into());

        let (status, _, _) = request(&fixture.router, Method::GET, &request_uri(&origin), &[]).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _, _) = request(
            &fixture.router,
            Method::GET,
            &request_uri(&origin),
            &[("Authorization", "Apikey badsekret")],
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _, body) = request(
            &fixture.router,
            Method::GET,
            &request_uri(&origin),
            &[("Authorization", "Apikey sekret")],
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"VEVENT");

        let basic = format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode("anything:sekret")
        );
        let (status, _, body) = request(
            &fixture.router,
            Method::GET,
            &request_uri(&origin),
            &[("Authorization", &basic)],
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"VEVENT");
    }

    #[tokio::test]
    async fn healthz_and_favicon_are_not_auth_gated() {
        let fixture = make_fixture(|cfg| cfg.api_key = "sekret".into());
        let (status, _, _) = request(&fixture.router, Method::GET, "/healthz", &[]).await;
        assert_eq!(status, StatusCode::OK);
        let (status, headers, body) =
            request(&fixture.router, Method::GET, "/favicon.ico", &[]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get("Content-Type").unwrap(), "image/x-icon");
        assert!(!body.is_empty());
    }

    #[tokio::test]
    async fn stats_reports_counts_and_latency() {
        let fixture = make_fixture(|cfg| {
            cfg.ical_ttl_map.insert(
                crate::types::NormalizedHostname::new("LOCALHOST"),
                TTL::from_secs(30 * 60),
            );
        });
        seed(
            &fixture,
            "https://stale.localhost/feed",
            200,
            b"OLD",
            chrono::Duration::hours(1),
        )
        .await;
        seed(
            &fixture,
            "https://fresh.localhost/feed",
            200,
            b"NEW",
            chrono::Duration::zero(),
        )
        .await;

        let (status, _, body) = request(&fixture.router, Method::GET, "/stats", &[]).await;
        assert_eq!(status, StatusCode::OK);
        let stats: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(stats["pending_refresh_count"], 1);
        assert_eq!(stats["pending_webhooks"], 0);
        assert!(stats["db_count_latency"].as_f64().unwrap() >= 0.0);
    }

    #[tokio::test]
    async fn healthz_reports_negative_latency_when_the_store_is_down() {
        let fixture = make_fixture(|_| ());
        fixture.storage.poison();
        let (status, _, body) = request(&fixture.router, Method::GET, "/healthz", &[]).await;
        assert_eq!(status, StatusCode::OK);
        let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(health["g"], 1);
        assert_eq!(health["d"], -1.0);
    }
}
