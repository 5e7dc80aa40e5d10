//! The forwarder: the HTTP surface gluing both limiters around Atlas.
//!
//! Each live route runs the same protocol: authenticate and admit the caller
//! against their per-second budget, claim an upstream slot, forward the
//! request with the upstream secret, then relay the payload together with the
//! caller's current rate-limit headers.

use std::sync::Arc;

use atlas_api::{AtlasClient, LiveEndpoint, PageQuery, UpstreamLimiter};
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;

use crate::downstream::{DownstreamLimiter, RateHeaders};
use crate::error::GateError;

/// Header carrying the caller secret when it is not in the query string.
pub const CALLER_SECRET_HEADER: &str = "Demo-Secret";

struct Shared {
    atlas: AtlasClient,
    upstream: UpstreamLimiter,
    downstream: DownstreamLimiter,
}

/// Everything a live-route handler needs.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<Shared>,
}

impl AppState {
    pub fn new(
        atlas: AtlasClient,
        upstream: UpstreamLimiter,
        downstream: DownstreamLimiter,
    ) -> Self {
        Self {
            inner: Arc::new(Shared {
                atlas,
                upstream,
                downstream,
            }),
        }
    }
}

/// The proxy's route table: the three live read endpoints, GET only.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/series/live", get(series_live))
        .route("/players/live", get(players_live))
        .route("/teams/live", get(teams_live))
        .with_state(state)
}

/// Query parameters the proxy recognizes; everything else is ignored.
/// `take` and `skip` stay raw strings so a non-numeric value can be refused
/// rather than silently dropped.
#[derive(Debug, Default, Deserialize)]
pub struct ForwardParams {
    secret: Option<String>,
    take: Option<String>,
    skip: Option<String>,
}

async fn series_live(
    State(state): State<AppState>,
    Query(params): Query<ForwardParams>,
    headers: HeaderMap,
) -> Response {
    forward(state, LiveEndpoint::Series, params, headers).await
}

async fn players_live(
    State(state): State<AppState>,
    Query(params): Query<ForwardParams>,
    headers: HeaderMap,
) -> Response {
    forward(state, LiveEndpoint::Players, params, headers).await
}

async fn teams_live(
    State(state): State<AppState>,
    Query(params): Query<ForwardParams>,
    headers: HeaderMap,
) -> Response {
    forward(state, LiveEndpoint::Teams, params, headers).await
}

/// The caller secret: query parameter first, header otherwise.
fn caller_secret(params: &ForwardParams, headers: &HeaderMap) -> String {
    if let Some(secret) = &params.secret {
        return secret.clone();
    }
    headers
        .get(CALLER_SECRET_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Parses `take`/`skip` into the upstream page query. A value that is not an
/// unsigned integer refuses the whole request; nothing goes upstream.
fn page_query(params: &ForwardParams) -> Result<PageQuery, Response> {
    let mut page = PageQuery::default();
    if let Some(raw) = &params.take {
        match raw.parse() {
            Ok(take) => page.take = Some(take),
            Err(_) => {
                tracing::debug!(take = %raw, "unparseable take parameter");
                return Err(StatusCode::BAD_REQUEST.into_response());
            }
        }
    }
    if let Some(raw) = &params.skip {
        match raw.parse() {
            Ok(skip) => page.skip = Some(skip),
            Err(_) => {
                tracing::debug!(skip = %raw, "unparseable skip parameter");
                return Err(StatusCode::BAD_REQUEST.into_response());
            }
        }
    }
    Ok(page)
}

fn refusal(err: GateError) -> Response {
    let status = match err {
        GateError::MissingSecret => StatusCode::BAD_REQUEST,
        GateError::UnknownSecret => StatusCode::FORBIDDEN,
        GateError::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
        GateError::TxnRetriesExhausted | GateError::Store(_) => {
            tracing::error!(%err, "downstream admission failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    status.into_response()
}

fn throttled(rate: &RateHeaders) -> Response {
    let mut response = StatusCode::TOO_MANY_REQUESTS.into_response();
    let headers = response.headers_mut();
    for (name, value) in rate.pairs() {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }
    response
}

async fn forward(
    state: AppState,
    endpoint: LiveEndpoint,
    params: ForwardParams,
    headers: HeaderMap,
) -> Response {
    let shared = &state.inner;
    let secret = caller_secret(&params, &headers);

    match shared.downstream.allow(&secret).await {
        Ok(()) => {}
        Err(GateError::TooManyRequests) => {
            return match shared.downstream.info(&secret).await {
                Ok(rate) => throttled(&rate),
                Err(err) => {
                    tracing::error!(%err, "reading rate info for a throttled caller");
                    StatusCode::INTERNAL_SERVER_ERROR.into_response()
                }
            };
        }
        Err(err) => return refusal(err),
    }

    if !shared.upstream.slot().await {
        tracing::debug!("no upstream slot available");
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }

    let page = match page_query(&params) {
        Ok(page) => page,
        Err(response) => return response,
    };

    let upstream_response = match shared.atlas.get_live(endpoint, &page).await {
        Ok(response) => response,
        Err(err) => {
            tracing::error!(%err, "upstream request failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let status = upstream_response.status();
    if status != StatusCode::OK {
        tracing::debug!(%status, "relaying upstream refusal");
        return status.into_response();
    }

    shared.upstream.update(upstream_response.headers()).await;

    let rate = match shared.downstream.info(&secret).await {
        Ok(rate) => rate,
        Err(err) => {
            tracing::error!(%err, "reading rate info");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let mut builder = Response::builder().status(StatusCode::OK);
    if let Some(content_type) = upstream_response.headers().get(header::CONTENT_TYPE) {
        builder = builder.header(header::CONTENT_TYPE, content_type.clone());
    }
    if let Some(length) = upstream_response.content_length() {
        builder = builder.header(header::CONTENT_LENGTH, length);
    }
    for (name, value) in rate.pairs() {
        builder = builder.header(name, value);
    }
    match builder.body(Body::from_stream(upstream_response.bytes_stream())) {
        Ok(response) => response,
        Err(err) => {
            tracing::error!(%err, "assembling the relayed response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_map(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn query_secret_wins_over_the_header() {
        let params = ForwardParams {
            secret: Some("from-query".to_string()),
            ..Default::default()
        };
        let headers = header_map(&[("Demo-Secret", "from-header")]);
        assert_eq!(caller_secret(&params, &headers), "from-query");
    }

    #[test]
    fn header_secret_is_the_fallback() {
        let headers = header_map(&[("Demo-Secret", "from-header")]);
        assert_eq!(
            caller_secret(&ForwardParams::default(), &headers),
            "from-header"
        );
    }

    #[test]
    fn no_secret_anywhere_is_empty() {
        assert_eq!(
            caller_secret(&ForwardParams::default(), &HeaderMap::new()),
            ""
        );
    }

    #[test]
    fn numeric_page_params_pass() {
        let params = ForwardParams {
            take: Some("7".to_string()),
            skip: Some("20".to_string()),
            ..Default::default()
        };
        let page = page_query(&params).unwrap();
        assert_eq!(page.take, Some(7));
        assert_eq!(page.skip, Some(20));
    }

    #[test]
    fn non_numeric_take_is_refused() {
        let params = ForwardParams {
            take: Some("seven".to_string()),
            ..Default::default()
        };
        let response = page_query(&params).unwrap_err();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn negative_skip_is_refused() {
        let params = ForwardParams {
            skip: Some("-3".to_string()),
            ..Default::default()
        };
        assert!(page_query(&params).is_err());
    }
}
