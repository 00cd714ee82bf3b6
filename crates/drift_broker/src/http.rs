//! HTTP surface of the broker.
//!
//! Endpoints:
//! - POST /client     — opaque offer in, answer out (or 503/504)
//! - POST /proxy      — proxy poll, JSON in/out
//! - POST /answer     — proxy's answer routed back to its client
//! - GET  /metrics    — aggregate stats, plaintext
//! - GET  /debug      — live queue summary
//! - GET  /robots.txt
//!
//! Handlers only ever touch the matcher lock through its non-blocking
//! operations; the long waits happen inside the matcher on delivery
//! channels, far away from any lock.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, DefaultBodyLimit, State};
use axum::http::{header, HeaderMap, HeaderName, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tracing::debug;

use drift_proto::messages::{
    NatClass, ProxyAnswerRequest, ProxyAnswerResponse, ProxyPollRequest, ProxyPollResponse,
};

use crate::matching::{AnswerOutcome, Matcher, OfferOutcome, PollOutcome};
use crate::metrics::Metrics;

/// Largest accepted request body, matching the offer/answer blob cap.
const MAX_BODY_BYTES: usize = 100_000;

/// Declares the client's NAT class alongside its otherwise opaque offer.
const NAT_CLASS_HEADER: &str = "snowflake-nat-class";

pub struct AppState {
    pub matcher: Arc<Matcher>,
    pub metrics: Arc<Metrics>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::ORIGIN, HeaderName::from_static("x-session-id")]);

    Router::new()
        .route("/client", post(handle_client))
        .route("/proxy", post(handle_proxy))
        .route("/answer", post(handle_answer))
        .route("/metrics", get(handle_metrics))
        .route("/debug", get(handle_debug))
        .route("/robots.txt", get(handle_robots))
        .layer(cors)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

/// A client submits its offer and blocks until an answer, a denial, or a
/// timeout.
async fn handle_client(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if body.is_empty() {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let nat = headers
        .get(NAT_CLASS_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(NatClass::from_str_lossy)
        .unwrap_or_default();

    match state.matcher.client_offer(body, nat).await {
        OfferOutcome::Answered { answer, rtt } => {
            state.metrics.record_match();
            state.metrics.record_rtt(rtt);
            answer.into_response()
        }
        OfferOutcome::Denied => {
            debug!("no proxies available for {} client", nat.as_str());
            state.metrics.record_denied(nat);
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
        OfferOutcome::AnswerTimeout => {
            // The offer did reach a proxy, so the match still counts.
            state.metrics.record_match();
            StatusCode::GATEWAY_TIMEOUT.into_response()
        }
    }
}

/// A proxy polls for a client to serve.
async fn handle_proxy(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    body: String,
) -> Response {
    let request: ProxyPollRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(e) => {
            debug!("rejecting proxy poll: {e}");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    if let Err(e) = request.validate() {
        debug!("rejecting proxy poll: {e}");
        return StatusCode::BAD_REQUEST.into_response();
    }

    if let Some(ConnectInfo(addr)) = connect_info {
        state
            .metrics
            .record_proxy_poll(addr.ip(), request.proxy_type, request.nat);
    }

    match state
        .matcher
        .proxy_poll(&request.sid, request.proxy_type, request.nat)
        .await
    {
        PollOutcome::Matched { offer, client_nat } => {
            Json(ProxyPollResponse::client_match(offer, client_nat)).into_response()
        }
        PollOutcome::NoMatch => {
            state.metrics.record_idle_poll();
            Json(ProxyPollResponse::no_match()).into_response()
        }
    }
}

/// A matched proxy posts its answer for the waiting client.
async fn handle_answer(State(state): State<Arc<AppState>>, body: String) -> Response {
    let request: ProxyAnswerRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(e) => {
            debug!("rejecting answer: {e}");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    if let Err(e) = request.validate() {
        debug!("rejecting answer: {e}");
        return StatusCode::BAD_REQUEST.into_response();
    }

    match state.matcher.proxy_answer(&request.sid, request.answer) {
        AnswerOutcome::Delivered => Json(ProxyAnswerResponse::success()).into_response(),
        AnswerOutcome::ClientGone => Json(ProxyAnswerResponse::client_gone()).into_response(),
        // The sid was once valid but its client entry is long reaped.
        AnswerOutcome::UnknownSid => {
            (StatusCode::GONE, Json(ProxyAnswerResponse::client_gone())).into_response()
        }
    }
}

async fn handle_metrics(State(state): State<Arc<AppState>>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.metrics.render(),
    )
        .into_response()
}

async fn handle_debug(State(state): State<Arc<AppState>>) -> Response {
    let proxies = state.matcher.available_proxies();
    let mut out = format!("current proxies available: {}\n", proxies.len());
    for (sid, proxy_type) in proxies {
        out.push_str(&format!("  {sid} ({})\n", proxy_type.as_str()));
    }
    match state.metrics.average_rtt() {
        Some(rtt) => out.push_str(&format!("\nroundtrip avg: {}ms\n", rtt.as_millis())),
        None => out.push_str("\nroundtrip avg: n/a\n"),
    }
    ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], out).into_response()
}

async fn handle_robots() -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        "User-agent: *\nDisallow: /\n",
    )
        .into_response()
}
