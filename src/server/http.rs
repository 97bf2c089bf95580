//! The control API: four JSON-over-POST endpoints, each wrapped by the
//! per-address rate limiter.
//!
//! Malformed input is a plain-text 400 and counts as a failure for the
//! sending address; storage trouble is a 5xx and does not. A rejected
//! request gets a 429 with `Retry-After` in whole seconds. Claim responses
//! never reveal why a claim failed, and a missing row reports
//! `expires_at = now`.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::api::{
    AddrBundle, AllocateResponse, ClaimRequest, ClaimResponse, ConnectionInfo, NameplateRequest,
    OkResponse, PlateStatus,
};
use crate::server::limiter::IpLimiter;
use crate::server::store::Store;

/// Discovery parameters handed out with every successful response.
#[derive(Debug, Clone, Default)]
pub struct ControlInfo {
    pub rzv_namespace: String,
    pub rendezvous_addrs: Vec<String>,
    pub relay_addrs: Vec<String>,
    pub bootstrap: Vec<String>,
}

/// Shared state behind the router.
pub struct ControlState {
    pub store: Store,
    pub limiter: IpLimiter,
    pub info: ControlInfo,
    pub ttl: Duration,
    pub digits: u32,
}

impl ControlState {
    fn conn_info(&self, nameplate: &str) -> ConnectionInfo {
        ConnectionInfo {
            rendezvous: AddrBundle {
                namespace: self.info.rzv_namespace.clone(),
                addrs: self.info.rendezvous_addrs.clone(),
            },
            relay: AddrBundle {
                namespace: "iroh-relay".to_string(),
                addrs: self.info.relay_addrs.clone(),
            },
            bootstrap: self.info.bootstrap.clone(),
            topic: format!("/wormhole/{nameplate}"),
        }
    }
}

/// Builds the control router.
pub fn router(state: Arc<ControlState>) -> Router {
    Router::new()
        .route("/v1/allocate", post(handle_allocate))
        .route("/v1/claim", post(handle_claim))
        .route("/v1/consume", post(handle_consume))
        .route("/v1/fail", post(handle_fail))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Spawns the once-a-minute sweep of expired and consumed rows.
pub fn spawn_sweeper(store: Store, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            match store.sweep(Utc::now().timestamp()) {
                Ok(0) => {}
                Ok(n) => info!(swept = n, "cleaned expired nameplates"),
                Err(e) => error!("sweep failed: {e}"),
            }
        }
    })
}

fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> IpAddr {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or_else(|| peer.ip())
}

fn too_many_requests(wait: Duration) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, wait.as_secs().max(1).to_string())],
        "too many requests",
    )
        .into_response()
}

fn bad_request(state: &ControlState, ip: IpAddr, msg: &'static str) -> Response {
    state.limiter.record_failure(ip, Instant::now());
    (StatusCode::BAD_REQUEST, msg).into_response()
}

fn expires_from(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_else(Utc::now)
}

async fn handle_allocate(
    State(state): State<Arc<ControlState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let ip = client_ip(&headers, peer);
    if let Err(wait) = state.limiter.allow(ip, Instant::now()) {
        return too_many_requests(wait);
    }

    let now = Utc::now().timestamp();
    match state
        .store
        .allocate(state.digits, state.ttl, now, &ip.to_string())
    {
        Ok((nameplate, expires)) => {
            info!(nameplate = %nameplate, %ip, "allocated");
            let resp = AllocateResponse {
                conn: state.conn_info(&nameplate),
                nameplate,
                expires_at: expires_from(expires),
            };
            Json(resp).into_response()
        }
        Err(e) => {
            error!("allocate failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "allocate failed").into_response()
        }
    }
}

async fn handle_claim(
    State(state): State<Arc<ControlState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let ip = client_ip(&headers, peer);
    if let Err(wait) = state.limiter.allow(ip, Instant::now()) {
        return too_many_requests(wait);
    }

    let Ok(req) = serde_json::from_str::<ClaimRequest>(&body) else {
        return bad_request(&state, ip, "bad json");
    };
    if req.nameplate.is_empty() || req.side.is_empty() {
        return bad_request(&state, ip, "nameplate & side required");
    }

    let now = Utc::now();
    match state
        .store
        .claim(&req.nameplate, &req.side, now.timestamp(), &ip.to_string())
    {
        Ok((status, row)) => {
            // A missing row reports expires_at = now so failures stay
            // indistinguishable from the outside.
            let expires_at = row
                .map(|r| expires_from(r.expires_at()))
                .unwrap_or(now);
            if status == PlateStatus::Failed {
                state.limiter.record_failure(ip, Instant::now());
            }
            info!(nameplate = %req.nameplate, side = %req.side, ?status, %ip, "claim");
            let resp = ClaimResponse {
                status,
                expires_at,
                conn: state.conn_info(&req.nameplate),
            };
            Json(resp).into_response()
        }
        Err(e) => {
            error!("claim failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "claim failed").into_response()
        }
    }
}

async fn handle_consume(
    State(state): State<Arc<ControlState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let ip = client_ip(&headers, peer);
    if let Err(wait) = state.limiter.allow(ip, Instant::now()) {
        return too_many_requests(wait);
    }

    let Ok(req) = serde_json::from_str::<NameplateRequest>(&body) else {
        return bad_request(&state, ip, "bad json");
    };
    if req.nameplate.is_empty() {
        return bad_request(&state, ip, "nameplate required");
    }

    match state.store.consume(&req.nameplate) {
        Ok(()) => {
            info!(nameplate = %req.nameplate, %ip, "consumed");
            Json(OkResponse { ok: "true".into() }).into_response()
        }
        Err(e) => {
            error!("consume failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "consume failed").into_response()
        }
    }
}

async fn handle_fail(
    State(state): State<Arc<ControlState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let ip = client_ip(&headers, peer);
    if let Err(wait) = state.limiter.allow(ip, Instant::now()) {
        return too_many_requests(wait);
    }

    let Ok(req) = serde_json::from_str::<NameplateRequest>(&body) else {
        return bad_request(&state, ip, "bad json");
    };
    if req.nameplate.is_empty() {
        return bad_request(&state, ip, "nameplate required");
    }

    // Succeeds even when the code is already gone; the client side stays
    // simple.
    match state.store.fail_and_consume(&req.nameplate) {
        Ok(()) => {
            info!(nameplate = %req.nameplate, %ip, "failed-and-consumed");
            Json(OkResponse { ok: "true".into() }).into_response()
        }
        Err(e) => {
            error!("fail report failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "fail-and-consume failed").into_response()
        }
    }
}
