use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use prometheus::{Encoder, IntGauge, Registry, TextEncoder};
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::control::EngineStatus;
use crate::store::SharedRuleStore;

const LEASE_NAME: &str = "nodeguardian-leader";
const LEASE_DURATION_SECONDS: i32 = 15;
const LEASE_RENEW_INTERVAL: Duration = Duration::from_secs(5);

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static READY_GAUGE: LazyLock<IntGauge> = LazyLock::new(|| {
    let g = IntGauge::new("nodeguardian_ready", "1 once the first trigger tick has completed")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(g.clone())).expect("metric not yet registered");
    g
});

static RULES_LOADED: LazyLock<IntGauge> = LazyLock::new(|| {
    let g = IntGauge::new("nodeguardian_rules_loaded", "Enabled rules currently held by the rule store")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(g.clone())).expect("metric not yet registered");
    g
});

#[derive(Clone)]
struct ServerState {
    status: Arc<EngineStatus>,
    store: SharedRuleStore,
}

pub fn build_router(status: Arc<EngineStatus>, store: SharedRuleStore) -> Router {
    let state = ServerState { status, store };
    Router::new()
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route("/readyz", get({
            let state = state.clone();
            move || ready_handler(state.clone())
        }))
        .route("/metrics", get({
            let state = state.clone();
            move || metrics_handler(state.clone())
        }))
}

pub async fn run(
    status: Arc<EngineStatus>,
    store: SharedRuleStore,
    addr: SocketAddr,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let app = build_router(status, store);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind HTTP server on {addr}"))?;
    info!(%addr, "http_server_started");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}

async fn ready_handler(state: ServerState) -> impl IntoResponse {
    RULES_LOADED.set(state.store.snapshot().await.len() as i64);
    if state.status.is_ready() {
        READY_GAUGE.set(1);
        (StatusCode::OK, "READY")
    } else {
        READY_GAUGE.set(0);
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler(state: ServerState) -> impl IntoResponse {
    RULES_LOADED.set(state.store.snapshot().await.len() as i64);
    READY_GAUGE.set(if state.status.is_ready() { 1 } else { 0 });

    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
        },
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
    }
}

/* ============================= LEADER ELECTION ============================= */

/// Acquires (or takes over an expired) leadership lease. Only the leader
/// runs the control loop; standbys sit idle until they win the lease.
pub async fn acquire_leader(client: &Client, namespace: &str, holder_identity: &str) -> Result<bool> {
    let leases: Api<Lease> = Api::namespaced(client.clone(), namespace);
    let now = MicroTime(chrono::Utc::now());

    let lease = Lease {
        metadata: ObjectMeta {
            name: Some(LEASE_NAME.to_string()),
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: Some(holder_identity.to_string()),
            lease_duration_seconds: Some(LEASE_DURATION_SECONDS),
            acquire_time: Some(now.clone()),
            renew_time: Some(now),
            ..Default::default()
        }),
    };

    match leases.create(&Default::default(), &lease).await {
        Ok(_) => return Ok(true),
        Err(kube::Error::Api(err)) if err.code == 409 => {
            info!("lease_exists_checking_expiry");
        }
        Err(_) => return Ok(false),
    }

    let existing = leases.get(LEASE_NAME).await?;
    let can_take = match &existing.spec {
        Some(spec) => {
            let is_ours = spec.holder_identity.as_deref() == Some(holder_identity);
            let is_expired = spec.renew_time.as_ref().is_none_or(|t| {
                let duration_secs = spec.lease_duration_seconds.unwrap_or(LEASE_DURATION_SECONDS) as i64;
                chrono::Utc::now().signed_duration_since(t.0) > chrono::Duration::seconds(duration_secs)
            });
            is_ours || is_expired
        }
        None => true,
    };
    if !can_take {
        return Ok(false);
    }

    info!("lease_takeover");
    let now = MicroTime(chrono::Utc::now());
    let patch = serde_json::json!({
        "spec": {
            "holderIdentity": holder_identity,
            "leaseDurationSeconds": LEASE_DURATION_SECONDS,
            "acquireTime": now,
            "renewTime": now,
        }
    });
    match leases
        .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(true),
        Err(_) => Ok(false),
    }
}

/// Periodically renews the lease this process won. Only called for the
/// winner of `acquire_leader`, but re-checks `holderIdentity` on every tick
/// anyway: if another replica has taken over (e.g. this one stalled past the
/// lease duration), renewing would keep the lease artificially fresh under
/// the wrong holder and defeat the exclusion leader election exists for.
pub async fn lease_renewal_loop(
    client: Client,
    namespace: String,
    holder_identity: String,
    mut shutdown: broadcast::Receiver<()>,
) {
    let leases: Api<Lease> = Api::namespaced(client, &namespace);
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = sleep(LEASE_RENEW_INTERVAL) => {
                match leases.get(LEASE_NAME).await {
                    Ok(lease) => {
                        let still_ours = lease
                            .spec
                            .as_ref()
                            .and_then(|s| s.holder_identity.as_deref())
                            == Some(holder_identity.as_str());
                        if !still_ours {
                            warn!("lease_no_longer_held_stopping_renewal");
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "lease_renewal_lookup_failed");
                        continue;
                    }
                }
                let now = MicroTime(chrono::Utc::now());
                let patch = serde_json::json!({ "spec": { "renewTime": now } });
                if let Err(e) = leases
                    .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
                {
                    warn!(error = %e, "lease_renewal_failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state(ready: bool) -> (Arc<EngineStatus>, SharedRuleStore) {
        let status = Arc::new(EngineStatus::new());
        if ready {
            status.mark_ready();
        }
        use chrono::TimeZone;
        let state_dir = std::env::temp_dir().join(format!("nodeguardian-server-test-{}", std::process::id()));
        let clock = Arc::new(crate::clock::FakeClock::new(
            chrono::Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        ));
        let cooldown = Arc::new(crate::cooldown::CooldownLedger::new(&state_dir, clock));
        let store = Arc::new(crate::store::RuleStore::new(&state_dir, cooldown));
        (status, store)
    }

    #[tokio::test]
    async fn test_healthz_returns_ok() {
        let (status, store) = test_state(false);
        let app = build_router(status, store);
        let req = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn test_readyz_before_first_tick() {
        let (status, store) = test_state(false);
        let app = build_router(status, store);
        let req = Request::builder().uri("/readyz").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_readyz_after_first_tick() {
        let (status, store) = test_state(true);
        let app = build_router(status, store);
        let req = Request::builder().uri("/readyz").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_returns_ok() {
        let (status, store) = test_state(false);
        let app = build_router(status, store);
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route_returns_404() {
        let (status, store) = test_state(false);
        let app = build_router(status, store);
        let req = Request::builder().uri("/nope").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
