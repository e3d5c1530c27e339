use std::sync::Arc;

use anyhow::Context;
use kube::Client;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

use nodeguardian::clock::SystemClock;
use nodeguardian::config::EngineConfig;
use nodeguardian::control::{self, EngineContext, EngineStatus};
use nodeguardian::cooldown::CooldownLedger;
use nodeguardian::dispatcher::AlertDispatcher;
use nodeguardian::metrics::HttpMetricsResolver;
use nodeguardian::platform::KubePlatformAdapter;
use nodeguardian::server;
use nodeguardian::store::RuleStore;

const SHUTDOWN_CHANNEL_CAPACITY: usize = 4;

pub async fn run(config_path: &str, secrets_dir: &str, addr: &str, no_leader_election: bool) -> anyhow::Result<()> {
    let mut config = EngineConfig::from_file(config_path)
        .context("loading engine configuration")?;
    config.overlay_secrets(secrets_dir);

    let client = Client::try_default()
        .await
        .context("connecting to the cluster (is KUBECONFIG set?)")?;

    let clock = Arc::new(SystemClock);
    let platform = Arc::new(KubePlatformAdapter::new(client.clone()));
    let metrics = Arc::new(HttpMetricsResolver::new(
        config.prometheus.url.clone(),
        config.monitoring.metrics_server_url.clone(),
    ));
    let cooldown = Arc::new(CooldownLedger::new(config.state_dir.clone(), clock.clone()));
    let store = Arc::new(
        RuleStore::new(config.state_dir.clone(), cooldown.clone()).with_platform(platform.clone()),
    );
    let sink = Arc::new(
        AlertDispatcher::new(config.email.clone(), config.alert.clone()).with_store(store.clone()),
    );
    let status = Arc::new(EngineStatus::new());

    let ctx = Arc::new(EngineContext {
        config,
        platform,
        metrics,
        store: store.clone(),
        cooldown,
        sink,
        clock,
    });

    let (shutdown_tx, _) = broadcast::channel(SHUTDOWN_CHANNEL_CAPACITY);
    let socket_addr: std::net::SocketAddr = addr.parse().context("parsing --addr")?;

    let holder_identity = format!("{}-{}", hostname(), std::process::id());
    let leader_namespace = "default".to_string();

    let http_handle = tokio::spawn(server::run(
        status.clone(),
        store.clone(),
        socket_addr,
        shutdown_tx.subscribe(),
    ));

    let is_leader = if no_leader_election {
        true
    } else {
        server::acquire_leader(&client, &leader_namespace, &holder_identity).await?
    };

    let lease_handle = if is_leader && !no_leader_election {
        Some(tokio::spawn(server::lease_renewal_loop(
            client.clone(),
            leader_namespace,
            holder_identity.clone(),
            shutdown_tx.subscribe(),
        )))
    } else {
        None
    };

    let control_handle = if is_leader {
        Some(tokio::spawn(control::run(ctx, status, shutdown_tx.subscribe())))
    } else {
        warn!("did not win leader election; standing by without running the control loop");
        None
    };

    info!(%addr, "nodeguardian_started");
    signal::ctrl_c().await.context("listening for ctrl-c")?;
    info!("shutdown_signal_received");
    let _ = shutdown_tx.send(());

    if let Some(control_handle) = control_handle {
        let _ = control_handle.await;
    }
    let _ = http_handle.await;
    if let Some(lease_handle) = lease_handle {
        let _ = lease_handle.await;
    }

    Ok(())
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "nodeguardian".to_string())
}
