//! Fencing operator entry point
//!
//! One binary, two modes. Without MY_NODE_NAME the process runs as the
//! cluster-wide manager: it reconciles every RemediationRequest but never
//! reboots anything. With MY_NODE_NAME set (the DaemonSet case) it runs as
//! the per-node agent: it owns the reboot path for its node and carries the
//! peer-health machinery.

use std::path::Path;
use std::sync::Arc;

use kube::runtime::events::{Recorder, Reporter};
use node_fence::controller::{self, BackoffTracker, ControllerState, OperatorMode};
use node_fence::crd::{ensure_default_template, Settings};
use node_fence::peerhealth::{PeerHealthClient, PeerHealthServer};
use node_fence::peers::PeerRegistry;
use node_fence::reboot::{select_rebooter, SafeTimeCalculator, Watchdog};
use node_fence::{apicheck, certificates, controlplane, utils, Error};
use tokio::sync::watch;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Error> {
    // Multiple linked crates enable both the aws-lc-rs and ring rustls
    // crypto backends, which makes rustls' auto-detection ambiguous.
    // Pin one explicitly before any TLS config is built.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    info!("Starting node-fence operator v{}", env!("CARGO_PKG_VERSION"));

    let client = kube::Client::try_default().await.map_err(Error::KubeError)?;
    info!("Connected to Kubernetes cluster");

    let namespace =
        std::env::var("DEPLOYMENT_NAMESPACE").unwrap_or_else(|_| "default".to_string());
    let settings = Arc::new(Settings::load(&client).await?);
    let out_of_service_taint_supported =
        controller::out_of_service_taint_supported(&client).await;

    match std::env::var("MY_NODE_NAME") {
        Err(_) => run_manager(client, &namespace, settings, out_of_service_taint_supported).await,
        Ok(node_name) => {
            run_agent(
                client,
                &namespace,
                settings,
                out_of_service_taint_supported,
                node_name,
            )
            .await
        }
    }
}

async fn run_manager(
    client: kube::Client,
    namespace: &str,
    settings: Arc<Settings>,
    out_of_service_taint_supported: bool,
) -> Result<(), Error> {
    info!("running in manager mode");

    certificates::ensure_certs(&client, namespace).await?;
    ensure_default_template(&client, namespace).await?;

    let recorder = Recorder::new(
        client.clone(),
        Reporter {
            controller: "node-fence-manager".to_string(),
            instance: None,
        },
    );

    let safe_time = SafeTimeCalculator::new(&settings, None);
    let state = Arc::new(ControllerState {
        client,
        recorder,
        mode: OperatorMode::Manager,
        rebooter: None,
        safe_reboot_timeout: safe_time.time_to_assume_node_rebooted(),
        out_of_service_taint_supported,
        backoff: BackoffTracker::new(),
    });

    controller::run_controller(state).await
}

async fn run_agent(
    client: kube::Client,
    namespace: &str,
    settings: Arc<Settings>,
    out_of_service_taint_supported: bool,
    node_name: String,
) -> Result<(), Error> {
    info!(node = %node_name, "running in agent mode");

    let watchdog = match Watchdog::open(Path::new(&settings.watchdog_file_path)) {
        Ok(watchdog) => Some(Arc::new(watchdog)),
        Err(err) => {
            warn!(%err, path = %settings.watchdog_file_path, "watchdog unavailable");
            None
        }
    };

    // Dropping every receiver would make the final send fail, so keep the
    // sender and hand subscriptions to the pet loop
    let (shutdown_tx, _shutdown_rx) = watch::channel(false);
    if let Some(watchdog) = &watchdog {
        tokio::spawn(watchdog.clone().run_pet_loop(shutdown_tx.subscribe()));
    }

    let rebooter = select_rebooter(watchdog.clone(), settings.is_software_reboot_enabled);
    let reboot_capable = rebooter.is_some();
    utils::set_reboot_capable_annotation(&client, &node_name, reboot_capable).await?;
    if !reboot_capable {
        error!("node cannot guarantee a reboot; the manager will refuse to remediate it");
    }

    let safe_time =
        SafeTimeCalculator::new(&settings, watchdog.as_ref().map(|w| w.timeout()));

    let material = certificates::load_material(&client, namespace).await?;

    let registry = Arc::new(PeerRegistry::new(client.clone(), &node_name));
    if let Err(err) = registry.refresh().await {
        warn!(%err, "initial peer registry refresh failed");
    }
    tokio::spawn(registry.clone().run(settings.peer_update_interval));

    let server = PeerHealthServer::new(
        client.clone(),
        material.clone(),
        settings.peer_health_port,
    );
    tokio::spawn(async move {
        if let Err(err) = server.run().await {
            error!(%err, "peer health server terminated");
        }
    });

    let control_plane =
        Arc::new(controlplane::ControlPlaneManager::new(&client, &node_name).await?);

    let peer_client = PeerHealthClient::new(
        &material,
        settings.peer_health_port,
        settings.peer_dial_timeout,
        settings.peer_request_timeout,
    );

    let machine_name = std::env::var("MY_MACHINE_NAME").unwrap_or_default();
    let check = apicheck::ApiConnectivityCheck::new(
        client.clone(),
        settings.clone(),
        &node_name,
        &machine_name,
        registry.clone(),
        peer_client,
        control_plane.clone(),
        rebooter.clone(),
    );
    tokio::spawn(check.run());

    let recorder = Recorder::new(
        client.clone(),
        Reporter {
            controller: "node-fence-agent".to_string(),
            instance: Some(node_name.clone()),
        },
    );

    let state = Arc::new(ControllerState {
        client,
        recorder,
        mode: OperatorMode::Agent { node_name },
        rebooter,
        safe_reboot_timeout: safe_time.time_to_assume_node_rebooted(),
        out_of_service_taint_supported,
        backoff: BackoffTracker::new(),
    });

    let result = controller::run_controller(state).await;

    // Orderly shutdown: disable the watchdog instead of letting it fire
    let _ = shutdown_tx.send(true);
    result
}
