mod config;
mod digest;
mod engine;
mod exemptions;
mod handlers;
mod image;
mod metrics;
mod reconcile;
mod server;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::post;
use clap::Parser;
use prometheus_client::registry::Registry;
use tracing::{error, info};

#[derive(Parser)]
#[command(
    name = "imagetrust",
    about = "Kubernetes admission webhook enforcing trusted image digests"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(
        long,
        default_value = "/etc/imagetrust/config.yaml",
        env = "IMAGETRUST_CONFIG"
    )]
    config: String,
}

fn parse_addr(value: &str, what: &str) -> SocketAddr {
    value.parse().unwrap_or_else(|e| {
        eprintln!("Invalid {what} '{value}': {e}");
        std::process::exit(1);
    })
}

#[tokio::main]
async fn main() {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install default CryptoProvider");

    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let settings = config::Settings::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Failed to load config from {}: {e}", cli.config);
        std::process::exit(1);
    });

    let trust = Arc::new(config::TrustStore::load(settings).unwrap_or_else(|e| {
        eprintln!("Failed to load trust material: {e}");
        std::process::exit(1);
    }));

    info!(
        listen_addr = %trust.settings.listen_addr,
        metrics_addr = %trust.settings.metrics_addr,
        validation_mode = %trust.settings.validation_mode,
        mutation_dry_run = trust.settings.mutation_dry_run,
        mutation_registry_enabled = trust.settings.mutation_registry_enabled,
        fetch_digests = trust.settings.fetch_digests.enabled,
        digest_mappings = trust.mapping.len(),
        exemptions = trust.settings.exemptions.len(),
        existing_pods = trust.settings.existing_pods.enabled,
        pull_secrets = trust.pull_secret_credentials.len(),
        "imagetrust starting"
    );

    let mut registry = Registry::default();
    let admission_metrics = metrics::Metrics::new(&mut registry);
    let registry = Arc::new(registry);

    let engine = engine::PolicyEngine::new(trust.clone());
    let app_state = Arc::new(handlers::AppState {
        engine,
        metrics: admission_metrics.clone(),
    });

    let webhook_router = Router::new()
        .route("/mutate-pods", post(handlers::handle_mutate))
        .route("/validate-pods", post(handlers::handle_validate))
        .layer(DefaultBodyLimit::max(2 * 1024 * 1024))
        .with_state(app_state);

    let listen_addr = parse_addr(&trust.settings.listen_addr, "listen_addr");
    let metrics_addr = parse_addr(&trust.settings.metrics_addr, "metrics_addr");

    let shutdown = server::Shutdown::install();

    // Bind both listeners before serving anything: bind errors stay fatal
    // and readiness needs no extra signalling.
    let webhook = server::WebhookServer::bind(
        listen_addr,
        &trust.settings.tls_cert_path,
        &trust.settings.tls_key_path,
    )
    .await
    .unwrap_or_else(|e| {
        eprintln!("Failed to start webhook listener: {e}");
        std::process::exit(1);
    });
    let ops = server::OpsServer::bind(metrics_addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to start metrics listener: {e}");
        std::process::exit(1);
    });

    let needs_client =
        trust.settings.existing_pods.enabled || !trust.pull_secret_credentials.is_empty();
    if needs_client {
        let client = kube::Client::try_default().await.unwrap_or_else(|e| {
            eprintln!("Failed to create Kubernetes client: {e}");
            std::process::exit(1);
        });

        if trust.settings.existing_pods.enabled {
            let sweep_client = client.clone();
            let sweep_trust = trust.clone();
            let sweep_metrics = admission_metrics.clone();
            let sweep_shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = reconcile::existing_pods::run(
                    sweep_client,
                    sweep_trust,
                    sweep_metrics,
                    sweep_shutdown,
                )
                .await
                {
                    error!("existing pods sweep failed: {e}");
                    std::process::exit(1);
                }
            });
        }

        if !trust.pull_secret_credentials.is_empty() {
            let ns_trust = trust.clone();
            let ns_shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = reconcile::namespaces::run(client, ns_trust, ns_shutdown).await {
                    error!("namespace reconciler failed: {e}");
                    std::process::exit(1);
                }
            });
        }
    }

    tokio::join!(
        webhook.serve(webhook_router, shutdown.clone()),
        ops.serve(registry, shutdown),
    );

    info!("imagetrust stopped");
}
