//! Clusterloop Operator
//!
//! Runs the ConfigMap and Widget controllers, against a kcp APIExport virtual
//! workspace when kcp is detected and against the current cluster otherwise.

use clap::{Args, Parser, Subcommand};
use clusterloop_operator::{
    bootstrap,
    config::{EngineConfig, ServerConfig, ResolverConfig},
    controllers::{ConfigMapReconciler, Context, WidgetReconciler},
    crds::{ApiExport, Widget},
    observability::{init_metrics, init_tracing, TracingConfig},
    health::{self, HealthState},
    scheme,
};
use kube::config::KubeConfigOptions;
use kube::{Config, CustomResourceExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "clusterloop-operator")]
#[command(about = "Cluster-aware ConfigMap and Widget controllers for kcp")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print CRD manifests to stdout
    Crds,
    /// Run the controllers
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// APIExport to serve; empty picks the export of the Widget group
    #[arg(long, env = "API_EXPORT_NAME", default_value = "")]
    api_export_name: String,

    /// kubeconfig context to use instead of the inferred configuration
    #[arg(long, env = "KUBE_CONTEXT")]
    context: Option<String>,

    /// Concurrent reconciles per controller
    #[arg(long, env = "WORKERS", default_value_t = 2)]
    workers: usize,

    /// Metrics endpoint bind address
    #[arg(long, env = "METRICS_BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    metrics_bind_address: SocketAddr,

    /// Health endpoint bind address
    #[arg(long, env = "HEALTH_BIND_ADDRESS", default_value = "0.0.0.0:8081")]
    health_bind_address: SocketAddr,

    /// First retry delay after a failed reconcile, in milliseconds
    #[arg(long, env = "REQUEUE_BACKOFF_BASE_MS", default_value_t = 5)]
    requeue_backoff_base_ms: u64,

    /// Maximum retry delay, in seconds
    #[arg(long, env = "REQUEUE_BACKOFF_MAX_SECS", default_value_t = 1000)]
    requeue_backoff_max_secs: u64,
}

impl RunArgs {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            workers: self.workers.max(1),
            backoff_base: Duration::from_millis(self.requeue_backoff_base_ms),
            backoff_max: Duration::from_secs(self.requeue_backoff_max_secs),
            ..Default::default()
        }
    }

    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            metrics_addr: self.metrics_bind_address,
            health_addr: self.health_bind_address,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let cli = Cli::parse();

    match cli.command {
        Commands::Crds => print_crds(),
        Commands::Run(args) => run_operator(args).await,
    }
}

fn print_crds() -> anyhow::Result<()> {
    println!("---");
    println!("{}", serde_yaml::to_string(&Widget::crd())?);
    println!("---");
    println!("{}", serde_yaml::to_string(&ApiExport::crd())?);
    Ok(())
}

async fn load_config(context: Option<&str>) -> clusterloop_operator::Result<Config> {
    match context {
        Some(context) => Ok(Config::from_kubeconfig(&KubeConfigOptions {
            context: Some(context.to_string()),
            ..Default::default()
        })
        .await?),
        None => Ok(Config::infer().await?),
    }
}

async fn run_operator(args: RunArgs) -> anyhow::Result<()> {
    init_tracing(&TracingConfig::from_env())?;
    info!("Starting clusterloop-operator");

    let metrics = match init_metrics() {
        Ok(metrics) => Some(metrics),
        Err(e) => {
            warn!(error = %e, "Failed to install metrics recorder, /metrics disabled");
            None
        }
    };

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    let server_config = args.server_config();
    let server_state = HealthState::new(metrics);
    let health_server = tokio::spawn(health::serve(
        server_config.health_addr,
        health::health_router(server_state.clone()),
        cancel.clone(),
    ));
    let metrics_server = tokio::spawn(health::serve(
        server_config.metrics_addr,
        health::metrics_router(server_state.clone()),
        cancel.clone(),
    ));

    let scheme = scheme();
    info!(groups = ?scheme.groups(), kinds = scheme.kinds().len(), "Registered API kinds");
    let config = load_config(args.context.as_deref()).await?;
    let session = bootstrap::connect(
        config,
        &scheme,
        ResolverConfig::for_export(&args.api_export_name),
        &cancel,
    )
    .await?;
    match &session.virtual_workspace_url {
        Some(url) => info!(url = %url, "Serving APIExport virtual workspace"),
        None => info!(url = %session.client.base_url(), "Serving single cluster"),
    }

    let ctx = Arc::new(Context::new(session.client.clone(), session.all_clusters.clone()));
    let engine = args.engine_config();
    let configmaps = ConfigMapReconciler::controller(ctx.clone(), engine.clone());
    let widgets = WidgetReconciler::controller(ctx, engine);

    server_state.set_ready(true);
    info!("Starting controllers");
    tokio::join!(configmaps.run(cancel.clone()), widgets.run(cancel.clone()));
    server_state.set_ready(false);

    for server in [health_server, metrics_server] {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Health server failed"),
            Err(e) => error!(error = %e, "Health server task panicked"),
        }
    }
    info!("clusterloop-operator stopped");
    Ok(())
}

async fn shutdown_on_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received terminate signal, shutting down"),
    }
    cancel.cancel();
}
