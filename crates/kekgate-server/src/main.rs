mod handlers;
mod limit;
mod tls;

use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use clap::{Parser, ValueEnum};
use kekgate_core::{
    AccessPolicy, Dataplane, HsmGateway, KeyManager, Pkcs11Gateway, ServiceConfig, SoftHsm,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use handlers::AppState;
use limit::RateLimiter;

#[derive(Parser, Debug)]
#[command(name = "kekgate-server", version, about = "kekgate envelope-encryption daemon")]
struct Args {
    /// Path to the service configuration file.
    #[arg(long, env = "CONFIG_PATH", default_value = "config.yaml")]
    config: PathBuf,

    /// HSM backend. `soft` keeps ephemeral keys in process memory and is for
    /// development only.
    #[arg(long, value_enum, default_value_t = HsmBackend::Pkcs11)]
    hsm_backend: HsmBackend,

    /// Override the bind address derived from the configuration.
    #[arg(long)]
    bind: Option<SocketAddr>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum HsmBackend {
    Pkcs11,
    Soft,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = ServiceConfig::load(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;

    init_tracing(&config);
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install TLS crypto provider"))?;
    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|err| anyhow::anyhow!("failed to install metrics recorder: {err}"))?;
    let startup = Instant::now();

    let gateway: Arc<dyn HsmGateway> = match args.hsm_backend {
        HsmBackend::Pkcs11 => Arc::new(Pkcs11Gateway::open(
            &config.hsm.pkcs11_lib,
            &config.hsm.slot_id,
            config.hsm.pin()?,
        )?),
        HsmBackend::Soft => {
            warn!("soft HSM backend selected; KEKs are ephemeral and for development only");
            Arc::new(seed_soft_hsm(&config)?)
        }
    };

    let manager = Arc::new(KeyManager::new(Arc::clone(&gateway), &config.hsm)?);
    let policy = Arc::new(AccessPolicy::new(&config.acl)?);

    let reload_interval = Duration::from_secs(config.hsm.reload_interval_secs.max(1));
    let manager_reload = manager.spawn_reload(reload_interval);
    let policy_reload = policy.spawn_reload(reload_interval);

    let limiter = Arc::new(RateLimiter::new(&config.rate_limit));
    let sweeper = limiter.spawn_sweeper();

    let state = AppState {
        dataplane: Arc::new(Dataplane::new(Arc::clone(&manager), Arc::clone(&policy))),
        limiter,
        metrics_handle,
        startup,
    };

    let app = Router::new()
        .route("/healthz", get(handlers::health))
        .route("/metrics", get(handlers::metrics_endpoint))
        .route("/api/v1/encrypt", post(handlers::encrypt))
        .route("/api/v1/decrypt", post(handlers::decrypt))
        .with_state(state)
        .layer(DefaultBodyLimit::max(2 * 1024 * 1024))
        .layer(TraceLayer::new_for_http());

    let acceptor = tls::build_acceptor(&config.server.tls).await?;
    let bind = args
        .bind
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], config.server.port)));
    let server_handle = axum_server::Handle::new();

    info!(%bind, "kekgate listening");
    let shutdown_handle = server_handle.clone();
    let server = axum_server::bind(bind)
        .acceptor(acceptor)
        .handle(server_handle)
        .serve(app.into_make_service());
    tokio::pin!(server);
    tokio::select! {
        result = &mut server => result?,
        _ = shutdown_signal() => {
            shutdown_handle.graceful_shutdown(None);
            server.await?;
        }
    }

    manager_reload.shutdown().await;
    policy_reload.shutdown().await;
    sweeper.abort();
    info!("kekgate stopped");
    Ok(())
}

fn init_tracing(config: &ServiceConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone()));
    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(false))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

/// Development backend: generate an ephemeral key for every label named by
/// the metadata document so the manager can load them.
fn seed_soft_hsm(config: &ServiceConfig) -> anyhow::Result<SoftHsm> {
    let store = kekgate_core::MetadataStore::new(&config.hsm.metadata_file);
    let metadata = store.load()?;
    let hsm = SoftHsm::new();
    for entry in metadata.rotation.values() {
        for version in &entry.versions {
            hsm.generate_key(&version.label, &[0; 8])?;
        }
    }
    Ok(hsm)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
