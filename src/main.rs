//! Process bootstrap.
//!
//! Wires config loading -> logging -> the JWKS keystore -> the service
//! account index (awaited ready) -> the signing identity -> the callout
//! endpoint -> the liveness/metrics listener, then waits for a shutdown
//! signal and drains.

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::{atomic::AtomicBool, Arc},
};

use clap::Parser;
use nats_sa_decider::{
    callout::CalloutEndpoint, config::Config, decider::PermissionsSource, decider::Validate, jwks::Keystore,
    metrics::Metrics, sa_index::SaIndex, signing::SigningIdentity, validator::TokenValidator,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// NATS auth-callout decider. All configuration is read from the process
/// environment (`DECIDER_*`); flags exist for local overrides only.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Override `DECIDER_LOG_LEVEL` for this run.
    #[arg(long, env = "DECIDER_LOG_LEVEL")]
    log_level: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load()?;

    init_logging(cli.log_level.as_deref().unwrap_or(&config.log_level));

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(config))
}

fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(config: Config) -> anyhow::Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "starting nats-sa-decider");

    if config.callout_issuer_public_key.is_none() {
        warn!("no callout-issuer-public-key configured, auth-callout requests will not be signature-verified");
    }

    let metrics = Metrics::new()?;
    let cancel = CancellationToken::new();

    let keystore = Keystore::load(
        config.effective_jwks_url(),
        config.jwks_refresh_rate_limit,
        metrics.clone(),
    )
    .await?;

    let kube_client = if config.in_cluster {
        kube::Client::try_default().await?
    } else {
        let kubeconfig = kube::config::Kubeconfig::read()?;
        let client_config =
            kube::Config::from_custom_kubeconfig(kubeconfig, &kube::config::KubeConfigOptions::default()).await?;
        kube::Client::try_from(client_config)?
    };

    let index = Arc::new(SaIndex::new(metrics.clone()));
    let index_task = {
        let index = index.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { index.run(kube_client, cancel).await })
    };

    index
        .await_ready(&cancel)
        .await
        .map_err(|_| anyhow::anyhow!("shutdown requested before service account index became ready"))?;
    info!("service account index ready");

    let validator = Arc::new(TokenValidator::new(
        keystore,
        config.effective_issuer(),
        config.jwt_audience.clone(),
        config.clock_skew,
    ));
    let jwks_refresh_task = {
        let validator = validator.clone();
        let interval = config.jwks_refresh_interval;
        let cancel = cancel.clone();
        tokio::spawn(async move { validator.keystore().run_refresh_loop(interval, cancel).await })
    };

    let signing_identity = Arc::new(SigningIdentity::load_or_generate(config.signing_key_file.as_deref())?);
    info!(account_public_key = %signing_identity.account_public_key(), "signing identity ready");

    let nats = connect_bus(&config).await?;

    let ready = Arc::new(AtomicBool::new(false));
    let http_server = tower_server::Builder::new(SocketAddr::new(Ipv4Addr::new(0, 0, 0, 0).into(), config.http_port))
        .with_graceful_shutdown(cancel.clone())
        .bind()
        .await?;
    tokio::spawn(http_server.serve(nats_sa_decider::metrics::router(metrics.clone(), ready.clone())));
    ready.store(true, std::sync::atomic::Ordering::Release);

    let endpoint = CalloutEndpoint::new(
        nats,
        config.callout_subject.clone(),
        config.callout_issuer_public_key.clone(),
        signing_identity,
        config.bus_account.clone(),
        config.user_token_ttl,
        config.drain_grace,
        metrics,
    );

    let shutdown = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            info!("shutdown signal received, draining");
            cancel.cancel();
        })
    };

    let serve_result = endpoint
        .run(
            validator.clone() as Arc<dyn Validate>,
            index.clone() as Arc<dyn PermissionsSource>,
            cancel.clone(),
        )
        .await;

    cancel.cancel();
    shutdown.abort();
    jwks_refresh_task.abort();
    index_task.abort();

    serve_result?;
    info!("shutdown complete");
    Ok(())
}

async fn connect_bus(config: &Config) -> anyhow::Result<async_nats::Client> {
    let mut options = async_nats::ConnectOptions::new();
    if let Some(creds) = &config.bus_credentials_file {
        options = options.credentials_file(creds).await?;
    }
    options.connect(&config.bus_url).await.map_err(anyhow::Error::from)
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => error!(?err, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
