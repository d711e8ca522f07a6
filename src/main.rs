use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use kube::Client;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use kube_image_deployer::config::Config;
use kube_image_deployer::metrics;
use kube_image_deployer::registry::RegistryClient;
use kube_image_deployer::registry::auth::{CloudIamProvider, CredentialChain, DefaultCredentialProvider, UnconfiguredTokenFetcher};
use kube_image_deployer::registry::transport::OciTransport;
use kube_image_deployer::supervisor::Supervisor;

/// The namespace the in-cluster service account's `imagePullSecrets` are
/// read from, per the standard downward-API-mounted service account
/// namespace file. Falls back to `"default"` when run outside a cluster
/// (e.g. against a local kubeconfig).
fn own_namespace() -> String {
    match std::fs::read_to_string("/var/run/secrets/kubernetes.io/serviceaccount/namespace") {
        Ok(contents) if !contents.trim().is_empty() => contents.trim().to_string(),
        _ => "default".to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "kube_image_deployer=info,kube=info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = Config::load()?;
    info!(watch_key = %config.controller_watch_key, "starting kube-image-deployer");

    let metrics_handle = metrics::start_metrics_server(&config.metrics_addr).await?;

    if let Some(path) = &config.kubeconfig {
        // SAFETY: single-threaded at this point in startup, before any
        // worker task reads the environment.
        unsafe { std::env::set_var("KUBECONFIG", path) };
    }
    let client = Client::try_default().await?;

    let default_platform = config.default_platform().map_err(|e| anyhow::anyhow!(e))?;
    let credentials = CredentialChain::new(
        CloudIamProvider::new(Arc::new(UnconfiguredTokenFetcher)),
        Arc::new(DefaultCredentialProvider::new(client.clone(), own_namespace())),
    );
    let registry_client = Arc::new(RegistryClient::new(
        Arc::new(OciTransport::new()),
        Arc::new(credentials),
        Duration::from_secs(config.image_hash_cache_ttl_sec),
        default_platform,
    ));

    let supervisor = Supervisor::start(&config, client, registry_client);

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }

    supervisor.shutdown().await;
    metrics_handle.abort();

    info!("kube-image-deployer stopped");
    Ok(())
}
