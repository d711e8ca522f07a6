//! Supervisor (spec §4.6): starts one reconciler per enabled workload
//! kind, wires each to the shared Image Watch Registry, and owns the
//! shutdown channel.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::CronJob;
use kube::Client;
use tokio::sync::watch as shutdown_watch;
use tracing::info;

use crate::config::Config;
use crate::controller::Reconciler;
use crate::controller::kinds::WorkloadKind;
use crate::registry::RegistryClient;
use crate::watch::ImageWatchRegistry;

pub struct Supervisor {
    shutdown_tx: shutdown_watch::Sender<bool>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl Supervisor {
    /// Starts a reconciler for every kind not disabled in `config`, then
    /// returns immediately; callers trigger [`Supervisor::shutdown`] to
    /// drain every worker.
    pub fn start(config: &Config, client: Client, registry_client: Arc<RegistryClient>) -> Self {
        let (shutdown_tx, shutdown_rx) = shutdown_watch::channel(false);
        let watch_registry = Arc::new(ImageWatchRegistry::new(registry_client.clone()));

        let mut workers = Vec::new();

        if !config.off_deployments {
            workers.push(spawn_reconciler::<Deployment>(config, client.clone(), watch_registry.clone(), shutdown_rx.clone()));
        }
        if !config.off_statefulsets {
            workers.push(spawn_reconciler::<StatefulSet>(config, client.clone(), watch_registry.clone(), shutdown_rx.clone()));
        }
        if !config.off_daemonsets {
            workers.push(spawn_reconciler::<DaemonSet>(config, client.clone(), watch_registry.clone(), shutdown_rx.clone()));
        }
        if !config.off_cronjobs {
            workers.push(spawn_reconciler::<CronJob>(config, client.clone(), watch_registry.clone(), shutdown_rx.clone()));
        }

        workers.push(tokio::spawn(run_watch_registry(
            watch_registry,
            Duration::from_secs(config.image_check_interval_sec),
            shutdown_rx,
        )));

        Self { shutdown_tx, workers }
    }

    /// Closes the shutdown channel and waits for every worker to drain.
    pub async fn shutdown(self) {
        info!("supervisor shutting down");
        let _ = self.shutdown_tx.send(true);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

async fn run_watch_registry(registry: Arc<ImageWatchRegistry>, interval: Duration, shutdown: shutdown_watch::Receiver<bool>) {
    registry.run(interval, shutdown).await;
}

fn spawn_reconciler<K>(
    config: &Config,
    client: Client,
    watch_registry: Arc<ImageWatchRegistry>,
    shutdown: shutdown_watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()>
where
    K: crate::controller::ReconcilableKind,
{
    let reconciler = Reconciler::<K>::new(client, watch_registry, config.controller_watch_key.clone(), config.image_default_platform.clone());
    let namespace = config.controller_watch_namespace.clone();
    tokio::spawn(async move {
        info!(kind = K::KIND_NAME, "starting controller");
        reconciler.run(namespace, shutdown).await;
        info!(kind = K::KIND_NAME, "controller drained");
    })
}
