//! Per-Resource Controller (spec §4.5): owns one Kubernetes resource kind,
//! maintains its desired Synced Images, schedules reconcile work on a
//! rate-limited queue, and batches resolved images into at-most-one patch
//! per resource per tick.
//!
//! Reconcile logic never branches on kind; `Reconciler<K>` is generic over
//! [`kinds::WorkloadKind`] per the design note on avoiding duplicated
//! per-kind control paths.

pub mod kinds;
pub mod queue;

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use kube::api::{Patch, PatchParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::watch as shutdown_watch;
use tracing::{error, info, instrument, warn};

use crate::metrics::{PATCHES_APPLIED_TOTAL, PATCH_TICK_ERRORS_TOTAL, RECONCILES_TOTAL};
use crate::watch::{ImageWatchRegistry, ResolvedImageSink, WatchKey};
use kinds::{ContainerImagePatch, WorkloadKind};

#[derive(Debug, Clone, Error)]
pub enum ReconcileError {
    #[error("object {resource_key} missing during patch tick")]
    ObjectMissingOnPatch { resource_key: String },

    #[error("container {container_name:?} not found on {resource_key}")]
    ContainerNameNotFound {
        resource_key: String,
        container_name: String,
    },

    #[error("failed to apply patch to {resource_key}: {source}")]
    PatchApplyError { resource_key: String, source: String },

    #[error("synced images lock poisoned while syncing {resource_key}")]
    SyncedImagesLockPoisoned { resource_key: String },
}

/// One container's ongoing watch commitment under one resource (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SyncedImage {
    pub resource_key: String,
    pub container_name: String,
    pub url: String,
    pub tag: String,
}

#[derive(Debug, Clone)]
struct PendingUpdate {
    url: String,
    tag: String,
    image_string: String,
}

/// Bundles the kube bounds every `Reconciler<K>` instantiation needs, so
/// they're spelled out once instead of on every impl block.
pub trait ReconcilableKind:
    WorkloadKind + kube::Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static
{
}

impl<K> ReconcilableKind for K where
    K: WorkloadKind + kube::Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static
{
}

pub struct Reconciler<K: ReconcilableKind> {
    client: Client,
    watch_registry: Arc<ImageWatchRegistry>,
    watch_prefix: String,
    default_platform: String,
    indexer: DashMap<String, Arc<K>>,
    synced_images: StdRwLock<HashMap<String, HashSet<SyncedImage>>>,
    pending_updates: StdMutex<Vec<PendingUpdate>>,
    queue: Arc<queue::WorkQueue>,
}

impl<K: ReconcilableKind> Reconciler<K> {
    pub fn new(
        client: Client,
        watch_registry: Arc<ImageWatchRegistry>,
        watch_prefix: impl Into<String>,
        default_platform: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            watch_registry,
            watch_prefix: watch_prefix.into(),
            default_platform: default_platform.into(),
            indexer: DashMap::new(),
            synced_images: StdRwLock::new(HashMap::new()),
            pending_updates: StdMutex::new(Vec::new()),
            queue: Arc::new(queue::WorkQueue::new(Duration::from_millis(500), Duration::from_secs(60))),
        })
    }

    /// Runs the informer, reconcile worker, and 1Hz patch ticker until
    /// `shutdown` fires. Returns once all three have drained.
    pub async fn run(self: Arc<Self>, namespace: Option<String>, mut shutdown: shutdown_watch::Receiver<bool>) {
        self.watch_registry
            .add_sink(K::KIND_NAME.to_string(), self.clone() as Arc<dyn ResolvedImageSink>);

        let watch_api: Api<K> = match &namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };

        let informer = self.clone().run_informer(watch_api, shutdown.clone());
        let reconciler = self.clone().run_reconcile_loop(shutdown.clone());
        let ticker = self.clone().run_patch_ticker(shutdown.clone());

        tokio::select! {
            _ = informer => {},
            _ = reconciler => {},
            _ = ticker => {},
            _ = shutdown.changed() => {},
        }
        self.queue.shutdown();
    }

    async fn run_informer(self: Arc<Self>, api: Api<K>, mut shutdown: shutdown_watch::Receiver<bool>) {
        let stream = watcher(api, watcher::Config::default().labels(&self.watch_prefix)).default_backoff();
        tokio::pin!(stream);

        loop {
            tokio::select! {
                event = stream.next() => {
                    match event {
                        Some(Ok(watcher::Event::Apply(obj))) | Some(Ok(watcher::Event::InitApply(obj))) => {
                            self.handle_apply(obj);
                        }
                        Some(Ok(watcher::Event::Delete(obj))) => {
                            self.handle_delete(&obj);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => warn!(kind = K::KIND_NAME, error = %err, "watch stream error"),
                        None => return,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    fn handle_apply(&self, obj: K) {
        let key = resource_key(&obj);
        self.indexer.insert(key.clone(), Arc::new(obj));
        self.queue.add(key);
    }

    fn handle_delete(&self, obj: &K) {
        let key = resource_key(obj);
        self.indexer.remove(&key);
        self.queue.add(key);
    }

    async fn run_reconcile_loop(self: Arc<Self>, mut shutdown: shutdown_watch::Receiver<bool>) {
        loop {
            let key = tokio::select! {
                key = self.queue.get() => key,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self.queue.shutdown();
                    }
                    continue;
                }
            };
            let Some(key) = key else {
                return;
            };

            self.sync(&key).await;
        }
    }

    /// Implements spec §4.5's retry policy: a failed sync is re-enqueued
    /// rate-limited (exponential backoff, capped at 5 attempts) rather than
    /// forgotten; a successful sync clears the key's backoff history.
    #[instrument(skip(self), fields(kind = K::KIND_NAME, resource_key = %key))]
    async fn sync(&self, key: &str) {
        let object = self.indexer.get(key).map(|e| e.clone());
        let result = match object {
            None => self.unregister_all_for(key),
            Some(obj) => self.reconcile_diff(key, &obj),
        };

        match result {
            Ok(()) => {
                RECONCILES_TOTAL.with_label_values(&[K::KIND_NAME, "synced"]).inc();
                self.queue.forget(key);
            }
            Err(err) => {
                RECONCILES_TOTAL.with_label_values(&[K::KIND_NAME, "error"]).inc();
                if self.queue.add_rate_limited(key.to_string()) {
                    warn!(resource_key = %key, error = %err, "sync failed, retrying with backoff");
                } else {
                    error!(resource_key = %key, error = %err, "sync failed after max retries, giving up");
                }
            }
        }
    }

    /// Derives the desired Synced Images from annotations and updates the
    /// Synced Images set and Image Watch Registry to match (spec §4.5
    /// steps 1-3). Malformed annotation values are skipped with a warning
    /// and never fail the reconcile (spec §7 `AnnotationParseError`).
    fn reconcile_diff(&self, key: &str, obj: &K) -> Result<(), ReconcileError> {
        let prefix = format!("{}/", self.watch_prefix);
        let mut saw_any_annotation = false;
        let mut desired = HashSet::new();

        for (annotation_key, value) in obj.annotations() {
            let Some(container_name) = annotation_key.strip_prefix(prefix.as_str()) else {
                continue;
            };
            saw_any_annotation = true;

            if value.contains('@') {
                continue; // already pinned to a digest
            }

            let Some((url, tag)) = value.split_once(':') else {
                warn!(resource_key = %key, annotation = %annotation_key, "annotation value missing ':', skipping");
                continue;
            };
            if url.is_empty() || tag.is_empty() {
                warn!(resource_key = %key, annotation = %annotation_key, "annotation has empty url or tag, skipping");
                continue;
            }

            desired.insert(SyncedImage {
                resource_key: key.to_string(),
                container_name: container_name.to_string(),
                url: url.to_string(),
                tag: tag.to_string(),
            });
        }

        if desired.is_empty() && saw_any_annotation {
            warn!(resource_key = %key, "resource carries watch annotations but none resolved to a valid image");
        }

        let mut synced = self
            .synced_images
            .write()
            .map_err(|_| ReconcileError::SyncedImagesLockPoisoned {
                resource_key: key.to_string(),
            })?;
        let current = synced.entry(key.to_string()).or_default();

        let to_add: Vec<SyncedImage> = desired.difference(current).cloned().collect();
        let to_remove: Vec<SyncedImage> = current.difference(&desired).cloned().collect();

        for image in &to_add {
            self.watch_registry.register(self.watch_key_for(image));
        }
        for image in &to_remove {
            self.watch_registry.unregister(&self.watch_key_for(image));
        }

        *current = desired;
        Ok(())
    }

    fn unregister_all_for(&self, key: &str) -> Result<(), ReconcileError> {
        let mut synced = self
            .synced_images
            .write()
            .map_err(|_| ReconcileError::SyncedImagesLockPoisoned {
                resource_key: key.to_string(),
            })?;
        if let Some(images) = synced.remove(key) {
            for image in images {
                self.watch_registry.unregister(&self.watch_key_for(&image));
            }
        }
        Ok(())
    }

    fn watch_key_for(&self, image: &SyncedImage) -> WatchKey {
        WatchKey {
            controller_id: K::KIND_NAME.to_string(),
            url: image.url.clone(),
            tag: image.tag.clone(),
            platform: self.default_platform.clone(),
        }
    }

    async fn run_patch_ticker(self: Arc<Self>, mut shutdown: shutdown_watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = ticker.tick() => self.patch_tick().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn patch_tick(&self) {
        let updates = {
            let mut pending = self.pending_updates.lock().unwrap();
            std::mem::take(&mut *pending)
        };
        if updates.is_empty() {
            return;
        }

        for (resource_key, instructions) in self.group_by_resource(&updates) {
            if let Err(err) = self.apply_patch_for(&resource_key, &instructions).await {
                PATCH_TICK_ERRORS_TOTAL.with_label_values(&[K::KIND_NAME]).inc();
                error!(resource_key = %resource_key, error = %err, "patch apply failed; next resolver tick will re-notify");
            }
        }
    }

    /// Groups resolved updates by resource-key using the *current* Synced
    /// Images, re-validating container membership rather than trusting
    /// the notification (spec §9 "`on-resolved` as advisory").
    fn group_by_resource(&self, updates: &[PendingUpdate]) -> HashMap<String, Vec<(String, String)>> {
        let synced = self.synced_images.read().unwrap();
        let mut grouped: HashMap<String, Vec<(String, String)>> = HashMap::new();

        for (resource_key, images) in synced.iter() {
            for image in images {
                if let Some(update) = updates.iter().find(|u| u.url == image.url && u.tag == image.tag) {
                    grouped
                        .entry(resource_key.clone())
                        .or_default()
                        .push((image.container_name.clone(), update.image_string.clone()));
                }
            }
        }
        grouped
    }

    async fn apply_patch_for(&self, resource_key: &str, instructions: &[(String, String)]) -> Result<(), ReconcileError> {
        let obj = self
            .indexer
            .get(resource_key)
            .map(|e| e.clone())
            .ok_or_else(|| ReconcileError::ObjectMissingOnPatch {
                resource_key: resource_key.to_string(),
            })?;

        let mut containers_patch = Vec::new();
        let mut init_containers_patch = Vec::new();

        for (container_name, image_string) in instructions {
            if let Some(container) = obj.containers().iter().find(|c| &c.name == container_name) {
                if container.image.as_deref() != Some(image_string.as_str()) {
                    containers_patch.push(ContainerImagePatch {
                        name: container_name.clone(),
                        image: image_string.clone(),
                    });
                }
            } else if let Some(container) = obj.init_containers().iter().find(|c| &c.name == container_name) {
                if container.image.as_deref() != Some(image_string.as_str()) {
                    init_containers_patch.push(ContainerImagePatch {
                        name: container_name.clone(),
                        image: image_string.clone(),
                    });
                }
            } else {
                return Err(ReconcileError::ContainerNameNotFound {
                    resource_key: resource_key.to_string(),
                    container_name: container_name.clone(),
                });
            }
        }

        if containers_patch.is_empty() && init_containers_patch.is_empty() {
            return Ok(());
        }

        let patch = K::build_patch(containers_patch, init_containers_patch);
        let (namespace, name) = split_resource_key(resource_key);
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);

        api.patch(name, &PatchParams::default(), &Patch::Strategic(patch))
            .await
            .map_err(|e| ReconcileError::PatchApplyError {
                resource_key: resource_key.to_string(),
                source: e.to_string(),
            })?;

        PATCHES_APPLIED_TOTAL.with_label_values(&[K::KIND_NAME]).inc();
        info!(resource_key = %resource_key, "applied image patch");
        Ok(())
    }
}

#[async_trait]
impl<K: ReconcilableKind> ResolvedImageSink for Reconciler<K> {
    async fn on_resolved(&self, url: &str, tag: &str, _platform: &str, image_string: &str) {
        self.pending_updates.lock().unwrap().push(PendingUpdate {
            url: url.to_string(),
            tag: tag.to_string(),
            image_string: image_string.to_string(),
        });
    }
}

fn resource_key<K: kube::Resource<DynamicType = ()>>(obj: &K) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

fn split_resource_key(key: &str) -> (&str, &str) {
    key.split_once('/').unwrap_or(("", key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::auth::{AnonymousProvider, CloudIamProvider, CredentialChain, UnconfiguredTokenFetcher};
    use crate::registry::transport::OciTransport;
    use crate::registry::{Platform, RegistryClient};
    use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn test_registry() -> Arc<ImageWatchRegistry> {
        let chain = CredentialChain::new(
            CloudIamProvider::new(Arc::new(UnconfiguredTokenFetcher)),
            Arc::new(AnonymousProvider),
        );
        let client = RegistryClient::new(
            Arc::new(OciTransport::new()),
            Arc::new(chain),
            Duration::from_secs(60),
            Platform::default_platform(),
        );
        Arc::new(ImageWatchRegistry::new(Arc::new(client)))
    }

    fn deployment_with_annotations(name: &str, annotations: Vec<(&str, &str)>) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                annotations: Some(
                    annotations
                        .into_iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "api".to_string(),
                            image: Some("busybox:1.34".to_string()),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            status: None,
        }
    }

    #[test]
    fn desired_set_skips_pinned_and_malformed_annotations() {
        let reconciler = Reconciler::<Deployment>::new(
            unsafe_test_client(),
            test_registry(),
            "kube-image-deployer",
            "linux/amd64",
        );
        let obj = deployment_with_annotations(
            "web",
            vec![
                ("kube-image-deployer/api", "busybox:1.34"),
                ("kube-image-deployer/pinned", "busybox@sha256:deadbeef"),
                ("kube-image-deployer/broken", "no-colon-here"),
                ("unrelated/key", "ignored:ignored"),
            ],
        );

        reconciler.reconcile_diff("default/web", &obj).unwrap();

        let synced = reconciler.synced_images.read().unwrap();
        let current = synced.get("default/web").unwrap();
        assert_eq!(current.len(), 1);
        assert!(current.iter().any(|s| s.container_name == "api" && s.url == "busybox" && s.tag == "1.34"));
    }

    #[test]
    fn deletion_unregisters_all_synced_images() {
        let reconciler = Reconciler::<Deployment>::new(
            unsafe_test_client(),
            test_registry(),
            "kube-image-deployer",
            "linux/amd64",
        );
        let obj = deployment_with_annotations("web", vec![("kube-image-deployer/api", "busybox:1.34")]);
        reconciler.reconcile_diff("default/web", &obj).unwrap();
        assert_eq!(reconciler.watch_registry.entry_count(), 1);

        reconciler.unregister_all_for("default/web").unwrap();
        assert_eq!(reconciler.watch_registry.entry_count(), 0);
    }

    #[tokio::test]
    async fn sync_retries_rate_limited_when_synced_images_lock_is_poisoned() {
        let reconciler = Reconciler::<Deployment>::new(
            unsafe_test_client(),
            test_registry(),
            "kube-image-deployer",
            "linux/amd64",
        );
        let obj = deployment_with_annotations("web", vec![("kube-image-deployer/api", "busybox:1.34")]);
        reconciler.indexer.insert("default/web".to_string(), Arc::new(obj));

        // Poison the synced_images lock the same way a panicking holder would.
        let poisoned = std::panic::AssertUnwindSafe(|| {
            let _guard = reconciler.synced_images.write().unwrap();
            panic!("simulated panic while holding the lock");
        });
        let _ = std::panic::catch_unwind(poisoned);

        reconciler.sync("default/web").await;

        // A failed sync must not forget the key's retry history; it must
        // instead be re-enqueued rate-limited (spec §4.5 "Retry policy").
        assert_eq!(reconciler.queue.len(), 0, "the key is delayed, not immediately requeued");
    }

    #[tokio::test]
    async fn patch_tick_skips_when_image_already_matches() {
        let reconciler = Reconciler::<Deployment>::new(
            unsafe_test_client(),
            test_registry(),
            "kube-image-deployer",
            "linux/amd64",
        );
        let obj = deployment_with_annotations("web", vec![("kube-image-deployer/api", "busybox:1.34")]);
        reconciler.indexer.insert("default/web".to_string(), Arc::new(obj));
        let stored = reconciler.indexer.get("default/web").unwrap().value().clone();
        reconciler.reconcile_diff("default/web", &*stored).unwrap();

        reconciler
            .on_resolved("busybox", "1.34", "", "busybox:1.34")
            .await;

        let updates = {
            let mut pending = reconciler.pending_updates.lock().unwrap();
            std::mem::take(&mut *pending)
        };
        let grouped = reconciler.group_by_resource(&updates);
        let instructions = grouped.get("default/web").cloned().unwrap_or_default();
        // The patch path itself needs a live cluster to exercise end to
        // end; here we assert the no-op condition it relies on: the
        // current image already equals the resolved one.
        let current_image = reconciler
            .indexer
            .get("default/web")
            .unwrap()
            .containers()[0]
            .image
            .clone();
        assert_eq!(current_image.as_deref(), Some("busybox:1.34"));
        assert_eq!(instructions, vec![("api".to_string(), "busybox:1.34".to_string())]);
    }

    /// Builds a `Client` over a service that is never actually invoked.
    /// These tests only exercise indexer/Synced-Images bookkeeping, never
    /// `apply_patch_for`, so no request is ever sent.
    fn unsafe_test_client() -> Client {
        let service = tower::service_fn(|_req: http::Request<kube::client::Body>| async move {
            Ok::<_, std::convert::Infallible>(
                http::Response::builder()
                    .status(500)
                    .body(kube::client::Body::empty())
                    .unwrap(),
            )
        });
        Client::new(service, "default")
    }
}
