//! Image Watch Registry (spec §4.4): deduplicates and reference-counts
//! watches across controllers, polling the Registry Client on a fixed
//! interval and fanning out resolved image strings.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::watch as shutdown_watch;
use tracing::{debug, info, warn};

use crate::metrics::{REGISTRY_RESOLVE_ERRORS, WATCH_ENTRIES};
use crate::registry::RegistryClient;

/// Deduplication key across all controllers (spec §3 "Image Watch Key").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchKey {
    pub controller_id: String,
    pub url: String,
    pub tag: String,
    pub platform: String,
}

struct WatchEntry {
    refcount: i64,
    last_resolved: Option<String>,
}

/// Receives resolved image strings from the registry poller. Implemented
/// by each per-resource controller (spec §4.5 "On-resolved callback").
#[async_trait]
pub trait ResolvedImageSink: Send + Sync {
    async fn on_resolved(&self, url: &str, tag: &str, platform: &str, image_string: &str);
}

/// Subscribes a `ResolvedImageSink` under a controller id so the registry
/// can route a resolved watch entry back to the right controller.
pub struct ImageWatchRegistry {
    entries: DashMap<WatchKey, WatchEntry>,
    sinks: DashMap<String, Arc<dyn ResolvedImageSink>>,
    registry_client: Arc<RegistryClient>,
}

impl ImageWatchRegistry {
    pub fn new(registry_client: Arc<RegistryClient>) -> Self {
        Self {
            entries: DashMap::new(),
            sinks: DashMap::new(),
            registry_client,
        }
    }

    /// Registers the controller that owns `controller_id` as the target
    /// for resolved-image callbacks. Must be called before that
    /// controller's first `register`.
    pub fn add_sink(&self, controller_id: impl Into<String>, sink: Arc<dyn ResolvedImageSink>) {
        self.sinks.insert(controller_id.into(), sink);
    }

    /// Inserts a new entry at refcount 1, or increments an existing one.
    pub fn register(&self, key: WatchKey) {
        match self.entries.get_mut(&key) {
            Some(mut entry) => entry.refcount += 1,
            None => {
                debug!(url = %key.url, tag = %key.tag, controller = %key.controller_id, "registering watch");
                self.entries.insert(
                    key,
                    WatchEntry {
                        refcount: 1,
                        last_resolved: None,
                    },
                );
            }
        }
    }

    /// Decrements the entry's refcount, removing it once it reaches zero.
    /// Unregistering an absent key logs a warning and is otherwise a no-op.
    pub fn unregister(&self, key: &WatchKey) {
        let Some(mut entry) = self.entries.get_mut(key) else {
            warn!(url = %key.url, tag = %key.tag, controller = %key.controller_id, "unregister of unknown watch key");
            return;
        };

        entry.refcount -= 1;
        if entry.refcount <= 0 {
            if entry.refcount < 0 {
                warn!(url = %key.url, tag = %key.tag, "watch refcount went negative, clamping at 0");
            }
            drop(entry);
            self.entries.remove(key);
        }
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Runs the poll ticker until `shutdown` fires. Failures for an
    /// individual entry are logged and never remove the entry or abort
    /// the tick (spec §4.4).
    pub async fn run(&self, check_interval: Duration, mut shutdown: shutdown_watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(check_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("image watch registry shutting down");
                        return;
                    }
                }
            }
        }
    }

    async fn tick(&self) {
        let snapshot: Vec<WatchKey> = self.entries.iter().map(|e| e.key().clone()).collect();
        WATCH_ENTRIES.set(snapshot.len() as i64);

        for key in snapshot {
            match self
                .registry_client
                .resolve(&key.url, &key.tag, &key.platform)
                .await
            {
                Ok(image_string) => {
                    if let Some(mut entry) = self.entries.get_mut(&key) {
                        entry.last_resolved = Some(image_string.clone());
                    }
                    if let Some(sink) = self.sinks.get(&key.controller_id) {
                        sink.on_resolved(&key.url, &key.tag, &key.platform, &image_string)
                            .await;
                    }
                }
                Err(err) => {
                    REGISTRY_RESOLVE_ERRORS.with_label_values(&[&key.controller_id]).inc();
                    warn!(url = %key.url, tag = %key.tag, error = %err, "registry poll failed, will retry next tick");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::auth::{AnonymousProvider, CloudIamProvider, CredentialChain, UnconfiguredTokenFetcher};
    use crate::registry::transport::OciTransport;
    use crate::registry::Platform;

    fn test_registry() -> Arc<RegistryClient> {
        let chain = CredentialChain::new(
            CloudIamProvider::new(Arc::new(UnconfiguredTokenFetcher)),
            Arc::new(AnonymousProvider),
        );
        Arc::new(RegistryClient::new(
            Arc::new(OciTransport::new()),
            Arc::new(chain),
            Duration::from_secs(60),
            Platform::default_platform(),
        ))
    }

    fn key(controller: &str) -> WatchKey {
        WatchKey {
            controller_id: controller.to_string(),
            url: "busybox".to_string(),
            tag: "1.34".to_string(),
            platform: String::new(),
        }
    }

    #[test]
    fn register_then_unregister_removes_entry() {
        let registry = ImageWatchRegistry::new(test_registry());
        let k = key("deployments");

        registry.register(k.clone());
        assert_eq!(registry.entry_count(), 1);

        registry.unregister(&k);
        assert_eq!(registry.entry_count(), 0);
    }

    #[test]
    fn refcount_tracks_multiple_registrations_across_controllers() {
        let registry = ImageWatchRegistry::new(test_registry());
        let a = WatchKey {
            controller_id: "deployments".to_string(),
            ..key("deployments")
        };
        let b = WatchKey {
            controller_id: "statefulsets".to_string(),
            ..key("statefulsets")
        };
        // Same (url, tag, platform) but different controller ids still
        // hash/equal independently since controller_id is part of the key;
        // registries sharing a true watch key go through one registration
        // call per Synced Image, so exercise that path too.
        registry.register(a.clone());
        registry.register(a.clone());
        registry.register(b);
        assert_eq!(registry.entry_count(), 2);

        registry.unregister(&a);
        assert_eq!(registry.entry_count(), 2, "one remaining ref on `a`");
        registry.unregister(&a);
        assert_eq!(registry.entry_count(), 1);
    }

    #[test]
    fn unregister_of_unknown_key_is_a_harmless_warning() {
        let registry = ImageWatchRegistry::new(test_registry());
        registry.unregister(&key("deployments"));
        assert_eq!(registry.entry_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_register_unregister_never_goes_negative() {
        let registry = Arc::new(ImageWatchRegistry::new(test_registry()));
        let k = key("deployments");

        for _ in 0..8 {
            registry.register(k.clone());
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let k = k.clone();
            handles.push(tokio::spawn(async move {
                registry.unregister(&k);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(registry.entry_count(), 0);
    }
}
