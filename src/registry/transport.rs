//! The raw registry HTTP transport (spec §1 "Out of scope: registry-protocol
//! HTTP client"). `RegistryClient` depends only on this trait; `OciTransport`
//! is the default implementation, grounded on the teacher's use of
//! `oci_distribution` in `polling::mod::RegistryPoller`.

use std::time::Duration;

use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client as OciClient, Reference};
use tokio::sync::Mutex;

use crate::registry::{Platform, RegistryError};

/// The part of talking to a container registry this crate treats as an
/// external collaborator: fetching a manifest digest and listing tags.
#[async_trait]
pub trait RegistryTransport: Send + Sync {
    /// `platform` disambiguates a multi-arch manifest list; a transport
    /// that only ever talks to single-arch manifests may ignore it.
    async fn manifest_digest(
        &self,
        reference: &Reference,
        auth: &RegistryAuth,
        platform: &Platform,
    ) -> Result<String, RegistryError>;

    async fn list_tags(&self, reference: &Reference, auth: &RegistryAuth) -> Result<Vec<String>, RegistryError>;
}

/// `oci_distribution`-backed transport. No built-in deadline per spec
/// §5 — the caller configures the HTTP-level timeout (default 10s).
///
/// `oci_distribution::Client`'s manifest/tag calls take `&mut self`
/// (the teacher's own `polling::mod::RegistryPoller` holds one behind a
/// fresh-per-call `let mut client`); `RegistryTransport` is shared via
/// `Arc<dyn RegistryTransport>` across concurrent callers, so the client
/// lives behind a `tokio::sync::Mutex` instead of being reconstructed
/// per call.
pub struct OciTransport {
    client: Mutex<OciClient>,
}

impl OciTransport {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(10))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let config = ClientConfig {
            protocol: ClientProtocol::Https,
            read_timeout: Some(timeout),
            connect_timeout: Some(timeout),
            ..Default::default()
        };
        Self {
            client: Mutex::new(OciClient::new(config)),
        }
    }
}

impl Default for OciTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// `repository:tag` (or `repository@digest`) for error messages, built
/// from `Reference`'s own accessors rather than relying on a `Display`
/// impl the crate may not expose.
fn reference_label(reference: &Reference) -> String {
    match reference.tag() {
        Some(tag) => format!("{}:{}", reference.repository(), tag),
        None => match reference.digest() {
            Some(digest) => format!("{}@{}", reference.repository(), digest),
            None => reference.repository().to_string(),
        },
    }
}

#[async_trait]
impl RegistryTransport for OciTransport {
    async fn manifest_digest(
        &self,
        reference: &Reference,
        auth: &RegistryAuth,
        _platform: &Platform,
    ) -> Result<String, RegistryError> {
        // Manifest-list platform selection is a registry/transport protocol
        // detail (out of scope per the core's external-collaborator split);
        // `oci_distribution` resolves the caller's native platform.
        self.client
            .lock()
            .await
            .fetch_manifest_digest(reference, auth)
            .await
            .map_err(|e| RegistryError::ResolveManifest {
                reference: reference_label(reference),
                source: e.to_string(),
            })
    }

    async fn list_tags(&self, reference: &Reference, auth: &RegistryAuth) -> Result<Vec<String>, RegistryError> {
        self.client
            .lock()
            .await
            .list_tags(reference, auth, None, None)
            .await
            .map(|resp| resp.tags)
            .map_err(|e| RegistryError::ListTags {
                repository: reference.repository().to_string(),
                source: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_transport_constructs() {
        let _transport = OciTransport::new();
    }
}
