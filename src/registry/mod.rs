//! Registry Client (spec §4.3): maps `(url, tag, platform)` to a resolved
//! `url@sha256:<digest>` image string, fronted by the TTL cache and backed
//! by a pluggable transport and credential chain.

pub mod auth;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use oci_distribution::Reference;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::cache::TtlCache;
use crate::version;
use auth::CredentialChain;
use transport::RegistryTransport;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("failed to parse image reference {reference:?}: {source}")]
    ParseReference { reference: String, source: String },

    #[error("failed to resolve manifest for {reference:?}: {source}")]
    ResolveManifest { reference: String, source: String },

    #[error("failed to list tags for {repository:?}: {source}")]
    ListTags { repository: String, source: String },

    #[error("no tag in {repository:?} matched filter {filter:?}")]
    NotFound { repository: String, filter: String },

    #[error("invalid platform string {platform:?}: {reason}")]
    InvalidPlatform { platform: String, reason: String },

    #[error("no credentials available for {reason}")]
    AuthUnavailable { reason: String },
}

/// A parsed `os/arch` platform string (spec §4.3 "Platform parsing").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    pub fn parse(raw: &str, default: &Platform) -> Result<Platform, RegistryError> {
        if raw.is_empty() {
            return Ok(default.clone());
        }
        let mut parts = raw.splitn(2, '/');
        let (os, arch) = match (parts.next(), parts.next()) {
            (Some(os), Some(arch)) if !os.is_empty() && !arch.is_empty() => (os, arch),
            _ => {
                return Err(RegistryError::InvalidPlatform {
                    platform: raw.to_string(),
                    reason: "expected \"os/arch\"".to_string(),
                });
            }
        };
        Ok(Platform {
            os: os.to_string(),
            arch: arch.to_string(),
        })
    }

    pub fn default_platform() -> Platform {
        Platform {
            os: "linux".to_string(),
            arch: "amd64".to_string(),
        }
    }
}

/// Resolves `(url, tag, platform)` to `"<url>@sha256:<digest>"`.
pub struct RegistryClient {
    digest_cache: Arc<TtlCache<String, RegistryError>>,
    tags_cache: Arc<TtlCache<Vec<String>, RegistryError>>,
    transport: Arc<dyn RegistryTransport>,
    credentials: Arc<CredentialChain>,
    default_platform: Platform,
}

impl RegistryClient {
    pub fn new(
        transport: Arc<dyn RegistryTransport>,
        credentials: Arc<CredentialChain>,
        cache_ttl: Duration,
        default_platform: Platform,
    ) -> Self {
        Self {
            digest_cache: Arc::new(TtlCache::new(cache_ttl)),
            tags_cache: Arc::new(TtlCache::new(cache_ttl)),
            transport,
            credentials,
            default_platform,
        }
    }

    #[instrument(skip(self), fields(url = %url, tag = %tag))]
    pub async fn resolve(&self, url: &str, tag: &str, platform: &str) -> Result<String, RegistryError> {
        let platform = Platform::parse(platform, &self.default_platform)?;

        if tag.contains('*') {
            let concrete = self.resolve_filter(url, tag).await?;
            debug!(concrete_tag = %concrete, "expanded tag filter");
            return self.resolve_digest(url, &concrete, &platform).await;
        }

        self.resolve_digest(url, tag, &platform).await
    }

    async fn resolve_filter(&self, url: &str, filter: &str) -> Result<String, RegistryError> {
        let cache_key = format!("{url}___{filter}");
        let url_owned = url.to_string();
        let transport = self.transport.clone();
        let credentials = self.credentials.clone();

        let tags = self
            .tags_cache
            .get(&cache_key, || async move {
                let reference = parse_reference(&url_owned, "latest")?;
                let auth = credentials.authorize(&url_owned).await?;
                transport.list_tags(&reference, &auth).await
            })
            .await?;

        let tag_refs: Vec<&str> = tags.iter().map(String::as_str).collect();
        version::highest(tag_refs, filter)
            .map(str::to_string)
            .map_err(|_| RegistryError::NotFound {
                repository: url.to_string(),
                filter: filter.to_string(),
            })
    }

    async fn resolve_digest(&self, url: &str, tag: &str, platform: &Platform) -> Result<String, RegistryError> {
        let cache_key = format!("{url}:{tag}");
        let url_owned = url.to_string();
        let tag_owned = tag.to_string();
        let platform_owned = platform.clone();
        let transport = self.transport.clone();
        let credentials = self.credentials.clone();

        let digest = self
            .digest_cache
            .get(&cache_key, || async move {
                let reference = parse_reference(&url_owned, &tag_owned)?;
                let auth = credentials.authorize(&url_owned).await?;
                transport.manifest_digest(&reference, &auth, &platform_owned).await
            })
            .await?;

        Ok(format!("{url}@{digest}"))
    }
}

fn parse_reference(url: &str, tag: &str) -> Result<Reference, RegistryError> {
    let full = format!("{url}:{tag}");
    Reference::try_from(full.as_str()).map_err(|e| RegistryError::ParseReference {
        reference: full,
        source: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_parses_os_and_arch() {
        let default = Platform::default_platform();
        let p = Platform::parse("linux/arm64", &default).unwrap();
        assert_eq!(p.os, "linux");
        assert_eq!(p.arch, "arm64");
    }

    #[test]
    fn platform_empty_uses_default() {
        let default = Platform::default_platform();
        let p = Platform::parse("", &default).unwrap();
        assert_eq!(p, default);
    }

    #[test]
    fn platform_malformed_fails_hard() {
        let default = Platform::default_platform();
        assert!(Platform::parse("linux", &default).is_err());
        assert!(Platform::parse("/amd64", &default).is_err());
        assert!(Platform::parse("linux/", &default).is_err());
    }
}
