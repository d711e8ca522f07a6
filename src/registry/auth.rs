//! Credential provider chain (spec §4.3, §6 "Credential provider registry").
//!
//! The chain is ordered URL-prefix lookup; when no explicit prefix
//! matches, an ECR/cloud-IAM regex match is tried, and finally a default
//! provider backed by the cluster's `imagePullSecrets` (falling back to
//! anonymous).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use kube::{Api, Client};
use oci_distribution::secrets::RegistryAuth;
use regex::Regex;
use serde::Deserialize;

use crate::cache::TtlCache;
use crate::registry::RegistryError;

/// One authenticator the `RegistryClient` can pick for a given URL.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn authorize(&self, url: &str) -> Result<RegistryAuth, RegistryError>;
}

/// Always returns anonymous credentials.
pub struct AnonymousProvider;

#[async_trait]
impl CredentialProvider for AnonymousProvider {
    async fn authorize(&self, _url: &str) -> Result<RegistryAuth, RegistryError> {
        Ok(RegistryAuth::Anonymous)
    }
}

/// External collaborator that exchanges cloud-IAM identity for a
/// registry-scoped token. The protocol itself (STS/IMDS calls, SDK choice)
/// is out of scope for the core (spec §1); implementations are injected.
#[async_trait]
pub trait CloudIamTokenFetcher: Send + Sync {
    /// Fetches a fresh bearer token authorized against the registry in
    /// `region`.
    async fn fetch_token(&self, region: &str) -> Result<String, RegistryError>;
}

/// A `CloudIamTokenFetcher` that has not been wired to a real cloud
/// credential source. Used as the default so the credential chain is
/// always constructible; every call fails with `AuthUnavailable`.
pub struct UnconfiguredTokenFetcher;

#[async_trait]
impl CloudIamTokenFetcher for UnconfiguredTokenFetcher {
    async fn fetch_token(&self, region: &str) -> Result<String, RegistryError> {
        Err(RegistryError::AuthUnavailable {
            reason: format!("no cloud-IAM token fetcher configured for region {region}"),
        })
    }
}

/// Regex matching ECR registry hostnames, e.g.
/// `123456789012.dkr.ecr.us-east-1.amazonaws.com`.
pub fn ecr_regex() -> Regex {
    Regex::new(r"^\d+\.dkr\.ecr\.(.+)\.amazonaws\.com").expect("static pattern")
}

/// Cloud-IAM credential provider for ECR-shaped registries. Tokens are
/// shared process-wide across every `RegistryClient` instance, keyed by
/// region, with a TTL matching the practical lifetime of an ECR
/// authorization token (spec §9 "Globally shared cloud-IAM token cache").
pub struct CloudIamProvider {
    regex: Regex,
    fetcher: Arc<dyn CloudIamTokenFetcher>,
    token_cache: Arc<TtlCache<String, RegistryError>>,
}

impl CloudIamProvider {
    pub const TOKEN_TTL: Duration = Duration::from_secs(60 * 60 * 11);

    pub fn new(fetcher: Arc<dyn CloudIamTokenFetcher>) -> Self {
        Self {
            regex: ecr_regex(),
            fetcher,
            token_cache: Arc::new(TtlCache::new(Self::TOKEN_TTL)),
        }
    }

    /// Shares `token_cache` with another provider instance, per the
    /// "process-wide, long-lived cache" design note.
    pub fn with_shared_cache(
        fetcher: Arc<dyn CloudIamTokenFetcher>,
        token_cache: Arc<TtlCache<String, RegistryError>>,
    ) -> Self {
        Self {
            regex: ecr_regex(),
            fetcher,
            token_cache,
        }
    }

    pub fn matches(&self, url: &str) -> Option<String> {
        self.regex
            .captures(url)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    }
}

#[async_trait]
impl CredentialProvider for CloudIamProvider {
    async fn authorize(&self, url: &str) -> Result<RegistryAuth, RegistryError> {
        let region = self.matches(url).ok_or_else(|| RegistryError::AuthUnavailable {
            reason: format!("{url} does not match an ECR hostname"),
        })?;

        let fetcher = self.fetcher.clone();
        let token = self
            .token_cache
            .get(&region, || {
                let fetcher = fetcher.clone();
                let region = region.clone();
                async move { fetcher.fetch_token(&region).await }
            })
            .await?;

        Ok(RegistryAuth::Bearer(token))
    }
}

#[derive(Debug, Deserialize)]
struct DockerConfig {
    auths: HashMap<String, DockerAuthEntry>,
}

#[derive(Debug, Deserialize, Default)]
struct DockerAuthEntry {
    #[serde(default)]
    auth: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    identitytoken: String,
    #[serde(default)]
    registrytoken: String,
}

/// Default credential provider: resolves `imagePullSecrets` attached to a
/// namespace's default `ServiceAccount`, falling back to anonymous.
///
/// Grounded on the teacher's `polling::auth::AuthManager`, generalized to
/// a fixed lookup namespace (the controller's own namespace) since the
/// core's `resolve(url, tag, platform)` contract carries no per-workload
/// namespace (see DESIGN.md open question).
pub struct DefaultCredentialProvider {
    client: Client,
    namespace: String,
}

impl DefaultCredentialProvider {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    async fn lookup(&self, registry: &str) -> Result<Option<RegistryAuth>, RegistryError> {
        let sa_api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), &self.namespace);
        let sa = match sa_api.get("default").await {
            Ok(sa) => sa,
            Err(_) => return Ok(None),
        };

        let Some(secret_refs) = sa.image_pull_secrets else {
            return Ok(None);
        };

        let secrets_api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        for secret_ref in secret_refs {
            let Ok(secret) = secrets_api.get(secret_ref.name.as_str()).await else {
                continue;
            };
            if let Some(auth) = parse_secret(&secret, registry) {
                return Ok(Some(auth));
            }
        }

        Ok(None)
    }
}

#[async_trait]
impl CredentialProvider for DefaultCredentialProvider {
    async fn authorize(&self, url: &str) -> Result<RegistryAuth, RegistryError> {
        let registry = registry_host(url);
        match self.lookup(&registry).await? {
            Some(auth) => Ok(auth),
            None => Ok(RegistryAuth::Anonymous),
        }
    }
}

fn parse_secret(secret: &Secret, registry: &str) -> Option<RegistryAuth> {
    let data = secret.data.as_ref()?;

    if let Some(bytes) = data.get(".dockerconfigjson") {
        if let Some(auth) = parse_dockerconfigjson(&bytes.0, registry) {
            return Some(auth);
        }
    }
    if let Some(bytes) = data.get(".dockercfg") {
        if let Some(auth) = parse_dockercfg(&bytes.0, registry) {
            return Some(auth);
        }
    }
    None
}

fn parse_dockerconfigjson(data: &[u8], registry: &str) -> Option<RegistryAuth> {
    let config: DockerConfig = serde_json::from_slice(data).ok()?;

    if let Some(entry) = config.auths.get(registry) {
        return parse_auth_entry(entry);
    }
    let https_registry = format!("https://{registry}");
    if let Some(entry) = config.auths.get(&https_registry) {
        return parse_auth_entry(entry);
    }
    config
        .auths
        .iter()
        .find(|(key, _)| registry_key_matches(key, registry))
        .and_then(|(_, entry)| parse_auth_entry(entry))
}

fn parse_dockercfg(data: &[u8], registry: &str) -> Option<RegistryAuth> {
    let auths: HashMap<String, DockerAuthEntry> = serde_json::from_slice(data).ok()?;
    auths.get(registry).and_then(parse_auth_entry)
}

fn parse_auth_entry(entry: &DockerAuthEntry) -> Option<RegistryAuth> {
    if !entry.identitytoken.is_empty() {
        return Some(RegistryAuth::Bearer(entry.identitytoken.clone()));
    }
    if !entry.registrytoken.is_empty() {
        return Some(RegistryAuth::Bearer(entry.registrytoken.clone()));
    }
    if !entry.username.is_empty() && !entry.password.is_empty() {
        return Some(RegistryAuth::Basic(entry.username.clone(), entry.password.clone()));
    }
    if !entry.auth.is_empty() {
        let decoded = BASE64_STANDARD.decode(entry.auth.as_bytes()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, pass) = decoded.split_once(':')?;
        return Some(RegistryAuth::Basic(user.to_string(), pass.to_string()));
    }
    None
}

/// Extracts the registry hostname from an image URL the same way the
/// teacher's auth manager does: a leading path segment counts as a
/// registry host only if it looks like one (has a dot, a port, or is
/// `localhost`); otherwise Docker Hub is assumed.
pub fn registry_host(url: &str) -> String {
    let first = url.split('/').next().unwrap_or(url);
    if first.contains('.') || first.contains(':') || first == "localhost" {
        first.to_string()
    } else {
        "docker.io".to_string()
    }
}

fn registry_key_matches(key: &str, target: &str) -> bool {
    let clean = key.trim_start_matches("https://").trim_start_matches("http://");
    if clean == target {
        return true;
    }
    if target == "docker.io" {
        return matches!(
            clean,
            "index.docker.io" | "registry-1.docker.io" | "index.docker.io/v1/" | "registry-1.docker.io/v1/"
        );
    }
    false
}

/// Ordered URL-prefix → provider chain with ECR and default fallbacks
/// (spec §4.3 "Authentication").
pub struct CredentialChain {
    prefixes: Vec<(String, Arc<dyn CredentialProvider>)>,
    ecr: CloudIamProvider,
    default: Arc<dyn CredentialProvider>,
}

impl CredentialChain {
    pub fn new(ecr: CloudIamProvider, default: Arc<dyn CredentialProvider>) -> Self {
        Self {
            prefixes: Vec::new(),
            ecr,
            default,
        }
    }

    /// Registers an explicit provider for URLs starting with `prefix`.
    /// Providers are tried in registration order.
    pub fn with_prefix(mut self, prefix: impl Into<String>, provider: Arc<dyn CredentialProvider>) -> Self {
        self.prefixes.push((prefix.into(), provider));
        self
    }

    pub async fn authorize(&self, url: &str) -> Result<RegistryAuth, RegistryError> {
        for (prefix, provider) in &self.prefixes {
            if url.starts_with(prefix.as_str()) {
                return provider.authorize(url).await;
            }
        }
        if self.ecr.matches(url).is_some() {
            return self.ecr.authorize(url).await;
        }
        self.default.authorize(url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_host_extracts_explicit_hosts() {
        assert_eq!(registry_host("gcr.io/project/image:tag"), "gcr.io");
        assert_eq!(registry_host("localhost:5000/image"), "localhost:5000");
        assert_eq!(registry_host("nginx:1.21"), "docker.io");
        assert_eq!(registry_host("library/nginx:1.21"), "docker.io");
    }

    #[test]
    fn ecr_regex_captures_region() {
        let re = ecr_regex();
        let caps = re.captures("123456789012.dkr.ecr.us-east-1.amazonaws.com").unwrap();
        assert_eq!(&caps[1], "us-east-1");
        assert!(!re.is_match("gcr.io/project/image"));
    }

    #[tokio::test]
    async fn chain_prefers_explicit_prefix_over_default() {
        let chain = CredentialChain::new(
            CloudIamProvider::new(Arc::new(UnconfiguredTokenFetcher)),
            Arc::new(AnonymousProvider),
        )
        .with_prefix("registry.internal", Arc::new(AnonymousProvider));

        let auth = chain.authorize("registry.internal/team/app:1.0").await.unwrap();
        assert!(matches!(auth, RegistryAuth::Anonymous));
    }

    #[tokio::test]
    async fn chain_routes_ecr_hosts_to_cloud_iam_provider() {
        let chain = CredentialChain::new(
            CloudIamProvider::new(Arc::new(UnconfiguredTokenFetcher)),
            Arc::new(AnonymousProvider),
        );

        let err = chain
            .authorize("123456789012.dkr.ecr.us-east-1.amazonaws.com/app:1.0")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::AuthUnavailable { .. }));
    }

    #[test]
    fn registry_key_matches_docker_hub_aliases() {
        assert!(registry_key_matches("https://index.docker.io/v1/", "docker.io"));
        assert!(registry_key_matches("registry-1.docker.io", "docker.io"));
        assert!(!registry_key_matches("gcr.io", "docker.io"));
    }
}
