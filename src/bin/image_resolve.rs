//! Standalone CLI mirroring `cli/src/cli.go`: resolves a single
//! `(image, tag, platform)` against a registry and prints the resolved
//! `url@sha256:...` string, without touching the cluster. Useful for
//! operators debugging a stuck annotation outside of Kubernetes.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube_image_deployer::registry::auth::{AnonymousProvider, CloudIamProvider, CredentialChain, UnconfiguredTokenFetcher};
use kube_image_deployer::registry::transport::OciTransport;
use kube_image_deployer::registry::{Platform, RegistryClient};

#[derive(Parser)]
#[command(name = "image-resolve", about = "Resolve a single image:tag to its registry digest")]
struct Args {
    #[arg(long)]
    image: String,

    #[arg(long)]
    tag: String,

    #[arg(long, default_value = "linux/amd64")]
    platform: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let credentials = CredentialChain::new(
        CloudIamProvider::new(Arc::new(UnconfiguredTokenFetcher)),
        Arc::new(AnonymousProvider),
    );
    let client = RegistryClient::new(
        Arc::new(OciTransport::new()),
        Arc::new(credentials),
        Duration::from_secs(60),
        Platform::default_platform(),
    );

    let resolved = client.resolve(&args.image, &args.tag, &args.platform).await?;
    println!("{resolved}");
    Ok(())
}
