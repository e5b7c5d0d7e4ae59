//! Data source image management.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use crate::config::Config;
use crate::orchestrator::ImageBuilder;
use berth_core::models::DataSourceKind;

/// The name of the Dockerfile in each data source asset dir.
const DOCKERFILE: &str = "Dockerfile";

/// An image builder which shells out to the `docker` CLI.
pub struct DockerCli {
    /// The docker binary to invoke.
    binary: PathBuf,
}

impl DockerCli {
    /// Create a new instance which invokes `docker` from the PATH.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self { binary: PathBuf::from("docker") }
    }

    async fn run(&self, args: Vec<String>) -> Result<()> {
        tracing::debug!(?args, "invoking docker");
        // Build & push progress goes straight to the operator's own stdout.
        let status = tokio::process::Command::new(&self.binary)
            .args(&args)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .context("error spawning docker")?;
        if !status.success() {
            bail!("docker {} exited with {}", args.first().map(String::as_str).unwrap_or(""), status);
        }
        Ok(())
    }
}

#[async_trait]
impl ImageBuilder for DockerCli {
    async fn build_image(&self, context: &Path, dockerfile: &str, tags: &[String]) -> Result<()> {
        let mut args = vec!["build".to_string(), "--rm".to_string(), "--file".to_string(), context.join(dockerfile).display().to_string()];
        for tag in tags {
            args.push("--tag".into());
            args.push(tag.clone());
        }
        args.push(context.display().to_string());
        self.run(args).await
    }

    async fn push_image(&self, tag: &str, registry_auth: &str) -> Result<()> {
        let mut args = Vec::with_capacity(4);
        // A non-empty registry auth names the docker config dir holding registry credentials.
        if !registry_auth.is_empty() {
            args.push("--config".to_string());
            args.push(registry_auth.to_string());
        }
        args.push("push".into());
        args.push(tag.into());
        self.run(args).await
    }
}

/// Build & push the image of the given data source kind.
///
/// The build context is `{assets}/datasource-{kind}/` and the image is tagged
/// `{registry}/{kind}:latest`.
#[tracing::instrument(level = "debug", skip(builder, config))]
pub async fn make_datasource_image(builder: &dyn ImageBuilder, config: &Config, kind: DataSourceKind) -> Result<String> {
    let context = Path::new(&config.datasource_assets_path).join(format!("datasource-{}", kind.as_str()));
    let tag = kind.image(&config.registry);
    tracing::info!(%tag, context = %context.display(), "building data source image");
    builder
        .build_image(&context, DOCKERFILE, std::slice::from_ref(&tag))
        .await
        .with_context(|| format!("error building image {}", tag))?;
    builder
        .push_image(&tag, &config.registry_auth)
        .await
        .with_context(|| format!("error pushing image {}", tag))?;
    Ok(tag)
}

/// Build & push the images of all data source kinds.
pub async fn make_datasource_images(builder: &dyn ImageBuilder, config: &Config) -> Result<Vec<String>> {
    let mut tags = Vec::new();
    for kind in [DataSourceKind::Redis, DataSourceKind::Mongodb] {
        tags.push(make_datasource_image(builder, config, kind).await?);
    }
    Ok(tags)
}
