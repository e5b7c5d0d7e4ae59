//! Runtime configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use jsonwebtoken::DecodingKey;
use serde::Deserialize;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The port used for the HTTP API, healthchecks & metrics.
    #[serde(default = "Config::default_http_port")]
    pub http_port: u16,

    /// The Kubernetes namespace in which services are provisioned.
    pub namespace: String,
    /// The path to the database on disk.
    #[serde(default = "crate::database::default_data_path")]
    pub storage_data_path: String,

    /// The HMAC secret used to verify session tokens.
    pub session_secret: String,

    /// The registry prefix of all images run by the platform.
    #[serde(default = "Config::default_registry")]
    pub registry: String,
    /// The fixed credential used for pushing images to the registry.
    #[serde(default)]
    pub registry_auth: String,
    /// The URL at which node agents reach this control plane.
    pub control_plane_url: String,

    /// The maximum duration in seconds of a single command poll.
    #[serde(default = "Config::default_poll_timeout_seconds")]
    pub poll_timeout_seconds: u64,
    /// The timeout in seconds applied to each orchestrator call.
    #[serde(default = "Config::default_orchestrator_timeout_seconds")]
    pub orchestrator_timeout_seconds: u64,

    /// Build & push the data source images at startup.
    #[serde(default)]
    pub build_datasource_images: bool,
    /// The directory holding the `datasource-{kind}` image build contexts.
    #[serde(default = "Config::default_datasource_assets_path")]
    pub datasource_assets_path: String,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints which serde can not express.
    pub(crate) fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.session_secret.is_empty(), "SESSION_SECRET must not be empty");
        anyhow::ensure!(self.poll_timeout_seconds > 0, "POLL_TIMEOUT_SECONDS must be greater than 0");
        anyhow::ensure!(self.orchestrator_timeout_seconds > 0, "ORCHESTRATOR_TIMEOUT_SECONDS must be greater than 0");
        Ok(())
    }

    /// The maximum duration of a single command poll.
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_seconds)
    }

    /// The timeout applied to each orchestrator call.
    pub fn orchestrator_timeout(&self) -> Duration {
        Duration::from_secs(self.orchestrator_timeout_seconds)
    }

    /// The key used to verify session tokens.
    pub fn session_decoding_key(&self) -> DecodingKey {
        DecodingKey::from_secret(self.session_secret.as_bytes())
    }

    fn default_http_port() -> u16 {
        8080
    }

    fn default_registry() -> String {
        "registry.berth.local".into()
    }

    fn default_poll_timeout_seconds() -> u64 {
        30
    }

    fn default_orchestrator_timeout_seconds() -> u64 {
        10
    }

    fn default_datasource_assets_path() -> String {
        "/usr/local/berth/assets".into()
    }

    /// Build a config for tests, rooted in a fresh temporary directory.
    #[cfg(test)]
    pub fn new_test() -> Result<(std::sync::Arc<Self>, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir().context("error creating tmp dir for test config")?;
        Ok((
            std::sync::Arc::new(Self {
                rust_log: "".into(),
                http_port: 8080,
                namespace: "default".into(),
                storage_data_path: tmpdir.path().to_string_lossy().to_string(),
                session_secret: "test-secret".into(),
                registry: "registry.test".into(),
                registry_auth: "".into(),
                control_plane_url: "http://berth.test".into(),
                poll_timeout_seconds: 1,
                orchestrator_timeout_seconds: 1,
                build_datasource_images: false,
                datasource_assets_path: tmpdir.path().join("assets").to_string_lossy().to_string(),
            }),
            tmpdir,
        ))
    }
}
