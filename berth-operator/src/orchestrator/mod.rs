//! Container orchestrator abstractions.
//!
//! The platform never talks to the container runtime directly. Everything which needs to create,
//! inspect or remove a running service goes through the `Orchestrator` trait, and everything
//! which needs an image built goes through the `ImageBuilder` trait.

pub mod images;
pub mod k8s;

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;

pub use k8s::KubeOrchestrator;

/// The kind of workload backing a service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Workload {
    /// A stateless application workload.
    Stateless,
    /// A stateful data source workload, where each replica keeps a stable identity.
    Stateful,
}

/// The desired state of a service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceSpec {
    /// The name of the service.
    pub name: String,
    /// The image which the service's replicas run.
    pub image: String,
    /// The number of desired replicas.
    pub replicas: u32,
    /// The environment of each replica.
    pub env: BTreeMap<String, String>,
    /// Labels applied to the service & its replicas.
    pub labels: BTreeMap<String, String>,
    /// The kind of workload backing the service.
    pub workload: Workload,
}

/// The observed state of a service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceHandle {
    /// The name of the service.
    pub name: String,
    /// The orchestrator's version of the service object, used to guard updates.
    pub resource_version: Option<String>,
    /// The number of replicas currently requested of the orchestrator.
    pub replicas: u32,
    /// The image currently requested of the orchestrator.
    pub image: Option<String>,
}

/// Errors returned from an orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// The target service does not exist.
    #[error("service {0} not found")]
    NotFound(String),
    /// The target service was modified concurrently, or already exists.
    #[error("service {0} was modified concurrently")]
    Conflict(String),
    /// A failure which may succeed if retried.
    #[error("transient orchestrator error: {0:#}")]
    Transient(anyhow::Error),
    /// A failure which will not succeed if retried.
    #[error("orchestrator error: {0:#}")]
    Fatal(anyhow::Error),
}

impl OrchestratorError {
    /// Check if the failed operation may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Conflict(_))
    }
}

pub type OrchestratorResult<T> = std::result::Result<T, OrchestratorError>;

/// A container orchestrator able to run services.
#[async_trait]
pub trait Orchestrator: Send + Sync + 'static {
    /// Inspect the service of the given name, returning `None` if it does not exist.
    async fn inspect_service(&self, name: &str, workload: Workload) -> OrchestratorResult<Option<ServiceHandle>>;

    /// Create a new service, failing with a conflict if it already exists.
    async fn create_service(&self, spec: &ServiceSpec) -> OrchestratorResult<ServiceHandle>;

    /// Update the given service to match the given spec.
    ///
    /// The update is guarded by the version of the given handle.
    async fn update_service(&self, spec: &ServiceSpec, current: &ServiceHandle) -> OrchestratorResult<ServiceHandle>;

    /// Remove the service of the given name, failing with `NotFound` if it does not exist.
    async fn remove_service(&self, name: &str, workload: Workload) -> OrchestratorResult<()>;
}

/// A builder of container images.
#[async_trait]
pub trait ImageBuilder: Send + Sync + 'static {
    /// Build the image found in the given context dir, tagging it with each of the given tags.
    async fn build_image(&self, context: &Path, dockerfile: &str, tags: &[String]) -> Result<()>;

    /// Push the given image tag to its registry.
    async fn push_image(&self, tag: &str, registry_auth: &str) -> Result<()>;
}
