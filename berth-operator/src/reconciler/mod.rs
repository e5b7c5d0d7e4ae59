//! Service reconciliation.
//!
//! The reconciler translates the desired state of applications & data sources into orchestrator
//! service specs and applies them. It is not transactional with the database: a failed
//! reconciliation leaves the domain record in place, and the next reconciliation of the same
//! record converges the running service.


use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};

use crate::config::Config;
use crate::database::Database;
use crate::error::AppError;
use crate::orchestrator::{Orchestrator, OrchestratorError, OrchestratorResult, ServiceHandle, ServiceSpec, Workload};
use crate::utils;
use berth_core::models::{Application, DataSource};

const METRIC_RECONCILE_ATTEMPTS: &str = "berth_reconcile_attempts";
const METRIC_RECONCILE_FAILURES: &str = "berth_reconcile_failures";

const LABEL_BERTH_RS_APPLICATION: &str = "berth.rs/application";
const LABEL_BERTH_RS_DATA_SOURCE: &str = "berth.rs/data-source";
const LABEL_BERTH_RS_DATA_SOURCE_TYPE: &str = "berth.rs/data-source-type";

pub const ENV_APP_NAME: &str = "BERTH_APP_NAME";
pub const ENV_DATASOURCE: &str = "BERTH_DATASOURCE";
pub const ENV_AGENT_TOKEN: &str = "BERTH_AGENT_TOKEN";
pub const ENV_CONTROL_PLANE_URL: &str = "BERTH_CONTROL_PLANE_URL";

/// The name of the service backing the given application.
pub fn app_service_name(app: &str) -> String {
    format!("app-{}", app)
}

/// The name of the service backing the given data source.
pub fn data_source_service_name(data_source: &str) -> String {
    format!("ds-{}", data_source)
}

/// The env var carrying the host of a linked data source.
pub fn linked_host_env(data_source: &str) -> String {
    format!("BERTH_DS_{}_HOST", utils::env_name_fragment(data_source))
}

/// The env var carrying the type of a linked data source.
pub fn linked_type_env(data_source: &str) -> String {
    format!("BERTH_DS_{}_TYPE", utils::env_name_fragment(data_source))
}

/// The service reconciler.
#[derive(Clone)]
pub struct Reconciler {
    config: Arc<Config>,
    db: Database,
    orchestrator: Arc<dyn Orchestrator>,
}

impl Reconciler {
    /// Create a new instance.
    pub fn new(config: Arc<Config>, db: Database, orchestrator: Arc<dyn Orchestrator>) -> Self {
        metrics::describe_counter!(METRIC_RECONCILE_ATTEMPTS, metrics::Unit::Count, "service reconciliations attempted");
        metrics::describe_counter!(METRIC_RECONCILE_FAILURES, metrics::Unit::Count, "service reconciliations which failed after retry");
        Self { config, db, orchestrator }
    }

    /// Create or update the service of the given application.
    ///
    /// The update is applied even when the version is unchanged, as links surface as env on the
    /// running service.
    #[tracing::instrument(level = "debug", skip(self, app), fields(app = %app.name))]
    pub async fn apply_service(&self, app: &Application) -> Result<ServiceHandle> {
        let mut linked = Vec::with_capacity(app.data_sources.len());
        for name in app.data_sources.iter() {
            match self.db.get_data_source(name).await? {
                Some(ds) => linked.push(ds),
                None => tracing::warn!(app = %app.name, data_source = %name, "skipping link to missing data source"),
            }
        }
        let spec = self.build_app_spec(app, &linked);
        self.apply(spec).await
    }

    /// Create or update the service of the given data source.
    #[tracing::instrument(level = "debug", skip(self, ds), fields(data_source = %ds.name))]
    pub async fn apply_data_source_service(&self, ds: &DataSource) -> Result<ServiceHandle> {
        let spec = self.build_data_source_spec(ds);
        self.apply(spec).await
    }

    /// Remove the service of the given name. A service which is already absent counts as removed.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn remove_service(&self, name: &str, workload: Workload) -> Result<()> {
        metrics::counter!(METRIC_RECONCILE_ATTEMPTS).increment(1);
        let res = self
            .with_retry(name, move || async move {
                match self.bounded(self.orchestrator.remove_service(name, workload)).await {
                    Ok(()) | Err(OrchestratorError::NotFound(_)) => Ok(()),
                    Err(err) => Err(err),
                }
            })
            .await;
        if res.is_ok() {
            tracing::info!(name, "service removed");
        }
        res
    }

    /// Build the service spec of the given application & its linked data sources.
    pub fn build_app_spec(&self, app: &Application, linked: &[DataSource]) -> ServiceSpec {
        let mut env = BTreeMap::new();
        env.insert(ENV_APP_NAME.to_string(), app.name.clone());
        for ds in linked {
            env.insert(linked_host_env(&ds.name), data_source_service_name(&ds.name));
            env.insert(linked_type_env(&ds.name), ds.kind.to_string());
        }
        ServiceSpec {
            name: app_service_name(&app.name),
            image: app.image(&self.config.registry),
            replicas: 1,
            env,
            labels: maplit::btreemap! {
                LABEL_BERTH_RS_APPLICATION.to_string() => app.name.clone(),
            },
            workload: Workload::Stateless,
        }
    }

    /// Build the service spec of the given data source.
    pub fn build_data_source_spec(&self, ds: &DataSource) -> ServiceSpec {
        ServiceSpec {
            name: data_source_service_name(&ds.name),
            image: ds.kind.image(&self.config.registry),
            replicas: ds.instances,
            env: maplit::btreemap! {
                ENV_DATASOURCE.to_string() => ds.name.clone(),
                ENV_AGENT_TOKEN.to_string() => ds.agent_token.as_str().to_string(),
                ENV_CONTROL_PLANE_URL.to_string() => self.config.control_plane_url.clone(),
            },
            labels: maplit::btreemap! {
                LABEL_BERTH_RS_DATA_SOURCE.to_string() => ds.name.clone(),
                LABEL_BERTH_RS_DATA_SOURCE_TYPE.to_string() => ds.kind.to_string(),
            },
            workload: Workload::Stateful,
        }
    }

    /// Apply the given spec, creating the service if it does not yet exist.
    async fn apply(&self, spec: ServiceSpec) -> Result<ServiceHandle> {
        metrics::counter!(METRIC_RECONCILE_ATTEMPTS).increment(1);
        let spec = &spec;
        let handle = self
            .with_retry(&spec.name, move || async move {
                match self.bounded(self.orchestrator.inspect_service(&spec.name, spec.workload)).await? {
                    Some(current) => self.bounded(self.orchestrator.update_service(spec, &current)).await,
                    None => self.bounded(self.orchestrator.create_service(spec)).await,
                }
            })
            .await?;
        tracing::info!(name = %spec.name, replicas = handle.replicas, "service reconciled");
        Ok(handle)
    }

    /// Run the given operation, retrying it once if its first failure is retryable.
    async fn with_retry<T, F, Fut>(&self, name: &str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = OrchestratorResult<T>>,
    {
        let err = match op().await {
            Ok(val) => return Ok(val),
            Err(err) if err.is_retryable() => {
                tracing::warn!(name, error = %err, "retrying failed service reconciliation");
                match op().await {
                    Ok(val) => return Ok(val),
                    Err(err) => err,
                }
            }
            Err(err) => err,
        };
        metrics::counter!(METRIC_RECONCILE_FAILURES).increment(1);
        tracing::error!(name, error = %err, "error reconciling service");
        bail!(AppError::Ise(anyhow::Error::from(err).context(format!("error reconciling service {}", name))))
    }

    /// Bound the given orchestrator call with the configured timeout.
    async fn bounded<T, Fut>(&self, fut: Fut) -> OrchestratorResult<T>
    where
        Fut: Future<Output = OrchestratorResult<T>>,
    {
        let timeout = self.config.orchestrator_timeout();
        tokio::time::timeout(timeout, fut)
            .await
            .unwrap_or_else(|_| Err(OrchestratorError::Transient(anyhow!("orchestrator call timed out after {:?}", timeout))))
    }
}
