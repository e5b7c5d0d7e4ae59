//! The platform's administrative operations.
//!
//! `Platform` sequences the cluster manager & reconciler for each externally visible operation.
//! Domain records are always written first and reconciled second; a failed reconciliation is
//! surfaced to the caller while the record keeps the desired state. Deletion is the exception,
//! where the service is removed before the record so that no record is ever dropped while its
//! service still runs.


use std::sync::Arc;

use anyhow::{bail, ensure, Result};

use crate::cluster::ClusterManager;
use crate::config::Config;
use crate::database::Database;
use crate::dispatcher::{Dispatcher, PollOutcome};
use crate::error::AppError;
use crate::orchestrator::{Orchestrator, Workload};
use crate::reconciler::{self, Reconciler};
use berth_core::models::{validate_name, validate_version, Application, DataSource, DataSourceNode, DataSourceSpec, NodeRole, NodeUpdate};

/// The number of attempts made at an optimistic application write before failing with a conflict.
const WRITE_ATTEMPTS: usize = 2;

/// The composition root of the control plane.
#[derive(Clone)]
pub struct Platform {
    config: Arc<Config>,
    db: Database,
    manager: ClusterManager,
    reconciler: Reconciler,
    dispatcher: Dispatcher,
}

impl Platform {
    /// Create a new instance.
    pub fn new(config: Arc<Config>, db: Database, orchestrator: Arc<dyn Orchestrator>) -> Self {
        let dispatcher = Dispatcher::new(db.clone());
        let manager = ClusterManager::new(db.clone(), dispatcher.clone());
        let reconciler = Reconciler::new(config.clone(), db.clone(), orchestrator);
        Self {
            config,
            db,
            manager,
            reconciler,
            dispatcher,
        }
    }

    //////////////////////////////////////////////////////////////////////////
    // Data Sources //////////////////////////////////////////////////////////

    pub async fn list_data_sources(&self, owner: &str) -> Result<Vec<DataSource>> {
        self.manager.list_data_sources(owner).await
    }

    pub async fn get_data_source(&self, owner: &str, name: &str) -> Result<DataSource> {
        self.manager.get_owned(owner, name).await
    }

    /// Create a data source & provision its service.
    pub async fn create_data_source(&self, owner: &str, spec: DataSourceSpec) -> Result<DataSource> {
        let ds = self.manager.create_data_source(owner, spec).await?;
        self.reconciler.apply_data_source_service(&ds).await?;
        Ok(ds)
    }

    /// Set the instance count of a data source & scale its service.
    pub async fn update_instances(&self, owner: &str, name: &str, instances: i64) -> Result<DataSource> {
        let ds = self.manager.get_owned(owner, name).await?;
        let ds = self.manager.update_instances(&ds, instances).await?;
        self.reconciler.apply_data_source_service(&ds).await?;
        Ok(ds)
    }

    /// Link an application to a data source & reconcile the application's service.
    pub async fn link_app(&self, owner: &str, name: &str, app: &str) -> Result<()> {
        let ds = self.manager.get_owned(owner, name).await?;
        let app = self.manager.link_app(&ds, app).await.map_err(app_not_found_as_invalid)?;
        self.reconciler.apply_service(&app).await?;
        Ok(())
    }

    /// Unlink an application from a data source & reconcile the application's service.
    pub async fn unlink_app(&self, owner: &str, name: &str, app: &str) -> Result<()> {
        let ds = self.manager.get_owned(owner, name).await?;
        let app = self.manager.unlink_app(&ds, app).await.map_err(app_not_found_as_invalid)?;
        self.reconciler.apply_service(&app).await?;
        Ok(())
    }

    /// Remove a data source's service, then its record.
    ///
    /// If the service can not be removed, the record is left in place & the error surfaced.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn delete_data_source(&self, owner: &str, name: &str) -> Result<()> {
        let ds = self.manager.get_owned(owner, name).await?;
        self.reconciler
            .remove_service(&reconciler::data_source_service_name(&ds.name), Workload::Stateful)
            .await?;
        let unlinked = self.manager.delete_data_source(&ds).await?;
        for app in unlinked {
            // The record is gone at this point, the next full reconciliation will retry.
            if let Err(err) = self.reconciler.apply_service(&app).await {
                tracing::error!(error = ?err, app = %app.name, "error reconciling application after data source removal");
            }
        }
        Ok(())
    }

    //////////////////////////////////////////////////////////////////////////
    // Nodes /////////////////////////////////////////////////////////////////

    pub async fn list_nodes(&self, owner: &str, name: &str) -> Result<Vec<DataSourceNode>> {
        let ds = self.manager.get_owned(owner, name).await?;
        self.manager.list_nodes(&ds.name).await
    }

    /// Register a node on behalf of its agent.
    pub async fn create_node(&self, name: &str, token: &str, host: &str) -> Result<DataSourceNode> {
        self.manager.create_node(name, token, host).await
    }

    /// Set the role of a node. Only promotion to master is supported.
    pub async fn set_role(&self, owner: &str, name: &str, host: &str, role: &str) -> Result<()> {
        let role: NodeRole = role.parse()?;
        ensure!(role == NodeRole::Master, AppError::InvalidInput("a node can only be set to master".into()));
        let ds = self.manager.get_owned(owner, name).await?;
        self.manager.set_master(&ds.name, host).await
    }

    pub async fn update_node(&self, owner: &str, name: &str, host: &str, update: NodeUpdate) -> Result<DataSourceNode> {
        let ds = self.manager.get_owned(owner, name).await?;
        self.manager.update_node(&ds.name, host, update).await
    }

    /// Long poll for the pending command of a node on behalf of its agent.
    pub async fn poll_command(&self, name: &str, token: &str, host: &str) -> Result<PollOutcome> {
        let ds = self.manager.authenticate_agent(name, token).await?;
        self.db.must_get_node(&ds.name, host).await?;
        self.dispatcher.wait_for_command(&ds.name, host, self.config.poll_timeout()).await
    }

    //////////////////////////////////////////////////////////////////////////
    // Applications //////////////////////////////////////////////////////////

    /// Register a new application & provision its service.
    pub async fn register_app(&self, owner: &str, name: &str, version: &str) -> Result<Application> {
        validate_name(name)?;
        validate_version(version)?;
        let app = Application::new(name, owner, version);
        self.db.insert_app(&app).await?;
        tracing::info!(app = name, version, owner, "application registered");
        self.reconciler.apply_service(&app).await?;
        Ok(app)
    }

    /// Deploy a new version of an application & roll its service.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn deploy_version(&self, owner: &str, name: &str, version: &str) -> Result<Application> {
        validate_version(version)?;
        for attempt in 1..=WRITE_ATTEMPTS {
            let mut app = self.get_owned_app(owner, name).await?;
            app.version = version.to_string();
            match self.db.update_app(app).await {
                Ok(app) => {
                    tracing::info!(app = name, version, "application version deployed");
                    self.reconciler.apply_service(&app).await?;
                    return Ok(app);
                }
                Err(err) if AppError::is_conflict(&err) && attempt < WRITE_ATTEMPTS => continue,
                Err(err) => return Err(err),
            }
        }
        bail!(AppError::Conflict(format!("application {} was modified concurrently, please retry", name)))
    }

    /// Register the given application, or deploy the given version if it already exists.
    pub async fn put_app(&self, owner: &str, name: &str, version: &str) -> Result<Application> {
        match self.db.get_app(name).await? {
            Some(_) => self.deploy_version(owner, name, version).await,
            None => self.register_app(owner, name, version).await,
        }
    }

    async fn get_owned_app(&self, owner: &str, name: &str) -> Result<Application> {
        match self.db.get_app(name).await? {
            Some(app) if app.owner == owner => Ok(app),
            _ => bail!(AppError::ResourceNotFound(format!("application {} not found", name))),
        }
    }

    //////////////////////////////////////////////////////////////////////////
    // Reconciliation ////////////////////////////////////////////////////////

    /// Reconcile the service of every data source & application.
    ///
    /// Failures are logged and skipped. Returns the number of services which failed to reconcile.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn reconcile_all(&self) -> Result<usize> {
        let mut failures = 0;
        for ds in self.db.list_data_sources().await? {
            if let Err(err) = self.reconciler.apply_data_source_service(&ds).await {
                tracing::error!(error = ?err, data_source = %ds.name, "error reconciling data source service");
                failures += 1;
            }
        }
        for app in self.db.list_apps().await? {
            if let Err(err) = self.reconciler.apply_service(&app).await {
                tracing::error!(error = ?err, app = %app.name, "error reconciling application service");
                failures += 1;
            }
        }
        tracing::info!(failures, "full reconciliation finished");
        Ok(failures)
    }
}

/// Report a missing application as invalid input of the request which referenced it.
fn app_not_found_as_invalid(err: anyhow::Error) -> anyhow::Error {
    match err.downcast::<AppError>() {
        Ok(AppError::ResourceNotFound(msg)) => AppError::InvalidInput(msg).into(),
        Ok(err) => err.into(),
        Err(err) => err,
    }
}
