//! Data source cluster management.
//!
//! The cluster manager owns all mutations of data sources & their nodes. Writes are guarded by
//! the optimistic concurrency counters of the records involved, and any write touching node roles
//! is committed as a single transaction guarded by the data source's counter. A writer which loses
//! a race reloads and retries once, then fails with a conflict.

#[cfg(test)]
mod mod_test;

use anyhow::{bail, ensure, Result};

use crate::database::{Database, NodeWrite};
use crate::dispatcher::Dispatcher;
use crate::error::AppError;
use berth_core::models::{validate_host, Application, Command, DataSource, DataSourceNode, DataSourceSpec, NodeRole, NodeUpdate};

/// The number of attempts made at an optimistic write before failing with a conflict.
const WRITE_ATTEMPTS: usize = 2;

/// The data source cluster manager.
#[derive(Clone)]
pub struct ClusterManager {
    db: Database,
    dispatcher: Dispatcher,
}

impl ClusterManager {
    /// Create a new instance.
    pub fn new(db: Database, dispatcher: Dispatcher) -> Self {
        Self { db, dispatcher }
    }

    /// Create a new data source owned by the given account.
    ///
    /// The caller is expected to reconcile the new data source's service.
    #[tracing::instrument(level = "debug", skip(self, spec), fields(name = %spec.name))]
    pub async fn create_data_source(&self, owner: &str, spec: DataSourceSpec) -> Result<DataSource> {
        let ds = DataSource::from_spec(spec, owner)?;
        self.db.insert_data_source(&ds).await?;
        tracing::info!(name = %ds.name, kind = %ds.kind, instances = ds.instances, owner, "data source created");
        Ok(ds)
    }

    /// List the data sources owned by the given account.
    pub async fn list_data_sources(&self, owner: &str) -> Result<Vec<DataSource>> {
        let mut all = self.db.list_data_sources().await?;
        all.retain(|ds| ds.owner == owner);
        Ok(all)
    }

    /// Fetch a data source owned by the given account.
    ///
    /// Data sources of other accounts are reported as not found.
    pub async fn get_owned(&self, owner: &str, name: &str) -> Result<DataSource> {
        match self.db.get_data_source(name).await? {
            Some(ds) if ds.owner == owner => Ok(ds),
            _ => bail!(AppError::ResourceNotFound(format!("data source {} not found", name))),
        }
    }

    /// Fetch a data source on behalf of one of its node agents, verifying the presented token.
    pub async fn authenticate_agent(&self, name: &str, token: &str) -> Result<DataSource> {
        let ds = self.db.must_get_data_source(name).await?;
        ensure!(ds.agent_token.verify(token), AppError::Unauthorized);
        Ok(ds)
    }

    /// Set the desired instance count of the given data source.
    ///
    /// The caller is expected to reconcile the data source's service afterwards.
    #[tracing::instrument(level = "debug", skip(self, ds), fields(name = %ds.name))]
    pub async fn update_instances(&self, ds: &DataSource, instances: i64) -> Result<DataSource> {
        let instances = DataSource::validate_instances(instances)?;
        let mut current = ds.clone();
        for attempt in 1..=WRITE_ATTEMPTS {
            current.instances = instances;
            match self.db.update_data_source(current).await {
                Ok(updated) => {
                    tracing::info!(name = %updated.name, instances, "data source instances updated");
                    return Ok(updated);
                }
                Err(err) if AppError::is_conflict(&err) && attempt < WRITE_ATTEMPTS => {
                    current = self.db.must_get_data_source(&ds.name).await?;
                }
                Err(err) => return Err(err),
            }
        }
        bail!(conflict(&ds.name))
    }

    /// Register a node of the given data source on behalf of its agent.
    ///
    /// The first node of a data source becomes its master, all later nodes become replicas
    /// following the current master. Registering an already registered host returns the existing
    /// node unchanged.
    #[tracing::instrument(level = "debug", skip(self, token))]
    pub async fn create_node(&self, data_source: &str, token: &str, host: &str) -> Result<DataSourceNode> {
        validate_host(host)?;
        for attempt in 1..=WRITE_ATTEMPTS {
            let ds = self.authenticate_agent(data_source, token).await?;
            let nodes = self.db.list_nodes(data_source).await?;
            if let Some(existing) = nodes.iter().find(|node| node.host == host) {
                return Ok(existing.clone());
            }
            let node = match nodes.iter().find(|node| node.is_master()) {
                Some(master) => DataSourceNode::new(data_source, host, NodeRole::Replica, Some(&master.host)),
                None => DataSourceNode::new(data_source, host, NodeRole::Master, None),
            };
            match self.db.commit_cluster_writes(&ds, &[NodeWrite::Create(node)]).await {
                Ok((_, mut created)) => {
                    let node = created.pop().ok_or_else(|| AppError::Ise(anyhow::anyhow!("node write returned no node")))?;
                    tracing::info!(data_source, host, role = %node.role, "node registered");
                    return Ok(node);
                }
                Err(err) if AppError::is_conflict(&err) && attempt < WRITE_ATTEMPTS => continue,
                Err(err) => return Err(err),
            }
        }
        bail!(conflict(data_source))
    }

    /// List the nodes of the given data source.
    pub async fn list_nodes(&self, data_source: &str) -> Result<Vec<DataSourceNode>> {
        self.db.list_nodes(data_source).await
    }

    /// Make the given node the master of its data source.
    ///
    /// The current master is demoted & the target promoted in one transaction, so no observer
    /// ever sees zero or two masters. Every other replica is redirected to the new master. Each
    /// affected node receives the command describing its new role.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn set_master(&self, data_source: &str, host: &str) -> Result<()> {
        for attempt in 1..=WRITE_ATTEMPTS {
            let ds = self.db.must_get_data_source(data_source).await?;
            let nodes = self.db.list_nodes(data_source).await?;
            let target = match nodes.iter().find(|node| node.host == host) {
                Some(target) => target,
                None => bail!(AppError::ResourceNotFound(format!("node {} of data source {} not found", host, data_source))),
            };
            if target.is_master() {
                tracing::debug!(data_source, host, "node is already master");
                return Ok(());
            }

            let mut writes = Vec::with_capacity(nodes.len());
            for node in nodes.iter() {
                let mut next = node.clone();
                if node.host == host {
                    next.role = NodeRole::Master;
                    next.master_host = host.to_string();
                    next.pending_command = Some(Command::Promote);
                } else if node.is_master() || node.master_host != host {
                    next.role = NodeRole::Replica;
                    next.master_host = host.to_string();
                    next.pending_command = Some(Command::Demote { master_host: host.to_string() });
                } else {
                    continue;
                }
                writes.push(NodeWrite::Update(next));
            }

            match self.db.commit_cluster_writes(&ds, &writes).await {
                Ok((_, updated)) => {
                    let hosts: Vec<&str> = updated.iter().map(|node| node.host.as_str()).collect();
                    self.dispatcher.commands_written(data_source, &hosts);
                    tracing::info!(data_source, host, "node promoted to master");
                    return Ok(());
                }
                Err(err) if AppError::is_conflict(&err) && attempt < WRITE_ATTEMPTS => {
                    tracing::debug!(data_source, host, "retrying master transition after conflict");
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        bail!(conflict(data_source))
    }

    /// Apply a generic update to the given node.
    ///
    /// A role may only be restated, never changed; role changes go through `set_master`. A
    /// replica may be redirected to follow another node of its data source, in which case the
    /// replica's agent is sent the corresponding command.
    #[tracing::instrument(level = "debug", skip(self, update))]
    pub async fn update_node(&self, data_source: &str, host: &str, update: NodeUpdate) -> Result<DataSourceNode> {
        let role = match update.role.as_deref() {
            Some(role) => Some(role.parse::<NodeRole>()?),
            None => None,
        };
        for attempt in 1..=WRITE_ATTEMPTS {
            let mut node = self.db.must_get_node(data_source, host).await?;
            if let Some(role) = role {
                ensure!(
                    role == node.role,
                    AppError::InvalidInput(format!("node {} is a {}, role changes must go through a master transition", host, node.role))
                );
            }
            let master_host = match update.master_host.as_deref() {
                Some(master_host) if master_host != node.master_host => master_host,
                _ => return Ok(node),
            };
            ensure!(
                !node.is_master(),
                AppError::InvalidInput(format!("node {} is the master and can not follow another node", host))
            );
            ensure!(master_host != host, AppError::InvalidInput(format!("node {} can not follow itself", host)));
            if self.db.get_node(data_source, master_host).await?.is_none() {
                bail!(AppError::InvalidInput(format!("node {} of data source {} does not exist", master_host, data_source)));
            }

            // The redirect and its command share one write.
            node.master_host = master_host.to_string();
            let command = Command::Demote { master_host: master_host.to_string() };
            match self.dispatcher.enqueue(node, command).await {
                Ok(updated) => {
                    tracing::info!(data_source, host, master_host, "replica redirected");
                    return Ok(updated);
                }
                Err(err) if AppError::is_conflict(&err) && attempt < WRITE_ATTEMPTS => continue,
                Err(err) => return Err(err),
            }
        }
        bail!(conflict(data_source))
    }

    /// Link the given application to the given data source. Linking twice is a no-op.
    ///
    /// The caller is expected to reconcile the returned application's service afterwards.
    #[tracing::instrument(level = "debug", skip(self, ds), fields(data_source = %ds.name))]
    pub async fn link_app(&self, ds: &DataSource, app: &str) -> Result<Application> {
        self.update_links(ds, app, true).await
    }

    /// Unlink the given application from the given data source. Unlinking twice is a no-op.
    ///
    /// The caller is expected to reconcile the returned application's service afterwards.
    #[tracing::instrument(level = "debug", skip(self, ds), fields(data_source = %ds.name))]
    pub async fn unlink_app(&self, ds: &DataSource, app: &str) -> Result<Application> {
        self.update_links(ds, app, false).await
    }

    async fn update_links(&self, ds: &DataSource, app_name: &str, link: bool) -> Result<Application> {
        for attempt in 1..=WRITE_ATTEMPTS {
            let mut app = match self.db.get_app(app_name).await? {
                Some(app) if app.owner == ds.owner => app,
                _ => bail!(AppError::ResourceNotFound(format!("application {} not found", app_name))),
            };
            let changed = if link {
                app.data_sources.insert(ds.name.clone())
            } else {
                app.data_sources.remove(&ds.name)
            };
            if !changed {
                return Ok(app);
            }
            match self.db.update_app(app).await {
                Ok(updated) => {
                    tracing::info!(data_source = %ds.name, app = app_name, link, "application links updated");
                    return Ok(updated);
                }
                Err(err) if AppError::is_conflict(&err) && attempt < WRITE_ATTEMPTS => continue,
                Err(err) => return Err(err),
            }
        }
        bail!(conflict(app_name))
    }

    /// Delete the record of the given data source along with its nodes.
    ///
    /// The data source's service must already have been removed. Blocked command polls of the
    /// data source's nodes are released, and the data source is unlinked from every application
    /// which referenced it. Returns the applications which were unlinked.
    #[tracing::instrument(level = "debug", skip(self, ds), fields(name = %ds.name))]
    pub async fn delete_data_source(&self, ds: &DataSource) -> Result<Vec<Application>> {
        let mut current = ds.clone();
        for attempt in 1..=WRITE_ATTEMPTS {
            match self.db.delete_data_source(&current).await {
                Ok(()) => break,
                // A node registered concurrently; delete it along with the rest.
                Err(err) if AppError::is_conflict(&err) && attempt < WRITE_ATTEMPTS => {
                    current = self.db.must_get_data_source(&ds.name).await?;
                }
                Err(err) if AppError::is_conflict(&err) => bail!(conflict(&ds.name)),
                Err(err) => return Err(err),
            }
        }
        self.dispatcher.close_data_source(&ds.name);
        tracing::info!(name = %ds.name, "data source deleted");

        let mut unlinked = Vec::new();
        for app in self.db.list_apps().await? {
            if app.data_sources.contains(&ds.name) {
                unlinked.push(self.unlink_app(ds, &app.name).await?);
            }
        }
        Ok(unlinked)
    }
}

fn conflict(name: &str) -> AppError {
    AppError::Conflict(format!("{} was modified concurrently, please retry", name))
}
