//! Database management.
//!
//! The database is a versioned document store. Every record carries a monotonic counter, and all
//! writes are compare-and-set operations against the counter observed by the writer. Writers
//! never block one another: a losing writer receives `AppError::Conflict` and decides whether to
//! retry.
//!
//! Writes which span a data source and its nodes are performed as a single multi-tree
//! transaction which re-checks the data source's counter and bumps it. Writes to a single node,
//! such as replica redirects and command slot updates, leave that counter alone and are guarded
//! by the node's own counter only.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{abort, ConflictableTransactionError, TransactionError, TransactionResult, TransactionalTree};
use sled::{Config as SledConfig, Db, IVec, Transactional, Tree};

use crate::config::Config;
use crate::error::{AppError, ShutdownError, ShutdownResult, ERR_DB_FLUSH, ERR_ITER_FAILURE};
use crate::utils;
use berth_core::models::{Application, DataSource, DataSourceNode};

/// The default path to use for data storage.
pub const DEFAULT_DATA_PATH: &str = "/usr/local/berth/db";
/// The DB tree used for data sources.
const TREE_DATA_SOURCES: &str = "data_sources";
/// The DB tree used for data source nodes.
const TREE_NODES: &str = "data_source_nodes";
/// The DB tree used for applications.
const TREE_APPS: &str = "applications";

/// The default path to use for data storage.
pub fn default_data_path() -> String {
    DEFAULT_DATA_PATH.to_string()
}

/// A model which carries an optimistic concurrency counter.
pub trait Versioned {
    /// The current value of the counter.
    fn version(&self) -> u64;

    /// Set the counter.
    fn set_version(&mut self, version: u64);
}

impl Versioned for DataSource {
    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

impl Versioned for DataSourceNode {
    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

impl Versioned for Application {
    fn version(&self) -> u64 {
        self.revision
    }

    fn set_version(&mut self, version: u64) {
        self.revision = version;
    }
}

/// A node write performed as part of a cluster transaction.
#[derive(Clone, Debug)]
pub enum NodeWrite {
    /// Insert a new node which must not already exist.
    Create(DataSourceNode),
    /// Replace a node, which must still be at the version carried by the given node.
    Update(DataSourceNode),
}

/// An abstraction over the Berth database.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    /// System runtime config.
    #[allow(dead_code)]
    config: Arc<Config>,
    /// The underlying DB handle.
    db: Db,
    data_sources: Tree,
    nodes: Tree,
    apps: Tree,
}

impl Database {
    /// Open the database for usage.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        // Determine the database path, and ensure it exists.
        let dbpath = PathBuf::from(&config.storage_data_path);
        tokio::fs::create_dir_all(&dbpath)
            .await
            .context("error creating dir for berth database")?;

        Self::spawn_blocking(move || -> Result<Self> {
            let db = SledConfig::new().path(dbpath).open()?;
            let data_sources = db.open_tree(IVec::from(TREE_DATA_SOURCES)).context("could not open data sources tree")?;
            let nodes = db.open_tree(IVec::from(TREE_NODES)).context("could not open nodes tree")?;
            let apps = db.open_tree(IVec::from(TREE_APPS)).context("could not open applications tree")?;
            let inner = Arc::new(DatabaseInner {
                config,
                db,
                data_sources,
                nodes,
                apps,
            });
            Ok(Self { inner })
        })
        .await?
    }

    /// Spawn a blocking database-related function, returning a ShutdownError if anything goes
    /// wrong related to spawning & joining.
    #[tracing::instrument(level = "trace", skip(f), err)]
    pub async fn spawn_blocking<F, R>(f: F) -> ShutdownResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|err| ShutdownError::from(anyhow::Error::from(err)))
    }

    /// Flush all pending writes to disk.
    pub async fn flush(&self) -> Result<()> {
        self.inner.db.flush_async().await.context(ERR_DB_FLUSH)?;
        Ok(())
    }

    //////////////////////////////////////////////////////////////////////////
    // Data Sources //////////////////////////////////////////////////////////

    /// Insert a new data source, failing with a conflict if the name is taken.
    pub async fn insert_data_source(&self, ds: &DataSource) -> Result<()> {
        insert_new(&self.inner.data_sources, ds.name.as_bytes(), ds, || format!("data source {} already exists", ds.name))?;
        self.flush().await
    }

    /// Fetch the data source of the given name.
    pub async fn get_data_source(&self, name: &str) -> Result<Option<DataSource>> {
        get_model(&self.inner.data_sources, name.as_bytes())
    }

    /// Fetch the data source of the given name, else fail with a not found error.
    pub async fn must_get_data_source(&self, name: &str) -> Result<DataSource> {
        self.get_data_source(name)
            .await?
            .ok_or_else(|| AppError::ResourceNotFound(format!("data source {} not found", name)).into())
    }

    /// List all data sources.
    pub async fn list_data_sources(&self) -> Result<Vec<DataSource>> {
        scan_models(&self.inner.data_sources, b"")
    }

    /// Replace the given data source, which must still be at the version it carries.
    ///
    /// Returns the stored data source with its bumped version.
    pub async fn update_data_source(&self, ds: DataSource) -> Result<DataSource> {
        let ds = compare_and_swap(&self.inner.data_sources, ds.name.clone().as_bytes(), ds, "data source")?;
        self.flush().await?;
        Ok(ds)
    }

    /// Delete the given data source along with all of its nodes.
    ///
    /// The data source must still be at the version it carries, ensuring that no node is
    /// registered concurrently and left orphaned.
    pub async fn delete_data_source(&self, ds: &DataSource) -> Result<()> {
        let node_keys: Vec<IVec> = self
            .inner
            .nodes
            .scan_prefix(utils::node_prefix(&ds.name))
            .keys()
            .collect::<sled::Result<_>>()
            .context(ERR_ITER_FAILURE)?;
        let res: TransactionResult<(), anyhow::Error> = (&self.inner.data_sources, &self.inner.nodes).transaction(|(ds_tree, node_tree)| {
            check_version::<DataSource>(ds_tree, ds.name.as_bytes(), ds.version, "data source")?;
            ds_tree.remove(ds.name.as_bytes())?;
            for key in node_keys.iter() {
                node_tree.remove(key.clone())?;
            }
            Ok(())
        });
        map_tx_result(res)?;
        self.flush().await
    }

    //////////////////////////////////////////////////////////////////////////
    // Nodes /////////////////////////////////////////////////////////////////

    /// Fetch the node of the given data source & host.
    pub async fn get_node(&self, data_source: &str, host: &str) -> Result<Option<DataSourceNode>> {
        get_model(&self.inner.nodes, utils::node_key(data_source, host).as_bytes())
    }

    /// Fetch the node of the given data source & host, else fail with a not found error.
    pub async fn must_get_node(&self, data_source: &str, host: &str) -> Result<DataSourceNode> {
        self.get_node(data_source, host)
            .await?
            .ok_or_else(|| AppError::ResourceNotFound(format!("node {} of data source {} not found", host, data_source)).into())
    }

    /// List all nodes of the given data source.
    pub async fn list_nodes(&self, data_source: &str) -> Result<Vec<DataSourceNode>> {
        scan_models(&self.inner.nodes, utils::node_prefix(data_source).as_bytes())
    }

    /// Replace the given node, which must still be at the version it carries.
    ///
    /// This does not touch the node's data source, and must therefore never change node roles.
    pub async fn update_node(&self, node: DataSourceNode) -> Result<DataSourceNode> {
        let key = utils::node_key(&node.data_source, &node.host);
        let node = compare_and_swap(&self.inner.nodes, key.as_bytes(), node, "node")?;
        self.flush().await?;
        Ok(node)
    }

    /// Atomically apply the given node writes, guarded by the version of their data source.
    ///
    /// The data source must still be at the version it carries, and its version is bumped as part
    /// of the same transaction. Returns the updated data source & the stored nodes.
    pub async fn commit_cluster_writes(&self, ds: &DataSource, writes: &[NodeWrite]) -> Result<(DataSource, Vec<DataSourceNode>)> {
        let mut next_ds = ds.clone();
        next_ds.version = ds.version + 1;
        let next_ds_bytes = utils::encode_model(&next_ds)?;
        let mut staged = Vec::with_capacity(writes.len());
        for write in writes {
            let (expected, mut node) = match write {
                NodeWrite::Create(node) => (None, node.clone()),
                NodeWrite::Update(node) => (Some(node.version), node.clone()),
            };
            node.version = expected.map(|version| version + 1).unwrap_or(0);
            let key = utils::node_key(&node.data_source, &node.host);
            let bytes = utils::encode_model(&node)?;
            staged.push((key, expected, bytes, node));
        }

        let res: TransactionResult<(), anyhow::Error> = (&self.inner.data_sources, &self.inner.nodes).transaction(|(ds_tree, node_tree)| {
            check_version::<DataSource>(ds_tree, ds.name.as_bytes(), ds.version, "data source")?;
            for (key, expected, bytes, _) in staged.iter() {
                match expected {
                    None => {
                        if node_tree.get(key.as_bytes())?.is_some() {
                            return abort(anyhow::Error::from(AppError::Conflict(format!("node {} already exists", key))));
                        }
                    }
                    Some(version) => check_version::<DataSourceNode>(node_tree, key.as_bytes(), *version, "node")?,
                }
                node_tree.insert(key.as_bytes(), bytes.as_slice())?;
            }
            ds_tree.insert(ds.name.as_bytes(), next_ds_bytes.as_slice())?;
            Ok(())
        });
        map_tx_result(res)?;
        self.flush().await?;
        Ok((next_ds, staged.into_iter().map(|(_, _, _, node)| node).collect()))
    }

    //////////////////////////////////////////////////////////////////////////
    // Applications //////////////////////////////////////////////////////////

    /// Insert a new application, failing with a conflict if the name is taken.
    pub async fn insert_app(&self, app: &Application) -> Result<()> {
        insert_new(&self.inner.apps, app.name.as_bytes(), app, || format!("application {} already exists", app.name))?;
        self.flush().await
    }

    /// Insert or replace the given application record as provided by the app management layer.
    pub async fn put_app(&self, app: &Application) -> Result<()> {
        let bytes = utils::encode_model(app)?;
        self.inner.apps.insert(app.name.as_bytes(), bytes).context("error writing application")?;
        self.flush().await
    }

    /// Fetch the application of the given name.
    pub async fn get_app(&self, name: &str) -> Result<Option<Application>> {
        get_model(&self.inner.apps, name.as_bytes())
    }

    /// Fetch the application of the given name, else fail with a not found error.
    pub async fn must_get_app(&self, name: &str) -> Result<Application> {
        self.get_app(name)
            .await?
            .ok_or_else(|| AppError::ResourceNotFound(format!("application {} not found", name)).into())
    }

    /// List all applications.
    pub async fn list_apps(&self) -> Result<Vec<Application>> {
        scan_models(&self.inner.apps, b"")
    }

    /// Replace the given application, which must still be at the revision it carries.
    pub async fn update_app(&self, app: Application) -> Result<Application> {
        let app = compare_and_swap(&self.inner.apps, app.name.clone().as_bytes(), app, "application")?;
        self.flush().await?;
        Ok(app)
    }
}

/// Fetch & decode the model at the given key.
fn get_model<M: DeserializeOwned>(tree: &Tree, key: &[u8]) -> Result<Option<M>> {
    match tree.get(key).context("error reading from database")? {
        Some(bytes) => Ok(Some(utils::decode_model(&bytes)?)),
        None => Ok(None),
    }
}

/// Decode all models under the given key prefix.
fn scan_models<M: DeserializeOwned>(tree: &Tree, prefix: &[u8]) -> Result<Vec<M>> {
    tree.scan_prefix(prefix)
        .values()
        .map(|res| res.context(ERR_ITER_FAILURE).and_then(|bytes| utils::decode_model(&bytes)))
        .collect()
}

/// Insert a model which must not already exist.
fn insert_new<M: Serialize>(tree: &Tree, key: &[u8], model: &M, conflict: impl FnOnce() -> String) -> Result<()> {
    let bytes = utils::encode_model(model)?;
    tree.compare_and_swap(key, None as Option<&[u8]>, Some(bytes))
        .context("error writing to database")?
        .map_err(|_| AppError::Conflict(conflict()))?;
    Ok(())
}

/// Replace the model at the given key with `next`, bumping its version.
///
/// The stored model must be at the version carried by `next`.
fn compare_and_swap<M>(tree: &Tree, key: &[u8], mut next: M, kind: &str) -> Result<M>
where
    M: Serialize + DeserializeOwned + Versioned,
{
    let current_bytes = tree
        .get(key)
        .context("error reading from database")?
        .ok_or_else(|| AppError::ResourceNotFound(format!("{} {} not found", kind, String::from_utf8_lossy(key))))?;
    let current: M = utils::decode_model(&current_bytes)?;
    if current.version() != next.version() {
        return Err(AppError::Conflict(format!(
            "{} {} was modified concurrently, expected version {} found {}",
            kind,
            String::from_utf8_lossy(key),
            next.version(),
            current.version()
        ))
        .into());
    }
    next.set_version(current.version() + 1);
    let next_bytes = utils::encode_model(&next)?;
    tree.compare_and_swap(key, Some(current_bytes), Some(next_bytes))
        .context("error writing to database")?
        .map_err(|_| AppError::Conflict(format!("{} {} was modified concurrently", kind, String::from_utf8_lossy(key))))?;
    Ok(next)
}

/// Within a transaction, ensure the model at the given key exists at the given version.
fn check_version<M>(tree: &TransactionalTree, key: &[u8], version: u64, kind: &str) -> std::result::Result<(), ConflictableTransactionError<anyhow::Error>>
where
    M: DeserializeOwned + Versioned,
{
    let bytes = match tree.get(key)? {
        Some(bytes) => bytes,
        None => {
            return abort(AppError::ResourceNotFound(format!("{} {} not found", kind, String::from_utf8_lossy(key))).into());
        }
    };
    let model: M = utils::decode_model(&bytes).map_err(ConflictableTransactionError::Abort)?;
    if model.version() != version {
        return abort(
            AppError::Conflict(format!(
                "{} {} was modified concurrently, expected version {} found {}",
                kind,
                String::from_utf8_lossy(key),
                version,
                model.version()
            ))
            .into(),
        );
    }
    Ok(())
}

/// Map the result of a transaction into a standard result.
fn map_tx_result<T>(res: TransactionResult<T, anyhow::Error>) -> Result<T> {
    res.map_err(|err| match err {
        TransactionError::Abort(err) => err,
        TransactionError::Storage(err) => anyhow!(err).context("storage error during database transaction"),
    })
}
