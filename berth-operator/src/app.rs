use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::database::Database;
use crate::orchestrator::images::{self, DockerCli};
use crate::orchestrator::KubeOrchestrator;
use crate::platform::Platform;
use crate::server::HttpServer;

/// The application object for when Berth is running as a server.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,
    db: Database,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the HTTP server.
    server: JoinHandle<Result<()>>,
    /// The join handle of the startup reconciliation pass.
    reconcile: JoinHandle<()>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>, metrics: PrometheusHandle) -> Result<Self> {
        // App shutdown channel.
        let (shutdown_tx, shutdown_rx) = broadcast::channel(10);

        if config.build_datasource_images {
            let tags = images::make_datasource_images(&DockerCli::new(), &config)
                .await
                .context("error building data source images")?;
            tracing::info!(?tags, "data source images published");
        }

        // Initialize K8s client & storage.
        let client = kube::Client::try_default().await.context("error initializing K8s client")?;
        let orchestrator = Arc::new(KubeOrchestrator::new(client, config.clone()));
        let db = Database::new(config.clone()).await.context("error opening database")?;
        let platform = Platform::new(config.clone(), db.clone(), orchestrator);

        // Spawn various core tasks.
        let server = HttpServer::new(config.clone(), platform.clone(), metrics, shutdown_tx.clone())
            .await
            .context("error setting up http server")?
            .spawn();
        let reconcile = tokio::spawn(async move {
            if let Err(err) = platform.reconcile_all().await {
                tracing::error!(error = ?err, "error during startup reconciliation");
            }
        });

        Ok(Self {
            _config: config,
            db,
            shutdown_rx: BroadcastStream::new(shutdown_rx),
            shutdown_tx,
            server,
            reconcile,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("Berth operator is shutting down");
        self.reconcile.abort();
        if let Err(err) = self.server.await.context("error joining http server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down http server");
        }
        if let Err(err) = self.db.flush().await {
            tracing::error!(error = ?err, "error flushing database on shutdown");
        }

        tracing::debug!("Berth operator shutdown complete");
        Ok(())
    }
}
