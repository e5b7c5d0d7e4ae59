//! The HTTP server.

mod auth;
mod handlers;
pub mod prom;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::routing::{get, patch, put};
use axum::Router;
use jsonwebtoken::DecodingKey;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::platform::Platform;

/// State shared by all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub platform: Platform,
    /// The key used to verify session tokens.
    pub session_key: Arc<DecodingKey>,
    /// The handle of the installed metrics recorder, if any.
    pub metrics: Option<PrometheusHandle>,
}

/// Build the router of the control plane's HTTP API.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/data-sources", get(handlers::list_data_sources).post(handlers::create_data_source))
        .route("/data-sources/:name", patch(handlers::update_data_source).delete(handlers::delete_data_source))
        .route("/data-sources/:name/apps/:app", put(handlers::link_app).delete(handlers::unlink_app))
        .route("/data-sources/:name/nodes", get(handlers::list_nodes).post(handlers::create_node))
        .route("/data-sources/:name/nodes/:host", patch(handlers::patch_node))
        .route("/data-sources/:name/nodes/:host/commands", get(handlers::poll_command))
        .route("/apps/:name", put(handlers::put_app))
        .layer(TraceLayer::new_for_http());
    Router::new()
        .route("/health", get(|| async { StatusCode::OK }))
        .route("/metrics", get(prom::prometheus_scrape))
        .merge(api)
        .with_state(state)
}

/// The HTTP server.
pub struct HttpServer {
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: broadcast::Receiver<()>,

    listener: TcpListener,
    router: Router,
}

impl HttpServer {
    /// Construct a new instance.
    pub async fn new(config: Arc<Config>, platform: Platform, metrics: PrometheusHandle, shutdown: broadcast::Sender<()>) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", config.http_port))
            .await
            .context("error binding socket address for http server")?;
        let state = AppState {
            platform,
            session_key: Arc::new(config.session_decoding_key()),
            metrics: Some(metrics),
        };
        Ok(Self {
            shutdown_rx: shutdown.subscribe(),
            shutdown_tx: shutdown,
            listener,
            router: router(state),
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(self) -> Result<()> {
        let Self {
            shutdown_tx,
            mut shutdown_rx,
            listener,
            router,
        } = self;
        let addr = listener.local_addr().context("error reading http server address")?;
        tracing::info!(%addr, "http server is listening");
        let res = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _res = shutdown_rx.recv().await;
            })
            .await;
        if let Err(err) = res {
            tracing::error!(error = ?err, "error from http server, shutting down");
            let _res = shutdown_tx.send(());
            return Err(err).context("error serving http");
        }
        Ok(())
    }
}
