//! HTTP surface of the retrosynthesis service.
//!
//! Uploads are `multipart/form-data` with a `data` part holding the JSON
//! parameters and one part per input table. Successful runs answer with the
//! produced table or archive; failures answer with the status code of their
//! tag and a JSON body carrying the diagnostic.

mod error;
mod handlers;
mod upload;

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use retro_jobs::{JobTracker, PipelineTracker};
use retro_pipeline::PipelineCoordinator;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub use error::ApiError;
pub use upload::{Upload, PATHWAYS_PART, RULES_PART, SINK_PART};

pub const APP_NAME: &str = "retrosynthesis";

/// Rule tables can be large; uploads above this are rejected.
pub const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

/// Listener and worker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Workers pulling from the job queue.
    pub workers: usize,
    /// Interval of the server-side poll loop behind `?wait=true`.
    pub poll_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8888,
            workers: 1,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Shared state behind every route.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: PipelineCoordinator,
    pub jobs: PipelineTracker,
    pub poll_interval: Duration,
}

impl AppState {
    /// Must be called inside a tokio runtime; starts the job workers.
    pub fn new(coordinator: PipelineCoordinator, config: &ServerConfig) -> Self {
        let jobs = JobTracker::start(coordinator.clone(), config.workers);
        Self {
            coordinator,
            jobs,
            poll_interval: config.poll_interval,
        }
    }
}

/// JSON envelope shared by all JSON answers.
pub fn stamp(status: &str, data: Value) -> Value {
    json!({
        "app": APP_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "time": chrono::Utc::now().to_rfc3339(),
        "status": status,
        "data": data,
    })
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::stamp).post(handlers::stamp))
        .route("/api", get(handlers::stamp).post(handlers::stamp))
        .route("/retrorules", post(handlers::retrorules))
        .route("/retropath2", post(handlers::retropath2))
        .route("/rp2paths", post(handlers::rp2paths))
        .route("/pipeline", post(handlers::pipeline))
        .route("/submitjob", post(handlers::submit_job))
        .route("/jobs/:id", get(handlers::poll_job))
        .route("/jobs/:id/result", get(handlers::job_result))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

/// Bind and serve until the listener fails.
pub async fn serve(config: &ServerConfig, state: AppState) -> retro_types::Result<()> {
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let addr: SocketAddr = listener.local_addr()?;
    tracing::info!(%addr, workers = config.workers, "listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
