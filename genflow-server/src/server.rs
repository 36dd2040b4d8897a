//! Server assembly: shared state, background tasks and the HTTP listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::auth::{Authenticator, TicketStore};
use crate::config::ServerConfig;
use crate::db::Db;
use crate::llm::LlmClient;
use crate::model::now_secs;
use crate::pipeline::{Pipeline, StageExecutor};
use crate::rate::RateGate;
use crate::stages::{StageSettings, default_stages};
use crate::stream::{StreamAdapter, StreamSettings};

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Shared state accessible by all request handlers.
pub struct SharedState {
    pub config: ServerConfig,
    pub db: Arc<Db>,
    pub auth: Authenticator,
    /// One-time stream tickets, keyed by ticket string.
    pub tickets: TicketStore,
    pub rate_gate: RateGate,
    pub streams: Arc<StreamAdapter>,
    pub started_at: Instant,
}

pub struct Server {
    config: ServerConfig,
    stages: Option<[Arc<dyn StageExecutor>; 7]>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config, stages: None }
    }

    /// Replace the default stage executors (for testing or embedding).
    pub fn with_stages(mut self, stages: [Arc<dyn StageExecutor>; 7]) -> Self {
        self.stages = Some(stages);
        self
    }

    /// Build SharedState, opening the database and wiring the pipeline.
    fn build_state(self) -> Result<Arc<SharedState>> {
        let config = self.config;
        let db = match &config.db_path {
            Some(path) => {
                tracing::info!("Opening database: {path}");
                Db::open(path).with_context(|| format!("Failed to open database {path}"))?
            }
            None => {
                tracing::info!("No database path given, using in-memory store");
                Db::open_memory().context("Failed to open in-memory database")?
            }
        };
        let db = Arc::new(db);
        report_stranded(&db, &config)?;

        if config.auth_secret.is_empty() {
            tracing::warn!("No auth secret configured; every authenticated request will be refused");
        }

        let stages = match self.stages {
            Some(stages) => stages,
            None => {
                let llm = config.anthropic_api_key.as_ref().map(|key| {
                    tracing::info!(model = %config.model, "LLM-backed stages enabled");
                    Arc::new(LlmClient::new(key.clone()).with_model(&config.model))
                });
                if llm.is_none() {
                    tracing::info!("No API key, using offline stage backends");
                }
                default_stages(Arc::clone(&db), llm, StageSettings::from_config(&config))
            }
        };
        let pipeline = Arc::new(Pipeline::new(stages, config.pipeline_budget()));
        let streams = Arc::new(StreamAdapter::new(
            Arc::clone(&db),
            pipeline,
            StreamSettings {
                poll_interval: config.poll_interval(),
                heartbeat: config.heartbeat,
                lease: config.claim_lease(),
            },
        ));

        Ok(Arc::new(SharedState {
            auth: Authenticator::new(&config.auth_secret),
            tickets: TicketStore::new(Duration::from_secs(config.ticket_ttl_secs)),
            rate_gate: RateGate::new(config.rate_limit, Duration::from_secs(config.rate_window_secs)),
            streams,
            db,
            config,
            started_at: Instant::now(),
        }))
    }

    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.listen_addr))?;
        tracing::info!("HTTP listener on {}", listener.local_addr()?);
        let state = self.build_state()?;
        serve(listener, state).await
    }

    /// Start the server on the configured address and return the bound
    /// address. Used by tests with `127.0.0.1:0`.
    pub async fn start(self) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        let addr = listener.local_addr()?;
        tracing::info!("Listening on {addr}");

        let state = self.build_state()?;
        let handle = tokio::spawn(serve(listener, state));
        Ok((addr, handle))
    }
}

async fn serve(listener: TcpListener, state: Arc<SharedState>) -> Result<()> {
    spawn_sweeper(Arc::clone(&state));
    let router = crate::web::router(state);
    axum::serve(listener, router).await.context("HTTP server error")
}

/// Periodically evict expired stream tickets.
fn spawn_sweeper(state: Arc<SharedState>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.tick().await; // skip first immediate tick
        loop {
            interval.tick().await;
            let removed = state.tickets.sweep();
            if removed > 0 {
                tracing::debug!(removed, remaining = state.tickets.len(), "Swept expired stream tickets");
            }
        }
    });
}

/// Log `processing` records left behind by an earlier process.
fn report_stranded(db: &Db, config: &ServerConfig) -> Result<()> {
    let counts = db.state_counts().context("Failed to count generations")?;
    if counts.processing == 0 {
        return Ok(());
    }
    match config.claim_lease() {
        Some(lease) => {
            let stale = db
                .count_stale_processing(now_secs() - lease.as_secs() as i64)
                .context("Failed to count stale claims")?;
            tracing::warn!(
                processing = counts.processing,
                past_lease = stale,
                "Found in-flight generations at boot; expired claims are re-claimed on the next attach"
            );
        }
        None => {
            tracing::warn!(
                processing = counts.processing,
                "Found in-flight generations at boot; without a claim lease they stay in processing"
            );
        }
    }
    Ok(())
}
