//! Server configuration.

use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "genflow-server", about = "Generation pipeline orchestrator")]
pub struct ServerConfig {
    /// HTTP listen address
    #[arg(long, env = "GENFLOW_LISTEN_ADDR", default_value = "127.0.0.1:8080")]
    pub listen_addr: String,

    /// SQLite database path (omit for an in-memory database)
    #[arg(long, env = "GENFLOW_DB_PATH")]
    pub db_path: Option<String>,

    /// HMAC secret used to sign and verify bearer credentials
    #[arg(long, env = "GENFLOW_AUTH_SECRET", default_value = "", hide_env_values = true)]
    pub auth_secret: String,

    /// Wall-clock budget for one pipeline run, measured from the claim
    #[arg(long, env = "GENFLOW_PIPELINE_BUDGET_SECS", default_value_t = 300)]
    pub pipeline_budget_secs: u64,

    /// Interval between record polls for non-claiming stream connections
    #[arg(long, env = "GENFLOW_POLL_INTERVAL_MS", default_value_t = 2000)]
    pub poll_interval_ms: u64,

    /// Emit heartbeat events while a polling connection waits
    #[arg(long, env = "GENFLOW_HEARTBEAT", default_value_t = true, action = clap::ArgAction::Set)]
    pub heartbeat: bool,

    /// Maximum generations per persona inside the rate window
    #[arg(long, env = "GENFLOW_RATE_LIMIT", default_value_t = 30)]
    pub rate_limit: u32,

    /// Sliding rate window
    #[arg(long, env = "GENFLOW_RATE_WINDOW_SECS", default_value_t = 3600)]
    pub rate_window_secs: u64,

    /// Re-claim `processing` records whose claim is older than this.
    /// 0 disables re-claiming: a crashed runner leaves its record stranded.
    #[arg(long, env = "GENFLOW_CLAIM_LEASE_SECS", default_value_t = 0)]
    pub claim_lease_secs: u64,

    /// Lifetime of one-time stream tickets
    #[arg(long, env = "GENFLOW_TICKET_TTL_SECS", default_value_t = 60)]
    pub ticket_ttl_secs: u64,

    /// Anthropic API key; without it the offline stage backends are used
    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    pub anthropic_api_key: Option<String>,

    /// Model used by the enhance and generate stages
    #[arg(long, env = "GENFLOW_MODEL", default_value = "claude-sonnet-4-20250514")]
    pub model: String,

    /// Minimum quality score a draft needs to pass quality-check
    #[arg(long, env = "GENFLOW_MIN_QUALITY", default_value_t = 0.3)]
    pub min_quality: f64,

    /// Terms that make the moderate stage reject content
    #[arg(long, env = "GENFLOW_BLOCKED_TERMS", value_delimiter = ',')]
    pub blocked_terms: Vec<String>,

    /// Terms that make the moderate stage flag content for review
    #[arg(long, env = "GENFLOW_REVIEW_TERMS", value_delimiter = ',')]
    pub review_terms: Vec<String>,
}

impl ServerConfig {
    pub fn pipeline_budget(&self) -> Duration {
        Duration::from_secs(self.pipeline_budget_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// `None` when leases are disabled.
    pub fn claim_lease(&self) -> Option<Duration> {
        (self.claim_lease_secs > 0).then(|| Duration::from_secs(self.claim_lease_secs))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            db_path: None,
            auth_secret: String::new(),
            pipeline_budget_secs: 300,
            poll_interval_ms: 2000,
            heartbeat: true,
            rate_limit: 30,
            rate_window_secs: 3600,
            claim_lease_secs: 0,
            ticket_ttl_secs: 60,
            anthropic_api_key: None,
            model: "claude-sonnet-4-20250514".to_string(),
            min_quality: 0.3,
            blocked_terms: Vec::new(),
            review_terms: Vec::new(),
        }
    }
}
