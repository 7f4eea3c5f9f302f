use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u16(profile: &str, key: &str, default: u16) -> u16 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_bool(profile: &str, key: &str, default: bool) -> bool {
    profiled_env_opt(profile, key)
        .and_then(|v| parse_bool(&v))
        .unwrap_or(default)
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// `"true"`/`"false"` select reserved-only / non-reserved jobs; anything else means all.
pub fn parse_reserved_filter(raw: Option<&str>) -> Option<bool> {
    raw.and_then(parse_bool)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub control_plane: ControlPlaneConfig,
    pub postgres: PostgresConfig,
    pub aws: AwsConfig,
    pub blob_storage: BlobStorageConfig,
    pub sync: SyncConfig,
    pub etl: EtlConfig,
    pub agent: AgentSettings,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `SLUICE_PROFILE` env var. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("SLUICE_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            control_plane: ControlPlaneConfig::from_env_profiled(p),
            postgres: PostgresConfig::from_env_profiled(p),
            aws: AwsConfig::from_env_profiled(p),
            blob_storage: BlobStorageConfig::from_env_profiled(p),
            sync: SyncConfig::from_env_profiled(p),
            etl: EtlConfig::from_env_profiled(p),
            agent: AgentSettings::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  control_plane: url={}", self.control_plane.url);
        tracing::info!("  postgres:      host={}, db={}", self.postgres.host, self.postgres.database);
        tracing::info!("  blob_storage:  backend={}, prefix={}", self.blob_storage.backend, self.blob_storage.prefix);
        tracing::info!(
            "  sync:          interval={}s, type_whitelist={}, integration_whitelist={}",
            self.sync.interval_secs,
            self.sync.trigger_type_whitelist_enabled,
            self.sync.integration_whitelist_enabled
        );
        tracing::info!("  etl:           worker_id={}, batch_size={}", self.etl.worker_id, self.etl.progress_detail_batch_size);
        tracing::info!(
            "  agent:         id={}, interval={}s, scheduling={}",
            self.agent.agent_id,
            self.agent.scheduling_interval_secs,
            self.agent.scheduling_enabled
        );
    }
}

// ── Control plane ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    pub url: String,
    pub request_timeout_secs: u64,
}

impl ControlPlaneConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            url: profiled_env_or(p, "CONTROL_PLANE_URL", "http://localhost:8081"),
            request_timeout_secs: profiled_env_u64(p, "CONTROL_PLANE_TIMEOUT_SECS", 30),
        }
    }
}

// ── PostgreSQL ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssl_mode: String,
    pub max_connections: u32,
}

impl PostgresConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            host: profiled_env_or(p, "PG_HOST", "localhost"),
            port: profiled_env_u16(p, "PG_PORT", 5432),
            database: profiled_env_or(p, "PG_DATABASE", "sluice"),
            username: profiled_env_opt(p, "PG_USERNAME"),
            password: profiled_env_opt(p, "PG_PASSWORD"),
            ssl_mode: profiled_env_or(p, "PG_SSL_MODE", "prefer"),
            max_connections: profiled_env_u32(p, "PG_MAX_CONNECTIONS", 10),
        }
    }

    pub fn connection_string(&self) -> String {
        let user = self.username.as_deref().unwrap_or("postgres");
        let pass = self.password.as_deref().unwrap_or("");
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            user, pass, self.host, self.port, self.database, self.ssl_mode
        )
    }

    pub fn is_configured(&self) -> bool {
        self.username.is_some()
    }
}

// ── AWS / S3 ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsConfig {
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    pub s3_bucket: Option<String>,
    pub endpoint_url: Option<String>,
}

impl AwsConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            region: profiled_env_or(p, "AWS_REGION", "us-east-1"),
            access_key_id: profiled_env_opt(p, "AWS_ACCESS_KEY_ID"),
            secret_access_key: profiled_env_opt(p, "AWS_SECRET_ACCESS_KEY"),
            session_token: profiled_env_opt(p, "AWS_SESSION_TOKEN"),
            s3_bucket: profiled_env_opt(p, "S3_BUCKET"),
            endpoint_url: profiled_env_opt(p, "AWS_ENDPOINT_URL"),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.access_key_id.is_some() && self.s3_bucket.is_some()
    }
}

// ── Payload blob storage ──────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobStorageConfig {
    /// "local", "s3" or "memory".
    pub backend: String,
    pub data_dir: PathBuf,
    /// Key prefix for every payload object.
    pub prefix: String,
}

impl BlobStorageConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            backend: profiled_env_or(p, "BLOB_BACKEND", "local"),
            data_dir: PathBuf::from(profiled_env_or(p, "BLOB_DATA_DIR", "data/payloads")),
            prefix: profiled_env_or(p, "BLOB_PREFIX", "payloads"),
        }
    }
}

// ── Trigger synchronization ───────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Comma-separated integration types allowed onto the schedule.
    pub trigger_type_whitelist: String,
    pub trigger_type_whitelist_enabled: bool,
    /// Comma-separated `tenant::integration` pairs.
    pub integration_whitelist: String,
    pub integration_whitelist_enabled: bool,
    pub interval_secs: u64,
}

impl SyncConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            trigger_type_whitelist: profiled_env_or(p, "SYNC_TRIGGER_TYPE_WHITELIST", ""),
            trigger_type_whitelist_enabled: profiled_env_bool(p, "SYNC_TRIGGER_TYPE_WHITELIST_ENABLED", false),
            integration_whitelist: profiled_env_or(p, "SYNC_INTEGRATION_WHITELIST", ""),
            integration_whitelist_enabled: profiled_env_bool(p, "SYNC_INTEGRATION_WHITELIST_ENABLED", false),
            interval_secs: profiled_env_u64(p, "SYNC_INTERVAL_SECS", 300),
        }
    }
}

// ── ETL worker ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtlConfig {
    pub worker_id: String,
    pub poll_interval_secs: u64,
    pub max_jobs_per_poll: usize,
    pub progress_detail_batch_size: usize,
    pub heartbeat_interval_secs: u64,
    /// A `pending` instance whose heartbeat is older than this is reclaimed.
    pub stale_heartbeat_secs: u64,
}

impl EtlConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            worker_id: profiled_env_opt(p, "ETL_WORKER_ID")
                .unwrap_or_else(|| format!("etl-worker-{}", uuid::Uuid::new_v4())),
            poll_interval_secs: profiled_env_u64(p, "ETL_POLL_INTERVAL_SECS", 10),
            max_jobs_per_poll: profiled_env_u32(p, "ETL_MAX_JOBS_PER_POLL", 5) as usize,
            progress_detail_batch_size: profiled_env_u32(p, "ETL_PROGRESS_BATCH_SIZE", 10) as usize,
            heartbeat_interval_secs: profiled_env_u64(p, "ETL_HEARTBEAT_INTERVAL_SECS", 30),
            stale_heartbeat_secs: profiled_env_u64(p, "ETL_STALE_HEARTBEAT_SECS", 600),
        }
    }
}

// ── Ingestion agent ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    pub agent_id: String,
    pub agent_type: String,
    pub version: String,
    /// Fixed tenant scope for dedicated agents.
    pub tenant_id: Option<String>,
    /// Fixed integration scope for dedicated agents.
    pub integration_ids: Vec<String>,
    pub auto_clear_jobs: bool,
    pub scheduling_enabled: bool,
    pub scheduling_interval_secs: u64,
    pub warmup_delay_secs: u64,
    /// `None` = all jobs, `Some(true)` = reserved only, `Some(false)` = non-reserved only.
    pub reserved_jobs: Option<bool>,
    pub max_concurrent_jobs: usize,
    pub max_submissions_per_sec: u32,
    pub rate_limit_backoff_ms: u64,
}

impl AgentSettings {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            agent_id: profiled_env_opt(p, "AGENT_ID")
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            agent_type: profiled_env_or(p, "AGENT_TYPE", "ingestion"),
            version: profiled_env_or(p, "AGENT_VERSION", env!("CARGO_PKG_VERSION")),
            tenant_id: profiled_env_opt(p, "AGENT_TENANT_ID"),
            integration_ids: profiled_env_opt(p, "AGENT_INTEGRATION_IDS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            auto_clear_jobs: profiled_env_bool(p, "AGENT_AUTO_CLEAR_JOBS", true),
            scheduling_enabled: profiled_env_bool(p, "AGENT_SCHEDULING_ENABLED", true),
            scheduling_interval_secs: profiled_env_u64(p, "AGENT_SCHEDULING_INTERVAL_SECS", 60),
            warmup_delay_secs: profiled_env_u64(p, "AGENT_WARMUP_DELAY_SECS", 5),
            reserved_jobs: parse_reserved_filter(profiled_env_opt(p, "AGENT_RESERVED_JOBS").as_deref()),
            max_concurrent_jobs: profiled_env_u32(p, "AGENT_MAX_CONCURRENT_JOBS", 4) as usize,
            max_submissions_per_sec: profiled_env_u32(p, "AGENT_MAX_SUBMISSIONS_PER_SEC", 10),
            rate_limit_backoff_ms: profiled_env_u64(p, "AGENT_RATE_LIMIT_BACKOFF_MS", 1000),
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            agent_id: uuid::Uuid::new_v4().to_string(),
            agent_type: "ingestion".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            tenant_id: None,
            integration_ids: Vec::new(),
            auto_clear_jobs: true,
            scheduling_enabled: true,
            scheduling_interval_secs: 60,
            warmup_delay_secs: 5,
            reserved_jobs: None,
            max_concurrent_jobs: 4,
            max_submissions_per_sec: 10,
            rate_limit_backoff_ms: 1000,
        }
    }
}
