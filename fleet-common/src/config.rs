/// Process-wide configuration, loaded once from the environment at startup
/// the way `inventiv-orchestrator`'s `main.rs` reads `DATABASE_URL` /
/// `REDIS_URL` directly — no config file, no layered sources.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub database_url: String,
    pub redis_url: String,
    pub regions: Vec<String>,
    pub spot_poll_interval_secs: u64,
    pub termination_poll_interval_secs: u64,
    pub ami_poll_interval_secs: u64,
    pub housekeeper_interval_secs: u64,
    pub max_iteration_time_secs: u64,
    pub max_consecutive_failures: u32,
    pub event_ingestor_concurrency: usize,
    pub cloud_call_timeout_secs: u64,
    pub http_bind_addr: String,
    /// `<prefix>` half of the `<prefix>:<workerType>:<hash>` key-name
    /// convention the housekeeper filters `describeInstances` by.
    pub key_prefix: String,
    /// Identity stamped into the `Owner`/`WorkerType` tags the tagger writes.
    pub manager_id: String,
    pub max_instance_life_hours: i64,
}

impl FleetConfig {
    pub fn from_env() -> Result<Self, String> {
        let database_url = env_required("DATABASE_URL")?;
        let redis_url = env_required("REDIS_URL")?;
        let regions = env_opt("FLEET_REGIONS")
            .unwrap_or_else(|| "us-east-1".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            database_url,
            redis_url,
            regions,
            spot_poll_interval_secs: env_u64("SPOT_POLL_INTERVAL_SECS", 30),
            termination_poll_interval_secs: env_u64("TERMINATION_POLL_INTERVAL_SECS", 30),
            ami_poll_interval_secs: env_u64("AMI_POLL_INTERVAL_SECS", 300),
            housekeeper_interval_secs: env_u64("HOUSEKEEPER_INTERVAL_SECS", 600),
            max_iteration_time_secs: env_u64("MAX_ITERATION_TIME_SECS", 120),
            max_consecutive_failures: env_u64("MAX_CONSECUTIVE_FAILURES", 5) as u32,
            event_ingestor_concurrency: env_u64("EVENT_INGESTOR_CONCURRENCY", 10) as usize,
            cloud_call_timeout_secs: env_u64("CLOUD_CALL_TIMEOUT_SECS", 20),
            http_bind_addr: env_opt("HTTP_BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            key_prefix: env_opt("FLEET_KEY_PREFIX").unwrap_or_else(|| "fleet".to_string()),
            manager_id: env_opt("FLEET_MANAGER_ID").unwrap_or_else(|| "fleet-manager".to_string()),
            max_instance_life_hours: env_u64("MAX_INSTANCE_LIFE_HOURS", 96) as i64,
        })
    }
}

fn env_required(key: &str) -> Result<String, String> {
    std::env::var(key).map_err(|_| format!("{key} must be set"))
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_opt(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
