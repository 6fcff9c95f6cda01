use std::env;
use std::time::Duration;

/// Subscription tier, which bounds how many runtime connections the pool
/// may hold at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionTier {
    Free,
    Pro,
    /// Explicitly configured ceiling for accounts on nonstandard plans.
    Custom(usize),
}

impl SubscriptionTier {
    pub fn connection_limit(self) -> usize {
        match self {
            SubscriptionTier::Free => 1,
            SubscriptionTier::Pro => 5,
            SubscriptionTier::Custom(limit) => limit.max(1),
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "free" => Some(SubscriptionTier::Free),
            "pro" => Some(SubscriptionTier::Pro),
            _ => trimmed.parse::<usize>().ok().map(SubscriptionTier::Custom),
        }
    }
}

/// Cumulus application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Control-plane base URL (defaults to the public service endpoint)
    pub api_base: String,
    /// Bearer token for control-plane calls; acquisition happens elsewhere
    pub auth_token: Option<String>,
    pub tier: SubscriptionTier,
    /// Notebook path bound to newly created kernel sessions
    pub notebook_path: String,
    /// Kernel type name requested for new sessions
    pub kernel_name: String,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub keep_alive_interval: Duration,
    pub health_check_interval: Duration,
    pub execute_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_base: env::var("CUMULUS_API_BASE").unwrap_or(defaults.api_base),
            auth_token: env::var("CUMULUS_TOKEN").ok().filter(|t| !t.trim().is_empty()),
            tier: env::var("CUMULUS_TIER")
                .ok()
                .and_then(|raw| SubscriptionTier::parse(&raw))
                .unwrap_or(defaults.tier),
            notebook_path: env::var("CUMULUS_NOTEBOOK_PATH").unwrap_or(defaults.notebook_path),
            kernel_name: env::var("CUMULUS_KERNEL_NAME").unwrap_or(defaults.kernel_name),
            max_reconnect_attempts: env_u64("CUMULUS_MAX_RECONNECT_ATTEMPTS")
                .map(|n| n as u32)
                .unwrap_or(defaults.max_reconnect_attempts),
            reconnect_base_delay: env_u64("CUMULUS_RECONNECT_BASE_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.reconnect_base_delay),
            keep_alive_interval: env_u64("CUMULUS_KEEP_ALIVE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.keep_alive_interval),
            health_check_interval: env_u64("CUMULUS_HEALTH_CHECK_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.health_check_interval),
            execute_timeout: env_u64("CUMULUS_EXECUTE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.execute_timeout),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base: "https://runtime.cumulus.dev".to_string(),
            auth_token: None,
            tier: SubscriptionTier::Free,
            notebook_path: "Untitled.ipynb".to_string(),
            kernel_name: "python3".to_string(),
            max_reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_secs(1),
            keep_alive_interval: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(30),
            execute_timeout: Duration::from_millis(300_000),
        }
    }
}

fn env_u64(var: &str) -> Option<u64> {
    env::var(var).ok().and_then(|raw| raw.trim().parse().ok())
}
