use std::path::PathBuf;
use std::time::Duration;

use arbor_types::HistoryConfig;

const DEFAULT_RUN_TTL_SEC: u64 = 3600;
const DEFAULT_TOOL_POOL: usize = 16;
const DEFAULT_ACTION_RETRIES: u32 = 2;

/// Engine configuration resolved from the environment once at startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub workspace_root: PathBuf,
    pub logs_dir: PathBuf,
    /// Terminal runs older than this are evicted by the sweeper.
    pub run_ttl: Duration,
    pub sweep_interval: Duration,
    /// Upper bound on concurrent tool executions across all runs.
    pub max_concurrent_tools: usize,
    /// Per-action retry ceiling for a run.
    pub max_retries: u32,
    pub default_history: HistoryConfig,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let workspace_root = std::env::var("WORKSPACE_ROOT")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("workspace"));
        let logs_dir = std::env::var("ARBOR_LOGS_DIR")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("logs"));
        let run_ttl = parsed_env("RUN_TTL_SEC").unwrap_or(DEFAULT_RUN_TTL_SEC);
        let pool = parsed_env("TOOL_POOL_SIZE").unwrap_or(DEFAULT_TOOL_POOL as u64);

        Self {
            workspace_root,
            logs_dir,
            run_ttl: Duration::from_secs(run_ttl),
            sweep_interval: Duration::from_secs(60),
            max_concurrent_tools: (pool as usize).max(1),
            max_retries: DEFAULT_ACTION_RETRIES,
            default_history: HistoryConfig::default(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("workspace"),
            logs_dir: PathBuf::from("logs"),
            run_ttl: Duration::from_secs(DEFAULT_RUN_TTL_SEC),
            sweep_interval: Duration::from_secs(60),
            max_concurrent_tools: DEFAULT_TOOL_POOL,
            max_retries: DEFAULT_ACTION_RETRIES,
            default_history: HistoryConfig::default(),
        }
    }
}

fn parsed_env(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse().ok()
}
