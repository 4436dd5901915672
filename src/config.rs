use clap::Parser;
use std::path::PathBuf;

/// Visionbench — runs vision-model evaluation jobs against labeled image datasets.
#[derive(Parser, Debug, Clone)]
#[command(name = "visionbench")]
pub struct CliArgs {
    /// Directory holding datasets (one subdirectory per dataset id)
    #[arg(short = 'd', long = "data-dir")]
    pub data_dir: PathBuf,

    /// SQLite database path (defaults to <data-dir>/visionbench.db)
    #[arg(long = "db-path")]
    pub db_path: Option<PathBuf>,

    /// HTTP port
    #[arg(long = "port", default_value_t = DEFAULT_PORT)]
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub port: u16,
}

// Port constants
pub const DEFAULT_PORT: u16 = 9480;

// Prompt chain constants
pub const MAX_PROMPT_STEPS: usize = 5;

// Dispatch constants
pub const DEFAULT_CONCURRENCY: usize = 3;
pub const MAX_CONCURRENCY: usize = 10;
pub const RETRY_MAX_ATTEMPTS: u32 = 3;
// Indexed by failed-attempt number: RETRY_BACKOFF_SECS[n-1] is slept after
// attempt n before attempt n+1.
pub const RETRY_BACKOFF_SECS: [u64; 3] = [1, 2, 4];
pub const ADAPTER_HTTP_TIMEOUT_SECS: u64 = 120;

// A run whose adapter-failure fraction exceeds this at completion is marked
// failed rather than completed.
pub const ADAPTER_FAILURE_ABORT_RATIO: f64 = 0.5;

// Cost estimation constants. Rough per-call token shape for a single-image
// prompt: one downscaled image plus a short instruction in, a short answer out.
pub const ESTIMATE_INPUT_TOKENS_PER_CALL: u64 = 1_100;
pub const ESTIMATE_OUTPUT_TOKENS_PER_CALL: u64 = 120;

// Results paging constants
pub const RESULTS_DEFAULT_LIMIT: i64 = 50;
pub const RESULTS_MAX_LIMIT: i64 = 500;

// Model config defaults
pub const DEFAULT_TEMPERATURE: f64 = 0.0;
pub const DEFAULT_MAX_TOKENS: u32 = 1024;

impl AppConfig {
    pub fn from_args(args: CliArgs) -> Self {
        let db_path = args
            .db_path
            .unwrap_or_else(|| args.data_dir.join("visionbench.db"));

        AppConfig {
            data_dir: args.data_dir,
            db_path,
            port: args.port,
        }
    }

    /// Root directory a dataset id resolves under.
    pub fn dataset_dir(&self, dataset_id: &str) -> PathBuf {
        self.data_dir.join(dataset_id)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn args(data_dir: &str) -> CliArgs {
        CliArgs {
            data_dir: PathBuf::from(data_dir),
            db_path: None,
            port: DEFAULT_PORT,
        }
    }

    #[test]
    fn db_path_defaults_under_data_dir() {
        let config = AppConfig::from_args(args("/tmp/datasets"));
        assert_eq!(config.db_path, PathBuf::from("/tmp/datasets/visionbench.db"));
    }

    #[test]
    fn explicit_db_path_wins() {
        let mut a = args("/tmp/datasets");
        a.db_path = Some(PathBuf::from("/var/lib/vb.db"));
        let config = AppConfig::from_args(a);
        assert_eq!(config.db_path, PathBuf::from("/var/lib/vb.db"));
    }

    #[test]
    fn dataset_dir_joins_id() {
        let config = AppConfig::from_args(args("/tmp/datasets"));
        assert_eq!(
            config.dataset_dir("traffic-lights"),
            PathBuf::from("/tmp/datasets/traffic-lights")
        );
    }

    #[test]
    fn backoff_schedule_covers_every_retryable_attempt() {
        // Every attempt that can be followed by a retry has a delay entry.
        assert!(RETRY_BACKOFF_SECS.len() as u32 >= RETRY_MAX_ATTEMPTS - 1);
    }
}
