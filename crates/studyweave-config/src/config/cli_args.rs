use std::path::PathBuf;

/// Command-line overrides. Every `Some` wins over the file and the defaults.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub config_path: Option<PathBuf>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub call_limit: Option<u64>,
    pub cache_dir: Option<String>,
    pub no_cache: bool,
    pub max_concurrent_calls: Option<usize>,
    pub run_deadline_secs: Option<u64>,
}
