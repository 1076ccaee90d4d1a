use biostata_model::DEFAULT_MIN_RUN_LENGTH;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ProjectConfig {
    /// SQLite busy timeout applied when the connection is opened (default: 5s).
    pub busy_timeout: Duration,
    /// Number of expanded group member lists kept per table (default: 256).
    pub sub_value_cache_capacity: usize,
    /// Shortest run of consecutive ids stored as a range in id filters (default: 4).
    pub id_run_length: usize,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(5),
            sub_value_cache_capacity: 256,
            id_run_length: DEFAULT_MIN_RUN_LENGTH,
        }
    }
}
