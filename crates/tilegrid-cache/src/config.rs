use std::env;
use std::path::PathBuf;
use thiserror::Error;

/// Default memory budget: 512 MiB.
pub const DEFAULT_MEMORY_BUDGET: usize = 512 * 1024 * 1024;
/// Default reserve margin: 8 MiB.
pub const DEFAULT_RESERVE: usize = 8 * 1024 * 1024;
pub const DEFAULT_MAX_RECLAIM_ATTEMPTS: u32 = 8;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}")]
    InvalidValue { var: &'static str, value: String },

    #[error("reserve of {reserve} bytes does not fit in a budget of {budget} bytes")]
    ReserveExceedsBudget { reserve: usize, budget: usize },
}

/// Memory manager configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Root directory; each grid persists its chunks under `<cache_dir>/<name>`
    pub cache_dir: PathBuf,
    /// Bytes of chunk storage allowed to be resident at once
    pub memory_budget_bytes: usize,
    /// Headroom re-established after every eviction
    pub reserve_bytes: usize,
    /// Reclaim cycles one operation may go through before giving up
    pub max_reclaim_attempts: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            cache_dir: env::temp_dir().join("tilegrid"),
            memory_budget_bytes: DEFAULT_MEMORY_BUDGET,
            reserve_bytes: DEFAULT_RESERVE,
            max_reclaim_attempts: DEFAULT_MAX_RECLAIM_ATTEMPTS,
        }
    }
}

impl ManagerConfig {
    /// Load configuration from environment variables
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let cache_dir = env::var("TILEGRID_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.cache_dir);
        let memory_budget_bytes =
            parse_var("TILEGRID_MEMORY_BUDGET", defaults.memory_budget_bytes)?;
        let reserve_bytes = parse_var("TILEGRID_RESERVE_BYTES", defaults.reserve_bytes)?;
        let max_reclaim_attempts =
            parse_var("TILEGRID_MAX_RECLAIM_ATTEMPTS", defaults.max_reclaim_attempts)?;

        Self {
            cache_dir,
            memory_budget_bytes,
            reserve_bytes,
            max_reclaim_attempts,
        }
        .validated()
    }

    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = cache_dir.into();
        self
    }

    pub fn with_memory_budget(mut self, bytes: usize) -> Self {
        self.memory_budget_bytes = bytes;
        self
    }

    pub fn with_reserve(mut self, bytes: usize) -> Self {
        self.reserve_bytes = bytes;
        self
    }

    pub fn with_max_reclaim_attempts(mut self, attempts: u32) -> Self {
        self.max_reclaim_attempts = attempts;
        self
    }

    pub fn validated(self) -> Result<Self, ConfigError> {
        if self.reserve_bytes >= self.memory_budget_bytes {
            return Err(ConfigError::ReserveExceedsBudget {
                reserve: self.reserve_bytes,
                budget: self.memory_budget_bytes,
            });
        }
        Ok(self)
    }
}

fn parse_var<V: std::str::FromStr>(var: &'static str, default: V) -> Result<V, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { var, value }),
        Err(_) => Ok(default),
    }
}
