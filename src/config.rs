use crate::error::StorageError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Runtime configuration for a shared storage database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedStorageConfig {
    /// Hard quota on `2 * (len(key) + len(value))` summed over an origin.
    pub max_bytes_per_origin: u64,
    pub max_init_tries: usize,
    pub max_iterator_batch_size: usize,
    pub bit_budget: f64,
    pub budget_interval_secs: u64,
    pub staleness_threshold_secs: u64,
    /// SQLite page size in bytes, must be a power of two in [512, 65536].
    pub max_page_size: u32,
    /// SQLite page cache size, in pages.
    pub max_cache_size: u32,
    pub wal_mode: bool,
}

impl Default for SharedStorageConfig {
    fn default() -> Self {
        Self {
            max_bytes_per_origin: 5 * 1024 * 1024,
            max_init_tries: 3,
            max_iterator_batch_size: 100,
            bit_budget: 12.0,
            budget_interval_secs: SECS_PER_DAY,
            staleness_threshold_secs: 30 * SECS_PER_DAY,
            max_page_size: 4096,
            max_cache_size: 1024,
            wal_mode: false,
        }
    }
}

impl SharedStorageConfig {
    /// Small limits that make quota and batching edges cheap to reach.
    pub fn for_testing() -> Self {
        Self {
            max_bytes_per_origin: 100,
            max_iterator_batch_size: 5,
            bit_budget: 10.0,
            ..Self::default()
        }
    }

    pub fn from_json_str(input: &str) -> Result<Self, StorageError> {
        let config: Self = serde_json::from_str(input).map_err(|e| StorageError::InvalidConfig {
            message: format!("malformed config json: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, StorageError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn with_max_bytes_per_origin(mut self, bytes: u64) -> Self {
        self.max_bytes_per_origin = bytes;
        self
    }

    pub fn with_max_iterator_batch_size(mut self, size: usize) -> Self {
        self.max_iterator_batch_size = size;
        self
    }

    pub fn with_bit_budget(mut self, bits: f64) -> Self {
        self.bit_budget = bits;
        self
    }

    /// Stored in whole seconds; a fractional second rounds up.
    pub fn with_budget_interval(mut self, interval: Duration) -> Self {
        self.budget_interval_secs = whole_secs_ceil(interval);
        self
    }

    /// Stored in whole seconds; a fractional second rounds up.
    pub fn with_staleness_threshold(mut self, threshold: Duration) -> Self {
        self.staleness_threshold_secs = whole_secs_ceil(threshold);
        self
    }

    /// Per-key and per-value cap, in UTF-16 code units.
    pub fn max_string_length(&self) -> usize {
        (self.max_bytes_per_origin / 2) as usize
    }

    pub fn budget_interval(&self) -> Duration {
        Duration::from_secs(self.budget_interval_secs)
    }

    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_secs(self.staleness_threshold_secs)
    }

    pub fn validate(&self) -> Result<(), StorageError> {
        if self.max_bytes_per_origin < 2 || self.max_bytes_per_origin > i64::MAX as u64 {
            return Err(StorageError::InvalidConfig {
                message: "max_bytes_per_origin must be >= 2 and fit in i64".into(),
            });
        }
        if self.max_init_tries == 0 {
            return Err(StorageError::InvalidConfig {
                message: "max_init_tries must be > 0".into(),
            });
        }
        if self.max_iterator_batch_size == 0 {
            return Err(StorageError::InvalidConfig {
                message: "max_iterator_batch_size must be > 0".into(),
            });
        }
        if !self.bit_budget.is_finite() || self.bit_budget <= 0.0 {
            return Err(StorageError::InvalidConfig {
                message: "bit_budget must be finite and > 0".into(),
            });
        }
        if self.budget_interval_secs == 0 || self.staleness_threshold_secs == 0 {
            return Err(StorageError::InvalidConfig {
                message: "budget_interval_secs/staleness_threshold_secs must be > 0".into(),
            });
        }
        if !self.max_page_size.is_power_of_two()
            || !(512..=65536).contains(&self.max_page_size)
        {
            return Err(StorageError::InvalidConfig {
                message: "max_page_size must be a power of two in [512, 65536]".into(),
            });
        }
        if self.max_cache_size == 0 {
            return Err(StorageError::InvalidConfig {
                message: "max_cache_size must be > 0".into(),
            });
        }
        Ok(())
    }
}

fn whole_secs_ceil(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}
