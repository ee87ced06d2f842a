use crate::error::{Result, StrataError};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Hard upper bound on extra worker threads
pub const MAX_WORKER_THREADS: usize = 7;

/// Scheduler and streaming settings, usually read from a JSON file.
/// Every field has a default so partial files are accepted.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    /// Map width in columns (x)
    pub map_size_x: i32,
    /// Map depth in columns (z)
    pub map_size_z: i32,
    pub slabs_per_column: usize,
    /// Region edge length in columns
    pub region_size: i32,
    pub queue_capacity: usize,
    /// Free slots kept in reserve before backpressure starts
    pub queue_margin: usize,
    pub worker_threads: usize,
    pub scan_batch_size: usize,
    pub idle_sleep_ms: u64,
    pub pause_timeout_ms: u64,
    pub blocking_stall_timeout_ms: u64,
    pub store_flush_every: usize,
    pub terrain_retry_limit: u32,
    /// Regenerate corrupt columns instead of halting
    pub repair_mode: bool,
    pub min_free_disk_bytes: u64,
    /// Cached metadata entries tolerated before untracked ones are dropped
    pub cache_trim_threshold: usize,
    pub tick_interval_ms: u64,
    pub view_radius: i32,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        StreamerConfig {
            map_size_x: 1024,
            map_size_z: 1024,
            slabs_per_column: 8,
            region_size: 16,
            queue_capacity: 2048,
            queue_margin: 16,
            worker_threads: 2,
            scan_batch_size: 32,
            idle_sleep_ms: 5,
            pause_timeout_ms: 2000,
            blocking_stall_timeout_ms: 12_000,
            store_flush_every: 256,
            terrain_retry_limit: 3,
            repair_mode: false,
            min_free_disk_bytes: 64 * 1024 * 1024,
            cache_trim_threshold: 4096,
            tick_interval_ms: 50,
            view_radius: 4,
        }
    }
}

impl StreamerConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: StreamerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.map_size_x <= 0 || self.map_size_z <= 0 {
            return Err(StrataError::Config("map size must be positive".to_string()));
        }
        if self.slabs_per_column == 0 {
            return Err(StrataError::Config(
                "slabs_per_column must be at least 1".to_string(),
            ));
        }
        if self.region_size <= 0 {
            return Err(StrataError::Config("region_size must be positive".to_string()));
        }
        if self.queue_capacity == 0 || self.queue_margin >= self.queue_capacity {
            return Err(StrataError::Config(format!(
                "queue_margin ({}) must be smaller than queue_capacity ({})",
                self.queue_margin, self.queue_capacity
            )));
        }
        if self.worker_threads > MAX_WORKER_THREADS {
            return Err(StrataError::Config(format!(
                "worker_threads must be at most {}",
                MAX_WORKER_THREADS
            )));
        }
        if self.scan_batch_size == 0 || self.store_flush_every == 0 {
            return Err(StrataError::Config(
                "scan_batch_size and store_flush_every must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    pub fn pause_timeout(&self) -> Duration {
        Duration::from_millis(self.pause_timeout_ms)
    }

    pub fn blocking_stall_timeout(&self) -> Duration {
        Duration::from_millis(self.blocking_stall_timeout_ms)
    }
}
