use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Controller configuration with all tuning parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    // Admission
    /// Workers that must complete handshake before the main job is seeded.
    pub min_workers_to_join: usize,

    // Queues
    /// Capacity of the inbound event queue.
    pub event_queue_capacity: usize,
    /// Capacity of each per-worker outbound command channel.
    pub command_queue_capacity: usize,
    /// Capacity of the ready frontier across both bands.
    pub frontier_capacity: usize,

    // Scheduling
    /// Maximum jobs assigned per scheduling pass.
    pub max_assign_batch: usize,
    /// Worker pool size for template expansion and lineage walks.
    pub expansion_workers: usize,

    // Checkpointing
    /// Open a checkpoint every this many frame boundaries; 0 disables.
    pub checkpoint_interval_frames: u64,
    /// Directory for the checkpoint store; in-memory sled when unset.
    pub checkpoint_path: Option<PathBuf>,

    // Caches
    /// Ancestor-closure entries retained before wholesale invalidation.
    pub ancestor_cache_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        let cpu_count = num_cpus::get();

        Self {
            min_workers_to_join: 1,
            event_queue_capacity: 10_000,
            command_queue_capacity: 1_000,
            frontier_capacity: 100_000,
            max_assign_batch: 128,
            expansion_workers: cpu_count.max(2),
            checkpoint_interval_frames: 8,
            checkpoint_path: None,
            ancestor_cache_capacity: 100_000,
        }
    }
}

impl ControllerConfig {
    pub fn builder() -> ControllerConfigBuilder {
        ControllerConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.event_queue_capacity == 0 {
            return Err("event_queue_capacity must be greater than 0".to_string());
        }
        if self.command_queue_capacity == 0 {
            return Err("command_queue_capacity must be greater than 0".to_string());
        }
        if self.frontier_capacity == 0 {
            return Err("frontier_capacity must be greater than 0".to_string());
        }
        if self.max_assign_batch == 0 {
            return Err("max_assign_batch must be greater than 0".to_string());
        }
        if self.expansion_workers == 0 {
            return Err("expansion_workers must be greater than 0".to_string());
        }
        Ok(())
    }

    /// Small queues and a single required worker, for tests and local runs.
    pub fn development() -> Self {
        Self {
            min_workers_to_join: 1,
            event_queue_capacity: 256,
            command_queue_capacity: 64,
            frontier_capacity: 1_024,
            max_assign_batch: 16,
            checkpoint_interval_frames: 2,
            ..Default::default()
        }
    }

    /// Sized for a cluster run of a long simulation.
    pub fn production() -> Self {
        let cpu_count = num_cpus::get();

        Self {
            min_workers_to_join: 4,
            event_queue_capacity: 100_000,
            command_queue_capacity: 10_000,
            frontier_capacity: 1_000_000,
            max_assign_batch: 1_024,
            expansion_workers: cpu_count * 2,
            ..Default::default()
        }
    }
}

/// Builder for ControllerConfig.
pub struct ControllerConfigBuilder {
    config: ControllerConfig,
}

impl ControllerConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ControllerConfig::default(),
        }
    }

    pub fn min_workers_to_join(mut self, n: usize) -> Self {
        self.config.min_workers_to_join = n;
        self
    }

    pub fn event_queue_capacity(mut self, n: usize) -> Self {
        self.config.event_queue_capacity = n;
        self
    }

    pub fn frontier_capacity(mut self, n: usize) -> Self {
        self.config.frontier_capacity = n;
        self
    }

    pub fn max_assign_batch(mut self, n: usize) -> Self {
        self.config.max_assign_batch = n;
        self
    }

    pub fn checkpoint_interval_frames(mut self, n: u64) -> Self {
        self.config.checkpoint_interval_frames = n;
        self
    }

    pub fn checkpoint_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.checkpoint_path = Some(path.into());
        self
    }

    pub fn build(self) -> Result<ControllerConfig, String> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ControllerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(ControllerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_presets_valid() {
        assert!(ControllerConfig::development().validate().is_ok());
        assert!(ControllerConfig::production().validate().is_ok());
        assert!(ControllerConfig::production().min_workers_to_join >= 4);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = ControllerConfig::default();
        config.frontier_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = ControllerConfig::default();
        config.max_assign_batch = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder() {
        let config = ControllerConfig::builder()
            .min_workers_to_join(3)
            .frontier_capacity(500)
            .max_assign_batch(32)
            .checkpoint_interval_frames(4)
            .checkpoint_path("/tmp/millrace-ckpt")
            .build()
            .unwrap();

        assert_eq!(config.min_workers_to_join, 3);
        assert_eq!(config.frontier_capacity, 500);
        assert_eq!(config.max_assign_batch, 32);
        assert!(config.checkpoint_path.is_some());
    }
}
