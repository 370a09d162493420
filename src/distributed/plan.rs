use std::ops::Range;

use crate::config::TrainingConfig;
use crate::error::{Error, Result};

/// Splits `total` rows among `devices` and returns the contiguous range for `device`.
///
/// Ranges are disjoint, cover `0..total` in order, and differ in size by at most one.
pub fn shard_range(total: usize, device: usize, devices: usize) -> Range<usize> {
    let base = total / devices;
    let rem = total % devices;

    let start = device * base + device.min(rem);
    let extra = usize::from(device < rem);
    start..start + base + extra
}

/// How a global batch is split across logical devices.
///
/// Trainable parameters and optimizer moments are replicated: every device
/// reads the same copy, and only the combined gradient is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardPlan {
    device_count: usize,
    per_device_batch: usize,
}

impl ShardPlan {
    pub fn new(device_count: usize, per_device_batch: usize) -> Result<Self> {
        if device_count == 0 {
            return Err(Error::DeviceAllocation {
                requested: device_count,
                reason: "at least one device is required".to_string(),
            });
        }
        if per_device_batch == 0 {
            return Err(Error::Config(
                "per-device batch size must be positive".to_string(),
            ));
        }
        Ok(Self {
            device_count,
            per_device_batch,
        })
    }

    pub fn single_device(batch_size: usize) -> Result<Self> {
        Self::new(1, batch_size)
    }

    pub fn from_config(config: &TrainingConfig) -> Result<Self> {
        Self::new(config.resolved_device_count(), config.per_device_batch_size)
    }

    pub fn device_count(&self) -> usize {
        self.device_count
    }

    pub fn per_device_batch(&self) -> usize {
        self.per_device_batch
    }

    /// `per_device_batch * device_count`
    pub fn global_batch_size(&self) -> usize {
        self.per_device_batch * self.device_count
    }

    pub fn shard(&self, total: usize, device: usize) -> Range<usize> {
        shard_range(total, device, self.device_count)
    }

    /// One range per device, in device order. Short batches leave the last
    /// devices with empty ranges.
    pub fn shards(&self, total: usize) -> Vec<Range<usize>> {
        (0..self.device_count)
            .map(|device| self.shard(total, device))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_range_balanced() {
        assert_eq!(shard_range(10, 0, 3), 0..4);
        assert_eq!(shard_range(10, 1, 3), 4..7);
        assert_eq!(shard_range(10, 2, 3), 7..10);
    }

    #[test]
    fn test_shards_cover_batch() {
        let plan = ShardPlan::new(4, 2).unwrap();
        assert_eq!(plan.global_batch_size(), 8);
        assert_eq!(plan.shards(8), vec![0..2, 2..4, 4..6, 6..8]);
    }

    #[test]
    fn test_short_batch_leaves_empty_shards() {
        let plan = ShardPlan::new(4, 1).unwrap();
        assert_eq!(plan.shards(2), vec![0..1, 1..2, 2..2, 2..2]);
    }

    #[test]
    fn test_zero_devices() {
        assert!(matches!(
            ShardPlan::new(0, 8),
            Err(Error::DeviceAllocation { requested: 0, .. })
        ));
        assert!(matches!(ShardPlan::new(2, 0), Err(Error::Config(_))));
    }
}
