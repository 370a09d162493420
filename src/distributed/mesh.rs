use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use super::ShardPlan;
use crate::error::{Error, Result};

/// A fixed set of logical compute devices, one worker thread each.
///
/// Built once at startup from a [`ShardPlan`] and passed to whatever needs it.
pub struct DeviceMesh {
    pool: ThreadPool,
    devices: usize,
}

impl DeviceMesh {
    pub fn new(plan: &ShardPlan) -> Result<Self> {
        let devices = plan.device_count();
        let pool = ThreadPoolBuilder::new()
            .num_threads(devices)
            .thread_name(|i| format!("device-{}", i))
            .build()
            .map_err(|e| Error::DeviceAllocation {
                requested: devices,
                reason: e.to_string(),
            })?;

        tracing::debug!(devices, "Device mesh ready");
        Ok(Self { pool, devices })
    }

    pub fn device_count(&self) -> usize {
        self.devices
    }

    /// Runs `f` once per device and blocks until every device has finished.
    /// Results are in device order.
    pub fn run<T, F>(&self, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(usize) -> T + Sync + Send,
    {
        self.pool
            .install(|| (0..self.devices).into_par_iter().map(f).collect())
    }
}

impl std::fmt::Debug for DeviceMesh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMesh")
            .field("devices", &self.devices)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_returns_device_order() {
        let mesh = DeviceMesh::new(&ShardPlan::new(3, 1).unwrap()).unwrap();
        assert_eq!(mesh.device_count(), 3);
        assert_eq!(mesh.run(|device| device * 10), vec![0, 10, 20]);
    }
}
