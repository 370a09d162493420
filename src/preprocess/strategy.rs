use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::config::{PreprocessConfig, StrategyKind};
use crate::error::{Error, Result};

/// How independent rows are mapped over CPU workers.
///
/// Every strategy returns results in input order; none of them changes what a
/// row produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStrategy {
    /// On the calling thread.
    Sequential,
    /// On rayon's global pool, or a dedicated pool of `workers` threads.
    WorkerPool { workers: usize },
    /// On a dedicated pool isolated from the rest of the process.
    ProcessPool { workers: usize },
}

impl ExecutionStrategy {
    pub fn from_config(config: &PreprocessConfig) -> Self {
        match config.strategy {
            StrategyKind::Sequential => ExecutionStrategy::Sequential,
            StrategyKind::WorkerPool => ExecutionStrategy::WorkerPool {
                workers: config.workers,
            },
            StrategyKind::ProcessPool => ExecutionStrategy::ProcessPool {
                workers: config.workers,
            },
        }
    }

    pub fn map<T, U, F>(&self, items: &[T], f: F) -> Result<Vec<U>>
    where
        T: Sync,
        U: Send,
        F: Fn(&T) -> U + Sync + Send,
    {
        match *self {
            ExecutionStrategy::Sequential => Ok(items.iter().map(f).collect()),
            ExecutionStrategy::WorkerPool { workers: 0 } => Ok(items.par_iter().map(f).collect()),
            ExecutionStrategy::WorkerPool { workers } | ExecutionStrategy::ProcessPool { workers } => {
                let pool = dedicated_pool(workers)?;
                Ok(pool.install(|| items.par_iter().map(f).collect()))
            }
        }
    }
}

fn dedicated_pool(workers: usize) -> Result<ThreadPool> {
    ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("preprocess-{}", i))
        .build()
        .map_err(|e| Error::Config(format!("cannot start preprocessing workers: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategies_agree() {
        let items: Vec<u64> = (0..257).collect();
        let square = |x: &u64| x * x;

        let expected = ExecutionStrategy::Sequential.map(&items, square).unwrap();
        for strategy in [
            ExecutionStrategy::WorkerPool { workers: 0 },
            ExecutionStrategy::WorkerPool { workers: 3 },
            ExecutionStrategy::ProcessPool { workers: 2 },
        ] {
            assert_eq!(strategy.map(&items, square).unwrap(), expected);
        }
    }
}
