//! Background workers: the job pool and the retention sweeper.

pub mod cleanup;
pub mod pool;

pub use cleanup::{CleanupConfig, CleanupHandle, CleanupWorker, run_cleanup};
pub use pool::{PoolStats, ShutdownReport, WorkerConfig, WorkerPool, WorkerPoolHandle};
