//! Repositories over the key-range table stores.

pub mod execution_logs;
pub mod executions;
pub mod recorder;

pub use execution_logs::ExecutionLogRepository;
pub use executions::{ExecutionPatch, ExecutionRepository};
pub use recorder::{ExecutionOutcome, ExecutionRecorder, BLOB_THRESHOLD_BYTES};
