//! Execution drivers: backends, process pool, worker entry, queue
//! consumer, dispatcher and dead-letter processing.

pub mod cleanup;
pub mod consumer;
pub mod dispatcher;
pub mod poison;
pub mod pool;
pub mod runner;
pub mod worker;

pub use cleanup::{CleanupReport, StuckExecutionSweeper};
pub use consumer::{EmptyConfigSource, QueueConsumer, ScopeConfigSource};
pub use dispatcher::{DispatchContext, Dispatcher, ExecutionResponse};
pub use poison::{PoisonQueueProcessor, POISON_BATCH_LIMIT};
pub use pool::{ProcessPool, ProcessPoolConfig};
pub use runner::{CancelProbe, ExecutionBackend, InProcessRunner, NeverCancelled};
pub use worker::run_worker;
