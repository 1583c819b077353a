//! # bifrost-core
//!
//! The execution pipeline for bifrost:
//! - Unified engine running named workflows, data providers and inline
//!   scripts with log/variable capture and result classification
//! - Process-isolated worker pool with signal-based cancellation and
//!   timeout enforcement
//! - Queue consumer driving the status lifecycle, plus the dispatcher
//!   choosing sync vs. async execution
//! - Record, log and blob repositories over pluggable storage backends
//! - Real-time broadcast events for detail and history views

pub mod broadcast;
pub mod cache;
pub mod capture;
pub mod coerce;
pub mod config;
pub mod context;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod exec;
pub mod logger;
pub mod metrics;
pub mod repository;
pub mod script;
pub mod storage;

pub use broadcast::{Broadcaster, ChannelBroadcaster, ExecutionUpdate, HistoryUpdate, NoopBroadcaster};
pub use cache::ProviderCache;
pub use config::Settings;
pub use context::{Caller, ExecutionContext, Organization};
pub use discovery::{handler_fn, WorkflowHandler, WorkflowRegistry, WorkspaceScanner};
pub use engine::{Engine, ExecutionRequest, ExecutionResult};
pub use error::EngineError;
pub use exec::{
    DispatchContext, Dispatcher, ExecutionBackend, InProcessRunner, PoisonQueueProcessor,
    ProcessPool, ProcessPoolConfig, QueueConsumer,
};
pub use logger::ExecutionLogger;
pub use repository::{ExecutionLogRepository, ExecutionRecorder, ExecutionRepository};
pub use storage::{
    BlobStore, HandshakeStore, MemoryBlobStore, MemoryHandshakeStore, MemoryTableStore,
    MemoryWorkQueue, StorageError, TableStore, WorkQueue,
};
