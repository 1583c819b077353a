//! # bifrost-db
//!
//! Production implementations of the bifrost-core storage traits:
//! - [`PgTableStore`]: key-range tables over PostgreSQL (records, indexes,
//!   logs)
//! - [`RedisHandshakeStore`]: pool-to-worker handshake KV
//! - [`LapinWorkQueue`]: RabbitMQ work and poison queues
//! - [`FsBlobStore`]: execution artifacts on the local filesystem

pub mod blob;
pub mod error;
pub mod handshake;
pub mod queue;
pub mod table;

pub use blob::FsBlobStore;
pub use error::DbError;
pub use handshake::RedisHandshakeStore;
pub use queue::LapinWorkQueue;
pub use table::{PgTableStore, TableName};
