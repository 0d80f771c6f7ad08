//! Local sample storage
//!
//! ## Design
//!
//! - **Trait-based**: `SampleSink` is all the fan-out loop needs; `StorageBackend`
//!   adds the read side for rules and the API
//! - **Async**: All operations are async for compatibility with Tokio tasks
//!
//! ## Backends
//!
//! - **SQLite** (default): Embedded database, persistent across restarts
//! - **In-Memory**: Bounded per-series ring buffers, no persistence

pub mod backend;
pub mod error;
pub mod memory;
pub mod retention;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;

use std::sync::Arc;

use tracing::info;

pub use backend::{HealthStatus, SampleSink, Selector, StorageBackend, StorageStats};
pub use error::{StorageError, StorageResult};

use crate::config::StorageConfig;

/// Open the configured backend
///
/// Failing here is fatal: nothing else has been started yet.
pub async fn open(config: &StorageConfig) -> StorageResult<Arc<dyn StorageBackend>> {
    match config {
        StorageConfig::Memory {
            max_samples_per_series,
        } => {
            info!("using in-memory storage ({max_samples_per_series} samples per series)");
            Ok(Arc::new(memory::MemoryBackend::with_capacity(
                *max_samples_per_series,
            )))
        }

        #[cfg(feature = "storage-sqlite")]
        StorageConfig::Sqlite { path } => Ok(Arc::new(sqlite::SqliteBackend::new(path).await?)),

        #[cfg(not(feature = "storage-sqlite"))]
        StorageConfig::Sqlite { .. } => Err(StorageError::InvalidConfig(
            "sqlite backend requires the storage-sqlite feature".to_string(),
        )),
    }
}
