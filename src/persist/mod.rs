//! Durable journaling of committed scheduling ops.

/// SQLite journal and relation tables.
pub mod sqlite;

use crate::{op::StoredOp, types::OpSeq};

/// Failures of the durable layer.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// SQLite reported an error.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// A payload could not be encoded or decoded.
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    /// Anything else, including inconsistent durable state.
    #[error("{0}")]
    Message(String),
}

impl From<crate::core::store::StoreError> for PersistError {
    fn from(value: crate::core::store::StoreError) -> Self {
        Self::Message(format!("store error: {value}"))
    }
}

/// Result alias for the durable layer.
pub type PersistResult<T> = Result<T, PersistError>;

/// Destination for committed ops, written in sequence order.
pub trait OpSink: Send {
    /// Persists `ops` atomically and returns the highest durable sequence.
    fn append_ops(&mut self, ops: &[StoredOp]) -> PersistResult<OpSeq>;
    /// Pushes buffered writes to stable storage.
    fn flush(&mut self) -> PersistResult<()> {
        Ok(())
    }
}
