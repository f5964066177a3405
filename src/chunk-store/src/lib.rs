//! Content-addressed chunk storage and the structured version chain.
//!
//! A chunk is an immutable blob named by the hash of its bytes. Stores only
//! ever see finished chunks; partially written data never gets a name.

mod chunk;
mod store;
mod version_db;

pub use chunk::*;
pub use store::*;
pub use version_db::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("chunk not found: {0}")]
    NotFound(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("db error: {0}")]
    DbError(String),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
