//! In-memory directory and file lifecycle core of the encrypted virtual
//! drive.
//!
//! Above this crate sits an OS filesystem driver issuing path-addressed
//! open/read/write/release/rename/delete calls; below it sit the
//! content-addressed chunk store and the structured version chain. The
//! core owns the pieces in between: per-file encryptor sessions with
//! inactivity teardown, in-memory directories with debounced persistence,
//! and the serialize/store/version handshake.

mod config;
mod directory;
mod directory_handler;
mod drive;
mod executor;
mod file_context;
mod meta_data;

#[cfg(test)]
mod drive_tests;

pub use config::*;
pub use directory::*;
pub use directory_handler::*;
pub use drive::*;
pub use executor::*;
pub use file_context::*;
pub use meta_data::*;

use chunk_store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DriveError {
    #[error("no such file: {0}")]
    NoSuchFile(String),
    #[error("file exists: {0}")]
    FileExists(String),
    #[error("parsing error: {0}")]
    ParsingError(String),
    #[error("unknown error: {0}")]
    Unknown(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub type DriveResult<T> = Result<T, DriveError>;
