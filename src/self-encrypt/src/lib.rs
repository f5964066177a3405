//! Streaming convergent-encryption codec between plaintext file ranges and
//! content-addressed chunk blobs.

mod data_map;
mod encryptor;

pub use data_map::*;
pub use encryptor::*;

use chunk_store::StoreError;
use thiserror::Error;

/// Plaintext bytes per encrypted chunk.
pub const CHUNK_PLAIN_SIZE: u64 = 256 * 1024;

#[derive(Error, Debug)]
pub enum EncryptError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("crypto error: {0}")]
    Crypto(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
}

pub type EncryptResult<T> = Result<T, EncryptError>;
