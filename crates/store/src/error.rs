//! Error type for the `store` crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("attempt is not open")]
    NotOpen,

    #[error("attempt already closed")]
    AlreadyClosed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
