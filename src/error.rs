//! Service error types

use thiserror::Error;

use crate::codec::CodecError;
use crate::context::ContextError;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("seed is {0} bytes, limit is 60")]
    SeedTooLarge(usize),

    #[error("no seed has been set")]
    NotSeeded,

    #[error("fingerprint mismatch: expected {expected}, active {active}")]
    FingerprintMismatch { expected: String, active: String },

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("worker pool is shut down")]
    PoolClosed,

    #[error("failed to start worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ServiceError>;
