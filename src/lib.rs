//! UniversalHash Hashing Service
//!
//! Computes UniversalHash proof-of-work hashes for remote callers over HTTP.
//!
//! # Overview
//!
//! A pool of worker threads shares one set of keyed tables derived from a
//! caller-supplied seed. Each worker owns a hashing machine and takes jobs
//! from a FIFO queue. Replacing the seed drains the pool, rekeys the tables
//! and rebinds every machine before hashing resumes.
//!
//! # Features
//!
//! - **Exclusive reseed**: no hash dispatched after a reseed sees stale keys
//! - **Pipelined batches**: stage two of one input overlaps stage one of the next
//! - **Light or full memory**: items derived on demand or precomputed, same results
//! - **Hex or binary wire format**: selected per request by media type
//!
//! # Example
//!
//! ```rust,no_run
//! use uhash_service::{ContextFactory, Flags, TableSize};
//!
//! let mut factory = ContextFactory::new(Some(Flags::NONE), TableSize::default())?;
//! factory.reseed(b"epoch seed", 4)?;
//!
//! let mut machine = factory.create_machine();
//! let hash = machine.hash(b"miner input")?;
//! assert_eq!(hash.len(), 32);
//! # Ok::<(), uhash_service::ContextError>(())
//! ```

// Re-export the core algorithm
pub use uhash_core as algorithm;

pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod http;
pub mod pool;
pub mod service;

// Convenience re-exports
pub use codec::{Encoding, Framing, Hash, HASH_SIZE};
pub use config::{ServiceConfig, TableSize};
pub use context::{ContextError, ContextFactory, Flags, Machine};
pub use error::ServiceError;
pub use pool::{Job, WorkerPool};
pub use service::{Service, ServiceState, StatusReport};
