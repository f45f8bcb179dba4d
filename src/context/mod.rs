//! Computation context
//!
//! A [`ContextFactory`] owns the keyed tables derived from the active seed and
//! hands out [`Machine`]s, one per worker. Each machine carries its own
//! UniversalHash scratchpads and a shared reference to the tables.
//!
//! A hash is computed in two stages:
//!
//! 1. `state = UniversalHash(key || input)`
//! 2. sixteen dependent dataset reads folded into `state` with keyed BLAKE3
//!
//! The stages are independent across inputs, so a batch runs stage two of one
//! input alongside stage one of the next.

mod tables;


use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uhash_core::UniversalHash;

use crate::codec::Hash;
use crate::config::TableSize;

pub use tables::{Tables, ITEM_SIZE};
use tables::{lead_word, TableMemory};

/// Dataset reads per hash
const DATASET_READS: u32 = 16;

/// Context errors
#[derive(Error, Debug)]
pub enum ContextError {
    #[error("failed to allocate {bytes} bytes for the {table}")]
    Allocation { table: &'static str, bytes: usize },

    #[error("failed to map {bytes} bytes of large pages for the {table}: {source}")]
    LargePages {
        table: &'static str,
        bytes: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid table size: {0}")]
    InvalidTableSize(String),

    #[error("machine is detached from its tables")]
    Detached,

    #[error("no pipelined hash is pending")]
    PipelineIdle,
}

/// Context flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Flags(u32);

impl Flags {
    pub const NONE: Flags = Flags(0);
    /// Precompute the full dataset
    pub const FULL_MEM: Flags = Flags(1);
    /// Back tables with large pages
    pub const LARGE_PAGES: Flags = Flags(2);
    /// Starting point of automatic selection
    pub const AUTO: Flags = Flags(1 | 2);

    const ALL: u32 = 1 | 2;

    /// Flags from raw bits, unknown bits are dropped
    pub const fn from_bits(bits: u32) -> Self {
        Flags(bits & Self::ALL)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn remove(&mut self, other: Flags) {
        self.0 &= !other.0;
    }

    /// Names of the set flags
    pub fn names(self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.contains(Flags::FULL_MEM) {
            names.push("full_mem");
        }
        if self.contains(Flags::LARGE_PAGES) {
            names.push("large_pages");
        }
        names
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self.names();
        if names.is_empty() {
            write!(f, "light")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// Owner of the shared tables
pub struct ContextFactory {
    flags: Flags,
    size: TableSize,
    tables: Arc<Tables>,
}

impl ContextFactory {
    /// Allocate tables with the given flags
    ///
    /// With `None`, large pages and full memory mode are tried first and
    /// dropped one step at a time when allocation fails. Explicit flags are
    /// used as given and any failure is returned.
    pub fn new(flags: Option<Flags>, size: TableSize) -> Result<Self, ContextError> {
        let (tables, flags) = match flags {
            Some(flags) => (Tables::allocate(flags, size)?, flags),
            None => allocate_with_fallback(size)?,
        };
        debug!(%flags, cache = size.cache_bytes, items = size.dataset_items, "context allocated");

        Ok(Self {
            flags,
            size,
            tables: Arc::new(tables),
        })
    }

    /// Flags in effect after allocation
    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn size(&self) -> TableSize {
        self.size
    }

    /// Shared reference to the current tables
    pub fn tables(&self) -> Arc<Tables> {
        Arc::clone(&self.tables)
    }

    /// Create a machine bound to the current tables
    pub fn create_machine(&self) -> Machine {
        Machine {
            hasher: UniversalHash::new(),
            tables: Some(self.tables()),
            pending: None,
        }
    }

    /// Rederive the tables from `seed`
    ///
    /// Tables are rewritten in place when no machine still holds them,
    /// otherwise a fresh set is allocated. `threads` bounds the dataset
    /// initialization parallelism.
    pub fn reseed(&mut self, seed: &[u8], threads: usize) -> Result<(), ContextError> {
        match Arc::get_mut(&mut self.tables) {
            Some(tables) => tables.reseed(seed, threads),
            None => {
                warn!("tables still referenced during reseed, allocating a fresh set");
                let mut tables = Tables::allocate(self.flags, self.size)?;
                tables.reseed(seed, threads);
                self.tables = Arc::new(tables);
            }
        }
        Ok(())
    }
}

fn allocate_with_fallback(size: TableSize) -> Result<(Tables, Flags), ContextError> {
    size.validate()?;
    let mut flags = Flags::AUTO;

    let cache = match TableMemory::allocate("cache", size.cache_bytes, true) {
        Ok(cache) => cache,
        Err(e) => {
            warn!(error = %e, "large pages unavailable for the cache");
            flags.remove(Flags::LARGE_PAGES);
            TableMemory::allocate("cache", size.cache_bytes, false)?
        }
    };

    let mut dataset = None;
    if flags.contains(Flags::LARGE_PAGES) {
        match TableMemory::allocate("dataset", size.dataset_bytes(), true) {
            Ok(memory) => dataset = Some(memory),
            Err(e) => {
                warn!(error = %e, "large pages unavailable for the dataset");
                flags.remove(Flags::LARGE_PAGES);
            }
        }
    }
    if dataset.is_none() {
        match TableMemory::allocate("dataset", size.dataset_bytes(), false) {
            Ok(memory) => dataset = Some(memory),
            Err(e) => {
                warn!(error = %e, "full memory mode unavailable, deriving items on demand");
                flags.remove(Flags::FULL_MEM);
            }
        }
    }

    Ok((Tables::from_parts(cache, dataset, size), flags))
}

/// Per-worker hashing state
pub struct Machine {
    hasher: UniversalHash,
    tables: Option<Arc<Tables>>,
    pending: Option<[u8; 32]>,
}

impl Machine {
    /// Rebind to freshly seeded tables
    pub fn refresh(&mut self, tables: Arc<Tables>) {
        self.tables = Some(tables);
        self.pending = None;
    }

    /// Drop the reference to the tables
    pub fn release(&mut self) {
        self.tables = None;
        self.pending = None;
    }

    pub fn is_attached(&self) -> bool {
        self.tables.is_some()
    }

    /// Hash one input
    pub fn hash(&mut self, input: &[u8]) -> Result<Hash, ContextError> {
        let tables = self.tables.as_deref().ok_or(ContextError::Detached)?;
        let state = prepare(&mut self.hasher, tables, input);
        Ok(finish(tables, state))
    }

    /// Start a pipelined sequence with its first input
    pub fn hash_first(&mut self, input: &[u8]) -> Result<(), ContextError> {
        let tables = self.tables.as_deref().ok_or(ContextError::Detached)?;
        self.pending = Some(prepare(&mut self.hasher, tables, input));
        Ok(())
    }

    /// Finish the pending input while starting the next one
    pub fn hash_next(&mut self, input: &[u8]) -> Result<Hash, ContextError> {
        let tables = self.tables.as_deref().ok_or(ContextError::Detached)?;
        let pending = self.pending.take().ok_or(ContextError::PipelineIdle)?;
        let hasher = &mut self.hasher;

        let (hash, next) = rayon::join(
            || finish(tables, pending),
            || prepare(hasher, tables, input),
        );
        self.pending = Some(next);
        Ok(hash)
    }

    /// Finish the pending input
    pub fn hash_last(&mut self) -> Result<Hash, ContextError> {
        let tables = self.tables.as_deref().ok_or(ContextError::Detached)?;
        let pending = self.pending.take().ok_or(ContextError::PipelineIdle)?;
        Ok(finish(tables, pending))
    }

    /// Hash every input in order through the pipeline
    pub fn hash_batch<T: AsRef<[u8]>>(&mut self, inputs: &[T]) -> Result<Vec<Hash>, ContextError> {
        let Some((first, rest)) = inputs.split_first() else {
            return Ok(Vec::new());
        };

        let mut hashes = Vec::with_capacity(inputs.len());
        self.hash_first(first.as_ref())?;
        for input in rest {
            hashes.push(self.hash_next(input.as_ref())?);
        }
        hashes.push(self.hash_last()?);
        Ok(hashes)
    }
}

fn prepare(hasher: &mut UniversalHash, tables: &Tables, input: &[u8]) -> [u8; 32] {
    let mut keyed = Vec::with_capacity(tables.key.len() + input.len());
    keyed.extend_from_slice(&tables.key);
    keyed.extend_from_slice(input);
    hasher.hash(&keyed)
}

fn finish(tables: &Tables, mut state: [u8; 32]) -> Hash {
    for round in 0..DATASET_READS {
        let item = tables.item(lead_word(&state) % tables.items());
        state = blake3::Hasher::new_keyed(&tables.key)
            .update(&state)
            .update(&item)
            .update(&round.to_le_bytes())
            .finalize()
            .into();
    }
    state
}
