//! Keyed tables shared by all machines
//!
//! The cache is a keyed BLAKE3 stream over the seed key. Dataset items are
//! derived from the key and eight dependent cache reads each:
//!
//! ```text
//! state = BLAKE3_keyed(key, index)
//! repeat 8: state = BLAKE3_keyed(key, state || cache[state mod blocks])
//! item  = BLAKE3_keyed_xof(key, state)[..64]
//! ```
//!
//! In full memory mode every item is precomputed, otherwise items are derived
//! on demand. Both paths produce identical items.

use std::ops::{Deref, DerefMut, Range};

use tracing::debug;

use super::{ContextError, Flags};
use crate::config::TableSize;

/// Size of a cache block and of a dataset item
pub const ITEM_SIZE: usize = 64;

/// Dependent cache reads per dataset item
const ITEM_CACHE_READS: usize = 8;

/// Large page size used to round mapping lengths
const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

const KEY_CONTEXT: &str = "uhash-service 2024-06 table key";

/// Backing memory for a table
pub(crate) enum TableMemory {
    Heap(Vec<u8>),
    HugePages { map: memmap2::MmapMut, len: usize },
}

impl TableMemory {
    pub(crate) fn allocate(
        table: &'static str,
        len: usize,
        large_pages: bool,
    ) -> Result<Self, ContextError> {
        if large_pages {
            Self::huge_pages(table, len)
        } else {
            Self::heap(table, len)
        }
    }

    fn heap(table: &'static str, len: usize) -> Result<Self, ContextError> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(len)
            .map_err(|_| ContextError::Allocation { table, bytes: len })?;
        buf.resize(len, 0);
        Ok(TableMemory::Heap(buf))
    }

    #[cfg(target_os = "linux")]
    fn huge_pages(table: &'static str, len: usize) -> Result<Self, ContextError> {
        let mapped = len.div_ceil(HUGE_PAGE_SIZE) * HUGE_PAGE_SIZE;
        let map = memmap2::MmapOptions::new()
            .len(mapped)
            .huge(None)
            .map_anon()
            .map_err(|source| ContextError::LargePages {
                table,
                bytes: mapped,
                source,
            })?;
        Ok(TableMemory::HugePages { map, len })
    }

    #[cfg(not(target_os = "linux"))]
    fn huge_pages(table: &'static str, len: usize) -> Result<Self, ContextError> {
        Err(ContextError::LargePages {
            table,
            bytes: len.div_ceil(HUGE_PAGE_SIZE) * HUGE_PAGE_SIZE,
            source: std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "large pages are only supported on Linux",
            ),
        })
    }
}

impl Deref for TableMemory {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            TableMemory::Heap(buf) => buf.as_slice(),
            TableMemory::HugePages { map, len } => &map[..*len],
        }
    }
}

impl DerefMut for TableMemory {
    fn deref_mut(&mut self) -> &mut [u8] {
        match self {
            TableMemory::Heap(buf) => buf.as_mut_slice(),
            TableMemory::HugePages { map, len } => &mut map[..*len],
        }
    }
}

/// Key, cache and optional dataset derived from one seed
pub struct Tables {
    pub(crate) key: [u8; 32],
    cache: TableMemory,
    dataset: Option<TableMemory>,
    items: u64,
}

impl Tables {
    /// Allocate unseeded tables with exactly the given flags
    pub(crate) fn allocate(flags: Flags, size: TableSize) -> Result<Self, ContextError> {
        size.validate()?;
        let large_pages = flags.contains(Flags::LARGE_PAGES);
        let cache = TableMemory::allocate("cache", size.cache_bytes, large_pages)?;
        let dataset = if flags.contains(Flags::FULL_MEM) {
            Some(TableMemory::allocate(
                "dataset",
                size.dataset_bytes(),
                large_pages,
            )?)
        } else {
            None
        };
        Ok(Self::from_parts(cache, dataset, size))
    }

    pub(crate) fn from_parts(
        cache: TableMemory,
        dataset: Option<TableMemory>,
        size: TableSize,
    ) -> Self {
        Self {
            key: [0u8; 32],
            cache,
            dataset,
            items: u64::from(size.dataset_items),
        }
    }

    /// Rekey the cache and, in full memory mode, rebuild the dataset
    pub(crate) fn reseed(&mut self, seed: &[u8], threads: usize) {
        self.key = blake3::derive_key(KEY_CONTEXT, seed);
        blake3::Hasher::new_keyed(&self.key)
            .update(b"cache")
            .finalize_xof()
            .fill(&mut self.cache);

        let Some(dataset) = self.dataset.as_mut() else {
            return;
        };
        let key = &self.key;
        let cache: &[u8] = &self.cache;
        let ranges = partition(self.items, threads);
        debug!(items = self.items, parts = ranges.len(), "initializing dataset");

        std::thread::scope(|scope| {
            let mut rest: &mut [u8] = dataset;
            for range in ranges {
                let bytes = (range.end - range.start) as usize * ITEM_SIZE;
                let (chunk, tail) = std::mem::take(&mut rest).split_at_mut(bytes);
                rest = tail;
                scope.spawn(move || fill_items(key, cache, range.start, chunk));
            }
        });
    }

    /// Number of dataset items
    pub fn items(&self) -> u64 {
        self.items
    }

    /// Whether dataset items are precomputed
    pub fn is_full_memory(&self) -> bool {
        self.dataset.is_some()
    }

    /// Dataset item at `index`, read or derived
    pub fn item(&self, index: u64) -> [u8; ITEM_SIZE] {
        match &self.dataset {
            Some(dataset) => {
                let offset = index as usize * ITEM_SIZE;
                let mut item = [0u8; ITEM_SIZE];
                item.copy_from_slice(&dataset[offset..offset + ITEM_SIZE]);
                item
            }
            None => derive_item(&self.key, &self.cache, index),
        }
    }
}

/// Split `items` into `parts` contiguous ranges, remainder to the last
pub(crate) fn partition(items: u64, parts: usize) -> Vec<Range<u64>> {
    let parts = parts.max(1) as u64;
    let per_part = items / parts;

    (0..parts)
        .map(|i| {
            let start = i * per_part;
            let end = if i + 1 == parts { items } else { start + per_part };
            start..end
        })
        .collect()
}

fn fill_items(key: &[u8; 32], cache: &[u8], first: u64, chunk: &mut [u8]) {
    for (offset, item) in chunk.chunks_exact_mut(ITEM_SIZE).enumerate() {
        item.copy_from_slice(&derive_item(key, cache, first + offset as u64));
    }
}

pub(crate) fn derive_item(key: &[u8; 32], cache: &[u8], index: u64) -> [u8; ITEM_SIZE] {
    let blocks = (cache.len() / ITEM_SIZE) as u64;
    let mut state: [u8; 32] = blake3::keyed_hash(key, &index.to_le_bytes()).into();

    for _ in 0..ITEM_CACHE_READS {
        let offset = (lead_word(&state) % blocks) as usize * ITEM_SIZE;
        state = blake3::Hasher::new_keyed(key)
            .update(&state)
            .update(&cache[offset..offset + ITEM_SIZE])
            .finalize()
            .into();
    }

    let mut item = [0u8; ITEM_SIZE];
    blake3::Hasher::new_keyed(key)
        .update(&state)
        .finalize_xof()
        .fill(&mut item);
    item
}

/// First eight bytes of a state as a little-endian word
pub(crate) fn lead_word(state: &[u8; 32]) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&state[..8]);
    u64::from_le_bytes(word)
}
