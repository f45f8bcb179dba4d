//! Service configuration
//!
//! Everything the service reads at startup. The CLI fills this in; library
//! users and tests build it directly.

use serde::{Deserialize, Serialize};

use crate::context::{ContextError, Flags, ITEM_SIZE};

/// Default listen host
pub const DEFAULT_HOST: &str = "localhost";

/// Default listen port
pub const DEFAULT_PORT: u16 = 39093;

/// Default cache size (2 MiB)
pub const DEFAULT_CACHE_BYTES: usize = 2 * 1024 * 1024;

/// Default number of dataset items (256 MiB of 64-byte items)
pub const DEFAULT_DATASET_ITEMS: u32 = 1 << 22;

/// Sizes of the keyed tables backing the computation context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSize {
    /// Cache size in bytes, a non-zero multiple of 64
    pub cache_bytes: usize,
    /// Number of 64-byte dataset items
    pub dataset_items: u32,
}

impl TableSize {
    /// Dataset size in bytes
    pub fn dataset_bytes(&self) -> usize {
        self.dataset_items as usize * ITEM_SIZE
    }

    pub fn validate(&self) -> Result<(), ContextError> {
        if self.cache_bytes == 0 || self.cache_bytes % ITEM_SIZE != 0 {
            return Err(ContextError::InvalidTableSize(format!(
                "cache size {} is not a non-zero multiple of {}",
                self.cache_bytes, ITEM_SIZE
            )));
        }
        if self.dataset_items == 0 {
            return Err(ContextError::InvalidTableSize(
                "dataset must hold at least one item".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for TableSize {
    fn default() -> Self {
        Self {
            cache_bytes: DEFAULT_CACHE_BYTES,
            dataset_items: DEFAULT_DATASET_ITEMS,
        }
    }
}

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Listen host
    pub host: String,
    /// Listen port
    pub port: u16,
    /// Number of worker threads
    pub threads: usize,
    /// Context flags, or `None` to probe with fallback
    pub flags: Option<Flags>,
    /// Browser origin allowed by CORS
    pub origin: Option<String>,
    /// Log every HTTP request
    pub log_requests: bool,
    /// Table sizes
    pub tables: TableSize,
}

impl ServiceConfig {
    /// `host:port` string to bind
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            threads: num_cpus::get(),
            flags: None,
            origin: None,
            log_requests: false,
            tables: TableSize::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.bind_address(), "localhost:39093");
        assert!(config.threads >= 1);
        assert!(config.flags.is_none());
        assert_eq!(config.tables.dataset_bytes(), 256 * 1024 * 1024);
        assert!(config.tables.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ServiceConfig =
            serde_json::from_str(r#"{"port": 8080, "flags": 1, "origin": "https://a.example"}"#)
                .unwrap();
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.port, 8080);
        assert_eq!(config.flags, Some(Flags::FULL_MEM));
        assert_eq!(config.origin.as_deref(), Some("https://a.example"));
        assert_eq!(config.tables, TableSize::default());
    }

    #[test]
    fn test_table_size_validation() {
        let odd_cache = TableSize {
            cache_bytes: 100,
            dataset_items: 16,
        };
        assert!(odd_cache.validate().is_err());

        let no_items = TableSize {
            cache_bytes: 4096,
            dataset_items: 0,
        };
        assert!(no_items.validate().is_err());
    }
}
