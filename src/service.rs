//! Service state and the async front of the worker pool

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::info;

use crate::codec::{Hash, MAX_SEED_SIZE};
use crate::config::ServiceConfig;
use crate::context::{ContextFactory, Flags};
use crate::error::{Result, ServiceError};
use crate::pool::{Job, WorkerPool};

/// Public identifier of a seed
///
/// Lowercase hex of the BLAKE3 digest, so the seed cannot be recovered from it.
pub fn fingerprint(seed: &[u8]) -> String {
    hex::encode(blake3::hash(seed).as_bytes())
}

/// State shared by the workers and the HTTP handlers
#[derive(Debug)]
pub struct ServiceState {
    threads: usize,
    flags: Flags,
    fingerprint: RwLock<Option<String>>,
    hashes: AtomicU64,
    origin: RwLock<Option<String>>,
    log_requests: AtomicBool,
}

impl ServiceState {
    pub fn new(threads: usize, flags: Flags, origin: Option<String>, log_requests: bool) -> Self {
        Self {
            threads,
            flags,
            fingerprint: RwLock::new(None),
            hashes: AtomicU64::new(0),
            origin: RwLock::new(origin),
            log_requests: AtomicBool::new(log_requests),
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Effective context flags
    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// Whether a seed has been set
    pub fn is_initialized(&self) -> bool {
        self.fingerprint
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(ServiceError::NotSeeded)
        }
    }

    /// Fingerprint of the active seed
    pub fn fingerprint(&self) -> Option<String> {
        self.fingerprint
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_seed(&self, seed: &[u8]) {
        *self.fingerprint.write().unwrap_or_else(PoisonError::into_inner) = Some(fingerprint(seed));
    }

    /// Fail when `expected` is present and differs from the active fingerprint
    pub fn check_fingerprint(&self, expected: Option<&str>) -> Result<()> {
        let Some(expected) = expected else {
            return Ok(());
        };
        match self.fingerprint() {
            Some(active) if expected.to_ascii_lowercase() == active => Ok(()),
            active => Err(ServiceError::FingerprintMismatch {
                expected: expected.to_string(),
                active: active.unwrap_or_default(),
            }),
        }
    }

    /// Number of hashes computed since startup
    pub fn hashes(&self) -> u64 {
        self.hashes.load(Ordering::Relaxed)
    }

    pub(crate) fn count_hashes(&self, count: u64) {
        self.hashes.fetch_add(count, Ordering::Relaxed);
    }

    pub fn origin(&self) -> Option<String> {
        self.origin
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_origin(&self, origin: Option<String>) {
        *self.origin.write().unwrap_or_else(PoisonError::into_inner) = origin;
    }

    /// Whether CORS access is granted to `origin`
    pub fn allows_origin(&self, origin: &str) -> bool {
        self.origin
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_deref()
            .is_some_and(|allowed| allowed == origin)
    }

    pub fn log_requests(&self) -> bool {
        self.log_requests.load(Ordering::Relaxed)
    }

    pub fn set_log_requests(&self, enabled: bool) {
        self.log_requests.store(enabled, Ordering::Relaxed);
    }

    /// Snapshot for the info endpoint
    pub fn status(&self) -> StatusReport {
        StatusReport {
            service: concat!("v", env!("CARGO_PKG_VERSION")).to_string(),
            algorithm: format!("uhash/v{}", uhash_core::VERSION),
            threads: self.threads,
            flags: self.flags.names().into_iter().map(str::to_string).collect(),
            fingerprint: self.fingerprint(),
            hashes: self.hashes(),
        }
    }
}

/// Service status as reported by `GET /info`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Service version
    pub service: String,
    /// Hash algorithm identifier
    pub algorithm: String,
    pub threads: usize,
    /// Effective context flags
    pub flags: Vec<String>,
    /// Fingerprint of the active seed
    pub fingerprint: Option<String>,
    pub hashes: u64,
}

/// Hashing service
///
/// Owns the worker pool; every operation is a job completed by one worker.
pub struct Service {
    state: Arc<ServiceState>,
    pool: WorkerPool,
}

impl Service {
    /// Allocate the context and start the workers
    pub fn new(config: &ServiceConfig) -> Result<Self> {
        let threads = config.threads.max(1);
        let factory = ContextFactory::new(config.flags, config.tables)?;
        let state = Arc::new(ServiceState::new(
            threads,
            factory.flags(),
            config.origin.clone(),
            config.log_requests,
        ));
        let pool = WorkerPool::new(threads, factory, Arc::clone(&state))?;
        info!(threads, flags = %state.flags(), "service started");

        Ok(Self { state, pool })
    }

    pub fn state(&self) -> &Arc<ServiceState> {
        &self.state
    }

    /// Report status once a worker picks the request up
    pub async fn status(&self) -> Result<StatusReport> {
        self.submit(|reply| Job::Status { reply }).await
    }

    /// Replace the seed
    ///
    /// Completes only after every worker has been rebound to the new tables.
    pub async fn reseed(&self, seed: Vec<u8>) -> Result<()> {
        if seed.len() > MAX_SEED_SIZE {
            return Err(ServiceError::SeedTooLarge(seed.len()));
        }
        self.submit(|reply| Job::Reseed { seed, reply }).await?
    }

    /// Hash one input
    ///
    /// With `expected` set the job fails with a fingerprint mismatch unless
    /// that seed is still active when a worker runs it.
    pub async fn hash(&self, input: Vec<u8>, expected: Option<String>) -> Result<Hash> {
        self.submit(|reply| Job::Hash {
            input,
            expected,
            reply,
        })
        .await?
    }

    /// Hash every input in order on a single worker
    pub async fn batch(
        &self,
        inputs: Vec<Vec<u8>>,
        expected: Option<String>,
    ) -> Result<Vec<Hash>> {
        self.submit(|reply| Job::Batch {
            inputs,
            expected,
            reply,
        })
        .await?
    }

    /// Stop accepting jobs and join the workers once the queue drains
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }

    async fn submit<T>(&self, job: impl FnOnce(oneshot::Sender<T>) -> Job) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.pool.enqueue(job(reply))?;
        response.await.map_err(|_| ServiceError::PoolClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_hides_seed() {
        let fp = fingerprint(b"secret");
        assert_eq!(fp.len(), 64);
        assert!(!fp.contains(&hex::encode(b"secret")));
        assert_eq!(fp, fingerprint(b"secret"));
        assert_ne!(fp, fingerprint(b"secret2"));
    }

    #[test]
    fn test_fingerprint_check() {
        let state = ServiceState::new(1, Flags::NONE, None, false);
        assert!(state.check_fingerprint(None).is_ok());
        assert!(matches!(
            state.check_fingerprint(Some("")),
            Err(ServiceError::FingerprintMismatch { .. })
        ));

        state.set_seed(b"seed");
        let active = state.fingerprint().unwrap();
        assert!(state.check_fingerprint(Some(&active)).is_ok());
        assert!(state.check_fingerprint(Some(&active.to_uppercase())).is_ok());
        assert!(state.check_fingerprint(Some("00")).is_err());
    }

    #[test]
    fn test_origin_matching() {
        let state = ServiceState::new(1, Flags::NONE, None, false);
        assert!(!state.allows_origin("https://example.org"));

        state.set_origin(Some("https://example.org".to_string()));
        assert!(state.allows_origin("https://example.org"));
        assert!(!state.allows_origin("https://example.org.evil"));
    }

    #[test]
    fn test_status_report() {
        let state = ServiceState::new(3, Flags::FULL_MEM, None, true);
        state.count_hashes(5);

        let report = state.status();
        assert_eq!(report.threads, 3);
        assert_eq!(report.flags, vec!["full_mem".to_string()]);
        assert_eq!(report.fingerprint, None);
        assert_eq!(report.hashes, 5);
        assert!(report.service.starts_with('v'));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["fingerprint"], serde_json::Value::Null);
        assert_eq!(json["flags"][0], "full_mem");
        assert!(state.log_requests());
    }
}
