//! Worker pool
//!
//! A fixed set of OS threads, each owning one [`Machine`], pulls jobs from a
//! shared FIFO queue. Reseeding is itself a job: the worker that dequeues it
//! stops dispatch, waits for every other worker to go idle, rekeys the shared
//! tables and rebinds every machine before dispatch resumes.

mod worker;


use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::codec::Hash;
use crate::context::ContextFactory;
use crate::error::{Result, ServiceError};
use crate::service::{ServiceState, StatusReport};

use worker::WorkerSlot;

/// Unit of work with its reply channel
pub enum Job {
    Status {
        reply: oneshot::Sender<StatusReport>,
    },
    Reseed {
        seed: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    /// `expected` is the caller's fingerprint, checked when the job runs
    Hash {
        input: Vec<u8>,
        expected: Option<String>,
        reply: oneshot::Sender<Result<Hash>>,
    },
    Batch {
        inputs: Vec<Vec<u8>>,
        expected: Option<String>,
        reply: oneshot::Sender<Result<Vec<Hash>>>,
    },
}

impl Job {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Job::Status { .. } => "status",
            Job::Reseed { .. } => "reseed",
            Job::Hash { .. } => "hash",
            Job::Batch { .. } => "batch",
        }
    }
}

#[derive(Default)]
struct Queue {
    jobs: VecDeque<Job>,
    reseeding: bool,
    shutdown: bool,
}

pub(crate) struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
    workers: Vec<WorkerSlot>,
    factory: Mutex<ContextFactory>,
    state: Arc<ServiceState>,
}

impl Shared {
    fn lock_queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until a job may be dispatched, `None` once shut down and drained
    ///
    /// Dispatch stays suspended during a reseed even after shutdown.
    /// The slot is marked busy while the queue lock is held. Dequeuing a
    /// reseed job suspends dispatch in the same critical section.
    fn next_job(&self, slot: &WorkerSlot) -> Option<Job> {
        let queue = self.lock_queue();
        let mut queue = self
            .available
            .wait_while(queue, |q| q.reseeding || (!q.shutdown && q.jobs.is_empty()))
            .unwrap_or_else(PoisonError::into_inner);

        let job = queue.jobs.pop_front()?;
        if matches!(job, Job::Reseed { .. }) {
            queue.reseeding = true;
        }
        slot.set_idle(false);
        Some(job)
    }

    /// Drain the other workers, rekey and rebind every machine
    fn reseed(&self, initiator: usize, seed: &[u8]) -> Result<()> {
        self.lock_queue().reseeding = true;

        for slot in self.workers.iter().filter(|slot| slot.id() != initiator) {
            slot.wait_idle();
        }

        let outcome = self.rekey(seed);

        self.lock_queue().reseeding = false;
        self.available.notify_all();
        outcome
    }

    fn rekey(&self, seed: &[u8]) -> Result<()> {
        let mut factory = self.factory.lock().unwrap_or_else(PoisonError::into_inner);

        for slot in &self.workers {
            slot.lock_machine().release();
        }

        let outcome = factory.reseed(seed, self.workers.len());
        if outcome.is_ok() {
            self.state.set_seed(seed);
            info!(fingerprint = ?self.state.fingerprint(), "seed replaced");
        }

        // Machines are rebound even on failure so they keep the previous tables
        let tables = factory.tables();
        for slot in &self.workers {
            slot.lock_machine().refresh(Arc::clone(&tables));
        }

        outcome.map_err(ServiceError::from)
    }
}

/// Fixed-size pool of hashing threads
pub struct WorkerPool {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Start `threads` workers, each with a machine from `factory`
    pub fn new(
        threads: usize,
        factory: ContextFactory,
        state: Arc<ServiceState>,
    ) -> std::io::Result<Self> {
        let threads = threads.max(1);
        let workers = (0..threads)
            .map(|id| WorkerSlot::new(id, factory.create_machine()))
            .collect();

        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            available: Condvar::new(),
            workers,
            factory: Mutex::new(factory),
            state,
        });

        let pool = Self {
            shared: Arc::clone(&shared),
            handles: Mutex::new(Vec::with_capacity(threads)),
        };
        for id in 0..threads {
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("uhash-worker-{}", id))
                .spawn(move || worker::run(shared, id))?;
            pool.lock_handles().push(handle);
        }
        debug!(threads, "worker pool started");

        Ok(pool)
    }

    pub fn threads(&self) -> usize {
        self.shared.workers.len()
    }

    /// Append a job and wake one worker
    pub fn enqueue(&self, job: Job) -> Result<()> {
        let mut queue = self.shared.lock_queue();
        if queue.shutdown {
            return Err(ServiceError::PoolClosed);
        }
        queue.jobs.push_back(job);
        drop(queue);

        self.shared.available.notify_one();
        Ok(())
    }

    /// Stop accepting jobs, let the workers drain the queue and join them
    pub fn shutdown(&self) {
        self.shared.lock_queue().shutdown = true;
        self.shared.available.notify_all();

        let handles = std::mem::take(&mut *self.lock_handles());
        if handles.is_empty() {
            return;
        }
        for handle in handles {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
        debug!("worker pool stopped");
    }

    fn lock_handles(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        self.shared.lock_queue().jobs.len()
    }

    #[cfg(test)]
    pub(crate) fn with_machine<R>(
        &self,
        worker: usize,
        f: impl FnOnce(&crate::context::Machine) -> R,
    ) -> R {
        f(&self.shared.workers[worker].lock_machine())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
