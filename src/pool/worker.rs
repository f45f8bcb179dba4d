//! Worker threads

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use super::{Job, Shared};
use crate::codec::Hash;
use crate::context::Machine;
use crate::error::Result;

/// Per-worker idle flag and machine
pub(crate) struct WorkerSlot {
    id: usize,
    idle: Mutex<bool>,
    idle_changed: Condvar,
    machine: Mutex<Machine>,
}

impl WorkerSlot {
    pub(crate) fn new(id: usize, machine: Machine) -> Self {
        Self {
            id,
            idle: Mutex::new(false),
            idle_changed: Condvar::new(),
            machine: Mutex::new(machine),
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn set_idle(&self, idle: bool) {
        *self.idle.lock().unwrap_or_else(PoisonError::into_inner) = idle;
        if idle {
            self.idle_changed.notify_all();
        }
    }

    /// Block until the worker reports idle
    pub(crate) fn wait_idle(&self) {
        let idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        let _idle = self
            .idle_changed
            .wait_while(idle, |idle| !*idle)
            .unwrap_or_else(PoisonError::into_inner);
    }

    pub(crate) fn lock_machine(&self) -> MutexGuard<'_, Machine> {
        self.machine.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Worker main loop
pub(crate) fn run(shared: Arc<Shared>, id: usize) {
    let slot = &shared.workers[id];
    debug!(worker = id, "worker started");

    loop {
        // Idle is published before waiting so a reseed never waits on a parked worker
        slot.set_idle(true);
        let Some(job) = shared.next_job(slot) else {
            break;
        };
        debug!(worker = id, job = job.kind(), "dispatched");
        execute(&shared, slot, job);
    }

    slot.set_idle(true);
    debug!(worker = id, "worker stopped");
}

fn execute(shared: &Shared, slot: &WorkerSlot, job: Job) {
    // A dropped receiver means the caller went away; the work still completes
    let delivered = match job {
        Job::Status { reply } => reply.send(shared.state.status()).is_ok(),
        Job::Reseed { seed, reply } => reply.send(shared.reseed(slot.id, &seed)).is_ok(),
        Job::Hash {
            input,
            expected,
            reply,
        } => reply
            .send(hash_one(shared, slot, &input, expected.as_deref()))
            .is_ok(),
        Job::Batch {
            inputs,
            expected,
            reply,
        } => reply
            .send(hash_batch(shared, slot, &inputs, expected.as_deref()))
            .is_ok(),
    };

    if !delivered {
        debug!(worker = slot.id, "caller dropped before the reply was sent");
    }
}

// The fingerprint is checked here, against the seed the machine is bound to
fn hash_one(
    shared: &Shared,
    slot: &WorkerSlot,
    input: &[u8],
    expected: Option<&str>,
) -> Result<Hash> {
    shared.state.ensure_initialized()?;
    shared.state.check_fingerprint(expected)?;
    let hash = slot.lock_machine().hash(input)?;
    shared.state.count_hashes(1);
    Ok(hash)
}

fn hash_batch(
    shared: &Shared,
    slot: &WorkerSlot,
    inputs: &[Vec<u8>],
    expected: Option<&str>,
) -> Result<Vec<Hash>> {
    shared.state.ensure_initialized()?;
    shared.state.check_fingerprint(expected)?;
    let hashes = slot.lock_machine().hash_batch(inputs)?;
    shared.state.count_hashes(hashes.len() as u64);
    Ok(hashes)
}
