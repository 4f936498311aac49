use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use cutout_core::{MaskConvention, SegmentationMask};
use cutout_image::{to_alpha, AlphaBuffer, MaskError};
use thiserror::Error;
use tracing::{debug, warn};

pub const MIN_WORKERS: usize = 2;
pub const MAX_WORKERS: usize = 4;

/// Worker count for a pool: the requested (or detected) parallelism clamped to
/// `MIN_WORKERS..=MAX_WORKERS`.
pub fn pool_capacity(requested: Option<usize>) -> usize {
    let wanted = requested.unwrap_or_else(|| {
        thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(MIN_WORKERS)
    });
    wanted.clamp(MIN_WORKERS, MAX_WORKERS)
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error(transparent)]
    Mask(#[from] MaskError),
    #[error("mask worker {0} stopped before replying")]
    WorkerLost(usize),
}

#[derive(Debug, Clone)]
pub struct MaskJob {
    pub mask: SegmentationMask,
    pub width: u32,
    pub height: u32,
    pub convention: MaskConvention,
}

impl MaskJob {
    pub fn run_inline(&self) -> Result<AlphaBuffer, MaskError> {
        to_alpha(&self.mask, self.width, self.height, self.convention)
    }
}

type Reply = Result<AlphaBuffer, MaskError>;

struct Envelope {
    job: MaskJob,
    reply: Sender<Reply>,
}

struct Worker {
    id: usize,
    jobs: Sender<Envelope>,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<Worker>,
    live: usize,
    next_id: usize,
    handles: Vec<JoinHandle<()>>,
}

struct PoolShared {
    capacity: usize,
    state: Mutex<PoolState>,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        // Closing the job channels ends each worker loop.
        state.idle.clear();
        for handle in state.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Bounded pool of reusable mask workers.
///
/// Workers are spawned on demand up to the capacity and live until the pool is
/// dropped. When every worker is busy and the pool is full, submissions come
/// back as [`Submission::Saturated`] so the caller can convert inline.
#[derive(Clone)]
pub struct MaskWorkerPool {
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for MaskWorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("MaskWorkerPool")
            .field("capacity", &self.shared.capacity)
            .field("live", &state.live)
            .field("idle", &state.idle.len())
            .finish()
    }
}

impl Default for MaskWorkerPool {
    fn default() -> Self {
        Self::new(pool_capacity(None))
    }
}

impl MaskWorkerPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                capacity: capacity.clamp(MIN_WORKERS, MAX_WORKERS),
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn live_workers(&self) -> usize {
        self.shared.lock().live
    }

    pub fn idle_workers(&self) -> usize {
        self.shared.lock().idle.len()
    }

    /// Takes an idle worker, spawning one if the pool has room.
    pub fn acquire(&self) -> Option<WorkerLease> {
        let mut state = self.shared.lock();
        if let Some(worker) = state.idle.pop_front() {
            return Some(self.lease(worker));
        }
        if state.live >= self.shared.capacity {
            return None;
        }
        let id = state.next_id;
        match spawn_worker(id) {
            Ok((worker, handle)) => {
                state.next_id += 1;
                state.live += 1;
                state.handles.push(handle);
                debug!(worker = id, live = state.live, "spawned mask worker");
                Some(self.lease(worker))
            }
            Err(err) => {
                warn!(error = %err, "could not spawn mask worker");
                None
            }
        }
    }

    pub fn try_submit(&self, job: MaskJob) -> Submission {
        match self.acquire() {
            Some(lease) => lease.submit(job),
            None => Submission::Saturated(job),
        }
    }

    /// Converts on a worker when one is available, otherwise on the calling thread.
    pub fn process(&self, job: MaskJob) -> Result<AlphaBuffer, PoolError> {
        match self.try_submit(job) {
            Submission::Pending(pending) => pending.wait(),
            Submission::Saturated(job) => Ok(job.run_inline()?),
        }
    }

    fn lease(&self, worker: Worker) -> WorkerLease {
        WorkerLease {
            worker: Some(worker),
            shared: Arc::clone(&self.shared),
            healthy: true,
        }
    }
}

fn spawn_worker(id: usize) -> std::io::Result<(Worker, JoinHandle<()>)> {
    let (jobs, inbox): (Sender<Envelope>, Receiver<Envelope>) = mpsc::channel();
    let handle = thread::Builder::new()
        .name(format!("cutout-mask-{id}"))
        .spawn(move || {
            for Envelope { job, reply } in inbox {
                let _ = reply.send(job.run_inline());
            }
        })?;
    Ok((Worker { id, jobs }, handle))
}

/// Exclusive use of one worker; dropping the lease releases it back to the pool.
pub struct WorkerLease {
    worker: Option<Worker>,
    shared: Arc<PoolShared>,
    healthy: bool,
}

impl WorkerLease {
    pub fn worker_id(&self) -> Option<usize> {
        self.worker.as_ref().map(|w| w.id)
    }

    pub fn submit(mut self, job: MaskJob) -> Submission {
        let Some(worker) = self.worker.as_ref() else {
            return Submission::Saturated(job);
        };
        let (reply, inbox) = mpsc::channel();
        match worker.jobs.send(Envelope { job, reply }) {
            Ok(()) => Submission::Pending(PendingMask { lease: self, inbox }),
            Err(mpsc::SendError(envelope)) => {
                warn!(worker = worker.id, "mask worker is gone, converting inline");
                self.healthy = false;
                Submission::Saturated(envelope.job)
            }
        }
    }

    pub fn release(self) {}
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let mut state = self.shared.lock();
        if self.healthy {
            state.idle.push_back(worker);
        } else {
            state.live = state.live.saturating_sub(1);
        }
    }
}

pub enum Submission {
    Pending(PendingMask),
    /// No worker could take the job; it is handed back untouched.
    Saturated(MaskJob),
}

/// A job in flight on a worker.
pub struct PendingMask {
    lease: WorkerLease,
    inbox: Receiver<Reply>,
}

impl PendingMask {
    pub fn worker_id(&self) -> Option<usize> {
        self.lease.worker_id()
    }

    pub fn wait(mut self) -> Result<AlphaBuffer, PoolError> {
        match self.inbox.recv() {
            Ok(reply) => Ok(reply?),
            Err(_) => {
                self.lease.healthy = false;
                Err(PoolError::WorkerLost(self.lease.worker_id().unwrap_or_default()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cutout_core::MaskValues;

    fn job(width: u32, height: u32) -> MaskJob {
        let values = (0..width * height).map(|i| (i % 256) as u8).collect();
        MaskJob {
            mask: SegmentationMask {
                width,
                height,
                values: MaskValues::Bytes(values),
            },
            width,
            height,
            convention: MaskConvention::BackgroundHigh,
        }
    }

    /// Parks a worker in the idle queue whose thread is `body`.
    fn install_worker(pool: &MaskWorkerPool, body: impl FnOnce(Receiver<Envelope>) + Send + 'static) -> usize {
        let (jobs, inbox) = mpsc::channel();
        let handle = thread::spawn(move || body(inbox));
        let mut state = pool.shared.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.live += 1;
        state.handles.push(handle);
        state.idle.push_back(Worker { id, jobs });
        id
    }

    #[test]
    fn closed_worker_channel_hands_the_job_back() {
        let pool = MaskWorkerPool::new(2);
        install_worker(&pool, drop);
        // Wait for the worker thread to drop its inbox.
        let handle = pool.shared.lock().handles.pop().expect("worker handle");
        handle.join().expect("worker exits");

        let submitted = job(2, 2);
        let Submission::Saturated(returned) = pool.try_submit(submitted.clone()) else {
            panic!("a dead worker cannot accept work");
        };
        assert_eq!(returned.mask, submitted.mask);
        assert_eq!(pool.live_workers(), 0);
        assert_eq!(pool.idle_workers(), 0);
        assert_eq!(
            pool.process(job(2, 2)).expect("fresh worker").as_slice(),
            &[255, 254, 253, 252]
        );
    }

    #[test]
    fn worker_dying_mid_job_is_reported_and_discarded() {
        let pool = MaskWorkerPool::new(2);
        let id = install_worker(&pool, |inbox| {
            // Take the job and drop its reply channel without answering.
            let _ = inbox.recv();
        });

        let Submission::Pending(pending) = pool.try_submit(job(2, 2)) else {
            panic!("an idle worker should accept work");
        };
        assert_eq!(pending.worker_id(), Some(id));
        let err = pending.wait().expect_err("no reply arrives");
        assert!(matches!(err, PoolError::WorkerLost(lost) if lost == id));
        assert_eq!(pool.live_workers(), 0);
        assert_eq!(pool.idle_workers(), 0);
    }

    #[test]
    fn capacity_is_clamped() {
        assert_eq!(pool_capacity(Some(1)), 2);
        assert_eq!(pool_capacity(Some(3)), 3);
        assert_eq!(pool_capacity(Some(64)), 4);
        let detected = pool_capacity(None);
        assert!((MIN_WORKERS..=MAX_WORKERS).contains(&detected));
        assert_eq!(MaskWorkerPool::new(0).capacity(), 2);
    }

    #[test]
    fn worker_output_matches_inline_conversion() {
        let pool = MaskWorkerPool::new(2);
        let job = job(32, 8);
        let expected = job.run_inline().expect("inline conversion");
        let Submission::Pending(pending) = pool.try_submit(job) else {
            panic!("an empty pool should accept work");
        };
        assert_eq!(pending.wait().expect("worker conversion"), expected);
    }

    #[test]
    fn workers_are_reused_between_jobs() {
        let pool = MaskWorkerPool::new(4);
        for _ in 0..5 {
            pool.process(job(4, 4)).expect("conversion");
        }
        assert_eq!(pool.live_workers(), 1);
        assert_eq!(pool.idle_workers(), 1);
    }

    #[test]
    fn full_pool_hands_the_job_back() {
        let pool = MaskWorkerPool::new(2);
        let first = pool.acquire().expect("first worker");
        let second = pool.acquire().expect("second worker");
        assert!(pool.acquire().is_none());

        let submitted = job(2, 2);
        let Submission::Saturated(returned) = pool.try_submit(submitted.clone()) else {
            panic!("a saturated pool should hand the job back");
        };
        assert_eq!(returned.mask, submitted.mask);
        assert_eq!(
            pool.process(job(2, 2)).expect("inline fallback").as_slice(),
            &[255, 254, 253, 252]
        );

        first.release();
        assert_eq!(pool.idle_workers(), 1);
        drop(second);
        assert_eq!(pool.idle_workers(), 2);
        assert_eq!(pool.live_workers(), 2);
    }

    #[test]
    fn malformed_job_reports_mask_error_from_worker() {
        let pool = MaskWorkerPool::new(2);
        let mut bad = job(4, 4);
        bad.width = 5;
        let err = pool.process(bad).expect_err("length mismatch should surface");
        assert!(matches!(err, PoolError::Mask(MaskError::LengthMismatch { .. })));
        assert_eq!(pool.idle_workers(), 1);
    }
}
