//! Process-wide pause/resume controller for CPU-heavy background work
//!
//! Every registered worker runs on its own thread in a tight loop until its
//! [`StopSignal`] fires. Stopping is cooperative: an iteration in progress runs
//! to completion before the worker observes the signal.

use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info};

type Worker = Arc<dyn Fn(&StopSignal) + Send + Sync>;

/// Cooperative stop flag shared between the miner and one running worker
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    /// Whether the worker owning this signal was asked to stop
    pub fn is_stopped(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Sleep for `duration` or until the signal fires, whichever comes first.
    ///
    /// Returns `true` when the signal fired.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        let (lock, condvar) = &*self.inner;
        let mut stopped = lock.lock();
        condvar.wait_while_for(&mut stopped, |stopped| !*stopped, duration);
        *stopped
    }

    fn stop(&self) {
        let (lock, condvar) = &*self.inner;
        *lock.lock() = true;
        condvar.notify_all();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MinerState {
    Working,
    Stopped,
}

struct MinerInner {
    state: MinerState,
    workers: Vec<Worker>,
    running: Vec<StopSignal>,
}

/// Registry of background workers that can be paused and resumed together
pub struct Miner {
    inner: Mutex<MinerInner>,
}

impl Miner {
    /// Create a miner in the working state
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MinerInner {
                state: MinerState::Working,
                workers: Vec::new(),
                running: Vec::new(),
            }),
        }
    }

    /// The process-wide miner shared by every pool
    pub fn global() -> &'static Miner {
        static MINER: OnceLock<Miner> = OnceLock::new();
        MINER.get_or_init(Miner::new)
    }

    /// Register a worker.
    ///
    /// The worker starts immediately when the miner is working. A stopped
    /// miner only queues it until the next [`Miner::resume`].
    pub fn mine<F>(&self, worker: F)
    where
        F: Fn(&StopSignal) + Send + Sync + 'static,
    {
        let worker: Worker = Arc::new(worker);
        let mut inner = self.inner.lock();

        inner.workers.push(worker.clone());
        if inner.state == MinerState::Working {
            if let Some(signal) = start_worker(worker) {
                inner.running.push(signal);
            }
        }
    }

    /// Signal every running worker to stop and drop their stop handles
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        if inner.state == MinerState::Stopped {
            return;
        }

        for signal in inner.running.drain(..) {
            signal.stop();
        }
        inner.state = MinerState::Stopped;

        info!(workers = inner.workers.len(), "Miner stopped");
    }

    /// Restart every registered worker from scratch.
    ///
    /// Resuming a miner that is already working does nothing.
    pub fn resume(&self) {
        let mut inner = self.inner.lock();
        if inner.state == MinerState::Working {
            return;
        }

        let running: Vec<StopSignal> = inner
            .workers
            .iter()
            .cloned()
            .filter_map(start_worker)
            .collect();
        inner.running = running;
        inner.state = MinerState::Working;

        info!(workers = inner.workers.len(), "Miner resumed");
    }

    #[cfg(test)]
    fn is_working(&self) -> bool {
        self.inner.lock().state == MinerState::Working
    }

    #[cfg(test)]
    fn worker_count(&self) -> usize {
        self.inner.lock().workers.len()
    }
}

impl Default for Miner {
    fn default() -> Self {
        Self::new()
    }
}

fn start_worker(worker: Worker) -> Option<StopSignal> {
    let signal = StopSignal::default();
    let worker_signal = signal.clone();

    let spawned = thread::Builder::new()
        .name("miner-worker".into())
        .spawn(move || {
            while !worker_signal.is_stopped() {
                worker(&worker_signal);
            }
            debug!("Miner worker exited");
        });

    match spawned {
        Ok(_) => Some(signal),
        Err(err) => {
            error!(%err, "Failed to start miner worker");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn counter_worker(counter: Arc<AtomicUsize>) -> impl Fn(&StopSignal) + Send + Sync + 'static {
        move |signal: &StopSignal| {
            counter.fetch_add(1, Ordering::SeqCst);
            signal.wait_timeout(Duration::from_millis(1));
        }
    }

    fn settle() {
        thread::sleep(Duration::from_millis(50));
    }

    #[test]
    fn test_workers_run_until_stopped() {
        let miner = Miner::new();
        let counter = Arc::new(AtomicUsize::new(0));
        miner.mine(counter_worker(counter.clone()));

        settle();
        assert!(counter.load(Ordering::SeqCst) > 0);

        miner.stop();
        settle();
        let stopped_at = counter.load(Ordering::SeqCst);
        settle();
        assert_eq!(counter.load(Ordering::SeqCst), stopped_at);
        assert!(!miner.is_working());
    }

    #[test]
    fn test_resume_restarts_all_workers() {
        let miner = Miner::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        miner.mine(counter_worker(first.clone()));
        miner.mine(counter_worker(second.clone()));

        miner.stop();
        settle();
        let first_stopped = first.load(Ordering::SeqCst);
        let second_stopped = second.load(Ordering::SeqCst);

        miner.resume();
        settle();
        assert!(first.load(Ordering::SeqCst) > first_stopped);
        assert!(second.load(Ordering::SeqCst) > second_stopped);
        assert!(miner.is_working());

        miner.stop();
    }

    #[test]
    fn test_mine_on_stopped_miner_waits_for_resume() {
        let miner = Miner::new();
        miner.stop();

        let counter = Arc::new(AtomicUsize::new(0));
        miner.mine(counter_worker(counter.clone()));
        settle();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(miner.worker_count(), 1);

        miner.resume();
        settle();
        assert!(counter.load(Ordering::SeqCst) > 0);

        miner.stop();
    }

    #[test]
    fn test_stop_signal_reaches_worker() {
        let miner = Miner::new();
        let observed = Arc::new(AtomicBool::new(false));
        let worker_observed = observed.clone();

        miner.mine(move |signal: &StopSignal| {
            if signal.wait_timeout(Duration::from_secs(10)) {
                worker_observed.store(true, Ordering::SeqCst);
            }
        });

        settle();
        miner.stop();
        settle();
        assert!(observed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_global_miner_is_shared() {
        assert!(std::ptr::eq(Miner::global(), Miner::global()));
    }

    #[test]
    fn test_resume_while_working_is_noop() {
        let miner = Miner::new();
        let counter = Arc::new(AtomicUsize::new(0));
        miner.mine(counter_worker(counter.clone()));

        miner.resume();
        assert_eq!(miner.inner.lock().running.len(), 1);

        miner.stop();
    }
}
