//! Bounded, persisted pool of precomputed artifacts

use crate::{Miner, PoolError, Persistence, Result, StopSignal};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

/// Pool of precomputed values fed by a single miner worker.
///
/// The worker generates one value, persists it, pushes it into the bounded
/// queue and then sleeps for the configured delay so latency-sensitive work
/// in the same process gets scheduled first. [`ParameterPool::get`] blocks
/// while the queue is empty.
pub struct ParameterPool<T> {
    name: &'static str,
    sender: mpsc::Sender<T>,
    receiver: Mutex<mpsc::Receiver<T>>,
    persistence: Arc<dyn Persistence<T>>,
}

impl<T> ParameterPool<T>
where
    T: Send + Sync + 'static,
{
    /// Create a pool preloaded with every persisted entry and register its
    /// generator with `miner`.
    ///
    /// The queue holds `size` entries, or more if more were persisted.
    /// `generate` receives the worker's stop signal so a long computation can
    /// bail out when the miner stops. Failed attempts are logged and retried
    /// after the same delay as successful ones.
    pub fn new<F, E>(
        name: &'static str,
        size: usize,
        generate: F,
        persistence: Arc<dyn Persistence<T>>,
        generate_delay: Duration,
        miner: &Miner,
    ) -> Result<Self>
    where
        F: Fn(&StopSignal) -> std::result::Result<T, E> + Send + Sync + 'static,
        E: Display,
    {
        let persisted = persistence.read_all()?;
        let preloaded = persisted.len();

        let (sender, receiver) = mpsc::channel(size.max(preloaded).max(1));
        for entry in persisted {
            sender.try_send(entry).map_err(|_| PoolError::Closed)?;
        }

        info!(pool = name, preloaded, target_size = size, "Pool initialized");

        let worker_sender = sender.clone();
        let worker_persistence = persistence.clone();
        miner.mine(move |stop: &StopSignal| {
            if worker_sender.is_closed() {
                stop.wait_timeout(generate_delay);
                return;
            }

            let entry = match generate(stop) {
                Ok(entry) => entry,
                Err(err) => {
                    if !stop.is_stopped() {
                        warn!(pool = name, %err, "Failed to generate pool entry");
                    }
                    stop.wait_timeout(generate_delay);
                    return;
                }
            };

            if let Err(err) = worker_persistence.save(&entry) {
                warn!(pool = name, %err, "Failed to persist pool entry");
            }

            if worker_sender.blocking_send(entry).is_err() {
                return;
            }

            info!(
                pool = name,
                pool_size = current_size(&worker_sender),
                "Generated new pool entry"
            );

            stop.wait_timeout(generate_delay);
        });

        Ok(Self {
            name,
            sender,
            receiver: Mutex::new(receiver),
            persistence,
        })
    }

    /// Take one entry, waiting for the generator if the pool is empty.
    ///
    /// The persisted copy of the returned entry is deleted.
    pub async fn get(&self) -> Result<T> {
        let entry = self
            .receiver
            .lock()
            .await
            .recv()
            .await
            .ok_or(PoolError::Closed)?;

        if let Err(err) = self.persistence.delete(&entry) {
            warn!(pool = self.name, %err, "Failed to delete persisted pool entry");
        }

        Ok(entry)
    }

    /// Number of entries ready to be taken
    pub fn current_size(&self) -> usize {
        current_size(&self.sender)
    }
}

fn current_size<T>(sender: &mpsc::Sender<T>) -> usize {
    sender.max_capacity() - sender.capacity()
}
