//! # Parameter Pool
//!
//! Infrastructure for amortizing expensive one-time precomputations.
//!
//! - [`Miner`] is a process-wide pause/resume controller for CPU-heavy
//!   background loops.
//! - [`ParameterPool`] keeps a bounded, persisted queue of precomputed
//!   artifacts, refilled by a single miner worker.
//! - [`Persistence`] is the storage contract a pool needs;
//!   [`DirectoryPersistence`] implements it with one file per entry.

pub mod error;
pub mod miner;
pub mod persistence;
pub mod pool;

pub use error::{PoolError, Result};
pub use miner::{Miner, StopSignal};
pub use persistence::{DirectoryPersistence, Persistable, Persistence, VolatilePersistence};
pub use pool::ParameterPool;
