//! # tECDSA DKG
//!
//! Distributed key generation for threshold ECDSA signing groups.
//!
//! Members of a group run a block-synchronized session over a broadcast
//! channel and end up with shares of one group signing key:
//!
//! - [`dkg`] runs the session and publishes its result
//! - [`state`] drives protocol states on the block clock
//! - [`tss`] is the keygen party the session wraps
//! - [`ephemeral`] encrypts peer-to-peer keygen payloads
//! - [`group`] tracks which members are still operating
//!
//! ## Example
//!
//! ```rust,ignore
//! use tecdsa_dkg::dkg::{Executor, PreParamsPool, SessionConfig};
//!
//! let pool = PreParamsPool::new(&config, &miner)?;
//! let executor = Executor::new(Arc::new(pool), config.key_generation_concurrency);
//!
//! let session = SessionConfig::new("session-1", 1, 100, 50)?;
//! let (result, end_block) = executor
//!     .execute(&session, start_block, block_counter, channel, validator)
//!     .await?;
//! ```

pub mod config;
pub mod dkg;
pub mod ephemeral;
pub mod error;
pub mod group;
pub mod net;
pub mod state;
pub mod tss;

pub use config::Config;
pub use error::{Error, Result};
