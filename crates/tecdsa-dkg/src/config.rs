//! Pre-parameters and key generation settings

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Settings of the pre-parameters pool and of keygen itself
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of pre-parameters kept ready
    pub pool_size: usize,
    /// Deadline for generating one set of pre-parameters
    pub generation_timeout: Duration,
    /// Pause between two generations
    pub generation_delay: Duration,
    /// Threads one generation may use
    pub generation_concurrency: usize,
    /// Threads a keygen party may use for curve arithmetic
    pub key_generation_concurrency: usize,
    /// Bit length of the safe primes behind `NTilde`
    pub safe_prime_bits: usize,
    /// Directory pre-parameters are persisted to; in-memory only when unset
    pub persistence_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool_size: 50,
            generation_timeout: Duration::from_secs(120),
            generation_delay: Duration::from_secs(10),
            generation_concurrency: 1,
            key_generation_concurrency: std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1),
            safe_prime_bits: 1024,
            persistence_dir: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = serde_json::from_str(
            r#"{ "pool_size": 5, "generation_delay": { "secs": 1, "nanos": 0 } }"#,
        )
        .unwrap();

        assert_eq!(config.pool_size, 5);
        assert_eq!(config.generation_delay, Duration::from_secs(1));
        assert_eq!(config.generation_timeout, Duration::from_secs(120));
        assert_eq!(config.safe_prime_bits, 1024);
        assert!(config.key_generation_concurrency >= 1);
        assert!(config.persistence_dir.is_none());
    }
}
