//! Pre-parameters pool feeding DKG sessions

use crate::config::Config;
use crate::tss::{generate_pre_params_until, LocalPreParams};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use param_pool::{
    DirectoryPersistence, Miner, ParameterPool, Persistable, Persistence, PoolError, StopSignal,
    VolatilePersistence,
};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::info;

const POOL_NAME: &str = "tss-pre-params";

/// Keygen pre-parameters stamped with their creation time
#[derive(Debug, Clone, PartialEq)]
pub struct PreParams {
    data: LocalPreParams,
    created_at: DateTime<Utc>,
}

impl PreParams {
    pub fn new(data: LocalPreParams) -> Self {
        Self::with_timestamp(data, Utc::now())
    }

    pub fn with_timestamp(data: LocalPreParams, created_at: DateTime<Utc>) -> Self {
        Self { data, created_at }
    }

    pub fn data(&self) -> &LocalPreParams {
        &self.data
    }

    pub fn into_data(self) -> LocalPreParams {
        self.data
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// SHA-256 over the length-prefixed numeric fields
    pub fn content_hash(&self) -> [u8; 32] {
        let data = &self.data;
        let mut hasher = Sha256::new();
        for value in [
            &data.paillier_sk.n,
            &data.paillier_sk.lambda_n,
            &data.paillier_sk.phi_n,
            &data.ntilde,
            &data.h1i,
            &data.h2i,
            &data.alpha,
            &data.beta,
            &data.p,
            &data.q,
        ] {
            let bytes = value.to_bytes();
            hasher.update((bytes.len() as u64).to_be_bytes());
            hasher.update(&bytes);
        }
        hasher.finalize().into()
    }
}

impl Persistable for PreParams {
    /// `<secs><nanos>_<hash prefix>`, zero padded so names sort by creation time
    fn file_name(&self) -> String {
        format!(
            "{:020}{:09}_{}",
            self.created_at.timestamp().max(0),
            self.created_at.timestamp_subsec_nanos(),
            &hex::encode(self.content_hash())[..7]
        )
    }

    fn to_bytes(&self) -> param_pool::Result<Vec<u8>> {
        self.marshal()
            .map_err(|e| PoolError::InvalidFormat(e.to_string()))
    }

    fn from_bytes(bytes: &[u8]) -> param_pool::Result<Self> {
        Self::unmarshal(bytes).map_err(|e| PoolError::InvalidFormat(e.to_string()))
    }
}

/// Where a session takes its pre-parameters from
#[async_trait]
pub trait PreParamsSource: Send + Sync {
    /// Take one set of pre-parameters, waiting until one is available
    async fn get(&self) -> Result<PreParams>;
}

/// Background-filled pool of pre-parameters
pub struct PreParamsPool {
    pool: ParameterPool<PreParams>,
}

impl PreParamsPool {
    /// Create a pool persisting to `config.persistence_dir`, or nowhere when
    /// unset, and register its generator with `miner`
    pub fn new(config: &Config, miner: &Miner) -> Result<Self> {
        let persistence: Arc<dyn Persistence<PreParams>> = match &config.persistence_dir {
            Some(dir) => Arc::new(DirectoryPersistence::new(dir)?),
            None => Arc::new(VolatilePersistence),
        };
        Self::with_persistence(config, persistence, miner)
    }

    pub fn with_persistence(
        config: &Config,
        persistence: Arc<dyn Persistence<PreParams>>,
        miner: &Miner,
    ) -> Result<Self> {
        let safe_prime_bits = config.safe_prime_bits;
        let timeout = config.generation_timeout;
        let concurrency = config.generation_concurrency;

        info!(
            pool_size = config.pool_size,
            safe_prime_bits,
            generation_timeout = ?timeout,
            generation_delay = ?config.generation_delay,
            "Initializing pre-parameters pool"
        );

        let pool = ParameterPool::new(
            POOL_NAME,
            config.pool_size,
            move |stop: &StopSignal| {
                generate_pre_params_until(safe_prime_bits, timeout, concurrency, || {
                    stop.is_stopped()
                })
                .map(PreParams::new)
            },
            persistence,
            config.generation_delay,
            miner,
        )?;

        Ok(Self { pool })
    }

    /// Pre-parameters ready to be taken
    pub fn current_size(&self) -> usize {
        self.pool.current_size()
    }
}

#[async_trait]
impl PreParamsSource for PreParamsPool {
    async fn get(&self) -> Result<PreParams> {
        Ok(self.pool.get().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::pre_params;
    use chrono::TimeZone;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_config(dir: Option<&TempDir>) -> Config {
        Config {
            pool_size: 2,
            generation_timeout: Duration::from_secs(60),
            generation_delay: Duration::ZERO,
            generation_concurrency: 1,
            key_generation_concurrency: 1,
            safe_prime_bits: 64,
            persistence_dir: dir.map(|d| d.path().to_path_buf()),
        }
    }

    #[test]
    fn test_file_names_sort_by_creation_time() {
        let older = PreParams::with_timestamp(
            pre_params(0),
            Utc.timestamp_opt(1_700_000_000, 5).unwrap(),
        );
        let newer = PreParams::with_timestamp(
            pre_params(1),
            Utc.timestamp_opt(1_700_000_001, 0).unwrap(),
        );

        let name = older.file_name();
        assert_eq!(name.len(), 20 + 9 + 1 + 7);
        assert!(name.starts_with("00000000001700000000000000005_"));
        assert!(older.file_name() < newer.file_name());
        assert_eq!(&name[30..], &hex::encode(older.content_hash())[..7]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pool_reloads_persisted_pre_params() {
        let dir = TempDir::new().unwrap();
        let persistence = DirectoryPersistence::new(dir.path()).unwrap();
        let stored = PreParams::new(pre_params(2));
        persistence.save(&stored).unwrap();

        let miner = Miner::new();
        miner.stop();
        let pool = PreParamsPool::new(&test_config(Some(&dir)), &miner).unwrap();

        assert_eq!(pool.current_size(), 1);
        assert_eq!(pool.get().await.unwrap(), stored);
        assert_eq!(pool.current_size(), 0);

        let remaining: Vec<PreParams> = persistence.read_all().unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pool_generates_pre_params() {
        let miner = Miner::new();
        let pool = PreParamsPool::new(&test_config(None), &miner).unwrap();

        let generated = tokio::time::timeout(Duration::from_secs(60), pool.get())
            .await
            .unwrap()
            .unwrap();
        assert!(generated.data().validate());

        miner.stop();
    }
}
