//! DKG Node
//!
//! Command-line interface around the threshold ECDSA key generation engine:
//! - Run a signing group's key generation in process
//! - Pre-generate keygen pre-parameters into a persistence directory
//! - Show protocol timing

mod operator;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use operator::{FileSubmitter, OperatorSigner};
use param_pool::Miner;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tecdsa_dkg::dkg::{
    pre_publication_blocks, protocol_blocks, DkgResult, Executor, PreParamsPool, Publisher,
    SessionConfig,
};
use tecdsa_dkg::group::{MemberIndex, StaticMembershipValidator};
use tecdsa_dkg::net::LocalNetwork;
use tecdsa_dkg::state::{BlockCounter, LocalBlockCounter};
use tecdsa_dkg::Config;
use tracing::{info, warn, Level};

/// DKG Node - threshold ECDSA key generation
#[derive(Parser)]
#[command(name = "dkg-node")]
#[command(about = "Threshold ECDSA distributed key generation node")]
#[command(version)]
struct Cli {
    /// JSON file with pre-parameters and keygen settings
    #[arg(short, long, env = "DKG_CONFIG")]
    config: Option<PathBuf>,

    /// Directory pre-parameters are persisted to
    #[arg(long, env = "PRE_PARAMS_DIR")]
    pre_params_dir: Option<PathBuf>,

    /// Bit length of the safe primes generated for pre-parameters
    #[arg(long, env = "SAFE_PRIME_BITS")]
    safe_prime_bits: Option<usize>,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run key generation for a whole group in this process
    Run {
        /// Number of members in the group
        #[arg(short = 'n', long, default_value = "3")]
        group_size: usize,

        /// Number of faulty members the group tolerates
        #[arg(short = 't', long, default_value = "1")]
        dishonest_threshold: usize,

        /// Members left out of the session (comma-separated indexes)
        #[arg(short, long, value_delimiter = ',')]
        excluded: Vec<MemberIndex>,

        /// Session identifier, random when not given
        #[arg(short, long)]
        session_id: Option<String>,

        /// Block time of the local block counter in milliseconds
        #[arg(long, default_value = "1000")]
        block_time_ms: u64,

        /// Directory submitted results are written to
        #[arg(short, long, env = "DEST", default_value = "./data")]
        dest: PathBuf,
    },

    /// Fill the pre-parameters directory and exit
    PreParams {
        /// Number of pre-parameters to have on disk
        #[arg(short, long)]
        count: usize,
    },

    /// Show protocol timing
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = load_config(&cli)?;

    match cli.command {
        Commands::Run {
            group_size,
            dishonest_threshold,
            ref excluded,
            ref session_id,
            block_time_ms,
            ref dest,
        } => {
            let session_id = session_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            run_group(
                &config,
                &session_id,
                group_size,
                dishonest_threshold,
                excluded,
                Duration::from_millis(block_time_ms),
                dest,
            )
            .await?;
        }
        Commands::PreParams { count } => {
            fill_pre_params(&config, count).await?;
        }
        Commands::Info => {
            println!("Protocol blocks: {}", protocol_blocks());
            println!("Pre-publication blocks: {}", pre_publication_blocks());
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter =
        tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into());
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read config {}", path.display()))?;
            serde_json::from_str(&json)
                .with_context(|| format!("invalid config {}", path.display()))?
        }
        None => Config::default(),
    };

    if let Some(dir) = &cli.pre_params_dir {
        config.persistence_dir = Some(dir.clone());
    }
    if let Some(bits) = cli.safe_prime_bits {
        config.safe_prime_bits = bits;
    }

    Ok(config)
}

/// Block until the pool holds at least `count` entries
async fn wait_for_pool(pool: &PreParamsPool, count: usize) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        interval.tick().await;
        let current = pool.current_size();
        if current >= count {
            return;
        }
        info!(current, target = count, "Waiting for pre-parameters");
    }
}

async fn fill_pre_params(config: &Config, count: usize) -> Result<()> {
    if config.persistence_dir.is_none() {
        bail!("a pre-parameters directory is required");
    }

    let config = Config {
        pool_size: config.pool_size.max(count),
        ..config.clone()
    };
    let miner = Miner::global();
    let pool = PreParamsPool::new(&config, miner)?;

    wait_for_pool(&pool, count).await;
    miner.stop();

    info!(count = pool.current_size(), "Pre-parameters ready");
    Ok(())
}

async fn run_group(
    config: &Config,
    session_id: &str,
    group_size: usize,
    dishonest_threshold: usize,
    excluded: &[MemberIndex],
    block_time: Duration,
    dest: &Path,
) -> Result<()> {
    std::fs::create_dir_all(dest)?;

    let members: Vec<MemberIndex> = (1..=group_size)
        .filter_map(|index| MemberIndex::try_from(index).ok())
        .filter(|index| !excluded.contains(index))
        .collect();
    if members.is_empty() {
        bail!("every member is excluded");
    }

    let sessions = members
        .iter()
        .map(|index| {
            SessionConfig::new(session_id, *index, group_size, dishonest_threshold)
                .map(|session| session.with_excluded_members(excluded.to_vec()))
        })
        .collect::<tecdsa_dkg::Result<Vec<_>>>()?;

    info!(
        session_id,
        group_size,
        dishonest_threshold,
        excluded = ?excluded,
        protocol_blocks = protocol_blocks(),
        "Starting group"
    );

    let config = Config {
        pool_size: config.pool_size.max(members.len()),
        ..config.clone()
    };
    let miner = Miner::global();
    let pool = Arc::new(PreParamsPool::new(&config, miner)?);
    wait_for_pool(&pool, members.len()).await;

    // Enough pre-parameters are queued; keep background generation off the
    // CPU while the group runs keygen
    miner.stop();

    let signers: Vec<Arc<OperatorSigner>> = members
        .iter()
        .map(|_| Arc::new(OperatorSigner::generate()))
        .collect();
    let validator = Arc::new(StaticMembershipValidator::new(
        members
            .iter()
            .zip(&signers)
            .map(|(index, signer)| (*index, signer.public_key())),
    ));

    let network = LocalNetwork::new();
    let block_counter = Arc::new(LocalBlockCounter::start(block_time));
    let executor = Arc::new(Executor::new(pool, config.key_generation_concurrency));

    let start_block = block_counter.current_block().await?;
    let handles: Vec<_> = sessions
        .into_iter()
        .zip(&signers)
        .map(|(session, signer)| {
            let channel = Arc::new(network.channel(session_id, signer.public_key()));
            let executor = executor.clone();
            let block_counter = block_counter.clone();
            let validator = validator.clone();
            tokio::spawn(async move {
                let outcome = executor
                    .execute(&session, start_block, block_counter, channel, validator)
                    .await;
                (session, outcome)
            })
        })
        .collect();

    let mut results: Vec<(SessionConfig, DkgResult, u64)> = Vec::new();
    for handle in handles {
        let (session, outcome) = handle.await?;
        match outcome {
            Ok((result, end_block)) => results.push((session, result, end_block)),
            Err(err) => {
                warn!(member = session.member_index, %err, "Key generation failed");
                return Err(err.into());
            }
        }
    }

    let publication_start = results
        .iter()
        .map(|(_, _, end_block)| *end_block)
        .max()
        .unwrap_or(start_block);
    let submitter = Arc::new(FileSubmitter::new(dest));
    let publication_channel = format!("{session_id}/result");

    let handles: Vec<_> = results
        .into_iter()
        .zip(&signers)
        .map(|((session, result, _), signer)| {
            let channel = Arc::new(network.channel(&publication_channel, signer.public_key()));
            let publisher = Publisher::new(signer.clone(), submitter.clone());
            let block_counter = block_counter.clone();
            let validator = validator.clone();
            tokio::spawn(async move {
                let group_public_key = hex::encode(result.group_public_key_bytes());
                publisher
                    .publish(&session, result, publication_start, block_counter, channel, validator)
                    .await
                    .map(|end_block| (group_public_key, end_block))
            })
        })
        .collect();

    for handle in handles {
        let (group_public_key, end_block) = handle.await??;
        info!(end_block, %group_public_key, "Publication finished");
    }

    println!("Session: {session_id}");
    println!("Results written to {}", dest.display());

    Ok(())
}
