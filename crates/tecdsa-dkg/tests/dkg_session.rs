//! Whole-session tests over the in-process network

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tecdsa_dkg::dkg::{
    DkgResult, Executor, PreParams, PreParamsSource, Publisher, ResultHash, ResultSigner,
    ResultSubmitter, SessionConfig, SignedResult,
};
use tecdsa_dkg::group::{MemberIndex, StaticMembershipValidator};
use tecdsa_dkg::net::LocalNetwork;
use tecdsa_dkg::state::{BlockCounter, LocalBlockCounter};
use tecdsa_dkg::tss::generate_pre_params;
use tecdsa_dkg::{Error, Result};
use tokio::sync::Mutex;

const BLOCK_TIME: Duration = Duration::from_millis(250);

/// Hands out one pre-generated set per call
struct StaticPreParams {
    pre_params: Mutex<Vec<PreParams>>,
}

impl StaticPreParams {
    fn generate(count: usize) -> Self {
        let pre_params = (0..count)
            .map(|_| {
                PreParams::new(generate_pre_params(64, Duration::from_secs(60), 1).unwrap())
            })
            .collect();
        Self {
            pre_params: Mutex::new(pre_params),
        }
    }
}

#[async_trait]
impl PreParamsSource for StaticPreParams {
    async fn get(&self) -> Result<PreParams> {
        self.pre_params
            .lock()
            .await
            .pop()
            .ok_or_else(|| Error::Internal("no pre-params left".into()))
    }
}

fn signature_over(public_key: &[u8], hash: &ResultHash) -> Vec<u8> {
    Sha256::new()
        .chain_update(public_key)
        .chain_update(hash.as_bytes())
        .finalize()
        .to_vec()
}

struct HashSigner {
    public_key: Vec<u8>,
}

impl ResultSigner for HashSigner {
    fn sign_result(&self, result: &DkgResult) -> Result<SignedResult> {
        let result_hash = ResultHash::new(Sha256::digest(result.group_public_key_bytes()).into());
        Ok(SignedResult {
            public_key: self.public_key.clone(),
            signature: signature_over(&self.public_key, &result_hash),
            result_hash,
        })
    }

    fn verify_signature(&self, signed_result: &SignedResult) -> Result<bool> {
        Ok(signed_result.signature
            == signature_over(&signed_result.public_key, &signed_result.result_hash))
    }
}

#[derive(Default)]
struct RecordingSubmitter {
    submissions: Mutex<Vec<(MemberIndex, Vec<MemberIndex>, u64)>>,
}

#[async_trait]
impl ResultSubmitter for RecordingSubmitter {
    async fn submit_result(
        &self,
        member_index: MemberIndex,
        _result: &DkgResult,
        signatures: &BTreeMap<MemberIndex, Vec<u8>>,
        start_block: u64,
    ) -> Result<()> {
        self.submissions.lock().await.push((
            member_index,
            signatures.keys().copied().collect(),
            start_block,
        ));
        Ok(())
    }
}

struct Harness {
    network: LocalNetwork,
    block_counter: Arc<LocalBlockCounter>,
    validator: Arc<StaticMembershipValidator>,
    executor: Arc<Executor>,
}

impl Harness {
    fn new(group_size: usize, pre_params: usize) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        Self {
            network: LocalNetwork::new(),
            block_counter: Arc::new(LocalBlockCounter::start(BLOCK_TIME)),
            validator: Arc::new(StaticMembershipValidator::new(
                (1..=group_size as u8).map(|id| (id, vec![id])),
            )),
            executor: Arc::new(Executor::new(
                Arc::new(StaticPreParams::generate(pre_params)),
                1,
            )),
        }
    }

    /// Run key generation for every session, all starting at the same block
    async fn execute(
        &self,
        sessions: Vec<SessionConfig>,
    ) -> Vec<(SessionConfig, Result<(DkgResult, u64)>)> {
        let start_block = self.block_counter.current_block().await.unwrap();

        let handles: Vec<_> = sessions
            .into_iter()
            .map(|session| {
                let channel = Arc::new(self.network.channel("group", vec![session.member_index]));
                let block_counter = self.block_counter.clone();
                let validator = self.validator.clone();
                let executor = self.executor.clone();
                tokio::spawn(async move {
                    let outcome = executor
                        .execute(&session, start_block, block_counter, channel, validator)
                        .await;
                    (session, outcome)
                })
            })
            .collect();

        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.await.unwrap());
        }
        outcomes
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_members_generate_and_publish_a_key() {
    let harness = Harness::new(3, 3);
    let sessions = (1..=3)
        .map(|index| SessionConfig::new("session-full", index, 3, 1).unwrap())
        .collect();

    let outcomes = harness.execute(sessions).await;

    let mut finished = Vec::new();
    for (session, outcome) in outcomes {
        let (result, end_block) = outcome.unwrap();
        assert!(result.misbehaved().is_empty());
        assert_eq!(result.group_public_key_bytes().len(), 65);
        finished.push((session, result, end_block));
    }
    let group_key = finished[0].1.group_public_key_bytes().to_vec();
    for (_, result, _) in &finished {
        assert_eq!(result.group_public_key_bytes(), group_key.as_slice());
    }

    // Publication starts at a common block for every member
    let start_block = finished.iter().map(|(_, _, end)| *end).max().unwrap();
    let submitter = Arc::new(RecordingSubmitter::default());

    let handles: Vec<_> = finished
        .into_iter()
        .map(|(session, result, _)| {
            let channel = Arc::new(
                harness
                    .network
                    .channel("publication", vec![session.member_index]),
            );
            let publisher = Publisher::new(
                Arc::new(HashSigner {
                    public_key: vec![session.member_index],
                }),
                submitter.clone(),
            );
            let block_counter = harness.block_counter.clone();
            let validator = harness.validator.clone();
            tokio::spawn(async move {
                publisher
                    .publish(&session, result, start_block, block_counter, channel, validator)
                    .await
            })
        })
        .collect();

    for handle in handles {
        let end_block = handle.await.unwrap().unwrap();
        assert!(end_block >= start_block + tecdsa_dkg::dkg::pre_publication_blocks());
    }

    let mut submissions = submitter.submissions.lock().await.clone();
    submissions.sort();
    assert_eq!(submissions.len(), 3);
    for (i, (member, signers, submission_block)) in submissions.into_iter().enumerate() {
        assert_eq!(member as usize, i + 1);
        assert_eq!(signers, vec![1, 2, 3]);
        assert_eq!(
            submission_block,
            start_block + tecdsa_dkg::dkg::pre_publication_blocks()
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_excluded_member_is_reported_as_misbehaved() {
    let harness = Harness::new(4, 3);
    let sessions = (1..=3)
        .map(|index| {
            SessionConfig::new("session-excluded", index, 4, 1)
                .unwrap()
                .with_excluded_members(vec![4])
        })
        .collect();

    let outcomes = harness.execute(sessions).await;

    let mut group_keys = Vec::new();
    for (_, outcome) in outcomes {
        let (result, _) = outcome.unwrap();
        assert_eq!(result.misbehaved(), &[4]);
        assert_eq!(result.group().disqualified_member_ids(), vec![4]);
        group_keys.push(result.group_public_key_bytes().to_vec());
    }
    assert!(group_keys.windows(2).all(|pair| pair[0] == pair[1]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_absent_member_aborts_the_session() {
    let harness = Harness::new(3, 2);
    let sessions = (1..=2)
        .map(|index| SessionConfig::new("session-absent", index, 3, 1).unwrap())
        .collect();

    let outcomes = harness.execute(sessions).await;

    for (_, outcome) in outcomes {
        match outcome {
            Err(Error::InactiveMembers { members }) => assert_eq!(members, vec![3]),
            Err(err) => panic!("unexpected error: {err}"),
            Ok(_) => panic!("session should have been aborted"),
        }
    }
}
