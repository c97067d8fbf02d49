//! Entry points running one DKG session and publishing its result

use super::marshaling::register_unmarshalers;
use super::member::{Member, SigningMember};
use super::pre_params::PreParamsSource;
use super::result::{DkgResult, ResultSigner, ResultSubmitter};
use super::states::{
    EphemeralKeyPairGenerationState, FinalizationState, PublicationContext, ResultSigningState,
    StateContext,
};
use crate::group::{Group, MemberIndex, MembershipValidator, MAX_MEMBER_INDEX};
use crate::net::BroadcastChannel;
use crate::state::{BlockCounter, Machine, MessageHistory};
use crate::{Error, Result};
use std::sync::Arc;
use tracing::{info, instrument};

/// Parameters of one member's participation in a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Identifier shared by all members of the session
    pub session_id: String,

    /// This member's 1-based index
    pub member_index: MemberIndex,

    pub group_size: usize,

    /// Number of faulty members the group tolerates
    pub dishonest_threshold: usize,

    /// Members left out of the session on purpose
    pub excluded_members: Vec<MemberIndex>,
}

impl SessionConfig {
    /// Create a session configuration with no excluded members
    pub fn new(
        session_id: impl Into<String>,
        member_index: MemberIndex,
        group_size: usize,
        dishonest_threshold: usize,
    ) -> Result<Self> {
        if group_size == 0 || group_size > MAX_MEMBER_INDEX as usize {
            return Err(Error::InvalidConfig(format!(
                "group size must be between 1 and {MAX_MEMBER_INDEX}, got {group_size}"
            )));
        }
        if dishonest_threshold >= group_size {
            return Err(Error::InvalidConfig(format!(
                "dishonest threshold {dishonest_threshold} must be lower than group size {group_size}"
            )));
        }
        if member_index == 0 || member_index as usize > group_size {
            return Err(Error::InvalidConfig(format!(
                "member index {member_index} out of range for group size {group_size}"
            )));
        }

        Ok(Self {
            session_id: session_id.into(),
            member_index,
            group_size,
            dishonest_threshold,
            excluded_members: Vec::new(),
        })
    }

    pub fn with_excluded_members(mut self, excluded_members: Vec<MemberIndex>) -> Self {
        self.excluded_members = excluded_members;
        self
    }
}

/// Runs key generation sessions
pub struct Executor {
    pre_params: Arc<dyn PreParamsSource>,
    key_generation_concurrency: usize,
}

impl Executor {
    pub fn new(pre_params: Arc<dyn PreParamsSource>, key_generation_concurrency: usize) -> Self {
        Self {
            pre_params,
            key_generation_concurrency: key_generation_concurrency.max(1),
        }
    }

    /// Run one session starting at `start_block`.
    ///
    /// Returns the result together with the block at which key generation
    /// ended.
    #[instrument(
        skip_all,
        fields(session_id = %session.session_id, member = session.member_index)
    )]
    pub async fn execute(
        &self,
        session: &SessionConfig,
        start_block: u64,
        block_counter: Arc<dyn BlockCounter>,
        channel: Arc<dyn BroadcastChannel>,
        membership_validator: Arc<dyn MembershipValidator>,
    ) -> Result<(DkgResult, u64)> {
        register_unmarshalers(&*channel);

        let pre_params = self
            .pre_params
            .get()
            .await
            .map_err(|e| Error::PreParamsUnavailable(e.to_string()))?;

        let member = Member::new(
            session.member_index,
            Group::new(session.dishonest_threshold, session.group_size),
            membership_validator,
            session.session_id.clone(),
            self.key_generation_concurrency,
        );
        for excluded in &session.excluded_members {
            if *excluded != session.member_index {
                member.mark_member_as_disqualified(*excluded);
            }
        }

        info!(start_block, "Starting DKG");

        let initial_state = EphemeralKeyPairGenerationState::new(
            StateContext::new(channel.clone(), member.clone()),
            member.initialize_ephemeral_keys_generation(pre_params),
        );
        let (last_state, end_block) = Machine::new(channel, block_counter, Box::new(initial_state))
            .execute(start_block)
            .await?;

        let name = last_state.name();
        let finalization = last_state
            .into_any()
            .downcast::<FinalizationState>()
            .map_err(|_| Error::UnexpectedFinalState(name.to_string()))?;
        let result = (*finalization).into_result()?;

        info!(
            end_block,
            misbehaved = ?result.misbehaved(),
            group_public_key = %hex::encode(result.group_public_key_bytes()),
            "DKG finished"
        );
        Ok((result, end_block))
    }
}

/// Signs a result, gathers the other members' signatures and submits it
pub struct Publisher {
    signer: Arc<dyn ResultSigner>,
    submitter: Arc<dyn ResultSubmitter>,
}

impl Publisher {
    pub fn new(signer: Arc<dyn ResultSigner>, submitter: Arc<dyn ResultSubmitter>) -> Self {
        Self { signer, submitter }
    }

    /// Publish `result` starting at `start_block`. Returns the block at which
    /// publication ended.
    #[instrument(
        skip_all,
        fields(session_id = %session.session_id, member = session.member_index)
    )]
    pub async fn publish(
        &self,
        session: &SessionConfig,
        result: DkgResult,
        start_block: u64,
        block_counter: Arc<dyn BlockCounter>,
        channel: Arc<dyn BroadcastChannel>,
        membership_validator: Arc<dyn MembershipValidator>,
    ) -> Result<u64> {
        register_unmarshalers(&*channel);

        let member = SigningMember::new(
            session.member_index,
            result.group().clone(),
            membership_validator,
            session.session_id.clone(),
        );
        let context = PublicationContext {
            channel: channel.clone(),
            history: MessageHistory::new(),
            result: Arc::new(result),
            signer: self.signer.clone(),
            submitter: self.submitter.clone(),
            start_block,
        };

        let (_, end_block) = Machine::new(
            channel,
            block_counter,
            Box::new(ResultSigningState::new(context, member)),
        )
        .execute(start_block)
        .await?;

        info!(end_block, "DKG result published");
        Ok(end_block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dkg::pre_params::PreParams;
    use crate::group::StaticMembershipValidator;
    use crate::net::LocalNetwork;
    use crate::state::LocalBlockCounter;
    use async_trait::async_trait;
    use std::time::Duration;

    #[test]
    fn test_session_config_validation() {
        assert!(SessionConfig::new("s", 1, 3, 1).is_ok());
        assert!(SessionConfig::new("s", 3, 3, 2).is_ok());

        for (member_index, group_size, dishonest_threshold) in
            [(1, 3, 3), (0, 3, 1), (4, 3, 1), (1, 0, 0), (1, 256, 1)]
        {
            let err = SessionConfig::new("s", member_index, group_size, dishonest_threshold)
                .unwrap_err();
            assert!(matches!(err, Error::InvalidConfig(_)), "{err}");
        }
    }

    struct UnavailablePreParams;

    #[async_trait]
    impl PreParamsSource for UnavailablePreParams {
        async fn get(&self) -> Result<PreParams> {
            Err(Error::Internal("pool closed".into()))
        }
    }

    #[tokio::test]
    async fn test_execute_fails_without_pre_params() {
        let network = LocalNetwork::new();
        let channel = Arc::new(network.channel("group", vec![1]));
        let executor = Executor::new(Arc::new(UnavailablePreParams), 1);
        let session = SessionConfig::new("session", 1, 3, 1).unwrap();

        let err = executor
            .execute(
                &session,
                0,
                Arc::new(LocalBlockCounter::start(Duration::from_millis(10))),
                channel,
                Arc::new(StaticMembershipValidator::new([(1, vec![1])])),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::PreParamsUnavailable(_)));
        assert!(err.to_string().starts_with("failed fetching pre-params"));
    }
}
