//! Protocol states of key generation and result publication

use super::member::*;
use super::message::*;
use super::result::{DkgResult, ResultSigner, ResultSubmitter};
use crate::group::MemberIndex;
use crate::net::{BroadcastChannel, NetMessage};
use crate::state::{
    MessageHistory, State, Transition, SILENT_STATE_ACTIVE_BLOCKS, SILENT_STATE_DELAY_BLOCKS,
};
use crate::{Error, Result};
use async_trait::async_trait;
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

const EPHEMERAL_KEY_PAIR_STATE_DELAY_BLOCKS: u64 = 1;
const EPHEMERAL_KEY_PAIR_STATE_ACTIVE_BLOCKS: u64 = 5;

const SYMMETRIC_KEY_STATE_DELAY_BLOCKS: u64 = 0;
const SYMMETRIC_KEY_STATE_ACTIVE_BLOCKS: u64 = 0;

const TSS_ROUND_ONE_STATE_DELAY_BLOCKS: u64 = 1;
const TSS_ROUND_ONE_STATE_ACTIVE_BLOCKS: u64 = 5;

const TSS_ROUND_TWO_STATE_DELAY_BLOCKS: u64 = 1;
const TSS_ROUND_TWO_STATE_ACTIVE_BLOCKS: u64 = 5;

const TSS_ROUND_THREE_STATE_DELAY_BLOCKS: u64 = 1;
const TSS_ROUND_THREE_STATE_ACTIVE_BLOCKS: u64 = 5;

const FINALIZATION_STATE_DELAY_BLOCKS: u64 = 1;
const FINALIZATION_STATE_ACTIVE_BLOCKS: u64 = 2;

const RESULT_SIGNING_STATE_DELAY_BLOCKS: u64 = 1;
const RESULT_SIGNING_STATE_ACTIVE_BLOCKS: u64 = 5;

/// Wall-clock estimate of one block, used to bound TSS computations
const BLOCK_TIME_ESTIMATE: Duration = Duration::from_secs(15);

/// Blocks a driver must allot to one session, key generation and result
/// publication together
pub fn protocol_blocks() -> u64 {
    [
        (EPHEMERAL_KEY_PAIR_STATE_DELAY_BLOCKS, EPHEMERAL_KEY_PAIR_STATE_ACTIVE_BLOCKS),
        (SYMMETRIC_KEY_STATE_DELAY_BLOCKS, SYMMETRIC_KEY_STATE_ACTIVE_BLOCKS),
        (TSS_ROUND_ONE_STATE_DELAY_BLOCKS, TSS_ROUND_ONE_STATE_ACTIVE_BLOCKS),
        (TSS_ROUND_TWO_STATE_DELAY_BLOCKS, TSS_ROUND_TWO_STATE_ACTIVE_BLOCKS),
        (TSS_ROUND_THREE_STATE_DELAY_BLOCKS, TSS_ROUND_THREE_STATE_ACTIVE_BLOCKS),
        (FINALIZATION_STATE_DELAY_BLOCKS, FINALIZATION_STATE_ACTIVE_BLOCKS),
        (RESULT_SIGNING_STATE_DELAY_BLOCKS, RESULT_SIGNING_STATE_ACTIVE_BLOCKS),
        (SILENT_STATE_DELAY_BLOCKS, SILENT_STATE_ACTIVE_BLOCKS),
        (SILENT_STATE_DELAY_BLOCKS, SILENT_STATE_ACTIVE_BLOCKS),
    ]
    .iter()
    .map(|(delay, active)| delay + active)
    .sum()
}

/// Blocks between the start of result publication and the moment the result
/// may be submitted
pub fn pre_publication_blocks() -> u64 {
    RESULT_SIGNING_STATE_DELAY_BLOCKS
        + RESULT_SIGNING_STATE_ACTIVE_BLOCKS
        + SILENT_STATE_DELAY_BLOCKS
        + SILENT_STATE_ACTIVE_BLOCKS
}

/// Deadline for the TSS work of a state lasting `delay + active` blocks
fn round_deadline(delay_blocks: u64, active_blocks: u64) -> Instant {
    let blocks = u32::try_from(delay_blocks + active_blocks).unwrap_or(u32::MAX);
    Instant::now() + BLOCK_TIME_ESTIMATE * blocks
}

/// Channel, message history and member shared by the key generation states
#[derive(Clone)]
pub(crate) struct StateContext {
    channel: Arc<dyn BroadcastChannel>,
    history: MessageHistory,
    member: Member,
}

impl StateContext {
    pub(crate) fn new(channel: Arc<dyn BroadcastChannel>, member: Member) -> Self {
        Self {
            channel,
            history: MessageHistory::new(),
            member,
        }
    }

    /// Keep a key generation message from an accepted sender of this session.
    ///
    /// Messages for later phases are kept too; they are consumed once their
    /// state runs.
    fn receive(&self, message: NetMessage) -> Result<()> {
        let Some(protocol_message) = as_key_generation_message(&message) else {
            return Ok(());
        };

        let sender_id = protocol_message.sender_id();
        if !self
            .member
            .should_accept_message(sender_id, message.sender_public_key())
        {
            debug!(
                member = self.member.id(),
                sender = sender_id,
                message_type = message.message_type(),
                "Ignoring message"
            );
            return Ok(());
        }

        if protocol_message.session_id() != self.member.session_id() {
            return Err(Error::InvalidMessage(format!(
                "message from member [{sender_id}] belongs to session [{}]",
                protocol_message.session_id()
            )));
        }

        self.history.push(message);
        Ok(())
    }

    /// Accepted messages of type `M`, one per sender
    fn messages<M: ProtocolMessage>(&self) -> Vec<Arc<M>> {
        deduplicate_by_sender(self.history.payloads::<M>())
    }

    /// Whether every other operating member delivered a message of type `M`
    fn received_from_all<M: ProtocolMessage>(&self) -> bool {
        let expected = self.member.operating_member_count().saturating_sub(1);
        self.messages::<M>().len() >= expected
    }
}

/// Sends ephemeral public keys
pub(crate) struct EphemeralKeyPairGenerationState {
    context: StateContext,
    phase: Mutex<EphemeralKeyPairGeneratingMember>,
}

impl EphemeralKeyPairGenerationState {
    pub(crate) fn new(context: StateContext, phase: EphemeralKeyPairGeneratingMember) -> Self {
        Self {
            context,
            phase: Mutex::new(phase),
        }
    }
}

#[async_trait]
impl State for EphemeralKeyPairGenerationState {
    fn name(&self) -> &'static str {
        "tecdsa_dkg_ephemeral_key_pair_generation"
    }

    fn delay_blocks(&self) -> u64 {
        EPHEMERAL_KEY_PAIR_STATE_DELAY_BLOCKS
    }

    fn active_blocks(&self) -> u64 {
        EPHEMERAL_KEY_PAIR_STATE_ACTIVE_BLOCKS
    }

    async fn initiate(&self) -> Result<()> {
        let message = self.phase.lock().await.generate_ephemeral_key_pair()?;
        self.context.channel.send(&message).await
    }

    fn receive(&self, message: NetMessage) -> Result<()> {
        self.context.receive(message)
    }

    fn can_transition(&self) -> bool {
        self.context.received_from_all::<EphemeralPublicKeyMessage>()
    }

    fn next(self: Box<Self>) -> Result<Transition> {
        let Self { context, phase } = *self;
        Ok(Transition::Next(Box::new(SymmetricKeyGenerationState {
            context,
            phase: Mutex::new(phase.into_inner().initialize_symmetric_key_generation()),
        })))
    }

    fn member_index(&self) -> MemberIndex {
        self.context.member.id()
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// Derives symmetric keys from the collected ephemeral public keys
pub(crate) struct SymmetricKeyGenerationState {
    context: StateContext,
    phase: Mutex<SymmetricKeyGeneratingMember>,
}

#[async_trait]
impl State for SymmetricKeyGenerationState {
    fn name(&self) -> &'static str {
        "tecdsa_dkg_symmetric_key_generation"
    }

    fn delay_blocks(&self) -> u64 {
        SYMMETRIC_KEY_STATE_DELAY_BLOCKS
    }

    fn active_blocks(&self) -> u64 {
        SYMMETRIC_KEY_STATE_ACTIVE_BLOCKS
    }

    async fn initiate(&self) -> Result<()> {
        let mut phase = self.phase.lock().await;
        let messages = self.context.messages::<EphemeralPublicKeyMessage>();

        phase.mark_inactive_members(&messages);
        phase.member().ensure_no_inactive_members()?;

        phase.generate_symmetric_keys(&messages)
    }

    fn receive(&self, message: NetMessage) -> Result<()> {
        self.context.receive(message)
    }

    fn can_transition(&self) -> bool {
        true
    }

    fn next(self: Box<Self>) -> Result<Transition> {
        let Self { context, phase } = *self;
        let phase = phase.into_inner().initialize_tss_round_one().map_err(|e| {
            Error::Internal(format!("cannot initialize TSS round one member: [{e}]"))
        })?;

        Ok(Transition::Next(Box::new(TssRoundOneState {
            context,
            phase: Mutex::new(phase),
        })))
    }

    fn member_index(&self) -> MemberIndex {
        self.context.member.id()
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// Starts the keygen and sends its round-one broadcast
pub(crate) struct TssRoundOneState {
    context: StateContext,
    phase: Mutex<TssRoundOneMember>,
}

#[async_trait]
impl State for TssRoundOneState {
    fn name(&self) -> &'static str {
        "tecdsa_dkg_tss_round_one"
    }

    fn delay_blocks(&self) -> u64 {
        TSS_ROUND_ONE_STATE_DELAY_BLOCKS
    }

    fn active_blocks(&self) -> u64 {
        TSS_ROUND_ONE_STATE_ACTIVE_BLOCKS
    }

    async fn initiate(&self) -> Result<()> {
        let deadline = round_deadline(self.delay_blocks(), self.active_blocks());
        let message = self.phase.lock().await.tss_round_one(deadline).await?;
        self.context.channel.send(&message).await
    }

    fn receive(&self, message: NetMessage) -> Result<()> {
        self.context.receive(message)
    }

    fn can_transition(&self) -> bool {
        self.context.received_from_all::<TssRoundOneMessage>()
    }

    fn next(self: Box<Self>) -> Result<Transition> {
        let Self { context, phase } = *self;
        Ok(Transition::Next(Box::new(TssRoundTwoState {
            context,
            phase: Mutex::new(phase.into_inner().initialize_tss_round_two()),
        })))
    }

    fn member_index(&self) -> MemberIndex {
        self.context.member.id()
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

pub(crate) struct TssRoundTwoState {
    context: StateContext,
    phase: Mutex<TssRoundTwoMember>,
}

#[async_trait]
impl State for TssRoundTwoState {
    fn name(&self) -> &'static str {
        "tecdsa_dkg_tss_round_two"
    }

    fn delay_blocks(&self) -> u64 {
        TSS_ROUND_TWO_STATE_DELAY_BLOCKS
    }

    fn active_blocks(&self) -> u64 {
        TSS_ROUND_TWO_STATE_ACTIVE_BLOCKS
    }

    async fn initiate(&self) -> Result<()> {
        let deadline = round_deadline(self.delay_blocks(), self.active_blocks());
        let mut phase = self.phase.lock().await;
        let messages = self.context.messages::<TssRoundOneMessage>();

        phase.mark_inactive_members(&messages);
        phase.member().ensure_no_inactive_members()?;

        let message = phase.tss_round_two(&messages, deadline).await?;
        self.context.channel.send(&message).await
    }

    fn receive(&self, message: NetMessage) -> Result<()> {
        self.context.receive(message)
    }

    fn can_transition(&self) -> bool {
        self.context.received_from_all::<TssRoundTwoMessage>()
    }

    fn next(self: Box<Self>) -> Result<Transition> {
        let Self { context, phase } = *self;
        Ok(Transition::Next(Box::new(TssRoundThreeState {
            context,
            phase: Mutex::new(phase.into_inner().initialize_tss_round_three()),
        })))
    }

    fn member_index(&self) -> MemberIndex {
        self.context.member.id()
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

pub(crate) struct TssRoundThreeState {
    context: StateContext,
    phase: Mutex<TssRoundThreeMember>,
}

#[async_trait]
impl State for TssRoundThreeState {
    fn name(&self) -> &'static str {
        "tecdsa_dkg_tss_round_three"
    }

    fn delay_blocks(&self) -> u64 {
        TSS_ROUND_THREE_STATE_DELAY_BLOCKS
    }

    fn active_blocks(&self) -> u64 {
        TSS_ROUND_THREE_STATE_ACTIVE_BLOCKS
    }

    async fn initiate(&self) -> Result<()> {
        let deadline = round_deadline(self.delay_blocks(), self.active_blocks());
        let mut phase = self.phase.lock().await;
        let messages = self.context.messages::<TssRoundTwoMessage>();

        phase.mark_inactive_members(&messages);
        phase.member().ensure_no_inactive_members()?;

        let message = phase.tss_round_three(&messages, deadline).await?;
        self.context.channel.send(&message).await
    }

    fn receive(&self, message: NetMessage) -> Result<()> {
        self.context.receive(message)
    }

    fn can_transition(&self) -> bool {
        self.context.received_from_all::<TssRoundThreeMessage>()
    }

    fn next(self: Box<Self>) -> Result<Transition> {
        let Self { context, phase } = *self;
        Ok(Transition::Next(Box::new(FinalizationState {
            context,
            phase: Mutex::new(phase.into_inner().initialize_finalization()),
        })))
    }

    fn member_index(&self) -> MemberIndex {
        self.context.member.id()
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// Last key generation state, waiting for the keygen output
pub(crate) struct FinalizationState {
    context: StateContext,
    phase: Mutex<FinalizingMember>,
}

impl FinalizationState {
    pub(crate) fn into_result(self) -> Result<DkgResult> {
        self.phase.into_inner().result()
    }
}

#[async_trait]
impl State for FinalizationState {
    fn name(&self) -> &'static str {
        "tecdsa_dkg_finalization"
    }

    fn delay_blocks(&self) -> u64 {
        FINALIZATION_STATE_DELAY_BLOCKS
    }

    fn active_blocks(&self) -> u64 {
        FINALIZATION_STATE_ACTIVE_BLOCKS
    }

    async fn initiate(&self) -> Result<()> {
        let deadline = round_deadline(self.delay_blocks(), self.active_blocks());
        let mut phase = self.phase.lock().await;
        let messages = self.context.messages::<TssRoundThreeMessage>();

        phase.mark_inactive_members(&messages);
        phase.member().ensure_no_inactive_members()?;

        phase.tss_finalize(&messages, deadline).await
    }

    fn receive(&self, message: NetMessage) -> Result<()> {
        self.context.receive(message)
    }

    fn can_transition(&self) -> bool {
        true
    }

    fn next(self: Box<Self>) -> Result<Transition> {
        Ok(Transition::Final(self))
    }

    fn member_index(&self) -> MemberIndex {
        self.context.member.id()
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// Inputs shared by the result publication states
#[derive(Clone)]
pub(crate) struct PublicationContext {
    pub(crate) channel: Arc<dyn BroadcastChannel>,
    pub(crate) history: MessageHistory,
    pub(crate) result: Arc<DkgResult>,
    pub(crate) signer: Arc<dyn ResultSigner>,
    pub(crate) submitter: Arc<dyn ResultSubmitter>,
    pub(crate) start_block: u64,
}

/// Signs the result and collects the other members' signatures
pub(crate) struct ResultSigningState {
    context: PublicationContext,
    member: parking_lot::Mutex<SigningMember>,
}

impl ResultSigningState {
    pub(crate) fn new(context: PublicationContext, member: SigningMember) -> Self {
        Self {
            context,
            member: parking_lot::Mutex::new(member),
        }
    }
}

#[async_trait]
impl State for ResultSigningState {
    fn name(&self) -> &'static str {
        "dkg_result_signing"
    }

    fn delay_blocks(&self) -> u64 {
        RESULT_SIGNING_STATE_DELAY_BLOCKS
    }

    fn active_blocks(&self) -> u64 {
        RESULT_SIGNING_STATE_ACTIVE_BLOCKS
    }

    async fn initiate(&self) -> Result<()> {
        let message = self
            .member
            .lock()
            .sign_dkg_result(&self.context.result, &*self.context.signer)?;
        self.context.channel.send(&message).await
    }

    fn receive(&self, message: NetMessage) -> Result<()> {
        let Some(signature) = message.payload::<ResultSignatureMessage>() else {
            return Ok(());
        };

        let member = self.member.lock();
        let accepted = member.should_accept_message(signature.sender_id(), message.sender_public_key())
            && signature.public_key() == message.sender_public_key()
            && signature.session_id() == member.session_id();

        if accepted {
            self.context.history.push(message);
        } else {
            debug!(
                member = member.member_index(),
                sender = signature.sender_id(),
                "Ignoring result signature message"
            );
        }
        Ok(())
    }

    fn next(self: Box<Self>) -> Result<Transition> {
        let Self { context, member } = *self;
        Ok(Transition::Next(Box::new(SignaturesVerificationState {
            context,
            member: member.into_inner(),
            signatures: parking_lot::Mutex::new(BTreeMap::new()),
        })))
    }

    fn member_index(&self) -> MemberIndex {
        self.member.lock().member_index()
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// Keeps the valid signatures that support this member's result
pub(crate) struct SignaturesVerificationState {
    context: PublicationContext,
    member: SigningMember,
    signatures: parking_lot::Mutex<BTreeMap<MemberIndex, Vec<u8>>>,
}

#[async_trait]
impl State for SignaturesVerificationState {
    fn name(&self) -> &'static str {
        "dkg_signatures_verification"
    }

    fn delay_blocks(&self) -> u64 {
        SILENT_STATE_DELAY_BLOCKS
    }

    fn active_blocks(&self) -> u64 {
        SILENT_STATE_ACTIVE_BLOCKS
    }

    async fn initiate(&self) -> Result<()> {
        let messages = self.context.history.payloads::<ResultSignatureMessage>();
        let signatures = self
            .member
            .verify_dkg_result_signatures(&messages, &*self.context.signer);

        info!(
            member = self.member.member_index(),
            signatures = signatures.len(),
            "Verified DKG result signatures"
        );
        *self.signatures.lock() = signatures;
        Ok(())
    }

    fn receive(&self, _message: NetMessage) -> Result<()> {
        Ok(())
    }

    fn can_transition(&self) -> bool {
        true
    }

    fn next(self: Box<Self>) -> Result<Transition> {
        let Self {
            context,
            member,
            signatures,
        } = *self;
        Ok(Transition::Next(Box::new(ResultSubmissionState {
            context,
            member: member.initialize_submitting_member(),
            signatures: signatures.into_inner(),
        })))
    }

    fn member_index(&self) -> MemberIndex {
        self.member.member_index()
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// Hands the result and its signatures to the submitter
pub(crate) struct ResultSubmissionState {
    context: PublicationContext,
    member: SubmittingMember,
    signatures: BTreeMap<MemberIndex, Vec<u8>>,
}

#[async_trait]
impl State for ResultSubmissionState {
    fn name(&self) -> &'static str {
        "dkg_result_submission"
    }

    fn delay_blocks(&self) -> u64 {
        SILENT_STATE_DELAY_BLOCKS
    }

    fn active_blocks(&self) -> u64 {
        SILENT_STATE_ACTIVE_BLOCKS
    }

    async fn initiate(&self) -> Result<()> {
        let submission_start_block = self.context.start_block + pre_publication_blocks();
        self.member
            .submit_dkg_result(
                &self.context.result,
                &self.signatures,
                submission_start_block,
                &*self.context.submitter,
            )
            .await
    }

    fn receive(&self, _message: NetMessage) -> Result<()> {
        Ok(())
    }

    fn can_transition(&self) -> bool {
        true
    }

    fn next(self: Box<Self>) -> Result<Transition> {
        Ok(Transition::Final(self))
    }

    fn member_index(&self) -> MemberIndex {
        self.member.member_index()
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_blocks() {
        assert_eq!(protocol_blocks(), 33);
        assert_eq!(pre_publication_blocks(), 6);
    }

    #[test]
    fn test_round_deadline() {
        let before = Instant::now();
        let deadline = round_deadline(1, 5);
        assert!(deadline >= before + Duration::from_secs(90));
        assert!(deadline <= Instant::now() + Duration::from_secs(90));
    }
}
