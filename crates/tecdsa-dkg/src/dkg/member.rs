//! Member state, one type per protocol phase
//!
//! Each phase consumes the previous one, so data a phase no longer needs
//! (ephemeral private keys, pre-parameters) is dropped as soon as it has been
//! used.

use super::identity::IdentityConverter;
use super::message::*;
use super::pre_params::PreParams;
use super::result::{DkgResult, PrivateKeyShare, ResultHash, ResultSigner, ResultSubmitter, SignedResult};
use crate::ephemeral::{EphemeralKeyPair, SymmetricKey};
use crate::group::{Group, InactiveMemberFilter, MemberIndex, MembershipValidator};
use crate::tss::{LocalKeygenParty, LocalPartySaveData, Parameters, PartyId, TssMessage};
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, instrument, warn};

/// Identity and session data shared by every phase
#[derive(Clone)]
pub(crate) struct Member {
    id: MemberIndex,
    group: Arc<RwLock<Group>>,
    membership_validator: Arc<dyn MembershipValidator>,
    session_id: String,
    key_generation_concurrency: usize,
    identity_converter: IdentityConverter,
}

impl Member {
    pub(crate) fn new(
        id: MemberIndex,
        group: Group,
        membership_validator: Arc<dyn MembershipValidator>,
        session_id: impl Into<String>,
        key_generation_concurrency: usize,
    ) -> Self {
        let session_id = session_id.into();
        Self {
            id,
            group: Arc::new(RwLock::new(group)),
            membership_validator,
            identity_converter: IdentityConverter::for_session(&session_id),
            session_id,
            key_generation_concurrency,
        }
    }

    pub(crate) fn id(&self) -> MemberIndex {
        self.id
    }

    pub(crate) fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Snapshot of the group
    pub(crate) fn group(&self) -> Group {
        self.group.read().clone()
    }

    pub(crate) fn operating_member_count(&self) -> usize {
        self.group.read().operating_member_ids().len()
    }

    pub(crate) fn mark_member_as_disqualified(&self, member: MemberIndex) {
        self.group.write().mark_member_as_disqualified(member);
    }

    /// Accept a message only from another member whose network key matches
    /// its claimed index and who is still operating
    pub(crate) fn should_accept_message(&self, sender_id: MemberIndex, sender_public_key: &[u8]) -> bool {
        sender_id != self.id
            && self
                .membership_validator
                .is_valid_membership(sender_id, sender_public_key)
            && self.group.read().is_operating(sender_id)
    }

    /// Mark every operating member that did not send one of `messages` as
    /// inactive
    pub(crate) fn mark_inactive_members<M: ProtocolMessage>(&self, messages: &[Arc<M>]) {
        let mut filter = InactiveMemberFilter::new(self.id);
        for message in messages {
            filter.mark_member_as_active(message.sender_id());
        }
        filter.flush_inactive_members(&mut self.group.write());
    }

    /// Fail when any member was marked inactive during the session
    pub(crate) fn ensure_no_inactive_members(&self) -> Result<()> {
        let inactive = self.group.read().inactive_member_ids();
        if inactive.is_empty() {
            return Ok(());
        }

        warn!(
            member = self.id,
            session_id = %self.session_id,
            inactive = ?inactive,
            "Inactive members detected"
        );
        Err(Error::InactiveMembers { members: inactive })
    }

    pub(crate) fn initialize_ephemeral_keys_generation(
        self,
        pre_params: PreParams,
    ) -> EphemeralKeyPairGeneratingMember {
        EphemeralKeyPairGeneratingMember {
            member: self,
            pre_params,
            ephemeral_key_pairs: BTreeMap::new(),
        }
    }
}

/// Phase one: generating an ephemeral key pair for every other member
pub(crate) struct EphemeralKeyPairGeneratingMember {
    member: Member,
    pre_params: PreParams,
    ephemeral_key_pairs: BTreeMap<MemberIndex, EphemeralKeyPair>,
}

impl EphemeralKeyPairGeneratingMember {
    /// Generate one key pair per other operating member and announce the
    /// public halves
    pub(crate) fn generate_ephemeral_key_pair(&mut self) -> Result<EphemeralPublicKeyMessage> {
        let others: Vec<MemberIndex> = self
            .member
            .group
            .read()
            .operating_member_ids()
            .into_iter()
            .filter(|id| *id != self.member.id)
            .collect();

        let mut ephemeral_public_keys = BTreeMap::new();
        for other in others {
            let key_pair = EphemeralKeyPair::generate();
            ephemeral_public_keys.insert(other, *key_pair.public_key());
            self.ephemeral_key_pairs.insert(other, key_pair);
        }

        debug!(
            member = self.member.id,
            key_pairs = ephemeral_public_keys.len(),
            "Generated ephemeral key pairs"
        );

        Ok(EphemeralPublicKeyMessage {
            sender_id: self.member.id,
            ephemeral_public_keys,
            session_id: self.member.session_id.clone(),
        })
    }

    pub(crate) fn initialize_symmetric_key_generation(self) -> SymmetricKeyGeneratingMember {
        SymmetricKeyGeneratingMember {
            member: self.member,
            pre_params: self.pre_params,
            ephemeral_key_pairs: self.ephemeral_key_pairs,
            symmetric_keys: BTreeMap::new(),
        }
    }
}

/// Phase two: deriving one symmetric key per peer
pub(crate) struct SymmetricKeyGeneratingMember {
    member: Member,
    pre_params: PreParams,
    ephemeral_key_pairs: BTreeMap<MemberIndex, EphemeralKeyPair>,
    symmetric_keys: BTreeMap<MemberIndex, SymmetricKey>,
}

impl SymmetricKeyGeneratingMember {
    pub(crate) fn member(&self) -> &Member {
        &self.member
    }

    pub(crate) fn mark_inactive_members(&self, messages: &[Arc<EphemeralPublicKeyMessage>]) {
        self.member.mark_inactive_members(messages);
    }

    /// ECDH the key each sender generated for this member with the local
    /// private key generated for that sender
    pub(crate) fn generate_symmetric_keys(
        &mut self,
        messages: &[Arc<EphemeralPublicKeyMessage>],
    ) -> Result<()> {
        for message in messages {
            let sender = message.sender_id;

            let peer_public_key = message.public_key_for(self.member.id).ok_or_else(|| {
                Error::InvalidMessage(format!(
                    "ephemeral public key for member [{}] not found in message from member [{sender}]",
                    self.member.id
                ))
            })?;

            let key_pair = self.ephemeral_key_pairs.get(&sender).ok_or_else(|| {
                Error::InvalidMessage(format!(
                    "ephemeral key pair for member [{sender}] does not exist"
                ))
            })?;

            self.symmetric_keys
                .insert(sender, key_pair.ecdh(peer_public_key));
        }

        debug!(
            member = self.member.id,
            symmetric_keys = self.symmetric_keys.len(),
            "Generated symmetric keys"
        );
        Ok(())
    }

    /// Create the keygen party over the operating members, consuming the
    /// pre-parameters
    pub(crate) fn initialize_tss_round_one(self) -> Result<TssRoundOneMember> {
        let group = self.member.group();
        let converter = self.member.identity_converter;

        let party_ids: Vec<PartyId> = group
            .operating_member_ids()
            .into_iter()
            .map(|id| converter.member_index_to_tss_party_id(id))
            .collect();
        let party_id = converter.member_index_to_tss_party_id(self.member.id);
        let threshold = group.honest_threshold().checked_sub(1).ok_or_else(|| {
            Error::Internal("honest threshold must be at least one".into())
        })?;

        let parameters = Parameters::new(party_ids, party_id, threshold)
            .map_err(|e| Error::tss("invalid TSS parameters", e))?
            .with_concurrency(self.member.key_generation_concurrency);

        let (outgoing_sender, tss_outgoing) = unbounded_channel();
        let (result_sender, tss_result) = unbounded_channel();
        let tss_party = LocalKeygenParty::new(
            parameters.clone(),
            self.pre_params.into_data(),
            outgoing_sender,
            result_sender,
        );

        Ok(TssRoundOneMember(TssMember {
            member: self.member,
            symmetric_keys: self.symmetric_keys,
            tss_party,
            tss_parameters: parameters,
            tss_outgoing,
            tss_result,
        }))
    }
}

/// Everything the TSS phases share
pub(crate) struct TssMember {
    member: Member,
    symmetric_keys: BTreeMap<MemberIndex, SymmetricKey>,
    tss_party: LocalKeygenParty,
    tss_parameters: Parameters,
    tss_outgoing: UnboundedReceiver<TssMessage>,
    tss_result: UnboundedReceiver<LocalPartySaveData>,
}

impl TssMember {
    /// Party id of `sender`, which must take part in the keygen
    fn sender_party_id(&self, sender: MemberIndex) -> Result<PartyId> {
        let key = self
            .member
            .identity_converter
            .member_index_to_tss_party_id(sender)
            .key;
        self.tss_parameters
            .find_by_key(key)
            .cloned()
            .ok_or_else(|| Error::InvalidMessage(format!("member [{sender}] is not a TSS party")))
    }

    fn party_member_index(&self, party_id: &PartyId) -> Result<MemberIndex> {
        self.member
            .identity_converter
            .tss_party_id_to_member_index(party_id)
            .ok_or_else(|| {
                Error::InvalidMessage(format!(
                    "cannot convert TSS party ID [{party_id}] to a member index"
                ))
            })
    }

    fn symmetric_key(&self, member: MemberIndex) -> Result<&SymmetricKey> {
        self.symmetric_keys.get(&member).ok_or_else(|| {
            Error::InvalidMessage(format!("cannot get symmetric key with member [{member}]"))
        })
    }

    async fn next_outgoing(&mut self, deadline: Instant) -> Option<TssMessage> {
        timeout_at(deadline, self.tss_outgoing.recv())
            .await
            .ok()
            .flatten()
    }

    async fn next_broadcast(&mut self, deadline: Instant) -> Option<Vec<u8>> {
        while let Some(message) = self.next_outgoing(deadline).await {
            if message.is_broadcast() {
                return Some(message.payload);
            }
            warn!(member = self.member.id, "Dropping unexpected direct TSS message");
        }
        None
    }
}

/// Phase three: TSS round one
pub(crate) struct TssRoundOneMember(TssMember);

impl TssRoundOneMember {
    /// Start the keygen party and wrap its round-one broadcast
    #[instrument(skip_all, fields(member = self.0.member.id))]
    pub(crate) async fn tss_round_one(&mut self, deadline: Instant) -> Result<TssRoundOneMessage> {
        self.0
            .tss_party
            .start()
            .map_err(|e| Error::tss("cannot start TSS round one", e))?;

        let broadcast_payload = self.0.next_broadcast(deadline).await.ok_or_else(|| {
            Error::Timeout("TSS round one outgoing message was not generated on time".into())
        })?;

        Ok(TssRoundOneMessage {
            sender_id: self.0.member.id,
            broadcast_payload,
            session_id: self.0.member.session_id.clone(),
        })
    }

    pub(crate) fn initialize_tss_round_two(self) -> TssRoundTwoMember {
        TssRoundTwoMember(self.0)
    }
}

/// Phase four: TSS round two
pub(crate) struct TssRoundTwoMember(TssMember);

impl TssRoundTwoMember {
    pub(crate) fn member(&self) -> &Member {
        &self.0.member
    }

    pub(crate) fn mark_inactive_members(&self, messages: &[Arc<TssRoundOneMessage>]) {
        self.0.member.mark_inactive_members(messages);
    }

    /// Feed round-one payloads and collect the round-two broadcast plus one
    /// encrypted payload per peer
    #[instrument(skip_all, fields(member = self.0.member.id))]
    pub(crate) async fn tss_round_two(
        &mut self,
        messages: &[Arc<TssRoundOneMessage>],
        deadline: Instant,
    ) -> Result<TssRoundTwoMessage> {
        for message in messages {
            let from = self.0.sender_party_id(message.sender_id)?;
            self.0
                .tss_party
                .update_from_bytes(&message.broadcast_payload, &from, true)
                .map_err(|e| Error::tss("cannot update using TSS round one message", e))?;
        }

        let peers = self.0.tss_parameters.party_count() - 1;
        let mut broadcast_payload = None;
        let mut peers_payload = BTreeMap::new();

        while broadcast_payload.is_none() || peers_payload.len() < peers {
            let Some(tss_message) = self.0.next_outgoing(deadline).await else {
                return Err(Error::Timeout(
                    "TSS round two outgoing messages were not generated on time".into(),
                ));
            };

            match &tss_message.to {
                None => broadcast_payload = Some(tss_message.payload),
                Some(to) => {
                    let receiver = self.0.party_member_index(to)?;
                    let encrypted = self.0.symmetric_key(receiver)?.encrypt(&tss_message.payload)?;
                    peers_payload.insert(receiver, encrypted);
                }
            }
        }

        Ok(TssRoundTwoMessage {
            sender_id: self.0.member.id,
            broadcast_payload: broadcast_payload.unwrap_or_default(),
            peers_payload,
            session_id: self.0.member.session_id.clone(),
        })
    }

    pub(crate) fn initialize_tss_round_three(self) -> TssRoundThreeMember {
        TssRoundThreeMember(self.0)
    }
}

/// Phase five: TSS round three
pub(crate) struct TssRoundThreeMember(TssMember);

impl TssRoundThreeMember {
    pub(crate) fn member(&self) -> &Member {
        &self.0.member
    }

    pub(crate) fn mark_inactive_members(&self, messages: &[Arc<TssRoundTwoMessage>]) {
        self.0.member.mark_inactive_members(messages);
    }

    /// Decrypt the payload each sender addressed to this member, feed both
    /// parts and collect the round-three broadcast
    #[instrument(skip_all, fields(member = self.0.member.id))]
    pub(crate) async fn tss_round_three(
        &mut self,
        messages: &[Arc<TssRoundTwoMessage>],
        deadline: Instant,
    ) -> Result<TssRoundThreeMessage> {
        let own_id = self.0.member.id;

        for message in messages {
            let sender = message.sender_id;
            let from = self.0.sender_party_id(sender)?;

            let encrypted = message.peers_payload.get(&own_id).ok_or_else(|| {
                Error::InvalidMessage(format!(
                    "TSS round two message from member [{sender}] has no P2P part for member [{own_id}]"
                ))
            })?;
            let decrypted = self.0.symmetric_key(sender)?.decrypt(encrypted).map_err(|e| {
                Error::InvalidMessage(format!(
                    "cannot decrypt P2P part of the TSS round two message from member [{sender}]: [{e}]"
                ))
            })?;

            self.0
                .tss_party
                .update_from_bytes(&message.broadcast_payload, &from, true)
                .map_err(|e| {
                    Error::tss("cannot update using the broadcast part of the TSS round two message", e)
                })?;
            self.0
                .tss_party
                .update_from_bytes(&decrypted, &from, false)
                .map_err(|e| {
                    Error::tss("cannot update using the P2P part of the TSS round two message", e)
                })?;
        }

        let broadcast_payload = self.0.next_broadcast(deadline).await.ok_or_else(|| {
            Error::Timeout("TSS round three outgoing message was not generated on time".into())
        })?;

        Ok(TssRoundThreeMessage {
            sender_id: own_id,
            broadcast_payload,
            session_id: self.0.member.session_id.clone(),
        })
    }

    pub(crate) fn initialize_finalization(self) -> FinalizingMember {
        FinalizingMember {
            tss: self.0,
            tss_result: None,
        }
    }
}

/// Last phase: waiting for the keygen output
pub(crate) struct FinalizingMember {
    tss: TssMember,
    tss_result: Option<LocalPartySaveData>,
}

impl FinalizingMember {
    pub(crate) fn member(&self) -> &Member {
        &self.tss.member
    }

    pub(crate) fn mark_inactive_members(&self, messages: &[Arc<TssRoundThreeMessage>]) {
        self.tss.member.mark_inactive_members(messages);
    }

    /// Feed round-three payloads and wait for the keygen save data
    #[instrument(skip_all, fields(member = self.tss.member.id))]
    pub(crate) async fn tss_finalize(
        &mut self,
        messages: &[Arc<TssRoundThreeMessage>],
        deadline: Instant,
    ) -> Result<()> {
        for message in messages {
            let from = self.tss.sender_party_id(message.sender_id)?;
            self.tss
                .tss_party
                .update_from_bytes(&message.broadcast_payload, &from, true)
                .map_err(|e| Error::tss("cannot update using TSS round three message", e))?;
        }

        match timeout_at(deadline, self.tss.tss_result.recv()).await {
            Ok(Some(save_data)) => {
                info!(
                    member = self.tss.member.id,
                    session_id = %self.tss.member.session_id,
                    "TSS keygen finished"
                );
                self.tss_result = Some(save_data);
                Ok(())
            }
            _ => Err(Error::Timeout("TSS result was not generated on time".into())),
        }
    }

    /// Result of the session; available once [`Self::tss_finalize`] succeeded
    pub(crate) fn result(&self) -> Result<DkgResult> {
        let save_data = self
            .tss_result
            .clone()
            .ok_or_else(|| Error::Internal("TSS result is not available yet".into()))?;
        Ok(DkgResult::new(
            self.tss.member.group(),
            PrivateKeyShare::new(save_data),
        ))
    }
}

/// Member signing its preferred result and collecting the others' signatures
pub(crate) struct SigningMember {
    member_index: MemberIndex,
    group: Group,
    membership_validator: Arc<dyn MembershipValidator>,
    session_id: String,
    preferred_result_hash: Option<ResultHash>,
    self_result_signature: Vec<u8>,
}

impl SigningMember {
    pub(crate) fn new(
        member_index: MemberIndex,
        group: Group,
        membership_validator: Arc<dyn MembershipValidator>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            member_index,
            group,
            membership_validator,
            session_id: session_id.into(),
            preferred_result_hash: None,
            self_result_signature: Vec::new(),
        }
    }

    pub(crate) fn member_index(&self) -> MemberIndex {
        self.member_index
    }

    pub(crate) fn session_id(&self) -> &str {
        &self.session_id
    }

    pub(crate) fn should_accept_message(&self, sender_id: MemberIndex, sender_public_key: &[u8]) -> bool {
        sender_id != self.member_index
            && self
                .membership_validator
                .is_valid_membership(sender_id, sender_public_key)
            && self.group.is_operating(sender_id)
    }

    /// Sign `result` and remember the hash as this member's preference
    pub(crate) fn sign_dkg_result(
        &mut self,
        result: &DkgResult,
        signer: &dyn ResultSigner,
    ) -> Result<ResultSignatureMessage> {
        let signed = signer
            .sign_result(result)
            .map_err(|e| Error::Signing(e.to_string()))?;

        self.preferred_result_hash = Some(signed.result_hash);
        self.self_result_signature = signed.signature.clone();

        Ok(ResultSignatureMessage {
            sender_id: self.member_index,
            result_hash: signed.result_hash,
            signature: signed.signature,
            public_key: signed.public_key,
            session_id: self.session_id.clone(),
        })
    }

    /// Signatures supporting the preferred result hash, this member's own
    /// included.
    ///
    /// A sender that sent more than one message is ignored altogether. The
    /// public key inside each message is expected to be checked against the
    /// network identity before this is called.
    pub(crate) fn verify_dkg_result_signatures(
        &self,
        messages: &[Arc<ResultSignatureMessage>],
        signer: &dyn ResultSigner,
    ) -> BTreeMap<MemberIndex, Vec<u8>> {
        let mut seen = BTreeSet::new();
        let duplicated: BTreeSet<MemberIndex> = messages
            .iter()
            .filter(|message| !seen.insert(message.sender_id))
            .map(|message| message.sender_id)
            .collect();

        let mut signatures = BTreeMap::new();
        for message in messages {
            let sender = message.sender_id;
            if sender == self.member_index {
                continue;
            }
            if duplicated.contains(&sender) {
                info!(member = self.member_index, sender, "Received multiple messages from sender");
                continue;
            }
            if Some(message.result_hash) != self.preferred_result_hash {
                info!(
                    member = self.member_index,
                    sender,
                    "Signature supports a result different than preferred"
                );
                continue;
            }

            let signed = SignedResult {
                public_key: message.public_key.clone(),
                signature: message.signature.clone(),
                result_hash: message.result_hash,
            };
            match signer.verify_signature(&signed) {
                Ok(true) => {
                    signatures.insert(sender, message.signature.clone());
                }
                Ok(false) => {
                    info!(member = self.member_index, sender, "Sender provided invalid signature");
                }
                Err(err) => {
                    info!(member = self.member_index, sender, %err, "Signature verification failed");
                }
            }
        }

        signatures.insert(self.member_index, self.self_result_signature.clone());
        signatures
    }

    pub(crate) fn initialize_submitting_member(&self) -> SubmittingMember {
        SubmittingMember {
            member_index: self.member_index,
        }
    }
}

/// Member handing the result and collected signatures to the submitter
pub(crate) struct SubmittingMember {
    member_index: MemberIndex,
}

impl SubmittingMember {
    pub(crate) fn member_index(&self) -> MemberIndex {
        self.member_index
    }

    pub(crate) async fn submit_dkg_result(
        &self,
        result: &DkgResult,
        signatures: &BTreeMap<MemberIndex, Vec<u8>>,
        start_block: u64,
        submitter: &dyn ResultSubmitter,
    ) -> Result<()> {
        submitter
            .submit_result(self.member_index, result, signatures, start_block)
            .await
            .map_err(|e| Error::Submission(e.to_string()))
    }
}

/// Keep the first message of every sender
pub(crate) fn deduplicate_by_sender<M: ProtocolMessage>(messages: Vec<Arc<M>>) -> Vec<Arc<M>> {
    let mut senders = BTreeSet::new();
    messages
        .into_iter()
        .filter(|message| senders.insert(message.sender_id()))
        .collect()
}
