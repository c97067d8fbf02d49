//! Messages exchanged during one DKG session

use super::result::ResultHash;
use crate::ephemeral::EphemeralPublicKey;
use crate::group::MemberIndex;
use crate::net::NetMessage;
use std::collections::BTreeMap;

pub const EPHEMERAL_PUBLIC_KEY_MESSAGE_TYPE: &str = "tecdsa_dkg/ephemeral_public_key_message";
pub const TSS_ROUND_ONE_MESSAGE_TYPE: &str = "tecdsa_dkg/tss_round_one_message";
pub const TSS_ROUND_TWO_MESSAGE_TYPE: &str = "tecdsa_dkg/tss_round_two_message";
pub const TSS_ROUND_THREE_MESSAGE_TYPE: &str = "tecdsa_dkg/tss_round_three_message";
pub const RESULT_SIGNATURE_MESSAGE_TYPE: &str = "tecdsa_dkg/result_signature_message";

/// Fields every session message carries
pub trait ProtocolMessage: Send + Sync + 'static {
    fn sender_id(&self) -> MemberIndex;
    fn session_id(&self) -> &str;
}

/// Ephemeral public keys generated by the sender, one per receiving member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EphemeralPublicKeyMessage {
    pub(crate) sender_id: MemberIndex,
    pub(crate) ephemeral_public_keys: BTreeMap<MemberIndex, EphemeralPublicKey>,
    pub(crate) session_id: String,
}

impl EphemeralPublicKeyMessage {
    /// Key addressed to `receiver`
    pub fn public_key_for(&self, receiver: MemberIndex) -> Option<&EphemeralPublicKey> {
        self.ephemeral_public_keys.get(&receiver)
    }

    pub fn ephemeral_public_keys(&self) -> &BTreeMap<MemberIndex, EphemeralPublicKey> {
        &self.ephemeral_public_keys
    }
}

/// TSS round one broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TssRoundOneMessage {
    pub(crate) sender_id: MemberIndex,
    pub(crate) broadcast_payload: Vec<u8>,
    pub(crate) session_id: String,
}

impl TssRoundOneMessage {
    pub fn broadcast_payload(&self) -> &[u8] {
        &self.broadcast_payload
    }
}

/// TSS round two broadcast plus one encrypted payload per receiving member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TssRoundTwoMessage {
    pub(crate) sender_id: MemberIndex,
    pub(crate) broadcast_payload: Vec<u8>,
    pub(crate) peers_payload: BTreeMap<MemberIndex, Vec<u8>>,
    pub(crate) session_id: String,
}

impl TssRoundTwoMessage {
    pub fn broadcast_payload(&self) -> &[u8] {
        &self.broadcast_payload
    }

    /// Encrypted payloads keyed by receiver
    pub fn peers_payload(&self) -> &BTreeMap<MemberIndex, Vec<u8>> {
        &self.peers_payload
    }
}

/// TSS round three broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TssRoundThreeMessage {
    pub(crate) sender_id: MemberIndex,
    pub(crate) broadcast_payload: Vec<u8>,
    pub(crate) session_id: String,
}

impl TssRoundThreeMessage {
    pub fn broadcast_payload(&self) -> &[u8] {
        &self.broadcast_payload
    }
}

/// A member's signature over the result hash it prefers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultSignatureMessage {
    pub(crate) sender_id: MemberIndex,
    pub(crate) result_hash: ResultHash,
    pub(crate) signature: Vec<u8>,
    pub(crate) public_key: Vec<u8>,
    pub(crate) session_id: String,
}

impl ResultSignatureMessage {
    pub fn result_hash(&self) -> &ResultHash {
        &self.result_hash
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// Operator key the signature was made with
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }
}

macro_rules! protocol_message {
    ($($message:ty),* $(,)?) => {
        $(
            impl ProtocolMessage for $message {
                fn sender_id(&self) -> MemberIndex {
                    self.sender_id
                }

                fn session_id(&self) -> &str {
                    &self.session_id
                }
            }
        )*
    };
}

protocol_message!(
    EphemeralPublicKeyMessage,
    TssRoundOneMessage,
    TssRoundTwoMessage,
    TssRoundThreeMessage,
    ResultSignatureMessage,
);

/// The key generation message carried by `message`, if it carries one
pub(crate) fn as_key_generation_message(message: &NetMessage) -> Option<&dyn ProtocolMessage> {
    if let Some(m) = message.payload::<EphemeralPublicKeyMessage>() {
        return Some(m);
    }
    if let Some(m) = message.payload::<TssRoundOneMessage>() {
        return Some(m);
    }
    if let Some(m) = message.payload::<TssRoundTwoMessage>() {
        return Some(m);
    }
    message
        .payload::<TssRoundThreeMessage>()
        .map(|m| m as &dyn ProtocolMessage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn round_one(sender_id: MemberIndex) -> TssRoundOneMessage {
        TssRoundOneMessage {
            sender_id,
            broadcast_payload: vec![1, 2, 3],
            session_id: "session-1".into(),
        }
    }

    #[test]
    fn test_key_generation_messages_are_recognized() {
        let message = NetMessage::new(vec![1], TSS_ROUND_ONE_MESSAGE_TYPE, Arc::new(round_one(4)));
        let protocol_message = as_key_generation_message(&message).unwrap();

        assert_eq!(protocol_message.sender_id(), 4);
        assert_eq!(protocol_message.session_id(), "session-1");
    }

    #[test]
    fn test_other_payloads_are_not_key_generation_messages() {
        let signature = ResultSignatureMessage {
            sender_id: 1,
            result_hash: ResultHash::from_bytes(&[0u8; 32]).unwrap(),
            signature: vec![],
            public_key: vec![],
            session_id: "session-1".into(),
        };
        let message = NetMessage::new(vec![1], RESULT_SIGNATURE_MESSAGE_TYPE, Arc::new(signature));
        assert!(as_key_generation_message(&message).is_none());

        let message = NetMessage::new(vec![1], "other", Arc::new(7u32));
        assert!(as_key_generation_message(&message).is_none());
    }
}
