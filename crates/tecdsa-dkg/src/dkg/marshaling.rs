//! Binary wire encoding of session messages and pre-parameters
//!
//! Every type is mirrored by a plain serde struct encoded with bincode's
//! standard configuration. Member indexes travel as `u32` and are bounds
//! checked on decode.

use super::message::*;
use super::pre_params::PreParams;
use super::result::ResultHash;
use crate::ephemeral::EphemeralPublicKey;
use crate::group::{MemberIndex, MAX_MEMBER_INDEX};
use crate::net::{BroadcastChannel, Payload, TaggedMarshaler, Unmarshaler};
use crate::tss::{LocalPreParams, PaillierPrivateKey};
use crate::{Error, Result};
use chrono::{TimeZone, Utc};
use libpaillier::unknown_order::BigNumber;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Serialize, Deserialize)]
struct EphemeralPublicKeyWire {
    sender_id: u32,
    ephemeral_public_keys: BTreeMap<u32, Vec<u8>>,
    session_id: String,
}

#[derive(Serialize, Deserialize)]
struct BroadcastWire {
    sender_id: u32,
    broadcast_payload: Vec<u8>,
    session_id: String,
}

#[derive(Serialize, Deserialize)]
struct TssRoundTwoWire {
    sender_id: u32,
    broadcast_payload: Vec<u8>,
    peers_payload: BTreeMap<u32, Vec<u8>>,
    session_id: String,
}

#[derive(Serialize, Deserialize)]
struct ResultSignatureWire {
    sender_id: u32,
    result_hash: Vec<u8>,
    signature: Vec<u8>,
    public_key: Vec<u8>,
    session_id: String,
}

#[derive(Serialize, Deserialize)]
struct PreParamsWire {
    paillier_n: Vec<u8>,
    paillier_lambda_n: Vec<u8>,
    paillier_phi_n: Vec<u8>,
    ntilde: Vec<u8>,
    h1i: Vec<u8>,
    h2i: Vec<u8>,
    alpha: Vec<u8>,
    beta: Vec<u8>,
    p: Vec<u8>,
    q: Vec<u8>,
    created_at_secs: i64,
    created_at_nanos: u32,
}

fn encode<T: Serialize>(wire: &T) -> Result<Vec<u8>> {
    Ok(bincode::serde::encode_to_vec(wire, bincode::config::standard())?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(wire, _)| wire)
        .map_err(Error::from)
}

/// Convert a wire member index, rejecting values that do not fit
pub(crate) fn validate_member_index(index: u32) -> Result<MemberIndex> {
    if index > MAX_MEMBER_INDEX {
        return Err(Error::Deserialization(format!(
            "invalid member index value: [{index}]"
        )));
    }
    Ok(index as MemberIndex)
}

fn marshal_member_map<V>(
    map: &BTreeMap<MemberIndex, V>,
    value: impl Fn(&V) -> Vec<u8>,
) -> BTreeMap<u32, Vec<u8>> {
    map.iter()
        .map(|(index, v)| (u32::from(*index), value(v)))
        .collect()
}

impl TaggedMarshaler for EphemeralPublicKeyMessage {
    fn message_type(&self) -> &'static str {
        EPHEMERAL_PUBLIC_KEY_MESSAGE_TYPE
    }

    fn marshal(&self) -> Result<Vec<u8>> {
        encode(&EphemeralPublicKeyWire {
            sender_id: u32::from(self.sender_id),
            ephemeral_public_keys: marshal_member_map(&self.ephemeral_public_keys, |key| {
                key.to_bytes().to_vec()
            }),
            session_id: self.session_id.clone(),
        })
    }
}

impl EphemeralPublicKeyMessage {
    pub fn unmarshal(bytes: &[u8]) -> Result<Self> {
        let wire: EphemeralPublicKeyWire = decode(bytes)?;

        let ephemeral_public_keys = wire
            .ephemeral_public_keys
            .iter()
            .map(|(index, key)| {
                Ok((validate_member_index(*index)?, EphemeralPublicKey::from_bytes(key)?))
            })
            .collect::<Result<_>>()?;

        Ok(Self {
            sender_id: validate_member_index(wire.sender_id)?,
            ephemeral_public_keys,
            session_id: wire.session_id,
        })
    }
}

impl TaggedMarshaler for TssRoundOneMessage {
    fn message_type(&self) -> &'static str {
        TSS_ROUND_ONE_MESSAGE_TYPE
    }

    fn marshal(&self) -> Result<Vec<u8>> {
        encode(&BroadcastWire {
            sender_id: u32::from(self.sender_id),
            broadcast_payload: self.broadcast_payload.clone(),
            session_id: self.session_id.clone(),
        })
    }
}

impl TssRoundOneMessage {
    pub fn unmarshal(bytes: &[u8]) -> Result<Self> {
        let wire: BroadcastWire = decode(bytes)?;
        Ok(Self {
            sender_id: validate_member_index(wire.sender_id)?,
            broadcast_payload: wire.broadcast_payload,
            session_id: wire.session_id,
        })
    }
}

impl TaggedMarshaler for TssRoundTwoMessage {
    fn message_type(&self) -> &'static str {
        TSS_ROUND_TWO_MESSAGE_TYPE
    }

    fn marshal(&self) -> Result<Vec<u8>> {
        encode(&TssRoundTwoWire {
            sender_id: u32::from(self.sender_id),
            broadcast_payload: self.broadcast_payload.clone(),
            peers_payload: marshal_member_map(&self.peers_payload, Vec::clone),
            session_id: self.session_id.clone(),
        })
    }
}

impl TssRoundTwoMessage {
    pub fn unmarshal(bytes: &[u8]) -> Result<Self> {
        let wire: TssRoundTwoWire = decode(bytes)?;

        let peers_payload = wire
            .peers_payload
            .into_iter()
            .map(|(index, payload)| Ok((validate_member_index(index)?, payload)))
            .collect::<Result<_>>()?;

        Ok(Self {
            sender_id: validate_member_index(wire.sender_id)?,
            broadcast_payload: wire.broadcast_payload,
            peers_payload,
            session_id: wire.session_id,
        })
    }
}

impl TaggedMarshaler for TssRoundThreeMessage {
    fn message_type(&self) -> &'static str {
        TSS_ROUND_THREE_MESSAGE_TYPE
    }

    fn marshal(&self) -> Result<Vec<u8>> {
        encode(&BroadcastWire {
            sender_id: u32::from(self.sender_id),
            broadcast_payload: self.broadcast_payload.clone(),
            session_id: self.session_id.clone(),
        })
    }
}

impl TssRoundThreeMessage {
    pub fn unmarshal(bytes: &[u8]) -> Result<Self> {
        let wire: BroadcastWire = decode(bytes)?;
        Ok(Self {
            sender_id: validate_member_index(wire.sender_id)?,
            broadcast_payload: wire.broadcast_payload,
            session_id: wire.session_id,
        })
    }
}

impl TaggedMarshaler for ResultSignatureMessage {
    fn message_type(&self) -> &'static str {
        RESULT_SIGNATURE_MESSAGE_TYPE
    }

    fn marshal(&self) -> Result<Vec<u8>> {
        encode(&ResultSignatureWire {
            sender_id: u32::from(self.sender_id),
            result_hash: self.result_hash.as_bytes().to_vec(),
            signature: self.signature.clone(),
            public_key: self.public_key.clone(),
            session_id: self.session_id.clone(),
        })
    }
}

impl ResultSignatureMessage {
    pub fn unmarshal(bytes: &[u8]) -> Result<Self> {
        let wire: ResultSignatureWire = decode(bytes)?;
        Ok(Self {
            sender_id: validate_member_index(wire.sender_id)?,
            result_hash: ResultHash::from_bytes(&wire.result_hash)?,
            signature: wire.signature,
            public_key: wire.public_key,
            session_id: wire.session_id,
        })
    }
}

impl PreParams {
    pub fn marshal(&self) -> Result<Vec<u8>> {
        let data = self.data();
        let created_at = self.created_at();

        encode(&PreParamsWire {
            paillier_n: data.paillier_sk.n.to_bytes(),
            paillier_lambda_n: data.paillier_sk.lambda_n.to_bytes(),
            paillier_phi_n: data.paillier_sk.phi_n.to_bytes(),
            ntilde: data.ntilde.to_bytes(),
            h1i: data.h1i.to_bytes(),
            h2i: data.h2i.to_bytes(),
            alpha: data.alpha.to_bytes(),
            beta: data.beta.to_bytes(),
            p: data.p.to_bytes(),
            q: data.q.to_bytes(),
            created_at_secs: created_at.timestamp(),
            created_at_nanos: created_at.timestamp_subsec_nanos(),
        })
    }

    pub fn unmarshal(bytes: &[u8]) -> Result<Self> {
        let wire: PreParamsWire = decode(bytes)?;

        let created_at = Utc
            .timestamp_opt(wire.created_at_secs, wire.created_at_nanos)
            .single()
            .ok_or_else(|| Error::Deserialization("invalid pre-params timestamp".into()))?;

        let data = LocalPreParams {
            paillier_sk: PaillierPrivateKey {
                n: BigNumber::from_slice(&wire.paillier_n),
                lambda_n: BigNumber::from_slice(&wire.paillier_lambda_n),
                phi_n: BigNumber::from_slice(&wire.paillier_phi_n),
            },
            ntilde: BigNumber::from_slice(&wire.ntilde),
            h1i: BigNumber::from_slice(&wire.h1i),
            h2i: BigNumber::from_slice(&wire.h2i),
            alpha: BigNumber::from_slice(&wire.alpha),
            beta: BigNumber::from_slice(&wire.beta),
            p: BigNumber::from_slice(&wire.p),
            q: BigNumber::from_slice(&wire.q),
        };

        Ok(PreParams::with_timestamp(data, created_at))
    }
}

fn unmarshaler<T: Any + Send + Sync>(decode: fn(&[u8]) -> Result<T>) -> Unmarshaler {
    Arc::new(move |bytes: &[u8]| decode(bytes).map(|message| Arc::new(message) as Payload))
}

/// Register decoders for every session message type on `channel`
pub fn register_unmarshalers(channel: &dyn BroadcastChannel) {
    channel.set_unmarshaler(
        EPHEMERAL_PUBLIC_KEY_MESSAGE_TYPE,
        unmarshaler(EphemeralPublicKeyMessage::unmarshal),
    );
    channel.set_unmarshaler(
        TSS_ROUND_ONE_MESSAGE_TYPE,
        unmarshaler(TssRoundOneMessage::unmarshal),
    );
    channel.set_unmarshaler(
        TSS_ROUND_TWO_MESSAGE_TYPE,
        unmarshaler(TssRoundTwoMessage::unmarshal),
    );
    channel.set_unmarshaler(
        TSS_ROUND_THREE_MESSAGE_TYPE,
        unmarshaler(TssRoundThreeMessage::unmarshal),
    );
    channel.set_unmarshaler(
        RESULT_SIGNATURE_MESSAGE_TYPE,
        unmarshaler(ResultSignatureMessage::unmarshal),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ephemeral::EphemeralKeyPair;
    use proptest::collection::{btree_map, vec};
    use chrono::DateTime;
    use proptest::prelude::*;

    fn session_id() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9-]{0,40}"
    }

    fn payload() -> impl Strategy<Value = Vec<u8>> {
        vec(any::<u8>(), 0..256)
    }

    fn ephemeral_public_keys() -> impl Strategy<Value = BTreeMap<MemberIndex, EphemeralPublicKey>> {
        btree_map(
            1u8..=255,
            any::<[u8; 32]>().prop_map(|bytes| EphemeralPublicKey::from_bytes(&bytes).unwrap()),
            0..16,
        )
    }

    /// Empty strings decode to zero
    fn big_number() -> impl Strategy<Value = BigNumber> {
        vec(any::<u8>(), 0..96).prop_map(BigNumber::from_slice)
    }

    fn created_at() -> impl Strategy<Value = DateTime<Utc>> {
        (0i64..=4_102_444_800, 0u32..1_000_000_000)
            .prop_map(|(secs, nanos)| Utc.timestamp_opt(secs, nanos).unwrap())
    }

    fn pre_params() -> impl Strategy<Value = PreParams> {
        (vec(big_number(), 10), created_at()).prop_map(|(values, created_at)| {
            let mut values = values.into_iter();
            let mut next = || values.next().unwrap_or_default();
            let data = LocalPreParams {
                paillier_sk: PaillierPrivateKey {
                    n: next(),
                    lambda_n: next(),
                    phi_n: next(),
                },
                ntilde: next(),
                h1i: next(),
                h2i: next(),
                alpha: next(),
                beta: next(),
                p: next(),
                q: next(),
            };
            PreParams::with_timestamp(data, created_at)
        })
    }

    proptest! {
        #[test]
        fn test_ephemeral_public_key_message_round_trip_randomized(
            sender_id in 1u8..=255,
            ephemeral_public_keys in ephemeral_public_keys(),
            session_id in session_id(),
        ) {
            let message = EphemeralPublicKeyMessage { sender_id, ephemeral_public_keys, session_id };
            let decoded = EphemeralPublicKeyMessage::unmarshal(&message.marshal().unwrap()).unwrap();
            prop_assert_eq!(decoded, message);
        }

        #[test]
        fn test_pre_params_round_trip_randomized(pre_params in pre_params()) {
            let decoded = PreParams::unmarshal(&pre_params.marshal().unwrap()).unwrap();
            prop_assert_eq!(decoded, pre_params);
        }

        #[test]
        fn test_tss_round_one_message_round_trip(
            sender_id in 1u8..=255,
            broadcast_payload in payload(),
            session_id in session_id(),
        ) {
            let message = TssRoundOneMessage { sender_id, broadcast_payload, session_id };
            let decoded = TssRoundOneMessage::unmarshal(&message.marshal().unwrap()).unwrap();
            prop_assert_eq!(decoded, message);
        }

        #[test]
        fn test_tss_round_two_message_round_trip(
            sender_id in 1u8..=255,
            broadcast_payload in payload(),
            peers_payload in btree_map(1u8..=255, payload(), 0..8),
            session_id in session_id(),
        ) {
            let message = TssRoundTwoMessage { sender_id, broadcast_payload, peers_payload, session_id };
            let decoded = TssRoundTwoMessage::unmarshal(&message.marshal().unwrap()).unwrap();
            prop_assert_eq!(decoded, message);
        }

        #[test]
        fn test_tss_round_three_message_round_trip(
            sender_id in 1u8..=255,
            broadcast_payload in payload(),
            session_id in session_id(),
        ) {
            let message = TssRoundThreeMessage { sender_id, broadcast_payload, session_id };
            let decoded = TssRoundThreeMessage::unmarshal(&message.marshal().unwrap()).unwrap();
            prop_assert_eq!(decoded, message);
        }

        #[test]
        fn test_result_signature_message_round_trip(
            sender_id in 1u8..=255,
            result_hash in any::<[u8; 32]>(),
            signature in payload(),
            public_key in payload(),
            session_id in session_id(),
        ) {
            let message = ResultSignatureMessage {
                sender_id,
                result_hash: ResultHash::new(result_hash),
                signature,
                public_key,
                session_id,
            };
            let decoded = ResultSignatureMessage::unmarshal(&message.marshal().unwrap()).unwrap();
            prop_assert_eq!(decoded, message);
        }

        #[test]
        fn test_fuzzed_bytes_never_panic(bytes in payload()) {
            let _ = EphemeralPublicKeyMessage::unmarshal(&bytes);
            let _ = TssRoundOneMessage::unmarshal(&bytes);
            let _ = TssRoundTwoMessage::unmarshal(&bytes);
            let _ = TssRoundThreeMessage::unmarshal(&bytes);
            let _ = ResultSignatureMessage::unmarshal(&bytes);
            let _ = PreParams::unmarshal(&bytes);
        }
    }

    #[test]
    fn test_ephemeral_public_key_message_round_trip() {
        let ephemeral_public_keys = (2..=4)
            .map(|index| (index, *EphemeralKeyPair::generate().public_key()))
            .collect();
        let message = EphemeralPublicKeyMessage {
            sender_id: 1,
            ephemeral_public_keys,
            session_id: "session-1".into(),
        };

        let decoded = EphemeralPublicKeyMessage::unmarshal(&message.marshal().unwrap()).unwrap();
        assert_eq!(decoded, message);

        let empty = EphemeralPublicKeyMessage {
            sender_id: 1,
            ephemeral_public_keys: BTreeMap::new(),
            session_id: String::new(),
        };
        let decoded = EphemeralPublicKeyMessage::unmarshal(&empty.marshal().unwrap()).unwrap();
        assert_eq!(decoded, empty);
    }

    #[test]
    fn test_sender_id_out_of_range() {
        let bytes = encode(&BroadcastWire {
            sender_id: MAX_MEMBER_INDEX + 1,
            broadcast_payload: vec![1],
            session_id: "session-1".into(),
        })
        .unwrap();

        let err = TssRoundOneMessage::unmarshal(&bytes).unwrap_err();
        assert!(err.to_string().contains("invalid member index value"));
    }

    #[test]
    fn test_peer_index_out_of_range() {
        let bytes = encode(&TssRoundTwoWire {
            sender_id: 1,
            broadcast_payload: vec![],
            peers_payload: BTreeMap::from([(1000, vec![1])]),
            session_id: "session-1".into(),
        })
        .unwrap();

        assert!(TssRoundTwoMessage::unmarshal(&bytes).is_err());
    }

    #[test]
    fn test_invalid_ephemeral_key_rejected() {
        let bytes = encode(&EphemeralPublicKeyWire {
            sender_id: 1,
            ephemeral_public_keys: BTreeMap::from([(2, vec![0u8; 16])]),
            session_id: "session-1".into(),
        })
        .unwrap();

        assert!(EphemeralPublicKeyMessage::unmarshal(&bytes).is_err());
    }

    #[test]
    fn test_pre_params_round_trip() {
        let pre_params = PreParams::new(crate::testutil::pre_params(0));

        let decoded = PreParams::unmarshal(&pre_params.marshal().unwrap()).unwrap();
        assert_eq!(decoded, pre_params);
    }

    #[tokio::test]
    async fn test_registered_unmarshalers_decode_payloads() {
        let network = crate::net::LocalNetwork::new();
        let channel = network.channel("group", vec![1]);
        register_unmarshalers(&channel);

        let message = TssRoundThreeMessage {
            sender_id: 2,
            broadcast_payload: vec![5, 6],
            session_id: "session-1".into(),
        };

        channel.send(&message).await.unwrap();
        let received = channel.recv().await.unwrap();
        assert_eq!(received.payload::<TssRoundThreeMessage>(), Some(&message));
    }
}
