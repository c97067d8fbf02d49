//! Three-round Feldman VSS keygen with commitment, share and proof checks
//!
//! This is a local stand-in for a full threshold ECDSA keygen such as GG18 or
//! CGGMP. It produces the group key and each party's share but runs none of
//! the Paillier or `NTilde` range and modulus proofs. The pre-parameters are
//! only exchanged, checked for distinct `NTilde`s and copied into
//! [`LocalPartySaveData`] for a signing protocol to consume.

use super::{LocalPreParams, Parameters, PartyId, TssError, TssMessage};
use k256::{
    elliptic_curve::{
        bigint::U256,
        ops::Reduce,
        sec1::{FromEncodedPoint, ToEncodedPoint},
        Field, PrimeField,
    },
    AffinePoint, ProjectivePoint, Scalar,
};
use libpaillier::unknown_order::BigNumber;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use subtle::ConstantTimeEq;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, instrument};
use zeroize::{Zeroize, ZeroizeOnDrop};

#[cfg(feature = "multi-thread")]
use rayon::prelude::*;

const COMMITMENT_DOMAIN: &[u8] = b"tecdsa-keygen/commitment";
const PROOF_DOMAIN: &[u8] = b"tecdsa-keygen/schnorr";

/// Final output of a successful keygen
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct LocalPartySaveData {
    pub local_pre_params: LocalPreParams,
    /// Secret share of the group key
    pub xi: Scalar,
    /// Evaluation point of this party's share
    #[zeroize(skip)]
    pub share_id: Scalar,
    /// Evaluation points of every party, in sorted party order
    #[zeroize(skip)]
    pub ks: Vec<Scalar>,
    #[zeroize(skip)]
    pub ntilde_j: Vec<BigNumber>,
    #[zeroize(skip)]
    pub h1_j: Vec<BigNumber>,
    #[zeroize(skip)]
    pub h2_j: Vec<BigNumber>,
    /// Paillier moduli of every party
    #[zeroize(skip)]
    pub paillier_pks: Vec<BigNumber>,
    /// Public shares `xj * G` of every party
    #[zeroize(skip)]
    pub big_xj: Vec<ProjectivePoint>,
    /// Group public key
    #[zeroize(skip)]
    pub ecdsa_pub: ProjectivePoint,
}

impl fmt::Debug for LocalPartySaveData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalPartySaveData")
            .field("share_id", &self.share_id)
            .field("parties", &self.ks.len())
            .field("ecdsa_pub", &self.ecdsa_pub.to_affine())
            .finish_non_exhaustive()
    }
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum KeygenPayload {
    Commitment {
        commitment: Vec<u8>,
        paillier_n: Vec<u8>,
        ntilde: Vec<u8>,
        h1: Vec<u8>,
        h2: Vec<u8>,
    },
    Decommitment {
        salt: Vec<u8>,
        coefficients: Vec<Vec<u8>>,
    },
    Share {
        share: Vec<u8>,
    },
    Proof {
        public_share: Vec<u8>,
        nonce_commitment: Vec<u8>,
        response: Vec<u8>,
    },
}

struct PeerCommitment {
    commitment: [u8; 32],
    paillier_n: BigNumber,
    ntilde: BigNumber,
    h1: BigNumber,
    h2: BigNumber,
}

struct SchnorrProof {
    public_share: ProjectivePoint,
    nonce_commitment: ProjectivePoint,
    response: Scalar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Round {
    NotStarted,
    One,
    Two,
    Three,
    Finished,
}

/// One party of an in-process keygen
pub struct LocalKeygenParty {
    params: Parameters,
    pre_params: LocalPreParams,
    outgoing: UnboundedSender<TssMessage>,
    end: UnboundedSender<LocalPartySaveData>,
    round: Round,

    coefficients: Vec<Scalar>,
    coefficient_commitments: Vec<ProjectivePoint>,
    salt: [u8; 32],

    commitments: BTreeMap<u64, PeerCommitment>,
    decommitments: BTreeMap<u64, Vec<ProjectivePoint>>,
    shares: BTreeMap<u64, Scalar>,
    proofs: BTreeMap<u64, SchnorrProof>,

    xi: Scalar,
    big_xj: Vec<ProjectivePoint>,
    ecdsa_pub: ProjectivePoint,
}

impl Drop for LocalKeygenParty {
    fn drop(&mut self) {
        self.coefficients.zeroize();
        self.shares.values_mut().for_each(Zeroize::zeroize);
        self.xi.zeroize();
    }
}

impl LocalKeygenParty {
    pub fn new(
        params: Parameters,
        pre_params: LocalPreParams,
        outgoing: UnboundedSender<TssMessage>,
        end: UnboundedSender<LocalPartySaveData>,
    ) -> Self {
        Self {
            params,
            pre_params,
            outgoing,
            end,
            round: Round::NotStarted,
            coefficients: Vec::new(),
            coefficient_commitments: Vec::new(),
            salt: [0u8; 32],
            commitments: BTreeMap::new(),
            decommitments: BTreeMap::new(),
            shares: BTreeMap::new(),
            proofs: BTreeMap::new(),
            xi: Scalar::ZERO,
            big_xj: Vec::new(),
            ecdsa_pub: ProjectivePoint::IDENTITY,
        }
    }

    pub fn party_id(&self) -> &PartyId {
        self.params.party_id()
    }

    /// Round whose inputs the party currently waits for; 0 before start and
    /// 4 once finished
    pub fn round(&self) -> u8 {
        match self.round {
            Round::NotStarted => 0,
            Round::One => 1,
            Round::Two => 2,
            Round::Three => 3,
            Round::Finished => 4,
        }
    }

    /// Emit the round-one broadcast
    #[instrument(skip(self), fields(party = %self.params.party_id()))]
    pub fn start(&mut self) -> Result<(), TssError> {
        if self.round != Round::NotStarted {
            return Err(TssError::InvalidState("party already started".into()));
        }
        if !self.pre_params.validate() {
            return Err(TssError::InvalidParameters("invalid pre-parameters".into()));
        }

        let mut rng = OsRng;
        self.coefficients = (0..=self.params.threshold())
            .map(|_| Scalar::random(&mut rng))
            .collect();
        self.coefficient_commitments = self
            .coefficients
            .iter()
            .map(|coef| ProjectivePoint::GENERATOR * coef)
            .collect();
        rng.fill_bytes(&mut self.salt);

        let commitment = commitment_hash(
            self.params.party_id().key,
            &self.salt,
            &self.coefficient_commitments,
        );

        self.round = Round::One;
        self.broadcast(KeygenPayload::Commitment {
            commitment: commitment.to_vec(),
            paillier_n: self.pre_params.paillier_sk.n.to_bytes(),
            ntilde: self.pre_params.ntilde.to_bytes(),
            h1: self.pre_params.h1i.to_bytes(),
            h2: self.pre_params.h2i.to_bytes(),
        })?;

        debug!("Keygen round one broadcast emitted");
        self.advance()
    }

    /// Feed one inbound payload sent by `from`.
    ///
    /// Emits the next round's messages, or the save data, as soon as the
    /// current round is complete.
    pub fn update_from_bytes(
        &mut self,
        bytes: &[u8],
        from: &PartyId,
        is_broadcast: bool,
    ) -> Result<(), TssError> {
        if self.round == Round::NotStarted || self.round == Round::Finished {
            return Err(TssError::InvalidState(format!(
                "party cannot accept messages in round {}",
                self.round()
            )));
        }

        let sender = self
            .params
            .find_by_key(from.key)
            .cloned()
            .ok_or_else(|| unexpected(from, "sender is not in the party set"))?;
        if sender.key == self.params.party_id().key {
            return Err(unexpected(from, "message from self"));
        }

        let payload: KeygenPayload =
            serde_json::from_slice(bytes).map_err(|e| malformed(&sender, e.to_string()))?;

        match payload {
            KeygenPayload::Commitment {
                commitment,
                paillier_n,
                ntilde,
                h1,
                h2,
            } => {
                expect_broadcast(&sender, is_broadcast, true)?;
                self.store_commitment(&sender, commitment, paillier_n, ntilde, h1, h2)?;
            }
            KeygenPayload::Decommitment { salt, coefficients } => {
                expect_broadcast(&sender, is_broadcast, true)?;
                self.store_decommitment(&sender, salt, coefficients)?;
            }
            KeygenPayload::Share { share } => {
                expect_broadcast(&sender, is_broadcast, false)?;
                self.store_share(&sender, share)?;
            }
            KeygenPayload::Proof {
                public_share,
                nonce_commitment,
                response,
            } => {
                expect_broadcast(&sender, is_broadcast, true)?;
                let proof = SchnorrProof {
                    public_share: decode_point(&sender, &public_share)?,
                    nonce_commitment: decode_point(&sender, &nonce_commitment)?,
                    response: decode_scalar(&sender, &response)?,
                };
                if self.proofs.insert(sender.key, proof).is_some() {
                    return Err(unexpected(&sender, "duplicate round three message"));
                }
            }
        }

        self.advance()
    }

    fn store_commitment(
        &mut self,
        sender: &PartyId,
        commitment: Vec<u8>,
        paillier_n: Vec<u8>,
        ntilde: Vec<u8>,
        h1: Vec<u8>,
        h2: Vec<u8>,
    ) -> Result<(), TssError> {
        let commitment: [u8; 32] = commitment
            .try_into()
            .map_err(|_| malformed(sender, "invalid commitment length"))?;
        let peer = PeerCommitment {
            commitment,
            paillier_n: BigNumber::from_slice(&paillier_n),
            ntilde: BigNumber::from_slice(&ntilde),
            h1: BigNumber::from_slice(&h1),
            h2: BigNumber::from_slice(&h2),
        };

        if peer.paillier_n.is_zero() || peer.ntilde.is_zero() {
            return Err(verification(sender, "empty Paillier or NTilde modulus"));
        }
        if peer.h1.is_zero() || peer.h2.is_zero() || peer.h1 == peer.h2 {
            return Err(verification(sender, "invalid h1/h2 generators"));
        }
        if peer.ntilde == self.pre_params.ntilde {
            return Err(verification(sender, "NTilde reused from another party"));
        }

        if self.commitments.insert(sender.key, peer).is_some() {
            return Err(unexpected(sender, "duplicate round one message"));
        }
        Ok(())
    }

    fn store_decommitment(
        &mut self,
        sender: &PartyId,
        salt: Vec<u8>,
        coefficients: Vec<Vec<u8>>,
    ) -> Result<(), TssError> {
        if self.decommitments.contains_key(&sender.key) {
            return Err(unexpected(sender, "duplicate round two broadcast"));
        }
        let commitment = self
            .commitments
            .get(&sender.key)
            .ok_or_else(|| unexpected(sender, "decommitment before commitment"))?;

        if coefficients.len() != self.params.threshold() + 1 {
            return Err(verification(sender, "wrong number of coefficient commitments"));
        }
        let points = coefficients
            .iter()
            .map(|bytes| decode_point(sender, bytes))
            .collect::<Result<Vec<_>, _>>()?;

        let expected = commitment_hash(sender.key, &salt, &points);
        if !bool::from(expected.ct_eq(&commitment.commitment)) {
            return Err(verification(sender, "decommitment does not match commitment"));
        }

        if let Some(share) = self.shares.get(&sender.key) {
            verify_share(sender, share, &points, self.params.party_id().key)?;
        }

        self.decommitments.insert(sender.key, points);
        Ok(())
    }

    fn store_share(&mut self, sender: &PartyId, share: Vec<u8>) -> Result<(), TssError> {
        if self.shares.contains_key(&sender.key) {
            return Err(unexpected(sender, "duplicate round two share"));
        }
        let share = decode_scalar(sender, &share)?;

        if let Some(points) = self.decommitments.get(&sender.key) {
            verify_share(sender, &share, points, self.params.party_id().key)?;
        }

        self.shares.insert(sender.key, share);
        Ok(())
    }

    fn advance(&mut self) -> Result<(), TssError> {
        let peers = self.params.party_count() - 1;
        loop {
            match self.round {
                Round::One if self.commitments.len() == peers => self.round_two()?,
                Round::Two if self.decommitments.len() == peers && self.shares.len() == peers => {
                    self.round_three()?
                }
                Round::Three if self.proofs.len() == peers => self.finish()?,
                _ => return Ok(()),
            }
        }
    }

    fn round_two(&mut self) -> Result<(), TssError> {
        self.round = Round::Two;

        self.broadcast(KeygenPayload::Decommitment {
            salt: self.salt.to_vec(),
            coefficients: self
                .coefficient_commitments
                .iter()
                .map(encode_point)
                .collect(),
        })?;

        let own_key = self.params.party_id().key;
        for party in self.params.parties() {
            if party.key == own_key {
                continue;
            }
            let share = evaluate_polynomial(&self.coefficients, party.key);
            self.send(
                party.clone(),
                KeygenPayload::Share {
                    share: share.to_bytes().to_vec(),
                },
            )?;
        }

        debug!(party = %self.params.party_id(), "Keygen round two messages emitted");
        Ok(())
    }

    fn round_three(&mut self) -> Result<(), TssError> {
        let own_key = self.params.party_id().key;

        // Shares that arrived before their decommitment are verified here.
        for (key, share) in &self.shares {
            let sender = self.party(*key)?;
            let points = self
                .decommitments
                .get(key)
                .ok_or_else(|| unexpected(sender, "missing decommitment"))?;
            verify_share(sender, share, points, own_key)?;
        }

        self.xi = self
            .shares
            .values()
            .fold(evaluate_polynomial(&self.coefficients, own_key), |acc, share| {
                acc + share
            });

        let mut all_commitments: Vec<&[ProjectivePoint]> = vec![&self.coefficient_commitments];
        all_commitments.extend(self.decommitments.values().map(Vec::as_slice));

        self.ecdsa_pub = all_commitments
            .iter()
            .fold(ProjectivePoint::IDENTITY, |acc, points| acc + points[0]);
        self.big_xj = self.public_shares(&all_commitments);

        let own_public_share = ProjectivePoint::GENERATOR * self.xi;
        if Some(&own_public_share) != self.big_xj.get(self.own_position()) {
            return Err(TssError::VerificationFailed {
                party: self.params.party_id().to_string(),
                reason: "own share does not match the aggregated commitments".into(),
            });
        }

        let nonce = Scalar::random(&mut OsRng);
        let nonce_commitment = ProjectivePoint::GENERATOR * nonce;
        let challenge = proof_challenge(own_key, &own_public_share, &nonce_commitment);
        let response = nonce + challenge * self.xi;

        self.round = Round::Three;
        self.broadcast(KeygenPayload::Proof {
            public_share: encode_point(&own_public_share),
            nonce_commitment: encode_point(&nonce_commitment),
            response: response.to_bytes().to_vec(),
        })?;

        debug!(party = %self.params.party_id(), "Keygen round three broadcast emitted");
        Ok(())
    }

    fn finish(&mut self) -> Result<(), TssError> {
        for (position, party) in self.params.parties().iter().enumerate() {
            let Some(proof) = self.proofs.get(&party.key) else {
                continue;
            };
            if Some(&proof.public_share) != self.big_xj.get(position) {
                return Err(verification(party, "public share does not match commitments"));
            }
            let challenge = proof_challenge(party.key, &proof.public_share, &proof.nonce_commitment);
            let lhs = ProjectivePoint::GENERATOR * proof.response;
            let rhs = proof.nonce_commitment + proof.public_share * challenge;
            if lhs != rhs {
                return Err(verification(party, "invalid Schnorr proof"));
            }
        }

        let mut save_data = LocalPartySaveData {
            local_pre_params: self.pre_params.clone(),
            xi: self.xi,
            share_id: Scalar::from(self.params.party_id().key),
            ks: Vec::with_capacity(self.params.party_count()),
            ntilde_j: Vec::with_capacity(self.params.party_count()),
            h1_j: Vec::with_capacity(self.params.party_count()),
            h2_j: Vec::with_capacity(self.params.party_count()),
            paillier_pks: Vec::with_capacity(self.params.party_count()),
            big_xj: self.big_xj.clone(),
            ecdsa_pub: self.ecdsa_pub,
        };

        for party in self.params.parties() {
            save_data.ks.push(Scalar::from(party.key));
            match self.commitments.get(&party.key) {
                Some(peer) => {
                    save_data.ntilde_j.push(peer.ntilde.clone());
                    save_data.h1_j.push(peer.h1.clone());
                    save_data.h2_j.push(peer.h2.clone());
                    save_data.paillier_pks.push(peer.paillier_n.clone());
                }
                None => {
                    save_data.ntilde_j.push(self.pre_params.ntilde.clone());
                    save_data.h1_j.push(self.pre_params.h1i.clone());
                    save_data.h2_j.push(self.pre_params.h2i.clone());
                    save_data.paillier_pks.push(self.pre_params.paillier_sk.n.clone());
                }
            }
        }

        self.round = Round::Finished;
        // A dropped receiver means the session was abandoned.
        let _ = self.end.send(save_data);

        debug!(party = %self.params.party_id(), "Keygen finished");
        Ok(())
    }

    fn public_shares(&self, all_commitments: &[&[ProjectivePoint]]) -> Vec<ProjectivePoint> {
        let compute = |party: &PartyId| {
            all_commitments
                .iter()
                .fold(ProjectivePoint::IDENTITY, |acc, points| {
                    acc + evaluate_commitments(points, party.key)
                })
        };

        #[cfg(feature = "multi-thread")]
        if self.params.concurrency() > 1 {
            return self.params.parties().par_iter().map(compute).collect();
        }

        self.params.parties().iter().map(compute).collect()
    }

    fn own_position(&self) -> usize {
        let own_key = self.params.party_id().key;
        self.params
            .parties()
            .iter()
            .position(|party| party.key == own_key)
            .unwrap_or_default()
    }

    fn party(&self, key: u64) -> Result<&PartyId, TssError> {
        self.params
            .find_by_key(key)
            .ok_or_else(|| TssError::InvalidState(format!("unknown party key {key}")))
    }

    fn broadcast(&self, payload: KeygenPayload) -> Result<(), TssError> {
        self.emit(None, payload)
    }

    fn send(&self, to: PartyId, payload: KeygenPayload) -> Result<(), TssError> {
        self.emit(Some(to), payload)
    }

    fn emit(&self, to: Option<PartyId>, payload: KeygenPayload) -> Result<(), TssError> {
        let payload = serde_json::to_vec(&payload)
            .map_err(|e| TssError::InvalidState(format!("cannot encode payload: {e}")))?;
        // A dropped receiver means the session was abandoned.
        let _ = self.outgoing.send(TssMessage {
            from: self.params.party_id().clone(),
            to,
            payload,
        });
        Ok(())
    }
}

fn commitment_hash(key: u64, salt: &[u8], points: &[ProjectivePoint]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(COMMITMENT_DOMAIN);
    hasher.update(key.to_be_bytes());
    hasher.update(salt);
    for point in points {
        hasher.update(encode_point(point));
    }
    hasher.finalize().into()
}

fn proof_challenge(key: u64, public_share: &ProjectivePoint, nonce_commitment: &ProjectivePoint) -> Scalar {
    let mut hasher = Sha256::new();
    hasher.update(PROOF_DOMAIN);
    hasher.update(key.to_be_bytes());
    hasher.update(encode_point(public_share));
    hasher.update(encode_point(nonce_commitment));
    <Scalar as Reduce<U256>>::reduce_bytes(&hasher.finalize())
}

/// Evaluate a polynomial at `x`
fn evaluate_polynomial(coefficients: &[Scalar], x: u64) -> Scalar {
    let x_scalar = Scalar::from(x);
    let mut result = Scalar::ZERO;
    let mut x_power = Scalar::ONE;

    for coef in coefficients {
        result += *coef * x_power;
        x_power *= x_scalar;
    }

    result
}

/// Evaluate the commitments to a polynomial at `x`, yielding `f(x) * G`
fn evaluate_commitments(points: &[ProjectivePoint], x: u64) -> ProjectivePoint {
    let x_scalar = Scalar::from(x);
    let mut result = ProjectivePoint::IDENTITY;
    let mut x_power = Scalar::ONE;

    for point in points {
        result += *point * x_power;
        x_power *= x_scalar;
    }

    result
}

fn verify_share(
    sender: &PartyId,
    share: &Scalar,
    points: &[ProjectivePoint],
    own_key: u64,
) -> Result<(), TssError> {
    if ProjectivePoint::GENERATOR * share != evaluate_commitments(points, own_key) {
        return Err(verification(sender, "share does not match commitment"));
    }
    Ok(())
}

fn encode_point(point: &ProjectivePoint) -> Vec<u8> {
    point.to_affine().to_encoded_point(true).as_bytes().to_vec()
}

fn decode_point(sender: &PartyId, bytes: &[u8]) -> Result<ProjectivePoint, TssError> {
    let encoded =
        k256::EncodedPoint::from_bytes(bytes).map_err(|e| malformed(sender, e.to_string()))?;
    Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&encoded))
        .map(ProjectivePoint::from)
        .ok_or_else(|| malformed(sender, "invalid curve point"))
}

fn decode_scalar(sender: &PartyId, bytes: &[u8]) -> Result<Scalar, TssError> {
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| malformed(sender, "invalid scalar length"))?;
    Option::<Scalar>::from(Scalar::from_repr(bytes.into()))
        .ok_or_else(|| malformed(sender, "scalar out of range"))
}

fn expect_broadcast(sender: &PartyId, actual: bool, expected: bool) -> Result<(), TssError> {
    if actual != expected {
        let reason = if expected {
            "expected a broadcast message"
        } else {
            "expected a direct message"
        };
        return Err(unexpected(sender, reason));
    }
    Ok(())
}

fn malformed(party: &PartyId, reason: impl Into<String>) -> TssError {
    TssError::MalformedMessage {
        party: party.to_string(),
        reason: reason.into(),
    }
}

fn unexpected(party: &PartyId, reason: impl Into<String>) -> TssError {
    TssError::UnexpectedMessage {
        party: party.to_string(),
        reason: reason.into(),
    }
}

fn verification(party: &PartyId, reason: impl Into<String>) -> TssError {
    TssError::VerificationFailed {
        party: party.to_string(),
        reason: reason.into(),
    }
}
