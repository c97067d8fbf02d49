//! Threshold ECDSA keygen party
//!
//! The DKG engine treats keygen as a black box with a channel-based surface:
//! a [`LocalKeygenParty`] is created from [`Parameters`], pre-parameters, an
//! outgoing-message channel and a result channel. Inbound payloads are fed with
//! [`LocalKeygenParty::update_from_bytes`]; whenever a round has all of its
//! inputs the party emits the next round's [`TssMessage`]s, and finally a
//! [`LocalPartySaveData`].
//!
//! Rounds:
//! 1. broadcast a hash commitment to the Feldman coefficient commitments,
//!    together with the Paillier modulus and the auxiliary `NTilde`, `h1`, `h2`
//! 2. broadcast the decommitment and send every peer its polynomial share
//! 3. broadcast a Schnorr proof of knowledge of the local public share

mod keygen;
mod preparams;

pub use keygen::{LocalKeygenParty, LocalPartySaveData};
pub use preparams::{
    generate_pre_params, generate_pre_params_until, LocalPreParams, PaillierPrivateKey,
};

use thiserror::Error;

/// Keygen party errors
#[derive(Debug, Error)]
pub enum TssError {
    /// The party set or threshold is unusable
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// A payload could not be parsed
    #[error("malformed message from party {party}: {reason}")]
    MalformedMessage { party: String, reason: String },

    /// A payload arrived from outside the party set, twice, or out of place
    #[error("unexpected message from party {party}: {reason}")]
    UnexpectedMessage { party: String, reason: String },

    /// A commitment, share or proof did not verify
    #[error("verification failed for party {party}: {reason}")]
    VerificationFailed { party: String, reason: String },

    /// The party was driven out of order
    #[error("invalid party state: {0}")]
    InvalidState(String),

    /// Pre-parameters were not generated before the deadline
    #[error("pre-parameters generation timed out")]
    PreParamsTimeout,

    /// Pre-parameters generation could not run
    #[error("pre-parameters generation failed: {0}")]
    PreParamsGeneration(String),
}

/// Identity of one keygen party.
///
/// `key` doubles as the party's share evaluation point and must be non-zero.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartyId {
    pub id: String,
    pub moniker: String,
    pub key: u64,
}

impl PartyId {
    pub fn new(id: impl Into<String>, moniker: impl Into<String>, key: u64) -> Self {
        Self {
            id: id.into(),
            moniker: moniker.into(),
            key,
        }
    }
}

impl std::fmt::Display for PartyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{{},{}}}", self.id, self.moniker)
    }
}

/// Keygen parameters shared by every party of one session
#[derive(Debug, Clone)]
pub struct Parameters {
    parties: Vec<PartyId>,
    party_id: PartyId,
    threshold: usize,
    concurrency: usize,
}

impl Parameters {
    /// Build parameters for `party_id` among `parties`.
    ///
    /// Parties are sorted by key. A `threshold` of `t` means `t + 1` parties
    /// are needed to sign.
    pub fn new(
        mut parties: Vec<PartyId>,
        party_id: PartyId,
        threshold: usize,
    ) -> Result<Self, TssError> {
        parties.sort_by_key(|party| party.key);
        parties.dedup_by_key(|party| party.key);

        if parties.iter().any(|party| party.key == 0) {
            return Err(TssError::InvalidParameters("party key must be non-zero".into()));
        }
        if !parties.iter().any(|party| party.key == party_id.key) {
            return Err(TssError::InvalidParameters(format!(
                "local party {party_id} is not in the party set"
            )));
        }
        if threshold + 1 > parties.len() {
            return Err(TssError::InvalidParameters(format!(
                "threshold {threshold} too high for {} parties",
                parties.len()
            )));
        }

        Ok(Self {
            parties,
            party_id,
            threshold,
            concurrency: 1,
        })
    }

    /// Worker threads the party may use for bulk curve arithmetic
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Parties sorted by key
    pub fn parties(&self) -> &[PartyId] {
        &self.parties
    }

    pub fn party_id(&self) -> &PartyId {
        &self.party_id
    }

    pub fn party_count(&self) -> usize {
        self.parties.len()
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn find_by_key(&self, key: u64) -> Option<&PartyId> {
        self.parties.iter().find(|party| party.key == key)
    }
}

/// Outgoing keygen message
#[derive(Debug, Clone)]
pub struct TssMessage {
    pub from: PartyId,
    /// Recipient for direct messages, `None` for broadcasts
    pub to: Option<PartyId>,
    pub payload: Vec<u8>,
}

impl TssMessage {
    pub fn is_broadcast(&self) -> bool {
        self.to.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn party(key: u64) -> PartyId {
        PartyId::new(key.to_string(), format!("member-{key}"), key)
    }

    #[test]
    fn test_parameters_sort_parties() {
        let params = Parameters::new(vec![party(3), party(1), party(2)], party(2), 1).unwrap();

        let keys: Vec<u64> = params.parties().iter().map(|p| p.key).collect();
        assert_eq!(keys, vec![1, 2, 3]);
        assert_eq!(params.party_count(), 3);
        assert_eq!(params.find_by_key(3), Some(&party(3)));
        assert_eq!(params.concurrency(), 1);
    }

    #[test]
    fn test_parameters_validation() {
        assert!(Parameters::new(vec![party(1), party(2)], party(5), 1).is_err());
        assert!(Parameters::new(vec![party(1), party(2)], party(1), 2).is_err());
        assert!(Parameters::new(vec![party(0), party(2)], party(2), 1).is_err());
    }
}
