//! DKG result and the collaborators that publish it

use crate::group::{Group, MemberIndex};
use crate::tss::LocalPartySaveData;
use crate::{Error, Result};
use async_trait::async_trait;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::ProjectivePoint;
use std::collections::BTreeMap;
use std::fmt;

/// Size of a [`ResultHash`] in bytes
pub const RESULT_HASH_BYTE_SIZE: usize = 32;

/// Member's share of the group signing key.
///
/// The secret share is zeroized when the last copy is dropped and never
/// shows up in `Debug` output.
#[derive(Clone)]
pub struct PrivateKeyShare {
    data: LocalPartySaveData,
}

impl fmt::Debug for PrivateKeyShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKeyShare")
            .field("public_key", &hex::encode(self.public_key_bytes()))
            .finish_non_exhaustive()
    }
}

impl PrivateKeyShare {
    pub fn new(data: LocalPartySaveData) -> Self {
        Self { data }
    }

    /// Group public key
    pub fn public_key(&self) -> ProjectivePoint {
        self.data.ecdsa_pub
    }

    fn public_key_bytes(&self) -> Vec<u8> {
        self.public_key()
            .to_affine()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec()
    }

    /// Full keygen output needed by later signing
    pub fn data(&self) -> &LocalPartySaveData {
        &self.data
    }
}

/// Outcome of a successful DKG session
#[derive(Debug, Clone)]
pub struct DkgResult {
    group: Group,
    misbehaved: Vec<MemberIndex>,
    group_public_key_bytes: Vec<u8>,
    private_key_share: PrivateKeyShare,
}

impl DkgResult {
    /// Build a result, recording every inactive or disqualified member of
    /// `group` as misbehaved
    pub fn new(group: Group, private_key_share: PrivateKeyShare) -> Self {
        let mut misbehaved = group.inactive_member_ids();
        misbehaved.extend(group.disqualified_member_ids());
        misbehaved.sort_unstable();
        misbehaved.dedup();

        let group_public_key_bytes = private_key_share.public_key_bytes();

        Self {
            group,
            misbehaved,
            group_public_key_bytes,
            private_key_share,
        }
    }

    /// Group state at the end of the session
    pub fn group(&self) -> &Group {
        &self.group
    }

    /// Sorted indexes of inactive and disqualified members
    pub fn misbehaved(&self) -> &[MemberIndex] {
        &self.misbehaved
    }

    /// Uncompressed SEC1 encoding of the group public key
    pub fn group_public_key_bytes(&self) -> &[u8] {
        &self.group_public_key_bytes
    }

    pub fn private_key_share(&self) -> &PrivateKeyShare {
        &self.private_key_share
    }
}

/// Hash of a [`DkgResult`], the unit members vote on
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResultHash([u8; RESULT_HASH_BYTE_SIZE]);

impl ResultHash {
    pub fn new(bytes: [u8; RESULT_HASH_BYTE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse a hash, rejecting anything but exactly 32 bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; RESULT_HASH_BYTE_SIZE] = bytes.try_into().map_err(|_| {
            Error::Deserialization(format!(
                "result hash must be {RESULT_HASH_BYTE_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; RESULT_HASH_BYTE_SIZE] {
        &self.0
    }
}

impl fmt::Debug for ResultHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResultHash({})", hex::encode(self.0))
    }
}

impl fmt::Display for ResultHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Signature over a result hash together with the key that made it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedResult {
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
    pub result_hash: ResultHash,
}

/// Signs results with the member's operator key
pub trait ResultSigner: Send + Sync {
    /// Hash `result` and sign the hash
    fn sign_result(&self, result: &DkgResult) -> Result<SignedResult>;

    /// Check a signature made by another member
    fn verify_signature(&self, signed_result: &SignedResult) -> Result<bool>;
}

/// Publishes a signed result, typically on chain
#[async_trait]
pub trait ResultSubmitter: Send + Sync {
    async fn submit_result(
        &self,
        member_index: MemberIndex,
        result: &DkgResult,
        signatures: &BTreeMap<MemberIndex, Vec<u8>>,
        start_block: u64,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_hash_from_bytes() {
        let hash = ResultHash::from_bytes(&[7u8; 32]).unwrap();
        assert_eq!(hash.as_bytes(), &[7u8; 32]);
        assert_eq!(hash.to_string(), "07".repeat(32));

        assert!(ResultHash::from_bytes(&[7u8; 31]).is_err());
        assert!(ResultHash::from_bytes(&[7u8; 33]).is_err());
        assert!(ResultHash::from_bytes(&[]).is_err());
    }
}
