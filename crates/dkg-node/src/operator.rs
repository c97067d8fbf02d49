//! Operator identity: result signing and result submission

use async_trait::async_trait;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tecdsa_dkg::dkg::{DkgResult, ResultHash, ResultSigner, ResultSubmitter, SignedResult};
use tecdsa_dkg::group::MemberIndex;
use tecdsa_dkg::{Error, Result};
use tiny_keccak::{Hasher, Keccak};
use tracing::info;

/// `keccak256(group public key || misbehaved member indexes)`
pub fn result_hash(result: &DkgResult) -> ResultHash {
    let mut hasher = Keccak::v256();
    hasher.update(result.group_public_key_bytes());
    hasher.update(result.misbehaved());

    let mut hash = [0u8; 32];
    hasher.finalize(&mut hash);
    ResultHash::new(hash)
}

/// Ed25519 operator key; its public half doubles as the network identity
pub struct OperatorSigner {
    key: SigningKey,
}

impl OperatorSigner {
    pub fn generate() -> Self {
        Self {
            key: SigningKey::from_bytes(&rand::random()),
        }
    }

    pub fn public_key(&self) -> Vec<u8> {
        self.key.verifying_key().to_bytes().to_vec()
    }
}

impl ResultSigner for OperatorSigner {
    fn sign_result(&self, result: &DkgResult) -> Result<SignedResult> {
        let result_hash = result_hash(result);
        let signature = self.key.sign(result_hash.as_bytes());

        Ok(SignedResult {
            public_key: self.public_key(),
            signature: signature.to_bytes().to_vec(),
            result_hash,
        })
    }

    fn verify_signature(&self, signed_result: &SignedResult) -> Result<bool> {
        let public_key: [u8; 32] = signed_result
            .public_key
            .as_slice()
            .try_into()
            .map_err(|_| Error::Crypto("operator public key must be 32 bytes".into()))?;
        let verifying_key =
            VerifyingKey::from_bytes(&public_key).map_err(|e| Error::Crypto(e.to_string()))?;
        let signature = Signature::from_slice(&signed_result.signature)
            .map_err(|e| Error::Crypto(e.to_string()))?;

        Ok(verifying_key
            .verify(signed_result.result_hash.as_bytes(), &signature)
            .is_ok())
    }
}

#[derive(Serialize)]
struct SubmittedResult {
    member_index: MemberIndex,
    group_public_key: String,
    misbehaved: Vec<MemberIndex>,
    signatures: BTreeMap<MemberIndex, String>,
    start_block: u64,
}

/// Writes each submitted result to `result.<member>.json` under `dest`
pub struct FileSubmitter {
    dest: PathBuf,
}

impl FileSubmitter {
    pub fn new(dest: impl Into<PathBuf>) -> Self {
        Self { dest: dest.into() }
    }
}

#[async_trait]
impl ResultSubmitter for FileSubmitter {
    async fn submit_result(
        &self,
        member_index: MemberIndex,
        result: &DkgResult,
        signatures: &BTreeMap<MemberIndex, Vec<u8>>,
        start_block: u64,
    ) -> Result<()> {
        let submitted = SubmittedResult {
            member_index,
            group_public_key: hex::encode(result.group_public_key_bytes()),
            misbehaved: result.misbehaved().to_vec(),
            signatures: signatures
                .iter()
                .map(|(member, signature)| (*member, hex::encode(signature)))
                .collect(),
            start_block,
        };
        let json = serde_json::to_string_pretty(&submitted)
            .map_err(|e| Error::Serialization(e.to_string()))?;

        let path = self.dest.join(format!("result.{member_index}.json"));
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| Error::Internal(format!("cannot write {}: {e}", path.display())))?;

        info!(
            member = member_index,
            signatures = signatures.len(),
            path = ?path,
            "Result submitted"
        );
        Ok(())
    }
}
