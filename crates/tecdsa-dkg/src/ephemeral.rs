//! Ephemeral x25519 keys and the symmetric keys derived from them
//!
//! Every member generates one key pair per peer and session. The ECDH output of
//! a pair is hashed into a ChaCha20-Poly1305 key protecting the peer-to-peer
//! payloads of TSS round two.

use crate::{Error, Result};
use chacha20poly1305::{
    aead::{generic_array::GenericArray, Aead, KeyInit},
    ChaCha20Poly1305,
};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, ReusableSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

const NONCE_SIZE: usize = 12;

/// Public half of an ephemeral key pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EphemeralPublicKey(PublicKey);

impl EphemeralPublicKey {
    /// Parse a 32-byte encoded key
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Deserialization("Invalid ephemeral public key length".into()))?;
        Ok(Self(PublicKey::from(bytes)))
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }
}

/// Ephemeral key pair generated for exactly one peer
pub struct EphemeralKeyPair {
    private_key: ReusableSecret,
    public_key: EphemeralPublicKey,
}

impl EphemeralKeyPair {
    pub fn generate() -> Self {
        let private_key = ReusableSecret::random_from_rng(OsRng);
        let public_key = EphemeralPublicKey(PublicKey::from(&private_key));
        Self {
            private_key,
            public_key,
        }
    }

    pub fn public_key(&self) -> &EphemeralPublicKey {
        &self.public_key
    }

    /// Derive the symmetric key shared with the owner of `peer_public_key`
    pub fn ecdh(&self, peer_public_key: &EphemeralPublicKey) -> SymmetricKey {
        let shared = self.private_key.diffie_hellman(&peer_public_key.0);
        let mut key = [0u8; 32];
        key.copy_from_slice(&Sha256::digest(shared.as_bytes()));
        SymmetricKey { key }
    }
}

/// Authenticated-encryption key shared by exactly two members
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey {
    key: [u8; 32],
}

impl SymmetricKey {
    /// Encrypt into `nonce || ciphertext`
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new(GenericArray::from_slice(&self.key));

        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(GenericArray::from_slice(&nonce), plaintext)
            .map_err(|_| Error::Crypto("Encryption failed".into()))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypt `nonce || ciphertext` produced by [`SymmetricKey::encrypt`]
    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_SIZE {
            return Err(Error::Crypto("Encrypted data too short".into()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);

        let cipher = ChaCha20Poly1305::new(GenericArray::from_slice(&self.key));
        cipher
            .decrypt(GenericArray::from_slice(nonce), ciphertext)
            .map_err(|_| Error::Crypto("Decryption failed".into()))
    }
}

impl PartialEq for SymmetricKey {
    fn eq(&self, other: &Self) -> bool {
        self.key.ct_eq(&other.key).into()
    }
}

impl Eq for SymmetricKey {}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}
