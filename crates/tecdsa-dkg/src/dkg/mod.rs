//! Threshold ECDSA distributed key generation
//!
//! A session runs as a chain of block-driven states:
//!
//! 1. ephemeral key pair generation, one x25519 key pair per peer
//! 2. symmetric key derivation
//! 3. TSS rounds one to three, peer-to-peer payloads encrypted with the
//!    symmetric keys
//! 4. finalization, waiting for the keygen output
//!
//! Any member that fails to deliver a round's message aborts the session.
//! A finished [`DkgResult`] is then signed, cross-verified and submitted by a
//! [`Publisher`].

mod executor;
mod identity;
mod marshaling;
mod member;
mod message;
mod pre_params;
mod result;
mod states;

pub use executor::{Executor, Publisher, SessionConfig};
pub use identity::IdentityConverter;
pub use marshaling::register_unmarshalers;
pub use message::{
    EphemeralPublicKeyMessage, ProtocolMessage, ResultSignatureMessage, TssRoundOneMessage,
    TssRoundThreeMessage, TssRoundTwoMessage, EPHEMERAL_PUBLIC_KEY_MESSAGE_TYPE,
    RESULT_SIGNATURE_MESSAGE_TYPE, TSS_ROUND_ONE_MESSAGE_TYPE, TSS_ROUND_THREE_MESSAGE_TYPE,
    TSS_ROUND_TWO_MESSAGE_TYPE,
};
pub use pre_params::{PreParams, PreParamsPool, PreParamsSource};
pub use result::{
    DkgResult, PrivateKeyShare, ResultHash, ResultSigner, ResultSubmitter, SignedResult,
    RESULT_HASH_BYTE_SIZE,
};
pub use states::{pre_publication_blocks, protocol_blocks};
