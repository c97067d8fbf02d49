//! Mapping between member indexes and keygen party identities

use crate::group::{MemberIndex, MAX_MEMBER_INDEX};
use crate::tss::PartyId;
use sha2::{Digest, Sha256};

/// Converts member indexes to party ids as `key = seed + index`.
///
/// The seed is derived from the session id, so party keys (and thus share
/// evaluation points) differ between sessions of the same group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityConverter {
    seed: u64,
}

/// Largest seed for which `seed + MAX_MEMBER_INDEX` fits in a `u64`
const MAX_SEED: u64 = u64::MAX - MAX_MEMBER_INDEX as u64;

impl IdentityConverter {
    /// Seeds above [`MAX_SEED`] are clamped to it
    pub(crate) fn new(seed: u64) -> Self {
        Self {
            seed: seed.min(MAX_SEED),
        }
    }

    /// Seed taken from the first 8 bytes of `SHA-256(session_id)`, shifted so
    /// `seed + MAX_MEMBER_INDEX` cannot overflow
    pub fn for_session(session_id: &str) -> Self {
        let digest = Sha256::digest(session_id.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        Self::new(u64::from_be_bytes(prefix) >> 9)
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn member_index_to_tss_party_id(&self, member_index: MemberIndex) -> PartyId {
        PartyId::new(
            member_index.to_string(),
            format!("member-{member_index}"),
            self.seed + u64::from(member_index),
        )
    }

    /// Member behind `party_id`, or `None` when the key does not correspond to
    /// a valid member index
    pub fn tss_party_id_to_member_index(&self, party_id: &PartyId) -> Option<MemberIndex> {
        let index = party_id.key.checked_sub(self.seed)?;
        if index == 0 || index > u64::from(MAX_MEMBER_INDEX) {
            return None;
        }
        MemberIndex::try_from(index).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversion_round_trip() {
        let converter = IdentityConverter::for_session("session-1");

        for index in [1u8, 2, 100, 255] {
            let party_id = converter.member_index_to_tss_party_id(index);
            assert_eq!(party_id.key, converter.seed() + u64::from(index));
            assert_eq!(party_id.id, index.to_string());
            assert_eq!(converter.tss_party_id_to_member_index(&party_id), Some(index));
        }
    }

    #[test]
    fn test_invalid_keys() {
        let converter = IdentityConverter::new(1000);

        let below_seed = PartyId::new("1", "member-1", 999);
        let zero_index = PartyId::new("0", "member-0", 1000);
        let too_large = PartyId::new("256", "member-256", 1256);

        assert_eq!(converter.tss_party_id_to_member_index(&below_seed), None);
        assert_eq!(converter.tss_party_id_to_member_index(&zero_index), None);
        assert_eq!(converter.tss_party_id_to_member_index(&too_large), None);
    }

    #[test]
    fn test_seed_depends_on_session() {
        let first = IdentityConverter::for_session("session-1");
        let second = IdentityConverter::for_session("session-2");

        assert_ne!(first.seed(), second.seed());
        assert_eq!(first, IdentityConverter::for_session("session-1"));
        assert!(first.seed() < u64::MAX >> 8);
    }

    #[test]
    fn test_largest_seed_does_not_overflow() {
        let converter = IdentityConverter::new(u64::MAX);
        assert_eq!(converter.seed(), MAX_SEED);

        let party_id = converter.member_index_to_tss_party_id(MemberIndex::MAX);
        assert_eq!(party_id.key, u64::MAX);
        assert_eq!(
            converter.tss_party_id_to_member_index(&party_id),
            Some(MemberIndex::MAX)
        );
    }
}
