//! Signing group membership and per-member status

use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

/// 1-based index of a member within its group
pub type MemberIndex = u8;

/// Largest member index representable on the wire
pub const MAX_MEMBER_INDEX: u32 = MemberIndex::MAX as u32;

/// A group of `group_size` members tolerating `dishonest_threshold` faulty ones.
///
/// Members start out operating. Marking a member inactive or disqualified
/// removes it from the operating set for the rest of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    dishonest_threshold: usize,
    group_size: usize,
    inactive: BTreeSet<MemberIndex>,
    disqualified: BTreeSet<MemberIndex>,
}

impl Group {
    /// Create a group with every member operating
    pub fn new(dishonest_threshold: usize, group_size: usize) -> Self {
        Self {
            dishonest_threshold,
            group_size,
            inactive: BTreeSet::new(),
            disqualified: BTreeSet::new(),
        }
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    pub fn dishonest_threshold(&self) -> usize {
        self.dishonest_threshold
    }

    /// Minimum number of honest members: `group_size - dishonest_threshold`,
    /// zero when the threshold exceeds the group
    pub fn honest_threshold(&self) -> usize {
        self.group_size.saturating_sub(self.dishonest_threshold)
    }

    /// All member indexes, `1..=group_size`
    pub fn member_ids(&self) -> Vec<MemberIndex> {
        (1..=self.group_size)
            .filter_map(|id| MemberIndex::try_from(id).ok())
            .collect()
    }

    /// Members neither inactive nor disqualified
    pub fn operating_member_ids(&self) -> Vec<MemberIndex> {
        self.member_ids()
            .into_iter()
            .filter(|id| self.is_operating(*id))
            .collect()
    }

    pub fn inactive_member_ids(&self) -> Vec<MemberIndex> {
        self.inactive.iter().copied().collect()
    }

    pub fn disqualified_member_ids(&self) -> Vec<MemberIndex> {
        self.disqualified.iter().copied().collect()
    }

    pub fn mark_member_as_inactive(&mut self, member: MemberIndex) {
        if self.is_in_range(member) {
            self.inactive.insert(member);
        }
    }

    pub fn mark_member_as_disqualified(&mut self, member: MemberIndex) {
        if self.is_in_range(member) {
            self.disqualified.insert(member);
        }
    }

    pub fn is_operating(&self, member: MemberIndex) -> bool {
        self.is_in_range(member)
            && !self.inactive.contains(&member)
            && !self.disqualified.contains(&member)
    }

    fn is_in_range(&self, member: MemberIndex) -> bool {
        member >= 1 && usize::from(member) <= self.group_size
    }
}

/// Collects the senders seen in one protocol phase and marks everybody else
/// as inactive.
#[derive(Debug)]
pub struct InactiveMemberFilter {
    member_id: MemberIndex,
    active: BTreeSet<MemberIndex>,
}

impl InactiveMemberFilter {
    pub fn new(member_id: MemberIndex) -> Self {
        Self {
            member_id,
            active: BTreeSet::new(),
        }
    }

    pub fn mark_member_as_active(&mut self, member: MemberIndex) {
        self.active.insert(member);
    }

    /// Mark every operating member other than self that was not seen as
    /// inactive. Returns the newly marked members.
    pub fn flush_inactive_members(self, group: &mut Group) -> Vec<MemberIndex> {
        let inactive: Vec<MemberIndex> = group
            .operating_member_ids()
            .into_iter()
            .filter(|id| *id != self.member_id && !self.active.contains(id))
            .collect();

        for member in &inactive {
            info!(
                member = self.member_id,
                inactive_member = *member,
                "Marking member as inactive"
            );
            group.mark_member_as_inactive(*member);
        }

        inactive
    }
}

/// Checks that a network identity really belongs to the claimed member index
pub trait MembershipValidator: Send + Sync {
    fn is_valid_membership(&self, member: MemberIndex, public_key: &[u8]) -> bool;
}

/// Validator over a fixed index to operator-key table
#[derive(Debug, Clone, Default)]
pub struct StaticMembershipValidator {
    members: BTreeMap<MemberIndex, Vec<u8>>,
}

impl StaticMembershipValidator {
    pub fn new(members: impl IntoIterator<Item = (MemberIndex, Vec<u8>)>) -> Self {
        Self {
            members: members.into_iter().collect(),
        }
    }

    /// Operator key registered for `member`
    pub fn public_key(&self, member: MemberIndex) -> Option<&[u8]> {
        self.members.get(&member).map(Vec::as_slice)
    }
}

impl MembershipValidator for StaticMembershipValidator {
    fn is_valid_membership(&self, member: MemberIndex, public_key: &[u8]) -> bool {
        self.members
            .get(&member)
            .is_some_and(|expected| expected.as_slice() == public_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thresholds_and_member_ids() {
        let group = Group::new(2, 5);

        assert_eq!(group.honest_threshold(), 3);
        assert_eq!(group.member_ids(), vec![1, 2, 3, 4, 5]);
        assert_eq!(group.operating_member_ids(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_threshold_larger_than_group() {
        let group = Group::new(5, 3);
        assert_eq!(group.honest_threshold(), 0);
    }

    #[test]
    fn test_marking_members() {
        let mut group = Group::new(1, 4);

        group.mark_member_as_inactive(2);
        group.mark_member_as_disqualified(4);
        group.mark_member_as_inactive(9);
        group.mark_member_as_disqualified(0);

        assert_eq!(group.operating_member_ids(), vec![1, 3]);
        assert_eq!(group.inactive_member_ids(), vec![2]);
        assert_eq!(group.disqualified_member_ids(), vec![4]);
        assert!(!group.is_operating(2));
        assert!(!group.is_operating(9));
        assert!(group.is_operating(3));
    }

    #[test]
    fn test_inactive_member_filter() {
        let mut group = Group::new(1, 5);
        group.mark_member_as_disqualified(5);

        let mut filter = InactiveMemberFilter::new(1);
        filter.mark_member_as_active(2);
        filter.mark_member_as_active(4);

        let marked = filter.flush_inactive_members(&mut group);

        assert_eq!(marked, vec![3]);
        assert_eq!(group.operating_member_ids(), vec![1, 2, 4]);
        assert_eq!(group.inactive_member_ids(), vec![3]);
    }

    #[test]
    fn test_static_membership_validator() {
        let validator = StaticMembershipValidator::new([(1, vec![0xaa]), (2, vec![0xbb])]);

        assert!(validator.is_valid_membership(1, &[0xaa]));
        assert!(!validator.is_valid_membership(1, &[0xbb]));
        assert!(!validator.is_valid_membership(3, &[0xaa]));
    }
}
