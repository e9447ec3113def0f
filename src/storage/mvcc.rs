use std::sync::Arc;

use smallvec::SmallVec;

use crate::types::CommitId;

/// One committed version of an entity. `value == None` marks a delete.
#[derive(Clone, Debug)]
pub struct Version<T> {
    /// Commit that produced this version.
    pub commit: CommitId,
    /// Record image, or `None` for a tombstone.
    pub value: Option<Arc<T>>,
}

/// Committed versions of one entity, ordered by ascending commit id.
///
/// Most entities are written once, so two inline slots avoid a heap
/// allocation for the common case.
#[derive(Clone, Debug)]
pub struct VersionChain<T> {
    versions: SmallVec<[Version<T>; 2]>,
}

impl<T> Default for VersionChain<T> {
    fn default() -> Self {
        Self {
            versions: SmallVec::new(),
        }
    }
}

/// Outcome of pruning a single chain.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PruneOutcome {
    /// Versions dropped from the chain.
    pub removed: usize,
    /// The chain now holds nothing any reader can observe.
    pub dead: bool,
}

impl<T> VersionChain<T> {
    /// Appends a version. Commit ids must be increasing.
    pub fn push(&mut self, commit: CommitId, value: Option<Arc<T>>) {
        debug_assert!(self.versions.last().map_or(true, |v| v.commit < commit));
        self.versions.push(Version { commit, value });
    }

    /// Newest version regardless of snapshot, tombstones included.
    pub fn latest(&self) -> Option<&Version<T>> {
        self.versions.last()
    }

    /// Newest live value regardless of snapshot.
    pub fn latest_value(&self) -> Option<&Arc<T>> {
        self.latest().and_then(|v| v.value.as_ref())
    }

    /// Commit id of the newest version.
    pub fn latest_commit(&self) -> Option<CommitId> {
        self.latest().map(|v| v.commit)
    }

    /// Value visible to a reader at `snapshot`.
    pub fn visible_at(&self, snapshot: CommitId) -> Option<&Arc<T>> {
        self.versions
            .iter()
            .rev()
            .find(|v| v.commit <= snapshot)
            .and_then(|v| v.value.as_ref())
    }

    /// All retained versions, oldest first.
    pub fn versions(&self) -> &[Version<T>] {
        &self.versions
    }

    /// Number of retained versions.
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    /// Returns true when no version is retained.
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Drops versions no reader at or above `horizon` can observe: everything
    /// older than the newest version with `commit <= horizon`.
    pub fn prune(&mut self, horizon: CommitId) -> PruneOutcome {
        let Some(base) = self.versions.iter().rposition(|v| v.commit <= horizon) else {
            return PruneOutcome::default();
        };
        let removed = base;
        if removed > 0 {
            self.versions.drain(..removed);
        }
        let dead = self.versions.len() == 1 && self.versions[0].value.is_none();
        PruneOutcome { removed, dead }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visibility_follows_snapshot() {
        let mut chain = VersionChain::default();
        chain.push(5, Some(Arc::new("v5")));
        chain.push(9, Some(Arc::new("v9")));
        chain.push(12, None);
        assert!(chain.visible_at(4).is_none());
        assert_eq!(chain.visible_at(5).map(|v| **v), Some("v5"));
        assert_eq!(chain.visible_at(11).map(|v| **v), Some("v9"));
        assert!(chain.visible_at(12).is_none());
        assert_eq!(chain.latest_commit(), Some(12));
    }

    #[test]
    fn prune_keeps_base_version_for_horizon() {
        let mut chain = VersionChain::default();
        chain.push(1, Some(Arc::new(1)));
        chain.push(3, Some(Arc::new(3)));
        chain.push(7, Some(Arc::new(7)));
        let outcome = chain.prune(4);
        assert_eq!(outcome, PruneOutcome { removed: 1, dead: false });
        assert_eq!(chain.visible_at(4).map(|v| **v), Some(3));
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn pruned_tombstone_marks_chain_dead() {
        let mut chain = VersionChain::default();
        chain.push(1, Some(Arc::new(1)));
        chain.push(2, None);
        assert_eq!(chain.prune(2), PruneOutcome { removed: 1, dead: true });
    }
}
