use std::collections::BTreeSet;

use smallvec::SmallVec;

use crate::{flow::FlowKey, time::Time};

/// Flows parked until their next permissible transmit time, ordered by that
/// time.
#[derive(Debug, Default, derive_new::new)]
pub(crate) struct ThrottleTree {
    #[new(default)]
    inner: BTreeSet<(Time, FlowKey)>,
}

impl ThrottleTree {
    pub(crate) fn insert(&mut self, at: Time, key: FlowKey) {
        self.inner.insert((at, key));
    }

    pub(crate) fn remove(&mut self, at: Time, key: FlowKey) -> bool {
        self.inner.remove(&(at, key))
    }

    /// The earliest parked wakeup, or `Time::MAX` when the tree is empty.
    pub(crate) fn next_due(&self) -> Time {
        self.inner.first().map_or(Time::MAX, |&(at, _)| at)
    }

    /// Remove and return every flow due at or before `now`.
    pub(crate) fn drain_due(&mut self, now: Time) -> SmallVec<[FlowKey; 4]> {
        let mut due = SmallVec::new();
        while let Some(&(at, key)) = self.inner.first() {
            if at > now {
                break;
            }
            self.inner.pop_first();
            due.push(key);
        }
        due
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.len()
    }

    pub(crate) fn clear(&mut self) {
        self.inner.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_the_earliest_wakeup() {
        let mut tree = ThrottleTree::new();
        assert_eq!(tree.next_due(), Time::MAX);
        tree.insert(Time::new(30), FlowKey::Synthetic(1));
        tree.insert(Time::new(10), FlowKey::Synthetic(2));
        tree.insert(Time::new(20), FlowKey::Synthetic(3));
        assert_eq!(tree.next_due(), Time::new(10));
        assert!(tree.remove(Time::new(10), FlowKey::Synthetic(2)));
        assert_eq!(tree.next_due(), Time::new(20));
    }

    #[test]
    fn drain_is_inclusive_and_ordered() {
        let mut tree = ThrottleTree::new();
        tree.insert(Time::new(30), FlowKey::Synthetic(1));
        tree.insert(Time::new(10), FlowKey::Synthetic(2));
        tree.insert(Time::new(20), FlowKey::Synthetic(3));
        let due = tree.drain_due(Time::new(20));
        assert_eq!(due.as_slice(), &[FlowKey::Synthetic(2), FlowKey::Synthetic(3)]);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.next_due(), Time::new(30));
    }
}
