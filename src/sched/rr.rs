use std::collections::VecDeque;

use crate::flow::FlowKey;

/// A round-robin service list: a FIFO of flow keys.
#[derive(Debug, Default, derive_new::new)]
pub(crate) struct RrList {
    #[new(default)]
    inner: VecDeque<FlowKey>,
}

impl RrList {
    delegate::delegate! {
        to self.inner {
            #[call(push_back)]
            pub(crate) fn push(&mut self, key: FlowKey);

            #[call(pop_front)]
            pub(crate) fn pop(&mut self) -> Option<FlowKey>;

            #[call(front)]
            pub(crate) fn head(&self) -> Option<&FlowKey>;

            pub(crate) fn is_empty(&self) -> bool;

            pub(crate) fn clear(&mut self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serves_in_arrival_order() {
        let mut list = RrList::new();
        assert!(list.is_empty());
        list.push(FlowKey::Synthetic(1));
        list.push(FlowKey::Synthetic(2));
        assert_eq!(list.head(), Some(&FlowKey::Synthetic(1)));
        assert_eq!(list.pop(), Some(FlowKey::Synthetic(1)));
        assert_eq!(list.pop(), Some(FlowKey::Synthetic(2)));
        assert_eq!(list.pop(), None);
    }
}
