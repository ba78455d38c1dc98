use std::collections::{BTreeMap, VecDeque};

use crate::{
    packet::{EndpointId, Packet},
    time::Time,
};

/// Identity of a flow in the flow table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum FlowKey {
    /// A flow owned by a live endpoint.
    Endpoint(EndpointId),
    /// A flow for orphaned packets, keyed by masked header hash.
    Synthetic(u64),
}

impl FlowKey {
    /// 64-bit image fed to the bucket hash. Synthetic keys carry a set low
    /// bit so the two namespaces can never collide.
    pub(crate) fn hash_input(self) -> u64 {
        match self {
            FlowKey::Endpoint(id) => id.into_u64() << 1,
            FlowKey::Synthetic(hash) => (hash << 1) | 1,
        }
    }
}

/// Which round-robin list a flow is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListId {
    New,
    Old,
    Co,
}

/// Where a flow currently lives. A flow is in exactly one of these states;
/// `Detached` flows hold no packets and age toward garbage collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlowState {
    Detached { since: Time },
    OnList(ListId),
    Throttled,
}

/// Per-flow scheduling state.
///
/// Packets whose departure time is in order with the tail go on the FIFO;
/// stragglers go into the out-of-order tree. `peek`/`pop` always yield the
/// earliest departure across both.
#[derive(Debug)]
pub(crate) struct FlowEntry {
    pub(crate) key: FlowKey,
    pub(crate) socket_hash: u64,
    fifo: VecDeque<Packet>,
    ooo: BTreeMap<(Time, u64), Packet>,
    ooo_seq: u64,
    pub(crate) credit: i64,
    pub(crate) time_next_packet: Time,
    pub(crate) state: FlowState,
}

impl FlowEntry {
    pub(crate) fn new(key: FlowKey, socket_hash: u64, credit: i64, now: Time) -> Self {
        Self {
            key,
            socket_hash,
            fifo: VecDeque::new(),
            ooo: BTreeMap::new(),
            ooo_seq: 0,
            credit,
            time_next_packet: Time::ZERO,
            state: FlowState::Detached { since: now },
        }
    }

    pub(crate) fn qlen(&self) -> usize {
        self.fifo.len() + self.ooo.len()
    }

    pub(crate) fn is_detached(&self) -> bool {
        matches!(self.state, FlowState::Detached { .. })
    }

    /// Queue a packet in earliest-departure order.
    pub(crate) fn push(&mut self, pkt: Packet) {
        let in_order = self
            .fifo
            .back()
            .map_or(true, |tail| pkt.time_to_send >= tail.time_to_send);
        if in_order {
            self.fifo.push_back(pkt);
        } else {
            self.ooo.insert((pkt.time_to_send, self.ooo_seq), pkt);
            self.ooo_seq += 1;
        }
    }

    /// The next packet to depart, if any. The FIFO wins ties.
    pub(crate) fn peek(&self) -> Option<&Packet> {
        match (self.fifo.front(), self.ooo.first_key_value()) {
            (Some(head), Some((&(at, _), early))) => {
                if at < head.time_to_send {
                    Some(early)
                } else {
                    Some(head)
                }
            }
            (Some(head), None) => Some(head),
            (None, Some((_, early))) => Some(early),
            (None, None) => None,
        }
    }

    /// Remove and return the next packet to depart.
    pub(crate) fn pop(&mut self) -> Option<Packet> {
        let from_ooo = match (self.fifo.front(), self.ooo.first_key_value()) {
            (Some(head), Some((&(at, _), _))) => at < head.time_to_send,
            (None, Some(_)) => true,
            _ => false,
        };
        if from_ooo {
            self.ooo.pop_first().map(|(_, pkt)| pkt)
        } else {
            self.fifo.pop_front()
        }
    }
}
