//! Hash-bucketed flow storage: an array of ordered trees keyed by flow
//! identity, with opportunistic garbage collection and live resizing.

use std::collections::BTreeMap;

use smallvec::SmallVec;

use crate::{
    flow::{FlowEntry, FlowKey, FlowState},
    time::{Delta, Time},
};

/// Entries reclaimed per garbage-collection walk, at most.
const GC_MAX: usize = 8;
/// Detached flows older than this are collection candidates.
const GC_AGE: Delta = Delta::new(3_000_000_000);
/// Occupancy cap standing in for allocator exhaustion; lookups past it fail
/// and the caller falls back to the internal flow.
const MAX_FLOWS: usize = 1 << 20;

/// Returned when the table refuses to grow; the packet still gets queued,
/// just not fairly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TableFull;

#[derive(Debug)]
pub(crate) struct FlowTable {
    buckets: Vec<BTreeMap<FlowKey, FlowEntry>>,
    log: u32,
    len: usize,
    cap: usize,
}

const GOLDEN_RATIO_64: u64 = 0x61c8_8646_80b5_83eb;

impl FlowTable {
    pub(crate) fn new(log: u32) -> Self {
        Self::with_cap(log, MAX_FLOWS)
    }

    pub(crate) fn with_cap(log: u32, cap: usize) -> Self {
        Self {
            buckets: (0..1usize << log).map(|_| BTreeMap::new()).collect(),
            log,
            len: 0,
            cap,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn nr_buckets(&self) -> usize {
        self.buckets.len()
    }

    fn bucket_index(&self, key: FlowKey) -> usize {
        (key.hash_input().wrapping_mul(GOLDEN_RATIO_64) >> (64 - self.log)) as usize
    }

    pub(crate) fn get_mut(&mut self, key: FlowKey) -> Option<&mut FlowEntry> {
        let idx = self.bucket_index(key);
        self.buckets[idx].get_mut(&key)
    }

    pub(crate) fn get(&self, key: FlowKey) -> Option<&FlowEntry> {
        let idx = self.bucket_index(key);
        self.buckets[idx].get(&key)
    }

    /// Find `key`, creating a fresh detached entry on a miss. The flag is
    /// true when the entry already existed.
    pub(crate) fn lookup_or_insert(
        &mut self,
        key: FlowKey,
        socket_hash: u64,
        credit: i64,
        now: Time,
    ) -> Result<(&mut FlowEntry, bool), TableFull> {
        use std::collections::btree_map::Entry;

        let idx = self.bucket_index(key);
        match self.buckets[idx].entry(key) {
            Entry::Occupied(e) => Ok((e.into_mut(), true)),
            Entry::Vacant(v) => {
                if self.len >= self.cap {
                    return Err(TableFull);
                }
                self.len += 1;
                Ok((v.insert(FlowEntry::new(key, socket_hash, credit, now)), false))
            }
        }
    }

    fn is_gc_candidate(entry: &FlowEntry, now: Time) -> bool {
        match entry.state {
            FlowState::Detached { since } => now > since + GC_AGE,
            _ => false,
        }
    }

    /// Walk the probed bucket and reclaim up to [`GC_MAX`] aged detached
    /// flows, stopping at the probe key. Returns the number reclaimed.
    pub(crate) fn gc(&mut self, probe: FlowKey, now: Time) -> usize {
        let idx = self.bucket_index(probe);
        let mut victims: SmallVec<[FlowKey; GC_MAX]> = SmallVec::new();
        for (key, entry) in self.buckets[idx].iter() {
            if *key == probe {
                break;
            }
            if Self::is_gc_candidate(entry, now) {
                victims.push(*key);
                if victims.len() == GC_MAX {
                    break;
                }
            }
        }
        for key in &victims {
            self.buckets[idx].remove(key);
        }
        self.len -= victims.len();
        victims.len()
    }

    /// Rehash every entry into `1 << log` buckets, dropping collection
    /// candidates along the way. Returns the number dropped.
    pub(crate) fn resize(&mut self, log: u32, now: Time) -> usize {
        let old = std::mem::replace(
            &mut self.buckets,
            (0..1usize << log).map(|_| BTreeMap::new()).collect(),
        );
        self.log = log;
        let mut dropped = 0;
        for entry in old.into_iter().flat_map(|b| b.into_values()) {
            if Self::is_gc_candidate(&entry, now) {
                dropped += 1;
                continue;
            }
            let idx = self.bucket_index(entry.key);
            let prev = self.buckets[idx].insert(entry.key, entry);
            debug_assert!(prev.is_none(), "duplicate flow key on rehash");
        }
        self.len -= dropped;
        dropped
    }

    pub(crate) fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        self.len = 0;
    }

    #[cfg(test)]
    pub(crate) fn iter(&self) -> impl Iterator<Item = &FlowEntry> {
        self.buckets.iter().flat_map(|b| b.values())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::EndpointId;

    fn insert(table: &mut FlowTable, key: FlowKey, now: Time) {
        let (_, existed) = table.lookup_or_insert(key, 0, 0, now).unwrap();
        assert!(!existed);
    }

    #[test]
    fn lookup_finds_inserted_flows() {
        let mut table = FlowTable::new(4);
        let ep = FlowKey::Endpoint(EndpointId::new(3));
        let syn = FlowKey::Synthetic(3);
        insert(&mut table, ep, Time::ZERO);
        insert(&mut table, syn, Time::ZERO);
        assert_eq!(table.len(), 2);
        let (_, existed) = table.lookup_or_insert(ep, 0, 0, Time::ZERO).unwrap();
        assert!(existed);
        assert!(table.get(syn).is_some());
    }

    #[test]
    fn occupancy_cap_rejects_new_flows() {
        let mut table = FlowTable::with_cap(2, 2);
        insert(&mut table, FlowKey::Synthetic(1), Time::ZERO);
        insert(&mut table, FlowKey::Synthetic(2), Time::ZERO);
        let err = table
            .lookup_or_insert(FlowKey::Synthetic(3), 0, 0, Time::ZERO)
            .unwrap_err();
        assert_eq!(err, TableFull);
        // Existing flows are still reachable past the cap.
        assert!(table.lookup_or_insert(FlowKey::Synthetic(1), 0, 0, Time::ZERO).is_ok());
    }

    #[test]
    fn gc_reclaims_only_aged_detached_flows() {
        let mut table = FlowTable::new(1);
        for i in 0..6 {
            insert(&mut table, FlowKey::Synthetic(i), Time::ZERO);
        }
        let now = Time::ZERO + GC_AGE + Delta::ONE;
        // Half the flows look busy.
        let mut aged = 0;
        for i in 0..6 {
            if i % 2 == 0 {
                table.get_mut(FlowKey::Synthetic(i)).unwrap().state = FlowState::Throttled;
            } else {
                aged += 1;
            }
        }
        // Absent probe keys landing in each of the two buckets cover the
        // whole table; walks never stop early on them.
        let first = FlowKey::Synthetic(100);
        let mut k = 101;
        while table.bucket_index(FlowKey::Synthetic(k)) == table.bucket_index(first) {
            k += 1;
        }
        let reclaimed = table.gc(first, now) + table.gc(FlowKey::Synthetic(k), now);
        assert_eq!(reclaimed, aged);
        assert_eq!(table.len(), 6 - aged);
    }

    #[test]
    fn gc_stops_at_the_probe_key() {
        let mut table = FlowTable::new(1);
        for i in 0..4 {
            insert(&mut table, FlowKey::Synthetic(i), Time::ZERO);
        }
        let now = Time::ZERO + GC_AGE + Delta::ONE;
        // Probing the smallest key reclaims nothing: the walk stops there.
        assert_eq!(table.gc(FlowKey::Synthetic(0), now), 0);
        assert_eq!(table.len(), 4);
    }

    #[test]
    fn resize_preserves_live_flows_and_drops_aged_ones() {
        let mut table = FlowTable::new(2);
        for i in 0..8 {
            insert(&mut table, FlowKey::Synthetic(i), Time::ZERO);
        }
        table.get_mut(FlowKey::Synthetic(0)).unwrap().state = FlowState::Throttled;
        let now = Time::ZERO + GC_AGE + Delta::ONE;
        let dropped = table.resize(6, now);
        assert_eq!(dropped, 7);
        assert_eq!(table.len(), 1);
        assert_eq!(table.nr_buckets(), 64);
        assert!(table.get(FlowKey::Synthetic(0)).is_some());
    }
}
