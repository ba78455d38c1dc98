//! The scheduler core: classification, admission, round-robin dispatch with
//! rate pacing, and the co-flow interleave policy.

mod rr;
mod throttle;
mod watchdog;

use std::cmp;

use tracing::{debug, trace};

use crate::{
    config::Config,
    error::{DropReason, Error},
    flow::{FlowEntry, FlowKey, FlowState, ListId},
    packet::{EndpointState, Packet, Priority},
    stats::{Counters, Stats},
    table::FlowTable,
    time::{Clock, MonotonicClock, Time},
    units::{BytesPerSec, Nanosecs, Secs},
};

use self::{rr::RrList, throttle::ThrottleTree, watchdog::Watchdog};

/// Where the classifier routed a packet.
enum Target {
    /// The unrated, unlimited control/fallback slot.
    Internal,
    /// A flow in the table.
    Flow(FlowKey),
}

/// A per-flow fair-queueing packet scheduler with rate pacing.
///
/// Packets are classified into flows, buffered in earliest-departure order,
/// and served round robin under a deficit-credit discipline. Flows whose
/// next permissible transmit time lies in the future are parked in a
/// throttle tree; learned co-flows receive a bounded interleaved share of
/// dispatch opportunities.
///
/// The host serializes all calls on one instance (there is no internal
/// locking) and owns packet lifetimes: rejected packets are consumed with a
/// [`DropReason`], purged packets are simply dropped. Dropping the scheduler
/// releases everything.
#[derive(Debug)]
pub struct Scheduler<C: Clock = MonotonicClock> {
    clock: C,
    /// Clock value cached per batch.
    now: Time,
    cfg: Config,

    table: FlowTable,
    new_flows: RrList,
    old_flows: RrList,
    co_flows: RrList,
    throttled: ThrottleTree,
    /// Control-priority and allocation-fallback packets.
    internal: FlowEntry,

    /// Packets queued across all flows, the internal slot included.
    backlog: usize,
    /// Flows currently detached.
    inactive: usize,

    // Co-flow policy, scoped to this instance.
    co_ids: [Option<u64>; 2],
    ucounter: u32,
    flipflag: bool,

    unthrottle_latency_ns: u64,
    counters: Counters,
    watchdog: Watchdog,
    peeked: Option<Packet>,
}

impl Scheduler {
    /// Build a scheduler over the host's monotonic clock.
    pub fn new(cfg: Config) -> Result<Self, Error> {
        Self::with_clock(cfg, MonotonicClock::default())
    }
}

impl<C: Clock> Scheduler<C> {
    /// Build a scheduler over a caller-provided time source.
    pub fn with_clock(cfg: Config, clock: C) -> Result<Self, Error> {
        cfg.validate()?;
        Ok(Self {
            clock,
            now: Time::ZERO,
            table: FlowTable::new(cfg.buckets_log),
            cfg,
            new_flows: RrList::new(),
            old_flows: RrList::new(),
            co_flows: RrList::new(),
            throttled: ThrottleTree::new(),
            internal: FlowEntry::new(FlowKey::Synthetic(0), 0, 0, Time::ZERO),
            backlog: 0,
            inactive: 0,
            co_ids: [None; 2],
            ucounter: 0,
            flipflag: false,
            unthrottle_latency_ns: 0,
            counters: Counters::default(),
            watchdog: Watchdog::new(),
            peeked: None,
        })
    }

    /// Packets currently queued, a peeked packet included.
    pub fn qlen(&self) -> usize {
        self.backlog + usize::from(self.peeked.is_some())
    }

    /// The live configuration.
    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Snapshot the counters and gauges.
    pub fn stats(&self) -> Stats {
        Stats {
            gc_flows: self.counters.gc_flows,
            highprio_packets: self.counters.highprio_packets,
            throttled: self.counters.throttled,
            flows_plimit_drops: self.counters.flows_plimit_drops,
            pkts_too_long: self.counters.pkts_too_long,
            allocation_errors: self.counters.allocation_errors,
            ce_mark: self.counters.ce_mark,
            horizon_drops: self.counters.horizon_drops,
            horizon_caps: self.counters.horizon_caps,
            flows: self.table.len() as u64,
            inactive_flows: self.inactive as u64,
            throttled_flows: self.throttled.len() as u64,
            time_next_delayed_flow: self.throttled.next_due(),
            unthrottle_latency_ns: self.unthrottle_latency_ns,
        }
    }

    /// The wakeup the host should arm, if any. A new request replaces the
    /// previous one.
    pub fn next_wakeup(&self) -> Option<Time> {
        self.watchdog.pending()
    }

    /// The scheduler's time source.
    pub fn clock_mut(&mut self) -> &mut C {
        &mut self.clock
    }

    fn refresh_now(&mut self) {
        self.now = self.clock.now();
    }

    /// Admit a packet. On rejection the packet is consumed and the reason
    /// returned; every rejection is also counted.
    pub fn enqueue(&mut self, mut pkt: Packet) -> Result<(), DropReason> {
        if self.qlen() >= self.cfg.plimit as usize {
            return Err(DropReason::TailLimit);
        }

        // Horizon policing, against the cached clock first.
        if pkt.tstamp == Time::ZERO {
            self.refresh_now();
            pkt.time_to_send = self.now;
        } else {
            let horizon = self.cfg.horizon.into_delta();
            if pkt.tstamp > self.now + horizon {
                self.refresh_now();
                if pkt.tstamp > self.now + horizon {
                    if self.cfg.horizon_drop {
                        self.counters.horizon_drops += 1;
                        return Err(DropReason::Horizon);
                    }
                    self.counters.horizon_caps += 1;
                    pkt.tstamp = self.now + horizon;
                }
            }
            pkt.time_to_send = pkt.tstamp;
        }

        let key = match self.classify(&mut pkt) {
            Target::Internal => {
                self.counters.highprio_packets += 1;
                self.internal.push(pkt);
                self.backlog += 1;
                return Ok(());
            }
            Target::Flow(key) => key,
        };

        let flow = self.table.get_mut(key).expect("classified flow must exist");
        if flow.qlen() >= self.cfg.flow_plimit as usize {
            self.counters.flows_plimit_drops += 1;
            return Err(DropReason::FlowLimit);
        }

        if let FlowState::Detached { since } = flow.state {
            // A flow returning from a long idle gets its credit refreshed.
            if self.now > since + self.cfg.flow_refill_delay.into_delta() {
                flow.credit = cmp::max(flow.credit, self.cfg.quantum.into_u64() as i64);
            }
        }
        let was_detached = flow.is_detached();
        let shash = flow.socket_hash;
        flow.push(pkt);
        self.backlog += 1;
        if was_detached {
            let co = self.co_ids.iter().flatten().any(|&h| h == shash);
            flow.state = FlowState::OnList(if co { ListId::Co } else { ListId::New });
            if co {
                self.co_flows.push(key);
            } else {
                self.new_flows.push(key);
            }
            self.inactive -= 1;
        }

        // Learn co-flow identities from the configured source ports. The
        // packet that teaches an identity is itself placed normally.
        if self.cfg.f1_source != 0 && pkt.src_port == self.cfg.f1_source {
            self.co_ids[0] = Some(shash);
        }
        if self.cfg.f2_source != 0 && pkt.src_port == self.cfg.f2_source {
            self.co_ids[1] = Some(shash);
        }
        Ok(())
    }

    /// Map a packet to the flow it joins, creating the flow if needed.
    fn classify(&mut self, pkt: &mut Packet) -> Target {
        if pkt.priority == Priority::Control {
            return Target::Internal;
        }

        let endpoint = pkt
            .endpoint
            .filter(|ep| ep.state == EndpointState::Established);
        let key = match endpoint {
            Some(ep) => FlowKey::Endpoint(ep.id),
            None => {
                // Orphaned (ownerless, listening, or closed-endpoint)
                // packets are pooled by masked header hash.
                pkt.endpoint = None;
                FlowKey::Synthetic(pkt.hash & u64::from(self.cfg.orphan_mask))
            }
        };

        // Opportunistic collection, only under table pressure.
        if self.table.len() >= 2 * self.table.nr_buckets() && self.inactive > self.table.len() / 2
        {
            let reclaimed = self.table.gc(key, self.now);
            if reclaimed > 0 {
                self.counters.gc_flows += reclaimed as u64;
                self.inactive -= reclaimed;
                debug!(reclaimed, "flow table gc");
            }
        }

        let socket_hash = endpoint.map_or(pkt.hash, |ep| ep.hash);
        let initial = self.cfg.initial_quantum.into_u64() as i64;
        match self.table.lookup_or_insert(key, socket_hash, initial, self.now) {
            Ok((flow, existed)) => {
                if !existed {
                    self.inactive += 1;
                } else if let Some(ep) = endpoint {
                    if flow.socket_hash != ep.hash {
                        // The endpoint was reused for a new flow: start its
                        // scheduling state over.
                        flow.credit = initial;
                        flow.socket_hash = ep.hash;
                        let parked_at = flow.time_next_packet;
                        flow.time_next_packet = Time::ZERO;
                        if flow.state == FlowState::Throttled {
                            flow.state = FlowState::OnList(ListId::Old);
                            self.throttled.remove(parked_at, key);
                            self.old_flows.push(key);
                        }
                    }
                }
                Target::Flow(key)
            }
            Err(_) => {
                self.counters.allocation_errors += 1;
                Target::Internal
            }
        }
    }

    /// Return the next packet to transmit, or `None`; in that case the
    /// watchdog holds a wakeup request whenever throttled flows remain.
    pub fn dequeue(&mut self) -> Option<Packet> {
        if let Some(pkt) = self.peeked.take() {
            return Some(pkt);
        }
        self.dequeue_inner()
    }

    /// Non-destructive view of the next packet [`dequeue`](Self::dequeue)
    /// would return. The packet stays queued and is handed out by the next
    /// `dequeue` call.
    pub fn peek(&mut self) -> Option<&Packet> {
        if self.peeked.is_none() {
            self.peeked = self.dequeue_inner();
        }
        self.peeked.as_ref()
    }

    fn dequeue_inner(&mut self) -> Option<Packet> {
        if let Some(pkt) = self.internal.pop() {
            self.backlog -= 1;
            return Some(pkt);
        }

        self.refresh_now();
        self.unthrottle_due();

        loop {
            let Some(head) = self.pick_list() else {
                let due = self.throttled.next_due();
                if due != Time::MAX {
                    let at = due + self.cfg.timer_slack.into_delta();
                    self.watchdog.schedule(at);
                    trace!("watchdog armed");
                } else {
                    self.watchdog.cancel();
                }
                return None;
            };
            let key = match head {
                ListId::New => *self.new_flows.head().expect("picked list is non-empty"),
                ListId::Old => *self.old_flows.head().expect("picked list is non-empty"),
                ListId::Co => *self.co_flows.head().expect("picked list is non-empty"),
            };
            let (shash, credit) = {
                let flow = self.table.get(key).expect("listed flow must exist");
                (flow.socket_hash, flow.credit)
            };

            // A co-flow surfacing in the regular discipline is promoted.
            let is_co = self.co_ids.iter().flatten().any(|&h| h == shash);
            if is_co && head != ListId::Co {
                self.pop_from(head);
                let flow = self.table.get_mut(key).expect("listed flow must exist");
                flow.state = FlowState::OnList(ListId::Co);
                self.co_flows.push(key);
                self.ucounter += 1;
                trace!(ucounter = self.ucounter, "co-flow promoted");
                continue;
            }
            // Breach: enough promotions accumulated while serving the
            // regular lists; flip dispatch to the co list.
            if !self.flipflag && head != ListId::Co && self.ucounter >= self.cfg.co_breach {
                self.flipflag = true;
                trace!("co-flow breach");
                continue;
            }
            // Relief: the co list drew its surplus down; flip back.
            if self.flipflag && head == ListId::Co && self.ucounter == 0 {
                self.flipflag = false;
                trace!("co-flow relief");
                continue;
            }
            if self.flipflag && head == ListId::Co {
                self.ucounter = self.ucounter.saturating_sub(1);
            }

            // Credit gate: an exhausted flow refills and goes to the back
            // of the old list.
            if credit <= 0 {
                let flow = self.table.get_mut(key).expect("listed flow must exist");
                flow.credit += self.cfg.quantum.into_u64() as i64;
                flow.state = FlowState::OnList(ListId::Old);
                self.pop_from(head);
                self.old_flows.push(key);
                continue;
            }

            let (next, tnp) = {
                let flow = self.table.get(key).expect("listed flow must exist");
                (flow.peek().map(|p| p.time_to_send), flow.time_next_packet)
            };
            let Some(tts) = next else {
                // Drained. Keep the flow cycling through the old list while
                // others still wait there, otherwise detach it.
                self.pop_from(head);
                let keep = head != ListId::Old && !self.old_flows.is_empty();
                let flow = self.table.get_mut(key).expect("listed flow must exist");
                if keep {
                    flow.state = FlowState::OnList(ListId::Old);
                    self.old_flows.push(key);
                } else {
                    flow.state = FlowState::Detached { since: self.now };
                    self.inactive += 1;
                }
                continue;
            };

            // Pacing gate: not eligible yet, park in the throttle tree.
            let send_at = cmp::max(tts, tnp);
            if self.now < send_at {
                self.pop_from(head);
                let flow = self.table.get_mut(key).expect("listed flow must exist");
                flow.time_next_packet = send_at;
                flow.state = FlowState::Throttled;
                self.throttled.insert(send_at, key);
                self.counters.throttled += 1;
                continue;
            }

            let flow = self.table.get_mut(key).expect("listed flow must exist");
            let mut pkt = flow.pop().expect("peeked packet must remain");
            if self.now - send_at > self.cfg.ce_threshold.into_delta() {
                pkt.ecn_ce = true;
                self.counters.ce_mark += 1;
            }
            self.backlog -= 1;
            let mut plen = pkt.len;
            flow.credit -= plen.into_u64() as i64;

            if !self.cfg.rate_enable {
                return Some(pkt);
            }
            let mut rate = self.cfg.flow_max_rate;
            // Endpoint pacing only steers packets that carried no explicit
            // departure time; the slow-flow handling below applies to
            // whichever rate survives the blend.
            if pkt.tstamp == Time::ZERO {
                if let Some(ep) = pkt.endpoint {
                    rate = cmp::min(ep.pacing_rate, rate);
                }
            }
            if rate <= self.cfg.low_rate_threshold {
                // Slow flows get one packet per round.
                flow.credit = 0;
            } else {
                plen = cmp::max(plen, self.cfg.quantum);
                if flow.credit > 0 {
                    return Some(pkt);
                }
            }
            if rate != BytesPerSec::MAX {
                let mut delay = rate.length(plen);
                let ceiling = Secs::new(1).into_ns();
                if delay > ceiling {
                    delay = ceiling;
                    self.counters.pkts_too_long += 1;
                }
                // Compensate for lateness since the previous transmit slot.
                if flow.time_next_packet > Time::ZERO {
                    let late = (self.now - flow.time_next_packet).into_ns();
                    delay = delay - cmp::min(Nanosecs::new(delay.into_u64() / 2), late);
                }
                flow.time_next_packet = self.now + delay.into_delta();
            }
            return Some(pkt);
        }
    }

    fn pick_list(&self) -> Option<ListId> {
        if self.flipflag && !self.co_flows.is_empty() {
            Some(ListId::Co)
        } else if !self.new_flows.is_empty() {
            Some(ListId::New)
        } else if !self.old_flows.is_empty() {
            Some(ListId::Old)
        } else if !self.co_flows.is_empty() {
            Some(ListId::Co)
        } else {
            None
        }
    }

    fn pop_from(&mut self, id: ListId) -> Option<FlowKey> {
        match id {
            ListId::New => self.new_flows.pop(),
            ListId::Old => self.old_flows.pop(),
            ListId::Co => self.co_flows.pop(),
        }
    }

    /// Release due flows from the throttle tree onto the old list and feed
    /// the wakeup-lateness EWMA.
    fn unthrottle_due(&mut self) {
        let due = self.throttled.next_due();
        if due <= self.now {
            let sample = (self.now - due).into_ns().into_u64();
            self.unthrottle_latency_ns -= self.unthrottle_latency_ns >> 3;
            self.unthrottle_latency_ns += sample >> 3;
        }
        for key in self.throttled.drain_due(self.now) {
            let flow = self.table.get_mut(key).expect("throttled flow must exist");
            flow.state = FlowState::OnList(ListId::Old);
            self.old_flows.push(key);
        }
    }

    /// Purge every queued packet and flow. Counters survive; the learned
    /// co-flow identities go with the flows that defined them.
    pub fn reset(&mut self) {
        self.table.clear();
        self.new_flows.clear();
        self.old_flows.clear();
        self.co_flows.clear();
        self.throttled.clear();
        self.internal = FlowEntry::new(FlowKey::Synthetic(0), 0, 0, Time::ZERO);
        self.peeked = None;
        self.backlog = 0;
        self.inactive = 0;
        self.co_ids = [None; 2];
        self.ucounter = 0;
        self.flipflag = false;
        self.watchdog.cancel();
    }

    /// Apply a new configuration. Validation happens first and a rejection
    /// leaves the scheduler untouched; a shrunken `plimit` drains the
    /// excess backlog.
    pub fn change(&mut self, cfg: Config) -> Result<(), Error> {
        cfg.validate()?;
        let old_log = self.cfg.buckets_log;
        self.cfg = cfg;
        if cfg.buckets_log != old_log {
            self.refresh_now();
            let dropped = self.table.resize(cfg.buckets_log, self.now);
            if dropped > 0 {
                self.counters.gc_flows += dropped as u64;
                self.inactive -= dropped;
            }
            debug!(from = old_log, to = cfg.buckets_log, "flow table resized");
        }
        let mut drained = 0usize;
        while self.qlen() > self.cfg.plimit as usize {
            if self.dequeue().is_none() {
                break;
            }
            drained += 1;
        }
        if drained > 0 {
            debug!(drained, "backlog trimmed to new limit");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        packet::Endpoint,
        time::{Delta, ManualClock},
        units::{Bytes, Millisecs},
    };

    fn sched(cfg: Config) -> Scheduler<ManualClock> {
        Scheduler::with_clock(cfg, ManualClock::new(Time::ZERO)).unwrap()
    }

    fn endpoint(id: u64, hash: u64) -> Endpoint {
        Endpoint::builder()
            .id(crate::packet::EndpointId::new(id))
            .hash(hash)
            .build()
    }

    fn pkt_on(ep: Endpoint, len: u64) -> Packet {
        Packet::builder()
            .len(Bytes::new(len))
            .endpoint(ep)
            .hash(ep.hash)
            .build()
    }

    fn assert_backlog_consistent<C: Clock>(s: &Scheduler<C>) {
        let queued: usize =
            s.table.iter().map(FlowEntry::qlen).sum::<usize>() + s.internal.qlen();
        assert_eq!(queued, s.backlog);
    }

    #[test]
    fn control_packets_bypass_the_fair_queue() {
        let mut s = sched(Config::default());
        s.enqueue(pkt_on(endpoint(1, 10), 1000)).unwrap();
        let ctrl = Packet::builder()
            .len(Bytes::new(64))
            .priority(Priority::Control)
            .build();
        s.enqueue(ctrl).unwrap();
        assert_backlog_consistent(&s);
        let first = s.dequeue().unwrap();
        assert_eq!(first.priority, Priority::Control);
        assert_eq!(s.stats().highprio_packets, 1);
    }

    #[test]
    fn orphans_pool_into_a_synthetic_flow() {
        let mut s = sched(Config::default());
        let orphan = Packet::builder().len(Bytes::new(500)).hash(77).build();
        s.enqueue(orphan).unwrap();
        let listener = Packet::builder()
            .len(Bytes::new(500))
            .endpoint(
                Endpoint::builder()
                    .id(crate::packet::EndpointId::new(9))
                    .hash(99)
                    .state(EndpointState::Listener)
                    .build(),
            )
            .hash(77)
            .build();
        s.enqueue(listener).unwrap();
        assert_eq!(s.stats().flows, 1);
        let out = s.dequeue().unwrap();
        assert!(out.endpoint.is_none());
        assert_eq!(s.qlen(), 1);
    }

    #[test]
    fn tail_and_flow_limits_reject() {
        let cfg = Config::builder().plimit(2).flow_plimit(1).build();
        let mut s = sched(cfg);
        let ep_a = endpoint(1, 10);
        let ep_b = endpoint(2, 20);
        s.enqueue(pkt_on(ep_a, 100)).unwrap();
        assert_eq!(s.enqueue(pkt_on(ep_a, 100)), Err(DropReason::FlowLimit));
        s.enqueue(pkt_on(ep_b, 100)).unwrap();
        assert_eq!(s.enqueue(pkt_on(ep_b, 100)), Err(DropReason::TailLimit));
        assert_eq!(s.stats().flows_plimit_drops, 1);
        assert_backlog_consistent(&s);
    }

    #[test]
    fn allocation_pressure_falls_back_to_the_internal_flow() {
        let mut s = sched(Config::default());
        s.table = FlowTable::with_cap(1, 0);
        s.enqueue(pkt_on(endpoint(1, 10), 100)).unwrap();
        assert_eq!(s.stats().allocation_errors, 1);
        assert_eq!(s.stats().highprio_packets, 1);
        assert_eq!(s.stats().flows, 0);
        assert!(s.dequeue().is_some());
    }

    #[test]
    fn oversized_pacing_delay_is_clamped() {
        let cfg = Config::builder()
            .flow_max_rate(BytesPerSec::new(100))
            .build();
        let mut s = sched(cfg);
        let mut pkt = pkt_on(endpoint(1, 10), 1500);
        pkt.tstamp = Time::ONE;
        s.clock_mut().advance(Delta::ONE);
        s.enqueue(pkt).unwrap();
        assert!(s.dequeue().is_some());
        assert_eq!(s.stats().pkts_too_long, 1);
        // The flow is pinned a full second out.
        let parked = s.table.get(FlowKey::Endpoint(crate::packet::EndpointId::new(1)));
        assert_eq!(
            parked.unwrap().time_next_packet,
            Time::ONE + Secs::new(1).into_ns().into_delta()
        );
    }

    #[test]
    fn late_delivery_gets_a_ce_mark() {
        let cfg = Config::builder().ce_threshold(Millisecs::new(1).into_ns()).build();
        let mut s = sched(cfg);
        s.enqueue(pkt_on(endpoint(1, 10), 100)).unwrap();
        s.clock_mut().advance(Millisecs::new(5).into_delta());
        let out = s.dequeue().unwrap();
        assert!(out.ecn_ce());
        assert_eq!(s.stats().ce_mark, 1);
    }

    #[test]
    fn peek_is_stable_and_conserves_packets() {
        let mut s = sched(Config::default());
        s.enqueue(pkt_on(endpoint(1, 10), 100)).unwrap();
        let seen = *s.peek().unwrap();
        assert_eq!(s.qlen(), 1);
        let got = s.dequeue().unwrap();
        assert_eq!(got.len, seen.len);
        assert_eq!(s.qlen(), 0);
        assert!(s.peek().is_none());
    }
}
