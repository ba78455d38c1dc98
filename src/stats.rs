use crate::time::Time;

/// A point-in-time snapshot of scheduler counters and gauges, as returned by
/// [`Scheduler::stats`](crate::Scheduler::stats).
#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct Stats {
    /// Flows reclaimed by garbage collection.
    pub gc_flows: u64,
    /// Control-priority packets routed through the internal flow.
    pub highprio_packets: u64,
    /// Times a flow was parked in the throttle tree.
    pub throttled: u64,
    /// Packets dropped against the per-flow cap.
    pub flows_plimit_drops: u64,
    /// Pacing delays clamped at one second.
    pub pkts_too_long: u64,
    /// Flow allocations that fell back to the internal flow.
    pub allocation_errors: u64,
    /// Packets marked congestion-experienced.
    pub ce_mark: u64,
    /// Packets dropped for exceeding the horizon.
    pub horizon_drops: u64,
    /// Packets whose departure time was capped to the horizon.
    pub horizon_caps: u64,

    /// Live flows in the table.
    pub flows: u64,
    /// Flows currently detached.
    pub inactive_flows: u64,
    /// Flows currently parked in the throttle tree.
    pub throttled_flows: u64,
    /// Earliest wakeup among throttled flows, or `Time::MAX`.
    pub time_next_delayed_flow: Time,
    /// EWMA of watchdog wakeup lateness, alpha = 1/8.
    pub unthrottle_latency_ns: u64,
}

/// Monotonic event counters. Gauges are assembled from live state at dump
/// time instead.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Counters {
    pub(crate) gc_flows: u64,
    pub(crate) highprio_packets: u64,
    pub(crate) throttled: u64,
    pub(crate) flows_plimit_drops: u64,
    pub(crate) pkts_too_long: u64,
    pub(crate) allocation_errors: u64,
    pub(crate) ce_mark: u64,
    pub(crate) horizon_drops: u64,
    pub(crate) horizon_caps: u64,
}
