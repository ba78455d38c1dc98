use crate::{
    error::Error,
    packet::Packet,
    units::{Bytes, BytesPerSec, Microsecs, Millisecs, Nanosecs, Secs},
};

/// Scheduler knobs. All parameters can be changed at runtime through
/// [`Scheduler::change`](crate::Scheduler::change).
#[derive(Debug, Clone, Copy, typed_builder::TypedBuilder, serde::Serialize, serde::Deserialize)]
pub struct Config {
    /// Global packet cap; arrivals beyond it are tail-dropped.
    #[builder(default = 10_000)]
    pub plimit: u32,
    /// Per-flow packet cap.
    #[builder(default = 100)]
    pub flow_plimit: u32,
    /// Byte budget added to a flow per round-robin round.
    #[builder(default = Bytes::new(2 * Packet::MTU.into_u64()), setter(into))]
    pub quantum: Bytes,
    /// Byte budget granted when a flow is first scheduled.
    #[builder(default = Bytes::new(10 * Packet::MTU.into_u64()), setter(into))]
    pub initial_quantum: Bytes,
    /// Hard per-flow rate cap. `BytesPerSec::MAX` disables the cap.
    #[builder(default = BytesPerSec::MAX, setter(into))]
    pub flow_max_rate: BytesPerSec,
    /// Flows paced at or below this rate get one packet per round.
    #[builder(default = BytesPerSec::new(68_750), setter(into))]
    pub low_rate_threshold: BytesPerSec,
    /// log2 of the flow-table bucket count; valid range 1..=18.
    #[builder(default = 10)]
    pub buckets_log: u32,
    /// Idle period after which a returning flow's credit is refreshed.
    #[builder(default = Millisecs::new(40).into_ns(), setter(into))]
    pub flow_refill_delay: Nanosecs,
    /// Mask applied to header hashes when synthesizing orphan flow keys.
    #[builder(default = 1023)]
    pub orphan_mask: u32,
    /// Lateness beyond which packets are marked congestion-experienced.
    #[builder(default = Nanosecs::MAX, setter(into))]
    pub ce_threshold: Nanosecs,
    /// Slack added to watchdog wakeups.
    #[builder(default = Microsecs::new(10).into_ns(), setter(into))]
    pub timer_slack: Nanosecs,
    /// Maximum accepted distance of a departure time into the future.
    #[builder(default = Secs::new(10).into_ns(), setter(into))]
    pub horizon: Nanosecs,
    /// Beyond the horizon: drop (true) or cap to the horizon (false).
    #[builder(default = true)]
    pub horizon_drop: bool,
    /// Enable rate pacing.
    #[builder(default = true)]
    pub rate_enable: bool,
    /// Source ports whose flows are learned as co-flows.
    #[builder(default = 0)]
    pub f1_source: u16,
    #[builder(default = 0)]
    pub f2_source: u16,
    /// Destination-port identifiers; part of the dump surface, not matched.
    #[builder(default = 0)]
    pub f1_dest: u16,
    #[builder(default = 0)]
    pub f2_dest: u16,
    /// Co-flow promotions tolerated before dispatch flips to the co list.
    #[builder(default = 2)]
    pub co_breach: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Config {
    /// Check every parameter range. Called before any config is applied.
    pub fn validate(&self) -> Result<(), Error> {
        if !(1..=18).contains(&self.buckets_log) {
            return Err(Error::InvalidConfig("buckets_log"));
        }
        if self.quantum == Bytes::ZERO || self.quantum.into_u64() >= (1 << 20) {
            return Err(Error::InvalidConfig("quantum"));
        }
        if self.initial_quantum == Bytes::ZERO {
            return Err(Error::InvalidConfig("initial_quantum"));
        }
        if self.plimit == 0 {
            return Err(Error::InvalidConfig("plimit"));
        }
        if self.flow_plimit == 0 {
            return Err(Error::InvalidConfig("flow_plimit"));
        }
        if self.co_breach == 0 {
            return Err(Error::InvalidConfig("co_breach"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn bucket_log_range_is_enforced() {
        let cfg = Config::builder().buckets_log(0).build();
        assert_eq!(cfg.validate(), Err(Error::InvalidConfig("buckets_log")));
        let cfg = Config::builder().buckets_log(19).build();
        assert_eq!(cfg.validate(), Err(Error::InvalidConfig("buckets_log")));
    }

    #[test]
    fn quantum_must_be_sane() {
        let cfg = Config::builder().quantum(Bytes::ZERO).build();
        assert_eq!(cfg.validate(), Err(Error::InvalidConfig("quantum")));
        let cfg = Config::builder().quantum(Bytes::new(1 << 20)).build();
        assert_eq!(cfg.validate(), Err(Error::InvalidConfig("quantum")));
    }
}
