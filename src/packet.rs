use typed_builder::TypedBuilder;

use crate::{
    time::Time,
    units::{Bytes, BytesPerSec},
};

identifier!(EndpointId);

/// A packet handed to the scheduler for transmission.
///
/// The scheduler treats the payload as opaque; only the fields below matter
/// to classification, admission, and pacing. `time_to_send` and `ecn_ce` are
/// scheduler-owned annotations.
#[derive(Debug, Clone, Copy, TypedBuilder)]
pub struct Packet {
    /// Wire length.
    #[builder(setter(into))]
    pub len: Bytes,
    /// Transmit-after timestamp; `Time::ZERO` means "as soon as possible".
    #[builder(default)]
    pub tstamp: Time,
    #[builder(default)]
    pub priority: Priority,
    /// Owning endpoint, if any. Orphaned packets are classified by `hash`.
    #[builder(default, setter(strip_option))]
    pub endpoint: Option<Endpoint>,
    /// Hash of the header 4-tuple.
    #[builder(default)]
    pub hash: u64,
    #[builder(default)]
    pub src_port: u16,
    #[builder(default)]
    pub dst_port: u16,

    /// Earliest departure time, assigned at enqueue.
    #[builder(default, setter(skip))]
    pub(crate) time_to_send: Time,
    /// Congestion-experienced mark, set at dequeue past the CE threshold.
    #[builder(default, setter(skip))]
    pub(crate) ecn_ce: bool,
}

impl Packet {
    /// Nominal link MTU used for the quantum defaults.
    pub const MTU: Bytes = Bytes::new(1_514);

    /// The departure time assigned to this packet.
    pub fn time_to_send(&self) -> Time {
        self.time_to_send
    }

    /// Whether the packet was marked congestion-experienced on dequeue.
    pub fn ecn_ce(&self) -> bool {
        self.ecn_ce
    }
}

/// The transmitting endpoint a packet belongs to.
#[derive(Debug, Clone, Copy, TypedBuilder)]
pub struct Endpoint {
    pub id: EndpointId,
    /// The endpoint's current hash; changes when the endpoint is reused.
    pub hash: u64,
    /// Endpoint-requested pacing rate. `BytesPerSec::MAX` means unpaced.
    #[builder(default = BytesPerSec::MAX)]
    pub pacing_rate: BytesPerSec,
    #[builder(default)]
    pub state: EndpointState,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, derivative::Derivative)]
#[derivative(Default)]
pub enum EndpointState {
    #[derivative(Default)]
    Established,
    Listener,
    Closed,
}

/// Packet priority class. `Control` packets bypass the fair queue entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derivative::Derivative)]
#[derivative(Default)]
pub enum Priority {
    #[derivative(Default)]
    Normal,
    Control,
}
