use thiserror::Error;

/// Why an arriving packet was refused. The packet is consumed; freeing it is
/// the host's business.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DropReason {
    #[error("scheduler backlog limit reached")]
    TailLimit,
    #[error("per-flow backlog limit reached")]
    FlowLimit,
    #[error("departure time beyond the accepted horizon")]
    Horizon,
}

/// Errors surfaced by control operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    #[error("configuration parameter `{0}` is out of range")]
    InvalidConfig(&'static str),
}
