use crate::messaging::ids::NodeId;

/// The outcome of an operation as seen by the application. All recoverable conditions are
///  delivered through a [Callback](crate::callback::Callback) carrying one of these, never by
///  panicking.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Status {
    #[error("stream closed")]
    StreamClosed,
    #[error("peer {0:?} is unreachable")]
    Unreachable(NodeId),
    #[error("operation cancelled")]
    Cancelled,
    #[error("contract violation: {0}")]
    ContractViolation(#[from] ContractViolation),
    #[error("aborted: {0}")]
    Aborted(String),
}

/// Programming errors on the caller's side. They are reported as distinguishable failures
///  rather than being silently ignored, and leave the stream's state untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContractViolation {
    #[error("register() was called more than once")]
    AlreadyRegistered,
    #[error("the stream must be registered before use")]
    NotRegistered,
    #[error("another pull is already pending on this stream")]
    PullAlreadyPending,
    #[error("stream id 0 is reserved for routing control traffic")]
    ReservedStreamId,
    #[error("the stream id is already in use for this peer")]
    StreamIdInUse,
    #[error("a routable message needs at least one destination")]
    EmptyDestinations,
    #[error("the router was dropped while the stream was still in use")]
    RouterGone,
    #[error("the payload does not fit into a single message on the route to the peer")]
    PayloadTooLarge,
}

pub type StatusResult = Result<(), Status>;

pub type StatusOr<T> = Result<T, Status>;
