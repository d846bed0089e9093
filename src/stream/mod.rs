//! Datagram streams: logical channels between the local node and one peer, multiplexed over the
//!  router by [StreamId](crate::messaging::ids::StreamId).
//!
//! Every message a stream sends starts with a one-byte frame tag (see [frame]). Reliable modes
//!  acknowledge every accepted data or close frame with a separate ACK frame in the reverse
//!  direction, and the sender retransmits unacknowledged frames with exponential backoff.

pub mod datagram_stream;
pub mod frame;
pub mod ops;
pub mod receive_window;
pub mod send_window;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ReliabilityAndOrdering {
    UnreliableUnordered,
    UnreliableOrdered,
    ReliableUnordered,
    ReliableOrdered,
}

impl ReliabilityAndOrdering {
    pub fn is_reliable(&self) -> bool {
        matches!(self, Self::ReliableUnordered | Self::ReliableOrdered)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamState {
    Unregistered,
    Open,
    Closing,
    Closed,
}
