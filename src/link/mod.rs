pub mod memory_link;

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::callback::Callback;
use crate::messaging::ids::NodeId;
use crate::messaging::message::Message;

/// Identifies a registered link within its router. Ids are assigned in registration order, and
///  this order breaks ties between equally good routes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct LinkId(pub u64);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LinkMetrics {
    pub src: NodeId,
    pub peer: NodeId,
    /// `None` if the link has no measurement (yet)
    pub round_trip: Option<Duration>,
    /// lost messages per thousand
    pub loss_permille: u16,
    /// the largest message (header and payload) the link can transmit
    pub mtu: usize,
}

impl LinkMetrics {
    pub const UNKNOWN_ROUND_TRIP_MILLIS: u64 = 10;

    /// The routing cost of sending a message over this link, based on round trip time with a
    ///  penalty for loss. Lower is better, and it is never 0.
    pub fn cost(&self) -> u64 {
        let rtt_millis = match self.round_trip {
            Some(rtt) => (rtt.as_millis() as u64).max(1),
            None => Self::UNKNOWN_ROUND_TRIP_MILLIS,
        };
        let loss_permille = self.loss_permille.min(1000) as u64;
        (rtt_millis * (1000 + 4 * loss_permille) / 1000).max(1)
    }
}

/// A transport to exactly one peer node.
///
/// `forward` is best effort: returning `Ok` means the message was handed to the transport, not
///  that it arrived. An `Err` is taken as a sign of link trouble, and the router removes a link
///  after a configurable number of failures in a row.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Link: Debug + Send + Sync + 'static {
    async fn forward(&self, message: Message) -> anyhow::Result<()>;

    /// Starts graceful shutdown. `quiesced` is invoked once no further `forward` calls will be
    ///  honored.
    fn close(&self, quiesced: Callback<()>);

    /// cheap and side-effect free
    fn get_link_metrics(&self) -> LinkMetrics;
}
