use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use tracing::{trace, warn};

use crate::callback::Callback;
use crate::link::{Link, LinkMetrics};
use crate::messaging::ids::NodeId;
use crate::messaging::message::Message;
use crate::router::Router;

/// An in-process link to another router. Every message goes through the wire codec (so payload
///  factories see a realistic budget and oversized messages are dropped), and is then handed to
///  the remote router before `forward` returns.
///
/// Loss can be injected with [MemoryLink::drop_next].
pub struct MemoryLink {
    src: NodeId,
    peer: NodeId,
    remote: Weak<Router>,
    mtu: usize,
    state: Mutex<MemoryLinkState>,
}

struct MemoryLinkState {
    is_closed: bool,
    num_to_drop: usize,
    num_delivered: usize,
    round_trip: Option<Duration>,
    loss_permille: u16,
}

impl Debug for MemoryLink {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "MemoryLink({:?} -> {:?})", self.src, self.peer)
    }
}

impl MemoryLink {
    pub const DEFAULT_MTU: usize = 1400;

    pub fn new(src: NodeId, remote: &Arc<Router>, mtu: usize) -> Arc<MemoryLink> {
        Arc::new(MemoryLink {
            src,
            peer: remote.node_id(),
            remote: Arc::downgrade(remote),
            mtu,
            state: Mutex::new(MemoryLinkState {
                is_closed: false,
                num_to_drop: 0,
                num_delivered: 0,
                round_trip: None,
                loss_permille: 0,
            }),
        })
    }

    /// Creates links in both directions between two routers, without registering them
    pub fn pair(a: &Arc<Router>, b: &Arc<Router>) -> (Arc<MemoryLink>, Arc<MemoryLink>) {
        (
            MemoryLink::new(a.node_id(), b, Self::DEFAULT_MTU),
            MemoryLink::new(b.node_id(), a, Self::DEFAULT_MTU),
        )
    }

    fn lock_state(&self) -> MutexGuard<'_, MemoryLinkState> {
        self.state.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// silently drops the next `n` messages forwarded over this link
    pub fn drop_next(&self, n: usize) {
        self.lock_state().num_to_drop += n;
    }

    pub fn num_delivered(&self) -> usize {
        self.lock_state().num_delivered
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().is_closed
    }

    /// changes the metrics the link reports, e.g. to simulate degradation
    pub fn set_quality(&self, round_trip: Option<Duration>, loss_permille: u16) {
        let mut state = self.lock_state();
        state.round_trip = round_trip;
        state.loss_permille = loss_permille;
    }
}

#[async_trait]
impl Link for MemoryLink {
    async fn forward(&self, message: Message) -> anyhow::Result<()> {
        {
            let mut state = self.lock_state();
            if state.is_closed {
                bail!("{:?} is closed", self);
            }
            if state.num_to_drop > 0 {
                state.num_to_drop -= 1;
                trace!("{:?}: dropping {:?}", self, message.header);
                return Ok(());
            }
        }

        let remote = self.remote.upgrade()
            .ok_or_else(|| anyhow!("{:?}: remote router was dropped", self))?;

        let encoded = match message.encode(self.mtu) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("{:?}: dropping message: {}", self, e);
                return Ok(());
            }
        };
        let decoded = Message::decode(encoded)?;

        self.lock_state().num_delivered += 1;
        remote.forward(decoded).await;
        Ok(())
    }

    fn close(&self, quiesced: Callback<()>) {
        self.lock_state().is_closed = true;
        quiesced.call(());
    }

    fn get_link_metrics(&self) -> LinkMetrics {
        let state = self.lock_state();
        LinkMetrics {
            src: self.src,
            peer: self.peer,
            round_trip: state.round_trip,
            loss_permille: state.loss_permille,
            mtu: self.mtu,
        }
    }
}
