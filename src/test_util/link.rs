use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;

use crate::callback::Callback;
use crate::link::{Link, LinkMetrics};
use crate::messaging::ids::{NodeId, StreamId};
use crate::messaging::message::{Destination, Message};
use crate::slice::{LazySliceArgs, Slice};

/// A [Link] that records forwarded messages instead of delivering them
#[derive(Debug)]
pub struct TrackingLink {
    metrics: Mutex<LinkMetrics>,
    tracker: Mutex<Vec<Message>>,
    is_failing: AtomicBool,
    is_closed: AtomicBool,
}

impl TrackingLink {
    pub fn new(src: NodeId, peer: NodeId) -> TrackingLink {
        TrackingLink {
            metrics: Mutex::new(LinkMetrics {
                src,
                peer,
                round_trip: None,
                loss_permille: 0,
                mtu: 1400,
            }),
            tracker: Default::default(),
            is_failing: AtomicBool::new(false),
            is_closed: AtomicBool::new(false),
        }
    }

    pub fn with_round_trip(src: NodeId, peer: NodeId, round_trip: Duration) -> TrackingLink {
        let result = TrackingLink::new(src, peer);
        result.set_round_trip(Some(round_trip));
        result
    }

    fn tracker(&self) -> MutexGuard<'_, Vec<Message>> {
        self.tracker.lock()
            .unwrap_or_else(|p| p.into_inner())
    }

    pub fn set_round_trip(&self, round_trip: Option<Duration>) {
        self.metrics.lock()
            .unwrap_or_else(|p| p.into_inner())
            .round_trip = round_trip;
    }

    /// makes all subsequent `forward` calls fail
    pub fn set_failing(&self, is_failing: bool) {
        self.is_failing.store(is_failing, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::SeqCst)
    }

    /// all messages forwarded so far, excluding route advertisements
    pub fn data_messages(&self) -> Vec<Message> {
        self.tracker().iter()
            .filter(|m| m.header.destinations().iter().all(|d| d.stream_id != StreamId::ROUTING))
            .cloned()
            .collect()
    }

    pub fn num_advertisements(&self) -> usize {
        let num_data_messages = self.data_messages().len();
        let num_total = self.tracker().len();
        num_total - num_data_messages
    }

    /// removes and returns the oldest recorded data message's destinations and payload
    pub fn take_data_message(&self) -> Option<(Vec<Destination>, Slice)> {
        let mut tracker = self.tracker();
        let idx = tracker.iter()
            .position(|m| m.header.destinations().iter().all(|d| d.stream_id != StreamId::ROUTING))?;
        let message = tracker.remove(idx);
        let payload = message.payload.materialize(LazySliceArgs::UNBOUNDED);
        Some((message.header.destinations().to_vec(), payload))
    }
}

#[async_trait]
impl Link for TrackingLink {
    async fn forward(&self, message: Message) -> anyhow::Result<()> {
        if self.is_failing.load(Ordering::SeqCst) {
            bail!("simulated link failure");
        }
        self.tracker().push(message);
        Ok(())
    }

    fn close(&self, quiesced: Callback<()>) {
        self.is_closed.store(true, Ordering::SeqCst);
        quiesced.call(());
    }

    fn get_link_metrics(&self) -> LinkMetrics {
        *self.metrics.lock()
            .unwrap_or_else(|p| p.into_inner())
    }
}
