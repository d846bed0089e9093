use tokio::sync::broadcast;
use tracing::trace;

use crate::link::LinkId;
use crate::messaging::ids::NodeId;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RouterEvent {
    RouteAdded(RouteData),
    RouteChanged(RouteData),
    RouteLost(RouteLostData),
    /// a link was removed after repeated failures
    LinkRemoved(LinkRemovedData),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RouteData {
    pub node: NodeId,
    pub next_hop: NodeId,
    pub cost: u64,
    pub hops: u8,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RouteLostData {
    pub node: NodeId,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LinkRemovedData {
    pub link: LinkId,
    pub peer: NodeId,
}

pub struct RouterEventNotifier {
    sender: broadcast::Sender<RouterEvent>,
}
impl RouterEventNotifier {
    pub fn new(capacity: usize) -> RouterEventNotifier {
        let (sender, _) = broadcast::channel(capacity);

        RouterEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RouterEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: RouterEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}
