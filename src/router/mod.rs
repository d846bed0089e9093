//! The router owns the local node's links and decides, per destination, which link a message
//!  leaves on. Messages addressed to the local node are handed to the registered stream.
//!
//! Route discovery is distance vector: each router advertises its routing table to its direct
//!  neighbours on the reserved stream [StreamId::ROUTING], and combines the neighbours'
//!  advertisements with its own link costs. All routing table changes are made by a single
//!  background worker per router, so they are serialized with respect to each other, and
//!  [Router::block_until_no_background_updates_processing] waits for that worker to become idle.

pub mod route_advertisement;
pub mod router_events;
pub mod routing_table;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tracing::{debug, info, trace, warn};

use crate::callback::Callback;
use crate::config::RouterConfig;
use crate::link::{Link, LinkId};
use crate::messaging::ids::{NodeId, StreamId};
use crate::messaging::message::{Destination, Message, RoutableMessage};
use crate::messaging::seq_num::SeqNum;
use crate::router::route_advertisement::{AdvertisedRoute, RouteAdvertisement};
use crate::router::router_events::{LinkRemovedData, RouteData, RouteLostData, RouterEvent, RouterEventNotifier};
use crate::router::routing_table::{AdvertisementOutcome, Route, RouteChange, RoutingTable};
use crate::slice::{LazySliceArgs, Slice};
use crate::status::{ContractViolation, StatusResult};
use crate::timer::{Timer, TimerHandle};

/// The receiving end of a stream, as seen by the router
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    async fn on_message(&self, seq: SeqNum, payload: Slice);

    /// The router lost its route to the stream's peer. This may be temporary.
    async fn on_route_lost(&self);
}

#[derive(Debug)]
enum RouteUpdate {
    LinkRegistered(LinkId),
    LinkFailed(LinkId),
    Advertisement {
        from: NodeId,
        seq: u32,
        entries: Vec<AdvertisedRoute>,
    },
    RefreshMetrics,
}

/// The queue feeding the background worker, with a count of updates that were enqueued but are
///  not fully processed yet
struct UpdateQueue {
    sender: mpsc::UnboundedSender<RouteUpdate>,
    pending: watch::Sender<usize>,
}

impl UpdateQueue {
    fn enqueue(&self, update: RouteUpdate) {
        self.pending.send_modify(|n| *n += 1);
        if self.sender.send(update).is_err() {
            // the worker is gone, so the router is being dropped
            self.mark_done();
        }
    }

    fn mark_done(&self) {
        self.pending.send_modify(|n| *n = n.saturating_sub(1));
    }

    fn num_pending(&self) -> usize {
        *self.pending.borrow()
    }

    async fn wait_until_idle(&self) {
        let mut recv = self.pending.subscribe();
        let _ = recv.wait_for(|n| *n == 0).await;
    }
}

#[derive(Debug)]
struct LinkEntry {
    id: LinkId,
    peer: NodeId,
    link: Arc<dyn Link>,
    consecutive_failures: AtomicU32,
}

struct RouterState {
    /// in registration order
    links: Vec<Arc<LinkEntry>>,
    table: RoutingTable,
    streams: FxHashMap<(NodeId, StreamId), Weak<dyn StreamHandler>>,
    refresh_timer: Option<TimerHandle>,
    is_shut_down: bool,
}

impl RouterState {
    fn link_entry(&self, id: LinkId) -> Option<Arc<LinkEntry>> {
        self.links.iter()
            .find(|l| l.id == id)
            .cloned()
    }

    fn advertisements_for(&self, peer: Option<NodeId>) -> Vec<(Arc<LinkEntry>, Vec<AdvertisedRoute>)> {
        self.links.iter()
            .filter(|l| peer.is_none() || peer == Some(l.peer))
            .map(|l| (l.clone(), self.table.advertisement_for(l.peer)))
            .collect()
    }
}

pub struct Router {
    myself: NodeId,
    weak_self: Weak<Router>,
    timer: Arc<dyn Timer>,
    config: Arc<RouterConfig>,
    state: RwLock<RouterState>,
    updates: UpdateQueue,
    events: RouterEventNotifier,
    next_link_id: AtomicU64,
    advertisement_seq: AtomicU32,
}

impl Router {
    /// Creates a router and spawns its background worker on the current tokio runtime
    pub fn new(myself: NodeId, timer: Arc<dyn Timer>, config: Arc<RouterConfig>) -> anyhow::Result<Arc<Router>> {
        config.validate()?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let (pending, _) = watch::channel(0);

        let router = Arc::new_cyclic(|weak: &Weak<Router>| {
            let refresh_timer = config.metrics_refresh_interval
                .map(|interval| Self::schedule_metrics_refresh(weak.clone(), timer.as_ref(), interval));

            Router {
                myself,
                weak_self: weak.clone(),
                timer: timer.clone(),
                config: config.clone(),
                state: RwLock::new(RouterState {
                    links: Vec::new(),
                    table: RoutingTable::new(myself, config.max_hops),
                    streams: FxHashMap::default(),
                    refresh_timer,
                    is_shut_down: false,
                }),
                updates: UpdateQueue {
                    sender,
                    pending,
                },
                events: RouterEventNotifier::new(config.event_channel_capacity),
                next_link_id: AtomicU64::new(0),
                advertisement_seq: AtomicU32::new(0),
            }
        });

        tokio::spawn(Self::run_background_updates(Arc::downgrade(&router), receiver));
        info!("started router for {:?}", myself);
        Ok(router)
    }

    fn schedule_metrics_refresh(router: Weak<Router>, timer: &dyn Timer, interval: std::time::Duration) -> TimerHandle {
        timer.schedule_at(timer.now() + interval, Callback::new(move |_| {
            if let Some(router) = router.upgrade() {
                router.updates.enqueue(RouteUpdate::RefreshMetrics);
            }
        }))
    }

    async fn run_background_updates(router: Weak<Router>, mut recv: mpsc::UnboundedReceiver<RouteUpdate>) {
        while let Some(update) = recv.recv().await {
            let Some(router) = router.upgrade() else {
                break;
            };
            trace!("{:?}: processing {:?}", router.myself, update);
            router.process_update(update).await;
            router.updates.mark_done();
        }
        debug!("router worker terminated");
    }

    pub fn node_id(&self) -> NodeId {
        self.myself
    }

    pub fn timer(&self) -> &Arc<dyn Timer> {
        &self.timer
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RouterEvent> {
        self.events.subscribe()
    }

    /// Adds a link to the active set. Routes over the link become available once the background
    ///  worker has processed the registration.
    pub async fn register_link(&self, link: Arc<dyn Link>) -> LinkId {
        let metrics = link.get_link_metrics();
        let id = LinkId(self.next_link_id.fetch_add(1, Ordering::SeqCst));
        if metrics.src != self.myself {
            warn!("link {:?} to {:?} reports source {:?}, but this router is {:?}", id, metrics.peer, metrics.src, self.myself);
        }

        let is_shut_down = {
            let mut state = self.state.write().await;
            if !state.is_shut_down {
                state.links.push(Arc::new(LinkEntry {
                    id,
                    peer: metrics.peer,
                    link: link.clone(),
                    consecutive_failures: AtomicU32::new(0),
                }));
            }
            state.is_shut_down
        };

        if is_shut_down {
            warn!("router {:?} is shut down, closing newly registered link to {:?}", self.myself, metrics.peer);
            link.close(Callback::ignored());
            return id;
        }

        debug!("{:?}: registered link {:?} to {:?}", self.myself, id, metrics.peer);
        self.updates.enqueue(RouteUpdate::LinkRegistered(id));
        id
    }

    /// point-in-time view, which may not reflect updates that are still being processed
    pub async fn has_route_to(&self, node: NodeId) -> bool {
        node == self.myself || self.state.read().await.table.route_to(node).is_some()
    }

    pub async fn route_to(&self, node: NodeId) -> Option<Route> {
        self.state.read().await.table.route_to(node)
    }

    /// The MTU of the link a message to `node` currently leaves on. This is `None` for the
    ///  local node and for nodes without a route.
    pub async fn mtu_to(&self, node: NodeId) -> Option<usize> {
        if node == self.myself {
            return None;
        }
        let entry = {
            let state = self.state.read().await;
            state.table.route_to(node)
                .and_then(|route| state.link_entry(route.link))?
        };
        Some(entry.link.get_link_metrics().mtu)
    }

    pub async fn block_until_no_background_updates_processing(&self) {
        self.updates.wait_until_idle().await;
    }

    /// the number of route updates that are queued or being processed right now
    pub fn num_pending_background_updates(&self) -> usize {
        self.updates.num_pending()
    }

    pub(crate) async fn register_stream(&self, peer: NodeId, stream_id: StreamId, handler: Weak<dyn StreamHandler>) -> StatusResult {
        if stream_id.is_reserved() {
            return Err(ContractViolation::ReservedStreamId.into());
        }

        let mut state = self.state.write().await;
        if let Some(existing) = state.streams.get(&(peer, stream_id)) {
            if existing.strong_count() > 0 {
                return Err(ContractViolation::StreamIdInUse.into());
            }
        }
        state.streams.insert((peer, stream_id), handler);
        debug!("{:?}: registered stream {:?} with {:?}", self.myself, stream_id, peer);
        Ok(())
    }

    pub(crate) async fn unregister_stream(&self, peer: NodeId, stream_id: StreamId) {
        if self.state.write().await.streams.remove(&(peer, stream_id)).is_some() {
            debug!("{:?}: unregistered stream {:?} with {:?}", self.myself, stream_id, peer);
        }
    }

    /// Routes a message. Destinations on the local node are delivered to their stream, all other
    ///  destinations are grouped by the link they leave on, so each link receives the message
    ///  once. Destinations without a route are dropped.
    pub async fn forward(&self, message: Message) {
        let mut routing_seq = None;
        let mut local: Vec<(Arc<dyn StreamHandler>, SeqNum)> = Vec::new();
        let mut dropped_streams = Vec::new();
        let mut outgoing: Vec<(Arc<LinkEntry>, Vec<Destination>)> = Vec::new();

        {
            let state = self.state.read().await;
            for destination in message.header.destinations() {
                if destination.node == self.myself {
                    if destination.stream_id.is_reserved() {
                        routing_seq = Some(destination.seq);
                        continue;
                    }
                    let key = (message.header.src, destination.stream_id);
                    match state.streams.get(&key).map(Weak::upgrade) {
                        Some(Some(handler)) => local.push((handler, destination.seq)),
                        Some(None) => dropped_streams.push(key),
                        None => debug!("{:?}: no stream {:?} with {:?}, dropping message", self.myself, destination.stream_id, message.header.src),
                    }
                    continue;
                }

                let entry = state.table.route_to(destination.node)
                    .and_then(|route| state.link_entry(route.link));
                let Some(entry) = entry else {
                    debug!("{:?}: no route to {:?}, dropping message", self.myself, destination.node);
                    continue;
                };

                match outgoing.iter_mut().find(|(e, _)| e.id == entry.id) {
                    Some((_, destinations)) => destinations.push(*destination),
                    None => outgoing.push((entry, vec![*destination])),
                }
            }
        }

        self.remove_dropped_streams(dropped_streams).await;

        if let Some(seq) = routing_seq {
            self.on_routing_message(message.header.src, seq, &message);
        }

        if !local.is_empty() {
            let payload = message.payload.materialize(LazySliceArgs::UNBOUNDED);
            for (handler, seq) in local {
                handler.on_message(seq, payload.clone()).await;
            }
        }

        let num_destinations = message.header.destinations().len();
        for (entry, destinations) in outgoing {
            let to_send = if destinations.len() == num_destinations {
                message.clone()
            }
            else {
                match message.with_destinations(destinations) {
                    Ok(msg) => msg,
                    Err(_) => continue,
                }
            };
            self.forward_over_link(&entry, to_send).await;
        }
    }

    /// Streams that were dropped without being closed leave a dead entry behind
    async fn remove_dropped_streams(&self, keys: Vec<(NodeId, StreamId)>) {
        if keys.is_empty() {
            return;
        }
        let mut state = self.state.write().await;
        for key in keys {
            if state.streams.get(&key).is_some_and(|handler| handler.strong_count() == 0) {
                state.streams.remove(&key);
                debug!("{:?}: removed dropped stream {:?} with {:?}", self.myself, key.1, key.0);
            }
        }
    }

    fn on_routing_message(&self, from: NodeId, seq: SeqNum, message: &Message) {
        let payload = message.payload.materialize(LazySliceArgs::UNBOUNDED);
        let mut buf: &[u8] = &payload;
        match RouteAdvertisement::try_deser(&mut buf) {
            Ok(advertisement) => {
                trace!("{:?}: received route advertisement #{} from {:?}", self.myself, seq.message_seq, from);
                self.updates.enqueue(RouteUpdate::Advertisement {
                    from,
                    seq: seq.message_seq,
                    entries: advertisement.entries().to_vec(),
                });
            }
            Err(e) => warn!("{:?}: received invalid route advertisement from {:?}: {}", self.myself, from, e),
        }
    }

    async fn forward_over_link(&self, entry: &LinkEntry, message: Message) {
        match entry.link.forward(message).await {
            Ok(()) => {
                entry.consecutive_failures.store(0, Ordering::SeqCst);
            }
            Err(e) => {
                let failures = entry.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!("{:?}: forwarding over link {:?} to {:?} failed ({} in a row): {}", self.myself, entry.id, entry.peer, failures, e);
                if failures == self.config.max_consecutive_link_failures {
                    self.updates.enqueue(RouteUpdate::LinkFailed(entry.id));
                }
            }
        }
    }

    /// Closes all links and waits for them to quiesce. Streams should be closed before this is
    ///  called.
    pub async fn shutdown(&self) {
        let links = {
            let mut state = self.state.write().await;
            if state.is_shut_down {
                return;
            }
            state.is_shut_down = true;
            if let Some(refresh_timer) = state.refresh_timer.take() {
                refresh_timer.cancel();
            }
            state.table = RoutingTable::new(self.myself, self.config.max_hops);
            std::mem::take(&mut state.links)
        };

        info!("shutting down router {:?}, closing {} link(s)", self.myself, links.len());
        let mut quiesced = Vec::new();
        for entry in links {
            let (callback, recv) = Callback::channel();
            entry.link.close(callback);
            quiesced.push(recv);
        }
        for recv in quiesced {
            let _ = recv.await;
        }
        debug!("router {:?} is shut down", self.myself);
    }

    async fn process_update(&self, update: RouteUpdate) {
        match update {
            RouteUpdate::LinkRegistered(id) => self.on_link_registered(id).await,
            RouteUpdate::LinkFailed(id) => self.on_link_failed(id).await,
            RouteUpdate::Advertisement { from, seq, entries } => self.on_advertisement(from, seq, entries).await,
            RouteUpdate::RefreshMetrics => self.on_refresh_metrics().await,
        }
    }

    async fn on_link_registered(&self, id: LinkId) {
        let Some(entry) = self.state.read().await.link_entry(id) else {
            return;
        };
        let cost = entry.link.get_link_metrics().cost();

        let (changes, advertisements) = {
            let mut state = self.state.write().await;
            state.table.add_link(id, entry.peer, cost);
            let changes = state.table.recompute();
            (changes, state.advertisements_for(None))
        };

        self.on_route_changes(changes).await;
        self.send_advertisements(advertisements).await;
    }

    async fn on_link_failed(&self, id: LinkId) {
        let (entry, changes, advertisements) = {
            let mut state = self.state.write().await;
            let Some(idx) = state.links.iter().position(|l| l.id == id) else {
                return;
            };
            let entry = state.links.remove(idx);
            state.table.remove_link(id);
            let changes = state.table.recompute();
            (entry, changes, state.advertisements_for(None))
        };

        warn!("{:?}: removing link {:?} to {:?} after repeated failures", self.myself, id, entry.peer);
        self.events.send_event(RouterEvent::LinkRemoved(LinkRemovedData { link: id, peer: entry.peer }));
        entry.link.close(Callback::new(move |_| debug!("link {:?} quiesced", id)));

        self.on_route_changes(changes).await;
        self.send_advertisements(advertisements).await;
    }

    async fn on_advertisement(&self, from: NodeId, seq: u32, entries: Vec<AdvertisedRoute>) {
        let (changes, advertisements) = {
            let mut state = self.state.write().await;
            let outcome = state.table.apply_advertisement(from, seq, entries);
            if outcome == AdvertisementOutcome::Stale || outcome == AdvertisementOutcome::NoLink {
                return;
            }

            let changes = state.table.recompute();
            let advertisements = if !changes.is_empty() {
                state.advertisements_for(None)
            }
            else if outcome == AdvertisementOutcome::AppliedFirst {
                // a new neighbour needs to learn our routes even if its own did not change anything
                state.advertisements_for(Some(from))
            }
            else {
                Vec::new()
            };
            (changes, advertisements)
        };

        self.on_route_changes(changes).await;
        self.send_advertisements(advertisements).await;
    }

    async fn on_refresh_metrics(&self) {
        let links = self.state.read().await.links.clone();
        let costs = links.iter()
            .map(|l| (l.id, l.link.get_link_metrics().cost()))
            .collect::<Vec<_>>();

        let (changes, advertisements) = {
            let mut state = self.state.write().await;
            if state.is_shut_down {
                return;
            }
            for (id, cost) in costs {
                state.table.update_link_cost(id, cost);
            }
            if let Some(interval) = self.config.metrics_refresh_interval {
                state.refresh_timer = Some(Self::schedule_metrics_refresh(self.weak_self.clone(), self.timer.as_ref(), interval));
            }
            let changes = state.table.recompute();
            (changes, state.advertisements_for(None))
        };

        self.on_route_changes(changes).await;
        self.send_advertisements(advertisements).await;
    }

    async fn on_route_changes(&self, changes: Vec<RouteChange>) {
        let mut lost = Vec::new();
        for change in changes {
            match change {
                RouteChange::Added(node, route) => {
                    debug!("{:?}: new route to {:?} via {:?}, cost {}", self.myself, node, route.next_hop, route.cost);
                    self.events.send_event(RouterEvent::RouteAdded(Self::route_data(node, &route)));
                }
                RouteChange::Changed(node, route) => {
                    debug!("{:?}: route to {:?} is now via {:?}, cost {}", self.myself, node, route.next_hop, route.cost);
                    self.events.send_event(RouterEvent::RouteChanged(Self::route_data(node, &route)));
                }
                RouteChange::Lost(node) => {
                    info!("{:?}: lost route to {:?}", self.myself, node);
                    self.events.send_event(RouterEvent::RouteLost(RouteLostData { node }));
                    lost.push(node);
                }
            }
        }

        if lost.is_empty() {
            return;
        }
        let mut handlers = Vec::new();
        let mut dropped_streams = Vec::new();
        for (key, handler) in self.state.read().await.streams.iter() {
            if !lost.contains(&key.0) {
                continue;
            }
            match handler.upgrade() {
                Some(handler) => handlers.push(handler),
                None => dropped_streams.push(*key),
            }
        }
        self.remove_dropped_streams(dropped_streams).await;

        for handler in handlers {
            handler.on_route_lost().await;
        }
    }

    fn route_data(node: NodeId, route: &Route) -> RouteData {
        RouteData {
            node,
            next_hop: route.next_hop,
            cost: route.cost,
            hops: route.hops,
        }
    }

    async fn send_advertisements(&self, advertisements: Vec<(Arc<LinkEntry>, Vec<AdvertisedRoute>)>) {
        for (entry, routes) in advertisements {
            let seq = self.advertisement_seq.fetch_add(1, Ordering::SeqCst) + 1;
            trace!("{:?}: advertising {} route(s) to {:?} as #{}", self.myself, routes.len(), entry.peer, seq);

            let header = RoutableMessage::single(self.myself, Destination::new(entry.peer, StreamId::ROUTING, SeqNum::unreliable(seq)));
            let message = Message::new(header, Arc::new(RouteAdvertisement::new(routes)), self.timer.now());
            self.forward_over_link(&entry, message).await;
        }
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(refresh_timer) = state.refresh_timer.take() {
            refresh_timer.cancel();
        }
        if !state.links.is_empty() {
            debug!("router {:?} dropped without shutdown, closing {} link(s)", self.myself, state.links.len());
        }
        for entry in state.links.drain(..) {
            entry.link.close(Callback::ignored());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;

    use super::*;
    use crate::link::{LinkMetrics, MockLink};
    use crate::test_util::link::TrackingLink;
    use crate::test_util::router::{chain, connect, settle, test_router, test_router_with_config};
    use crate::timer::Timestamp;

    fn data_message(src: u64, destinations: Vec<(u64, u64)>, payload: &'static [u8]) -> Message {
        let destinations = destinations.into_iter()
            .map(|(node, stream)| Destination::new(NodeId(node), StreamId(stream), SeqNum::new(1, 1)))
            .collect();
        Message::new(RoutableMessage::new(NodeId(src), destinations).unwrap(), Arc::new(Slice::from_static(payload)), Timestamp::ZERO)
    }

    fn metrics(src: u64, peer: u64) -> LinkMetrics {
        LinkMetrics {
            src: NodeId(src),
            peer: NodeId(peer),
            round_trip: None,
            loss_permille: 0,
            mtu: 1400,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_route_to_self() {
        let router = test_router(1);
        assert!(router.has_route_to(NodeId(1)).await);
        assert!(!router.has_route_to(NodeId(2)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_link() {
        let router = test_router(1);
        let link = Arc::new(TrackingLink::new(NodeId(1), NodeId(2)));
        let id = router.register_link(link.clone()).await;
        router.block_until_no_background_updates_processing().await;

        assert!(router.has_route_to(NodeId(2)).await);
        assert_eq!(router.route_to(NodeId(2)).await, Some(Route { link: id, next_hop: NodeId(2), cost: 10, hops: 1 }));
        assert_eq!(link.num_advertisements(), 1);
        assert!(link.data_messages().is_empty());
    }

    #[rstest]
    #[case::two(2)]
    #[case::three(3)]
    #[case::five(5)]
    #[tokio::test(start_paused = true)]
    async fn test_convergence_along_chain(#[case] num_nodes: u64) {
        let routers = chain(1, num_nodes).await;

        for router in &routers {
            for node in 1..=num_nodes {
                assert!(router.has_route_to(NodeId(node)).await, "{:?} has no route to {}", router.node_id(), node);
            }
        }

        let route = routers[0].route_to(NodeId(num_nodes)).await.unwrap();
        assert_eq!(route.next_hop, NodeId(2));
        assert_eq!(route.hops as u64, num_nodes - 1);
        assert_eq!(route.cost, 10 * (num_nodes - 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnected_routers_have_no_route() {
        let routers = chain(1, 2).await;
        let others = chain(3, 4).await;

        assert!(!routers[0].has_route_to(NodeId(3)).await);
        assert!(!others[1].has_route_to(NodeId(2)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_route_events() {
        let a = test_router(1);
        let b = test_router(2);
        let mut events = a.subscribe();

        connect(&a, &b).await;
        settle(&[&a, &b]).await;

        assert_eq!(events.recv().await.unwrap(), RouterEvent::RouteAdded(RouteData { node: NodeId(2), next_hop: NodeId(2), cost: 10, hops: 1 }));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forward_groups_destinations_by_link() {
        let router = test_router(1);
        let link_2 = Arc::new(TrackingLink::new(NodeId(1), NodeId(2)));
        let link_3 = Arc::new(TrackingLink::new(NodeId(1), NodeId(3)));
        router.register_link(link_2.clone()).await;
        router.register_link(link_3.clone()).await;
        router.block_until_no_background_updates_processing().await;

        router.forward(data_message(1, vec![(2, 1), (3, 1), (2, 5)], b"abc")).await;

        let (destinations, payload) = link_2.take_data_message().unwrap();
        assert_eq!(destinations.iter().map(|d| (d.node, d.stream_id)).collect::<Vec<_>>(), vec![(NodeId(2), StreamId(1)), (NodeId(2), StreamId(5))]);
        assert_eq!(payload.as_ref(), b"abc");
        assert!(link_2.take_data_message().is_none());

        let (destinations, payload) = link_3.take_data_message().unwrap();
        assert_eq!(destinations.iter().map(|d| (d.node, d.stream_id)).collect::<Vec<_>>(), vec![(NodeId(3), StreamId(1))]);
        assert_eq!(payload.as_ref(), b"abc");
    }

    #[tokio::test(start_paused = true)]
    async fn test_forward_without_route_is_dropped() {
        let router = test_router(1);
        let link = Arc::new(TrackingLink::new(NodeId(1), NodeId(2)));
        router.register_link(link.clone()).await;
        router.block_until_no_background_updates_processing().await;

        router.forward(data_message(1, vec![(99, 1)], b"abc")).await;
        assert!(link.data_messages().is_empty());

        router.forward(data_message(1, vec![(99, 1), (2, 1)], b"abc")).await;
        let (destinations, _) = link.take_data_message().unwrap();
        assert_eq!(destinations.len(), 1);
        assert_eq!(destinations[0].node, NodeId(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_delivery() {
        let router = test_router(1);

        let mut handler = MockStreamHandler::new();
        handler.expect_on_message()
            .withf(|seq, payload| *seq == SeqNum::new(1, 1) && payload.as_ref() == b"abc")
            .times(1)
            .return_const(());
        let handler: Arc<dyn StreamHandler> = Arc::new(handler);
        router.register_stream(NodeId(5), StreamId(3), Arc::downgrade(&handler)).await.unwrap();

        router.forward(data_message(5, vec![(1, 3)], b"abc")).await;
        // neither a different stream nor a different peer reach the handler
        router.forward(data_message(5, vec![(1, 4)], b"x")).await;
        router.forward(data_message(6, vec![(1, 3)], b"x")).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_multi_hop_delivery() {
        let routers = chain(1, 3).await;

        let mut handler = MockStreamHandler::new();
        handler.expect_on_message()
            .withf(|_, payload| payload.as_ref() == b"hop")
            .times(1)
            .return_const(());
        let handler: Arc<dyn StreamHandler> = Arc::new(handler);
        routers[2].register_stream(NodeId(1), StreamId(7), Arc::downgrade(&handler)).await.unwrap();

        routers[0].forward(data_message(1, vec![(3, 7)], b"hop")).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_stream_contract() {
        let router = test_router(1);
        let handler: Arc<dyn StreamHandler> = Arc::new(MockStreamHandler::new());

        assert_eq!(router.register_stream(NodeId(2), StreamId::ROUTING, Arc::downgrade(&handler)).await, Err(ContractViolation::ReservedStreamId.into()));

        router.register_stream(NodeId(2), StreamId(1), Arc::downgrade(&handler)).await.unwrap();
        assert_eq!(router.register_stream(NodeId(2), StreamId(1), Arc::downgrade(&handler)).await, Err(ContractViolation::StreamIdInUse.into()));
        router.register_stream(NodeId(3), StreamId(1), Arc::downgrade(&handler)).await.unwrap();

        router.unregister_stream(NodeId(2), StreamId(1)).await;
        router.register_stream(NodeId(2), StreamId(1), Arc::downgrade(&handler)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_stream_frees_its_id() {
        let router = test_router(1);
        let handler: Arc<dyn StreamHandler> = Arc::new(MockStreamHandler::new());
        router.register_stream(NodeId(2), StreamId(1), Arc::downgrade(&handler)).await.unwrap();
        drop(handler);

        let other: Arc<dyn StreamHandler> = Arc::new(MockStreamHandler::new());
        router.register_stream(NodeId(2), StreamId(1), Arc::downgrade(&other)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_forward_removes_dropped_stream() {
        let router = test_router(1);
        let handler: Arc<dyn StreamHandler> = Arc::new(MockStreamHandler::new());
        router.register_stream(NodeId(2), StreamId(1), Arc::downgrade(&handler)).await.unwrap();
        drop(handler);
        assert_eq!(router.state.read().await.streams.len(), 1);

        router.forward(data_message(2, vec![(1, 1)], b"x")).await;
        assert!(router.state.read().await.streams.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_route_loss_removes_dropped_stream() {
        let router = test_router_with_config(1, RouterConfig { metrics_refresh_interval: None, ..Default::default() });
        let link = Arc::new(TrackingLink::new(NodeId(1), NodeId(2)));
        router.register_link(link.clone()).await;
        router.block_until_no_background_updates_processing().await;

        let dropped: Arc<dyn StreamHandler> = Arc::new(MockStreamHandler::new());
        router.register_stream(NodeId(2), StreamId(1), Arc::downgrade(&dropped)).await.unwrap();
        drop(dropped);
        let mut live = MockStreamHandler::new();
        live.expect_on_route_lost().times(1).return_const(());
        let live: Arc<dyn StreamHandler> = Arc::new(live);
        router.register_stream(NodeId(2), StreamId(2), Arc::downgrade(&live)).await.unwrap();

        link.set_failing(true);
        for _ in 0..3 {
            router.forward(data_message(1, vec![(2, 1)], b"x")).await;
        }
        router.block_until_no_background_updates_processing().await;

        assert!(!router.has_route_to(NodeId(2)).await);
        let streams = router.state.read().await.streams.keys().copied().collect::<Vec<_>>();
        assert_eq!(streams, vec![(NodeId(2), StreamId(2))]);
    }

    #[rstest]
    #[case::first_faster(Some(5), Some(20), 0)]
    #[case::second_faster(Some(20), Some(5), 1)]
    #[case::tie(None, None, 0)]
    #[tokio::test(start_paused = true)]
    async fn test_route_selection(#[case] rtt_0: Option<u64>, #[case] rtt_1: Option<u64>, #[case] expected_link: usize) {
        let router = test_router(1);
        let links = [rtt_0, rtt_1].into_iter()
            .map(|rtt| {
                let link = TrackingLink::new(NodeId(1), NodeId(2));
                link.set_round_trip(rtt.map(Duration::from_millis));
                Arc::new(link)
            })
            .collect::<Vec<_>>();
        for link in &links {
            router.register_link(link.clone()).await;
        }
        router.block_until_no_background_updates_processing().await;

        router.forward(data_message(1, vec![(2, 1)], b"x")).await;
        assert_eq!(links[expected_link].data_messages().len(), 1);
        assert_eq!(links[1 - expected_link].data_messages().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_route_follows_link_metrics() {
        let router = test_router(1);
        let fast = Arc::new(TrackingLink::with_round_trip(NodeId(1), NodeId(2), Duration::from_millis(5)));
        let slow = Arc::new(TrackingLink::with_round_trip(NodeId(1), NodeId(2), Duration::from_millis(20)));
        let fast_id = router.register_link(fast.clone()).await;
        let slow_id = router.register_link(slow.clone()).await;
        router.block_until_no_background_updates_processing().await;
        assert_eq!(router.route_to(NodeId(2)).await.unwrap().link, fast_id);

        fast.set_round_trip(Some(Duration::from_millis(50)));
        tokio::time::sleep(Duration::from_millis(1001)).await;
        router.block_until_no_background_updates_processing().await;

        assert_eq!(router.route_to(NodeId(2)).await, Some(Route { link: slow_id, next_hop: NodeId(2), cost: 20, hops: 1 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_link_is_removed() {
        let router = test_router_with_config(1, RouterConfig { metrics_refresh_interval: None, ..Default::default() });
        let mut events = router.subscribe();

        let mut link = MockLink::new();
        link.expect_get_link_metrics().return_const(metrics(1, 2));
        link.expect_forward().returning(|_| Err(anyhow::anyhow!("broken")));
        link.expect_close().times(1).returning(|quiesced| quiesced.call(()));
        let id = router.register_link(Arc::new(link)).await;
        router.block_until_no_background_updates_processing().await;
        assert!(router.has_route_to(NodeId(2)).await);

        let mut handler = MockStreamHandler::new();
        handler.expect_on_route_lost().times(1).return_const(());
        let handler: Arc<dyn StreamHandler> = Arc::new(handler);
        router.register_stream(NodeId(2), StreamId(1), Arc::downgrade(&handler)).await.unwrap();

        for _ in 0..3 {
            router.forward(data_message(1, vec![(2, 1)], b"x")).await;
        }
        router.block_until_no_background_updates_processing().await;

        assert!(!router.has_route_to(NodeId(2)).await);
        assert_eq!(events.recv().await.unwrap(), RouterEvent::RouteAdded(RouteData { node: NodeId(2), next_hop: NodeId(2), cost: 10, hops: 1 }));
        assert_eq!(events.recv().await.unwrap(), RouterEvent::LinkRemoved(LinkRemovedData { link: id, peer: NodeId(2) }));
        assert_eq!(events.recv().await.unwrap(), RouterEvent::RouteLost(RouteLostData { node: NodeId(2) }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_forward_resets_failure_count() {
        let router = test_router_with_config(1, RouterConfig { metrics_refresh_interval: None, ..Default::default() });
        let link = Arc::new(TrackingLink::new(NodeId(1), NodeId(2)));
        router.register_link(link.clone()).await;
        router.block_until_no_background_updates_processing().await;

        for _ in 0..3 {
            link.set_failing(true);
            router.forward(data_message(1, vec![(2, 1)], b"x")).await;
            router.forward(data_message(1, vec![(2, 1)], b"x")).await;
            link.set_failing(false);
            router.forward(data_message(1, vec![(2, 1)], b"x")).await;
        }
        router.block_until_no_background_updates_processing().await;

        assert!(router.has_route_to(NodeId(2)).await);
        assert!(!link.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_route_loss_propagates() {
        let a = test_router(1);
        let b = test_router(2);
        let c = test_router(3);
        connect(&a, &b).await;
        let (b_to_c, _) = connect(&b, &c).await;
        settle(&[&a, &b, &c]).await;
        assert!(a.has_route_to(NodeId(3)).await);

        b_to_c.close(Callback::ignored());
        // periodic advertisements over the closed link fail until it is removed
        tokio::time::sleep(Duration::from_secs(4)).await;
        settle(&[&a, &b, &c]).await;

        assert!(!b.has_route_to(NodeId(3)).await);
        assert!(!a.has_route_to(NodeId(3)).await);
        assert!(a.has_route_to(NodeId(2)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_links() {
        let router = test_router(1);
        let link = Arc::new(TrackingLink::new(NodeId(1), NodeId(2)));
        router.register_link(link.clone()).await;
        router.block_until_no_background_updates_processing().await;

        router.shutdown().await;
        assert!(link.is_closed());
        assert!(!router.has_route_to(NodeId(2)).await);

        let late = Arc::new(TrackingLink::new(NodeId(1), NodeId(3)));
        router.register_link(late.clone()).await;
        assert!(late.is_closed());

        router.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_closes_links() {
        let router = test_router(1);
        let link = Arc::new(TrackingLink::new(NodeId(1), NodeId(2)));
        router.register_link(link.clone()).await;
        router.block_until_no_background_updates_processing().await;

        drop(router);
        assert!(link.is_closed());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let result = Router::new(NodeId(1), Arc::new(crate::timer::TokioTimer::new()), Arc::new(RouterConfig { max_hops: 0, ..Default::default() }));
            assert!(result.is_err());
        });
    }
}
