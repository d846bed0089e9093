use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::link::LinkId;
use crate::messaging::ids::NodeId;
use crate::router::route_advertisement::AdvertisedRoute;

/// The current choice of link for reaching a node
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Route {
    pub link: LinkId,
    pub next_hop: NodeId,
    pub cost: u64,
    pub hops: u8,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RouteChange {
    Added(NodeId, Route),
    Changed(NodeId, Route),
    Lost(NodeId),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AdvertisementOutcome {
    /// the first advertisement from this neighbour since a link to it was registered
    AppliedFirst,
    Applied,
    Stale,
    /// there is no link to the advertising node, so its routes are useless
    NoLink,
}

#[derive(Debug)]
struct LinkState {
    id: LinkId,
    peer: NodeId,
    cost: u64,
}

#[derive(Debug)]
struct NeighbourAdvertisement {
    seq: u32,
    entries: Vec<AdvertisedRoute>,
}

/// Distance vector routing state. This is the pure part of route discovery: it is fed with link
///  changes and neighbours' advertisements, and it computes the best route per destination.
///
/// Candidates for a destination are the direct links to it and all links to neighbours that
///  advertise a route to it. The cheapest candidate wins, and ties go to the link that was
///  registered first.
#[derive(Debug)]
pub struct RoutingTable {
    myself: NodeId,
    max_hops: u8,
    /// in registration order
    links: Vec<LinkState>,
    advertisements: FxHashMap<NodeId, NeighbourAdvertisement>,
    routes: FxHashMap<NodeId, Route>,
}

impl RoutingTable {
    pub fn new(myself: NodeId, max_hops: u8) -> RoutingTable {
        RoutingTable {
            myself,
            max_hops,
            links: Vec::new(),
            advertisements: FxHashMap::default(),
            routes: FxHashMap::default(),
        }
    }

    fn has_link_to(&self, peer: NodeId) -> bool {
        self.links.iter().any(|l| l.peer == peer)
    }

    pub fn add_link(&mut self, id: LinkId, peer: NodeId, cost: u64) {
        if !self.has_link_to(peer) {
            // the peer may have restarted, starting its advertisement sequence from scratch
            self.advertisements.remove(&peer);
        }
        self.links.push(LinkState { id, peer, cost });
    }

    pub fn remove_link(&mut self, id: LinkId) -> Option<NodeId> {
        let idx = self.links.iter().position(|l| l.id == id)?;
        let removed = self.links.remove(idx);
        if !self.has_link_to(removed.peer) {
            self.advertisements.remove(&removed.peer);
        }
        Some(removed.peer)
    }

    /// returns `true` if the cost changed
    pub fn update_link_cost(&mut self, id: LinkId, cost: u64) -> bool {
        match self.links.iter_mut().find(|l| l.id == id) {
            Some(link) if link.cost != cost => {
                trace!("cost of link {:?} to {:?} changed from {} to {}", id, link.peer, link.cost, cost);
                link.cost = cost;
                true
            }
            _ => false,
        }
    }

    pub fn apply_advertisement(&mut self, from: NodeId, seq: u32, entries: Vec<AdvertisedRoute>) -> AdvertisementOutcome {
        if !self.has_link_to(from) {
            return AdvertisementOutcome::NoLink;
        }

        let is_first = match self.advertisements.get(&from) {
            Some(prev) if prev.seq >= seq => {
                debug!("ignoring stale route advertisement #{} from {:?}, already have #{}", seq, from, prev.seq);
                return AdvertisementOutcome::Stale;
            }
            Some(_) => false,
            None => true,
        };

        self.advertisements.insert(from, NeighbourAdvertisement { seq, entries });
        if is_first {
            AdvertisementOutcome::AppliedFirst
        }
        else {
            AdvertisementOutcome::Applied
        }
    }

    pub fn route_to(&self, node: NodeId) -> Option<Route> {
        self.routes.get(&node).copied()
    }

    /// Recomputes all routes from the current links and advertisements, returning the changes
    ///  ordered by node.
    pub fn recompute(&mut self) -> Vec<RouteChange> {
        let mut new_routes: FxHashMap<NodeId, Route> = FxHashMap::default();

        let mut offer = |node: NodeId, candidate: Route| {
            match new_routes.get(&node) {
                Some(existing) if existing.cost <= candidate.cost => {}
                _ => {
                    new_routes.insert(node, candidate);
                }
            }
        };

        for link in &self.links {
            if link.peer == self.myself {
                continue;
            }
            offer(link.peer, Route { link: link.id, next_hop: link.peer, cost: link.cost, hops: 1 });

            if let Some(advertisement) = self.advertisements.get(&link.peer) {
                for entry in &advertisement.entries {
                    if entry.node == self.myself || entry.node == link.peer {
                        continue;
                    }
                    let hops = entry.hops.saturating_add(1);
                    if hops > self.max_hops {
                        continue;
                    }
                    offer(entry.node, Route {
                        link: link.id,
                        next_hop: link.peer,
                        cost: entry.cost.saturating_add(link.cost),
                        hops,
                    });
                }
            }
        }

        let mut changes = Vec::new();
        for (node, route) in &new_routes {
            match self.routes.get(node) {
                None => changes.push(RouteChange::Added(*node, *route)),
                Some(old) if old != route => changes.push(RouteChange::Changed(*node, *route)),
                Some(_) => {}
            }
        }
        for node in self.routes.keys() {
            if !new_routes.contains_key(node) {
                changes.push(RouteChange::Lost(*node));
            }
        }
        changes.sort_by_key(|c| match c {
            RouteChange::Added(n, _) | RouteChange::Changed(n, _) | RouteChange::Lost(n) => *n,
        });

        self.routes = new_routes;
        changes
    }

    /// The routes to advertise to `peer`. Routes through `peer` itself are left out (split
    ///  horizon), and so is the route to `peer`.
    pub fn advertisement_for(&self, peer: NodeId) -> Vec<AdvertisedRoute> {
        self.routes.iter()
            .filter(|(node, route)| **node != peer && route.next_hop != peer)
            .map(|(node, route)| AdvertisedRoute {
                node: *node,
                cost: route.cost,
                hops: route.hops,
            })
            .collect()
    }
}
