use std::sync::Arc;

use crate::config::RouterConfig;
use crate::link::memory_link::MemoryLink;
use crate::messaging::ids::NodeId;
use crate::router::Router;
use crate::timer::TokioTimer;

/// a router with default config and its own [TokioTimer]
pub fn test_router(node: u64) -> Arc<Router> {
    test_router_with_config(node, RouterConfig::default())
}

pub fn test_router_with_config(node: u64, config: RouterConfig) -> Arc<Router> {
    Router::new(NodeId(node), Arc::new(TokioTimer::new()), Arc::new(config))
        .expect("test config should be valid")
}

/// Connects two routers with a pair of [MemoryLink]s, registering each link with its router
pub async fn connect(a: &Arc<Router>, b: &Arc<Router>) -> (Arc<MemoryLink>, Arc<MemoryLink>) {
    let (a_to_b, b_to_a) = MemoryLink::pair(a, b);
    a.register_link(a_to_b.clone()).await;
    b.register_link(b_to_a.clone()).await;
    (a_to_b, b_to_a)
}

/// Waits until none of the routers has background updates pending. Processing an update on one
///  router can trigger updates on its neighbours, so this waits for all of them to be idle at
///  the same time.
pub async fn settle(routers: &[&Arc<Router>]) {
    loop {
        for router in routers {
            router.block_until_no_background_updates_processing().await;
        }
        if routers.iter().all(|r| r.num_pending_background_updates() == 0) {
            return;
        }
    }
}

/// Creates a chain of routers `first..=last`, each connected to its predecessor, and waits for
///  routes to converge
pub async fn chain(first: u64, last: u64) -> Vec<Arc<Router>> {
    let routers = (first..=last)
        .map(test_router)
        .collect::<Vec<_>>();
    for pair in routers.windows(2) {
        connect(&pair[0], &pair[1]).await;
    }
    settle(&routers.iter().collect::<Vec<_>>()).await;
    routers
}
