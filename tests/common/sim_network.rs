//! In-memory cluster with fault injection.
//!
//! Every node gets a [`SimClient`] whose `send_broadcast` calls straight into
//! the destination node's `handle`, so a delivery completes when the remote
//! handler returns, just like a real `broadcast_ok`.
//!
//! Faults are injected per destination or per link:
//! - `fail_next(dest, n)`: the next `n` sends to `dest` fail with a transport error
//! - `set_down(dest, true)`: every send to `dest` fails until it is brought back
//! - `partition(a, b)`: sends between `a` and `b` fail in both directions
//! - `set_hanging(dest, true)`: sends to `dest` never resolve

use broadcast_engine::client::{BoxFuture, PeerClient};
use broadcast_engine::{
    BroadcastConfig, BroadcastError, BroadcastNode, BroadcastPayload, NodeId, Request, Value,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

pub type SimNode = BroadcastNode<SimClient>;

/// One delivered `broadcast` (the receiver's handler accepted it).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub from: NodeId,
    pub to: NodeId,
    pub values: Vec<Value>,
}

#[derive(Default)]
struct Faults {
    fail_next: HashMap<NodeId, u32>,
    down: HashSet<NodeId>,
    partitions: HashSet<(NodeId, NodeId)>,
    hanging: HashSet<NodeId>,
}

impl Faults {
    fn partitioned(&self, a: &NodeId, b: &NodeId) -> bool {
        self.partitions.contains(&(a.clone(), b.clone())) || self.partitions.contains(&(b.clone(), a.clone()))
    }
}

#[derive(Default)]
pub struct SimNetwork {
    nodes: RwLock<HashMap<NodeId, Arc<SimNode>>>,
    faults: Mutex<Faults>,
    attempts: Mutex<HashMap<NodeId, u32>>,
    deliveries: Mutex<Vec<Delivery>>,
}

/// Outbound side of one simulated node.
pub struct SimClient {
    from: NodeId,
    net: Weak<SimNetwork>,
}

impl PeerClient for SimClient {
    fn send_broadcast(&self, dest: &NodeId, payload: BroadcastPayload) -> BoxFuture<'_, ()> {
        let dest = dest.clone();
        Box::pin(async move {
            let net = self
                .net
                .upgrade()
                .ok_or_else(|| BroadcastError::transport(dest.as_str(), "network gone"))?;
            net.deliver(&self.from, &dest, payload).await
        })
    }
}

pub fn node_ids(n: usize) -> Vec<NodeId> {
    (0..n).map(|i| NodeId::new(format!("n{}", i))).collect()
}

/// Every node adjacent to every other.
pub fn full_mesh(n: usize) -> HashMap<NodeId, Vec<NodeId>> {
    let ids = node_ids(n);
    ids.iter()
        .map(|id| (id.clone(), ids.iter().filter(|o| *o != id).cloned().collect()))
        .collect()
}

/// n0 - n1 - ... - n(k-1)
pub fn line(n: usize) -> HashMap<NodeId, Vec<NodeId>> {
    let ids = node_ids(n);
    ids.iter()
        .enumerate()
        .map(|(i, id)| {
            let mut peers = Vec::new();
            if i > 0 {
                peers.push(ids[i - 1].clone());
            }
            if i + 1 < n {
                peers.push(ids[i + 1].clone());
            }
            (id.clone(), peers)
        })
        .collect()
}

impl SimNetwork {
    /// Build, initialize and install topology on an `n`-node cluster.
    pub fn cluster(n: usize, config: BroadcastConfig, adjacency: HashMap<NodeId, Vec<NodeId>>) -> Arc<Self> {
        let net = Arc::new(SimNetwork::default());
        let members = node_ids(n);

        for id in &members {
            let client = SimClient {
                from: id.clone(),
                net: Arc::downgrade(&net),
            };
            let node = Arc::new(BroadcastNode::new(config.clone(), Arc::new(client)));
            net.nodes.write().unwrap().insert(id.clone(), node);
        }
        for id in &members {
            net.node(id.as_str()).init(id.clone(), members.clone()).unwrap();
        }
        for id in &members {
            net.node(id.as_str()).install_topology(&adjacency).unwrap();
        }
        net
    }

    pub fn node(&self, id: &str) -> Arc<SimNode> {
        self.nodes
            .read()
            .unwrap()
            .get(&NodeId::from(id))
            .cloned()
            .unwrap_or_else(|| panic!("no node {}", id))
    }

    pub fn ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.read().unwrap().keys().cloned().collect();
        ids.sort_by_key(|id| id.rank());
        ids
    }

    async fn deliver(&self, from: &NodeId, to: &NodeId, payload: BroadcastPayload) -> broadcast_engine::Result<()> {
        *self.attempts.lock().unwrap().entry(to.clone()).or_insert(0) += 1;

        let (hang, fail) = {
            let mut faults = self.faults.lock().unwrap();
            let hang = faults.hanging.contains(to);
            let mut fail = faults.down.contains(to) || faults.partitioned(from, to);
            if !fail {
                if let Some(left) = faults.fail_next.get_mut(to) {
                    if *left > 0 {
                        *left -= 1;
                        fail = true;
                    }
                }
            }
            (hang, fail)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        if fail {
            return Err(BroadcastError::transport(to.as_str(), "injected fault"));
        }

        let node = self.nodes.read().unwrap().get(to).cloned();
        let node = node.ok_or_else(|| BroadcastError::transport(to.as_str(), "no such node"))?;
        let values = payload.values().to_vec();

        match node.handle(from, Request::Broadcast(payload)).await {
            Ok(_) => {
                self.deliveries.lock().unwrap().push(Delivery {
                    from: from.clone(),
                    to: to.clone(),
                    values,
                });
                Ok(())
            }
            Err(e) => Err(BroadcastError::Remote {
                code: e.error_code(),
                text: e.to_string(),
            }),
        }
    }

    // ---------------------------------------------------------------------
    // Fault injection
    // ---------------------------------------------------------------------

    pub fn fail_next(&self, dest: &str, n: u32) {
        self.faults.lock().unwrap().fail_next.insert(dest.into(), n);
    }

    pub fn set_down(&self, dest: &str, down: bool) {
        let mut faults = self.faults.lock().unwrap();
        if down {
            faults.down.insert(dest.into());
        } else {
            faults.down.remove(&NodeId::from(dest));
        }
    }

    pub fn partition(&self, a: &str, b: &str) {
        self.faults.lock().unwrap().partitions.insert((a.into(), b.into()));
    }

    /// Cut `node` off from every other node.
    pub fn isolate(&self, node: &str) {
        for other in self.ids() {
            if other.as_str() != node {
                self.partition(node, other.as_str());
            }
        }
    }

    pub fn heal(&self) {
        let mut faults = self.faults.lock().unwrap();
        faults.partitions.clear();
        faults.down.clear();
        faults.fail_next.clear();
    }

    pub fn set_hanging(&self, dest: &str, hanging: bool) {
        let mut faults = self.faults.lock().unwrap();
        if hanging {
            faults.hanging.insert(dest.into());
        } else {
            faults.hanging.remove(&NodeId::from(dest));
        }
    }

    // ---------------------------------------------------------------------
    // Observation
    // ---------------------------------------------------------------------

    /// Sends attempted towards `dest`, including failed ones.
    pub fn attempts_to(&self, dest: &str) -> u32 {
        self.attempts
            .lock()
            .unwrap()
            .get(&NodeId::from(dest))
            .copied()
            .unwrap_or(0)
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }

    /// Deliveries that carried `value`.
    pub fn deliveries_of(&self, value: Value) -> Vec<Delivery> {
        self.deliveries()
            .into_iter()
            .filter(|d| d.values.contains(&value))
            .collect()
    }

    // ---------------------------------------------------------------------
    // Client operations
    // ---------------------------------------------------------------------

    /// A client broadcast of `value` at `node`.
    pub async fn broadcast(&self, node: &str, value: i64) {
        self.node(node)
            .handle(&"c1".into(), Request::Broadcast(BroadcastPayload::Single(Value(value))))
            .await
            .unwrap();
    }

    pub fn read(&self, node: &str) -> Vec<Value> {
        self.node(node).read().unwrap()
    }

    pub fn read_set(&self, node: &str) -> BTreeSet<i64> {
        self.read(node).into_iter().map(|v| v.0).collect()
    }

    pub fn has(&self, node: &str, value: i64) -> bool {
        self.node(node).store().contains(&Value(value))
    }

    /// Every node holds every value in `values`.
    pub fn all_have(&self, values: &[i64]) -> bool {
        self.ids()
            .iter()
            .all(|id| values.iter().all(|v| self.has(id.as_str(), *v)))
    }

    /// Each of `nodes` holds every value in `values`.
    pub fn all_have_on(&self, nodes: &[&str], values: &[i64]) -> bool {
        nodes
            .iter()
            .all(|id| values.iter().all(|v| self.has(id, *v)))
    }

    /// Every node holds the same set.
    pub fn converged(&self) -> bool {
        let ids = self.ids();
        let Some(first) = ids.first() else { return true };
        let reference = self.read_set(first.as_str());
        ids.iter().all(|id| self.read_set(id.as_str()) == reference)
    }

    /// Run one anti-entropy tick on each named node, in order.
    pub async fn tick(&self, order: &[&str]) {
        for id in order {
            self.node(id).run_anti_entropy_tick().await;
        }
    }

    pub async fn shutdown(&self) {
        let nodes: Vec<Arc<SimNode>> = self.nodes.read().unwrap().values().cloned().collect();
        for node in nodes {
            node.shutdown().await;
        }
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
