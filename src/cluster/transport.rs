//! Peer message delivery.
//!
//! The consensus loop hands every outgoing message to a [`Transport`] and
//! moves on; delivery is best-effort and unordered across peers.  Lost
//! messages are recovered by the protocol's own retries (heartbeats,
//! election timeouts).
//!
//! [`HttpTransport`] posts JSON to `/raft/message` on the peer.
//! [`LocalNetwork`] connects in-process nodes and can partition them,
//! which is what the multi-node tests use.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::membership::{Configuration, NodeId};
use super::messages::{Message, Outgoing};
use super::node::RaftNode;
use crate::metrics::PEER_SEND_FAILURES_TOTAL;

/// Messages buffered per peer before new ones are dropped.
const PEER_QUEUE_DEPTH: usize = 256;

pub trait Transport: Send + Sync + 'static {
    /// Queue a message for delivery.  Must not block.
    fn send(&self, outgoing: Outgoing);

    /// Called whenever the node table changes; lets a transport release
    /// resources held for nodes that are no longer members.
    fn retain(&self, _configuration: &Configuration) {}
}

// -- HTTP ---------------------------------------------------------------------

/// Sends messages to peers over HTTP, one worker task per peer address so
/// messages to the same peer stay in order.
pub struct HttpTransport {
    client: reqwest::Client,
    peers: Mutex<HashMap<String, mpsc::Sender<Message>>>,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            peers: Mutex::new(HashMap::new()),
        })
    }

    fn spawn_peer(&self, address: &str) -> mpsc::Sender<Message> {
        let (tx, rx) = mpsc::channel(PEER_QUEUE_DEPTH);
        tokio::spawn(run_peer(self.client.clone(), address.to_string(), rx));
        tx
    }
}

impl Transport for HttpTransport {
    fn send(&self, outgoing: Outgoing) {
        let mut peers = self.peers.lock().expect("mutex poisoned");
        if peers.get(&outgoing.address).is_some_and(|tx| tx.is_closed()) {
            peers.remove(&outgoing.address);
        }
        let tx = match peers.get(&outgoing.address) {
            Some(tx) => tx.clone(),
            None => {
                let tx = self.spawn_peer(&outgoing.address);
                peers.insert(outgoing.address.clone(), tx.clone());
                tx
            }
        };
        drop(peers);
        if let Err(err) = tx.try_send(outgoing.message) {
            counter!(PEER_SEND_FAILURES_TOTAL, "reason" => "queue_full").increment(1);
            debug!(to = outgoing.to, address = %outgoing.address, "peer queue full, dropping message: {err}");
        }
    }
    /// Stop the workers of peers that left the cluster.  A worker exits
    /// once its queue is drained and its sender dropped.
    fn retain(&self, configuration: &Configuration) {
        let mut peers = self.peers.lock().expect("mutex poisoned");
        peers.retain(|address, _| {
            let keep = configuration.nodes().any(|n| n.address == *address);
            if !keep {
                debug!(%address, "releasing peer worker");
            }
            keep
        });
    }
}

async fn run_peer(client: reqwest::Client, address: String, mut rx: mpsc::Receiver<Message>) {
    let url = format!("http://{address}/raft/message");
    while let Some(message) = rx.recv().await {
        let kind = message.body.kind();
        match client.post(&url).json(&message).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                counter!(PEER_SEND_FAILURES_TOTAL, "reason" => "status").increment(1);
                warn!(%address, kind, status = %response.status(), "peer rejected message");
            }
            Err(err) => {
                counter!(PEER_SEND_FAILURES_TOTAL, "reason" => "unreachable").increment(1);
                debug!(%address, kind, "peer unreachable: {err}");
            }
        }
    }
}

// -- In-process ---------------------------------------------------------------

/// In-process network of [`RaftNode`]s keyed by address.
#[derive(Default)]
pub struct LocalNetwork {
    nodes: Mutex<HashMap<String, RaftNode>>,
    isolated: Mutex<HashSet<NodeId>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, address: impl Into<String>, node: RaftNode) {
        self.nodes
            .lock()
            .expect("mutex poisoned")
            .insert(address.into(), node);
    }

    pub fn unregister(&self, address: &str) {
        self.nodes.lock().expect("mutex poisoned").remove(address);
    }

    /// Drop all traffic to and from `id`.
    pub fn isolate(&self, id: NodeId) {
        self.isolated.lock().expect("mutex poisoned").insert(id);
    }

    pub fn heal(&self, id: NodeId) {
        self.isolated.lock().expect("mutex poisoned").remove(&id);
    }

    pub fn heal_all(&self) {
        self.isolated.lock().expect("mutex poisoned").clear();
    }

    pub fn is_isolated(&self, id: NodeId) -> bool {
        self.isolated.lock().expect("mutex poisoned").contains(&id)
    }
}

impl Transport for LocalNetwork {
    fn send(&self, outgoing: Outgoing) {
        {
            let isolated = self.isolated.lock().expect("mutex poisoned");
            if isolated.contains(&outgoing.to) || isolated.contains(&outgoing.message.from) {
                return;
            }
        }
        let node = self
            .nodes
            .lock()
            .expect("mutex poisoned")
            .get(&outgoing.address)
            .cloned();
        match node {
            Some(node) => node.deliver(outgoing.message),
            None => debug!(address = %outgoing.address, "no local node at address"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use super::*;
    use crate::cluster::membership::Configuration;
    use crate::cluster::messages::MessageBody;
    use crate::cluster::raft::{RaftConfig, RaftCore};
    use crate::fsm::state_machine::StateMachine;
    use crate::logstore::memory::MemoryLogStore;

    fn spawn(id: NodeId, network: &Arc<LocalNetwork>) -> RaftNode {
        let fsm = Arc::new(StateMachine::new(&["main"]).unwrap());
        let config = RaftConfig {
            election_timeout: Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(20),
            ..RaftConfig::default()
        };
        let mut core = RaftCore::new(
            id,
            format!("@{id}"),
            config.clone(),
            Box::new(MemoryLogStore::new()),
            fsm.clone(),
            Instant::now(),
        )
        .unwrap();
        core.bootstrap(Configuration::with_voters([(1, "@1"), (2, "@2")]))
            .unwrap();
        let node = RaftNode::spawn(core, fsm, network.clone(), &config);
        network.register(format!("@{id}"), node.clone());
        node
    }

    #[tokio::test]
    async fn test_local_network_elects_leader() {
        let network = Arc::new(LocalNetwork::new());
        let a = spawn(1, &network);
        let b = spawn(2, &network);
        let status = a.wait_for_leader(Duration::from_secs(5)).await.unwrap();
        let leader = status.leader.unwrap().id;
        let other = b.wait_for_leader(Duration::from_secs(5)).await.unwrap();
        assert_eq!(other.leader.unwrap().id, leader);
        a.shutdown().await;
        b.shutdown().await;
    }

    fn timeout_now(from: NodeId, to: NodeId, term: u64) -> Outgoing {
        Outgoing {
            to,
            address: format!("@{to}"),
            message: Message {
                from,
                from_address: format!("@{from}"),
                term,
                body: MessageBody::TimeoutNow,
            },
        }
    }

    #[tokio::test]
    async fn test_isolated_sender_is_dropped() {
        let network = Arc::new(LocalNetwork::new());
        let fsm = Arc::new(StateMachine::new(&["main"]).unwrap());
        // Long timeouts: node 2 only moves its term when a message arrives.
        let config = RaftConfig {
            election_timeout: Duration::from_secs(60),
            ..RaftConfig::default()
        };
        let mut core = RaftCore::new(
            2,
            "@2".to_string(),
            config.clone(),
            Box::new(MemoryLogStore::new()),
            fsm.clone(),
            Instant::now(),
        )
        .unwrap();
        core.bootstrap(Configuration::with_voters([(1, "@1"), (2, "@2")]))
            .unwrap();
        let node = RaftNode::spawn(core, fsm, network.clone(), &config);
        network.register("@2", node.clone());
        let term = node.status().term;

        network.isolate(1);
        network.send(timeout_now(1, 2, term + 5));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(node.status().term, term);

        network.heal_all();
        network.send(timeout_now(1, 2, term + 5));
        let mut status = node.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|s| s.term >= term + 5),
        )
        .await
        .unwrap()
        .unwrap();

        network.unregister("@2");
        network.send(timeout_now(1, 2, term + 50));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(node.status().term < term + 50);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_http_transport_releases_removed_peers() {
        let transport = HttpTransport::new(Duration::from_millis(50)).unwrap();
        for to in [2, 3] {
            transport.send(Outgoing {
                to,
                address: format!("127.0.0.1:{to}"),
                message: Message {
                    from: 1,
                    from_address: "127.0.0.1:1".to_string(),
                    term: 1,
                    body: MessageBody::TimeoutNow,
                },
            });
        }
        assert_eq!(transport.peers.lock().unwrap().len(), 2);

        transport.retain(&Configuration::with_voters([
            (1, "127.0.0.1:1"),
            (2, "127.0.0.1:2"),
        ]));
        let peers = transport.peers.lock().unwrap();
        assert_eq!(peers.len(), 1);
        assert!(peers.contains_key("127.0.0.1:2"));
    }

    #[tokio::test]
    async fn test_http_transport_tolerates_unreachable_peer() {
        let transport = HttpTransport::new(Duration::from_millis(50)).unwrap();
        for _ in 0..3 {
            transport.send(Outgoing {
                to: 2,
                address: "127.0.0.1:1".to_string(),
                message: Message {
                    from: 1,
                    from_address: "127.0.0.1:2".to_string(),
                    term: 1,
                    body: MessageBody::TimeoutNow,
                },
            });
        }
        assert_eq!(transport.peers.lock().unwrap().len(), 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
