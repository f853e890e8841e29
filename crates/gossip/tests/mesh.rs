//! In-process gossip mesh behavior.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use snapmesh_gossip::{Broadcast, GossipConfig, GossipNode, PeerState, RequestHandler};
use snapmesh_primitives::NodeId;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

fn fast_config(bootstrap: Vec<std::net::SocketAddr>) -> GossipConfig {
    let mut config = GossipConfig::new("127.0.0.1:0".parse().unwrap(), bootstrap);
    config.heartbeat_interval = Duration::from_millis(50);
    config.fanout = 8;
    config
}

async fn spawn_mesh(size: usize) -> Vec<(GossipNode, mpsc::Receiver<Broadcast>)> {
    let mut nodes = Vec::with_capacity(size);

    let (seed, seed_rx) = GossipNode::bind(
        NodeId::new("node-0").unwrap(),
        fast_config(Vec::new()),
    )
    .await
    .unwrap();
    let seed_addr = seed.local_addr();
    nodes.push((seed, seed_rx));

    for i in 1..size {
        let (node, rx) = GossipNode::bind(
            NodeId::new(format!("node-{i}")).unwrap(),
            fast_config(vec![seed_addr]),
        )
        .await
        .unwrap();
        nodes.push((node, rx));
    }

    // Let heartbeats spread the membership.
    for _ in 0..40 {
        if nodes.iter().all(|(n, _)| n.peer_count() >= size - 1) {
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }

    nodes
}

#[tokio::test]
async fn join_folds_in_the_peer_list() {
    let nodes = spawn_mesh(3).await;

    for (node, _) in &nodes {
        assert_eq!(
            node.peer_count(),
            2,
            "{} should know both other peers",
            node.node_id()
        );
    }

    for (node, _) in &nodes {
        node.shutdown();
    }
}

#[tokio::test]
async fn broadcast_reaches_every_node_exactly_once() {
    let mut nodes = spawn_mesh(4).await;

    let payload = b"delta bytes".to_vec();
    nodes[0].0.broadcast(payload.clone()).await.unwrap();

    for (node, rx) in nodes.iter_mut().skip(1) {
        let delivery = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap_or_else(|_| panic!("{} never saw the broadcast", node.node_id()))
            .unwrap();

        assert_eq!(delivery.origin.as_str(), "node-0");
        assert_eq!(delivery.data, payload);

        // Relays must not deliver a second copy.
        let duplicate = timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(duplicate.is_err(), "{} saw a duplicate", node.node_id());
    }

    for (node, _) in &nodes {
        node.shutdown();
    }
}

#[tokio::test]
async fn origin_does_not_hear_its_own_broadcast() {
    let mut nodes = spawn_mesh(3).await;

    nodes[0].0.broadcast(b"echo?".to_vec()).await.unwrap();

    let own = timeout(Duration::from_millis(500), nodes[0].1.recv()).await;
    assert!(own.is_err());

    for (node, _) in &nodes {
        node.shutdown();
    }
}

struct EchoHandler;

#[async_trait]
impl RequestHandler for EchoHandler {
    async fn handle(&self, origin: &NodeId, data: Vec<u8>) -> Vec<u8> {
        let mut reply = format!("{origin}:").into_bytes();
        reply.extend_from_slice(&data);
        reply
    }
}

#[tokio::test]
async fn request_response_round_trip() {
    let nodes = spawn_mesh(2).await;

    nodes[1].0.set_request_handler(Arc::new(EchoHandler));

    let reply = nodes[0]
        .0
        .request(nodes[1].0.local_addr(), b"ping".to_vec())
        .await
        .unwrap();

    assert_eq!(reply, b"node-0:ping");

    for (node, _) in &nodes {
        node.shutdown();
    }
}

#[tokio::test]
async fn silent_peer_is_declared_failed() {
    let nodes = spawn_mesh(3).await;

    // Take node 2 off the air entirely.
    nodes[2].0.shutdown();

    let mut removed = false;
    for _ in 0..100 {
        if nodes[0].0.peer_count() == 1 && nodes[1].0.peer_count() == 1 {
            removed = true;
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }

    assert!(removed, "silent peer was never evicted");

    for (node, _) in nodes.iter().take(2) {
        assert!(node
            .peers()
            .iter()
            .all(|peer| peer.state == PeerState::Alive || peer.state == PeerState::Suspect));
    }

    for (node, _) in &nodes {
        node.shutdown();
    }
}
