//! Relay termination when nodes disagree about where a session lives.
//!
//! Each node here gets its own store, so every node can be made to believe
//! the session sits on the next one. Without a hop ceiling the push would
//! circle forever.

use crate::*;

use tether_core::session::now_millis;
use tether_core::{ForwardItem, SessionRecord, Status, MAX_FORWARD_HOPS};
use tether_services::MemoryStore;

const SESSION: &str = "lost-session";

fn record_on(reside: &str) -> SessionRecord {
    let now = now_millis();
    SessionRecord {
        id: SESSION.into(),
        uid: 77,
        device: Device::Web,
        status: Status::Active,
        ctime: now,
        last_active_time: now,
        reside: reside.into(),
        ip: "10.0.0.9".into(),
    }
}

/// Nodes `node-0 .. node-{n-1}`, each convinced the session lives on the
/// next one around the ring.
async fn ring(n: usize) -> Result<(Arc<LoopbackRelay>, Vec<Arc<NodeContext>>)> {
    let relay = Arc::new(LoopbackRelay::default());
    let names: Vec<String> = (0..n).map(|i| format!("node-{i}:7400")).collect();
    let mut nodes = Vec::with_capacity(n);
    for (i, name) in names.iter().enumerate() {
        let node = spawn_node(name, Arc::new(MemoryStore::new()), &relay);
        node.directory.create(&record_on(&names[(i + 1) % n])).await?;
        nodes.push(node);
    }
    Ok((relay, nodes))
}

fn assert_bounded(relay: &LoopbackRelay) {
    let calls = relay.calls();
    assert!(
        calls.len() as u32 <= MAX_FORWARD_HOPS,
        "{} relays for one push",
        calls.len()
    );
    for (_, request) in &calls {
        for item in &request.items {
            assert!(item.hop_count >= 1 && item.hop_count <= MAX_FORWARD_HOPS);
        }
    }
}

#[tokio::test]
async fn two_node_cycle_terminates() -> Result<()> {
    let (relay, nodes) = ring(2).await?;

    let report = tokio::time::timeout(
        Duration::from_secs(5),
        nodes[0].router.push(77, None, Bytes::from_static(b"loop")),
    )
    .await
    .context("relay loop did not terminate")??;

    assert_eq!(report.relayed, 1);
    assert_bounded(&relay);
    assert_eq!(relay.call_count(), MAX_FORWARD_HOPS as usize);

    let hops: Vec<u32> = relay
        .calls()
        .iter()
        .map(|(_, r)| r.items[0].hop_count)
        .collect();
    assert_eq!(hops, vec![1, 2, 3]);
    Ok(())
}

#[tokio::test]
async fn longer_ring_terminates() -> Result<()> {
    for n in [3, 4, 6] {
        let (relay, nodes) = ring(n).await?;
        tokio::time::timeout(
            Duration::from_secs(5),
            nodes[0].router.push(77, None, Bytes::from_static(b"loop")),
        )
        .await
        .context("relay loop did not terminate")??;
        assert_bounded(&relay);
    }
    Ok(())
}

#[tokio::test]
async fn over_ceiling_relay_is_dropped_without_work() -> Result<()> {
    let (relay, nodes) = ring(2).await?;

    let ack = nodes[0]
        .forwarder
        .handle_forward(ForwardRequest {
            origin: "elsewhere:7400".into(),
            items: vec![ForwardItem {
                session_id: SESSION.into(),
                payload: Bytes::from_static(b"late"),
                hop_count: MAX_FORWARD_HOPS + 1,
            }],
        })
        .await;

    assert_eq!(ack.accepted, 0);
    assert_eq!(ack.dropped, 1);
    assert_eq!(relay.call_count(), 0);
    Ok(())
}

#[tokio::test]
async fn stale_presence_on_self_is_not_relayed() -> Result<()> {
    let relay = Arc::new(LoopbackRelay::default());
    let node = spawn_node(NODE_A, Arc::new(MemoryStore::new()), &relay);
    // Directory says the session is here but no socket exists.
    node.directory.create(&record_on(NODE_A)).await?;

    let report = node.router.push(77, None, Bytes::from_static(b"x")).await?;
    assert_eq!(report.local, 0);
    assert_eq!(report.missed, 1);
    assert_eq!(relay.call_count(), 0);
    Ok(())
}

#[tokio::test]
async fn unreachable_owner_counts_as_missed() -> Result<()> {
    let relay = Arc::new(LoopbackRelay::default());
    let node = spawn_node(NODE_A, Arc::new(MemoryStore::new()), &relay);
    node.directory.create(&record_on("gone:7400")).await?;

    let report = node.router.push(77, None, Bytes::from_static(b"x")).await?;
    assert_eq!(report.relayed, 0);
    assert_eq!(report.missed, 1);
    assert_eq!(relay.call_count(), 1);
    Ok(())
}

#[tokio::test]
async fn relayed_push_reaches_moved_session_in_two_hops() -> Result<()> {
    // A's store is stale (says B), B's store is current (says C), C holds the socket.
    let relay = Arc::new(LoopbackRelay::default());
    let store_c = MemoryStore::new();
    let a = spawn_node(NODE_A, Arc::new(MemoryStore::new()), &relay);
    let _b = spawn_node(NODE_B, Arc::new(store_c.clone()), &relay);
    let c = spawn_node("node-c:7400", Arc::new(store_c), &relay);

    let mut client = TestClient::connect(&c, 77, Device::Web).await?;
    let mut stale = record_on(NODE_B);
    stale.id = client.id().to_string();
    a.directory.create(&stale).await?;

    let report = a.router.push(77, None, Bytes::from_static(b"moved")).await?;
    assert_eq!(report.relayed, 1);
    assert_eq!(client.next_data().await?, Bytes::from_static(b"moved"));

    let hops: Vec<(String, u32)> = relay
        .calls()
        .into_iter()
        .map(|(dest, r)| (dest, r.items[0].hop_count))
        .collect();
    assert_eq!(
        hops,
        vec![(NODE_B.to_string(), 1), ("node-c:7400".to_string(), 2)]
    );
    Ok(())
}
