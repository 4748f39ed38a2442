//! Session lifecycle across two nodes sharing one directory.

use crate::*;

use tether_core::Status;
use tether_services::{MemoryStore, NodeError};

fn cluster() -> (MemoryStore, Arc<LoopbackRelay>, Arc<NodeContext>, Arc<NodeContext>) {
    let store = MemoryStore::new();
    let relay = Arc::new(LoopbackRelay::default());
    let a = spawn_node(NODE_A, Arc::new(store.clone()), &relay);
    let b = spawn_node(NODE_B, Arc::new(store.clone()), &relay);
    (store, relay, a, b)
}

#[tokio::test]
async fn session_follows_client_across_nodes() -> Result<()> {
    let (_store, relay, a, b) = cluster();

    let mut on_a = TestClient::connect(&a, 42, Device::Web).await?;
    let session = on_a.id().to_string();
    let record = a.directory.get_by_id(&session).await?;
    assert_eq!(record.status, Status::Active);
    assert_eq!(record.reside, NODE_A);

    // Local delivery, no relay.
    let report = a.router.push(42, Some(Device::Web), Bytes::from_static(b"P")).await?;
    assert_eq!(report.local, 1);
    assert_eq!(report.relayed, 0);
    assert_eq!(relay.call_count(), 0);
    assert_eq!(on_a.next_data().await?, Bytes::from_static(b"P"));

    // Node A shuts down.
    let drained = a.drain().await?;
    assert_eq!(drained.updated, 1);
    assert_eq!(on_a.task.await?, CloseReason::Local);
    let record = a.directory.get_by_id(&session).await?;
    assert_eq!(record.status, Status::TemporaryOffline);

    // Same client comes back on node B and resumes the session.
    let mut on_b = TestClient::connect(&b, 42, Device::Web).await?;
    assert_eq!(on_b.id(), session);
    let record = b.directory.get_by_id(&session).await?;
    assert_eq!(record.status, Status::Active);
    assert_eq!(record.reside, NODE_B);

    // A push still resolved on A goes through exactly one relay.
    let report = a.router.push(42, Some(Device::Web), Bytes::from_static(b"P2")).await?;
    assert_eq!(report.local, 0);
    assert_eq!(report.relayed, 1);

    let calls = relay.calls();
    assert_eq!(calls.len(), 1);
    let (dest, request) = &calls[0];
    assert_eq!(dest, NODE_B);
    assert_eq!(request.origin, NODE_A);
    assert_eq!(request.items.len(), 1);
    assert_eq!(request.items[0].session_id, session);
    assert_eq!(request.items[0].hop_count, 1);

    assert_eq!(on_b.next_data().await?, Bytes::from_static(b"P2"));
    Ok(())
}

#[tokio::test]
async fn draining_node_refuses_new_clients() -> Result<()> {
    let (_store, _relay, a, _b) = cluster();
    a.drain().await?;

    let err = a
        .admit(&ConnectRequest {
            uid: 1,
            device: Device::Ios,
            ip: "127.0.0.1".into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, NodeError::Draining));
    Ok(())
}

#[tokio::test]
async fn hang_up_marks_session_no_active_and_reconnect_reuses_it() -> Result<()> {
    let (_store, _relay, a, b) = cluster();

    let client = TestClient::connect(&a, 7, Device::Android).await?;
    let session = client.id().to_string();
    assert_eq!(client.hang_up().await?, CloseReason::PeerClosed);

    let record = a.directory.get_by_id(&session).await?;
    assert_eq!(record.status, Status::NoActive);
    assert!(a.connections.get(&session).is_none());
    assert!(a.keepalive.is_empty());

    let again = TestClient::connect(&b, 7, Device::Android).await?;
    assert_eq!(again.id(), session);
    Ok(())
}

#[tokio::test]
async fn each_device_class_gets_its_own_session() -> Result<()> {
    let (_store, relay, a, b) = cluster();

    let mut web = TestClient::connect(&a, 9, Device::Web).await?;
    let mut ios = TestClient::connect(&b, 9, Device::Ios).await?;
    assert_ne!(web.id(), ios.id());
    assert_eq!(a.directory.get_by_uid(9).await?.len(), 2);

    // Device filter: only the iOS socket on B.
    let report = a.router.push(9, Some(Device::Ios), Bytes::from_static(b"ios")).await?;
    assert_eq!(report.relayed, 1);
    assert_eq!(report.local, 0);
    assert_eq!(ios.next_data().await?, Bytes::from_static(b"ios"));

    // No filter: both.
    let report = a.router.push(9, None, Bytes::from_static(b"all")).await?;
    assert_eq!(report.local, 1);
    assert_eq!(report.relayed, 1);
    assert_eq!(web.next_data().await?, Bytes::from_static(b"all"));
    assert_eq!(ios.next_data().await?, Bytes::from_static(b"all"));
    assert_eq!(relay.call_count(), 2);
    Ok(())
}

#[tokio::test]
async fn push_counts_offline_sessions() -> Result<()> {
    let (_store, relay, a, _b) = cluster();

    let client = TestClient::connect(&a, 5, Device::Desktop).await?;
    client.hang_up().await?;

    let report = a.router.push(5, None, Bytes::from_static(b"x")).await?;
    assert_eq!(report.offline, 1);
    assert_eq!(report.local + report.relayed, 0);
    assert_eq!(relay.call_count(), 0);
    Ok(())
}

#[tokio::test]
async fn broadcast_reaches_every_node() -> Result<()> {
    let (_store, _relay, a, b) = cluster();

    let mut one = TestClient::connect(&a, 1, Device::Web).await?;
    let mut two = TestClient::connect(&b, 2, Device::Web).await?;

    let report = b
        .router
        .broadcast(&[1, 2, 3], Bytes::from_static(b"hello"))
        .await;
    assert_eq!(report.targets, 3);
    assert_eq!(report.totals.local, 1);
    assert_eq!(report.totals.relayed, 1);
    assert!(report.failed.is_empty());

    assert_eq!(one.next_data().await?, Bytes::from_static(b"hello"));
    assert_eq!(two.next_data().await?, Bytes::from_static(b"hello"));
    Ok(())
}

#[tokio::test]
async fn directory_outage_rejects_connects() -> Result<()> {
    let (store, _relay, a, _b) = cluster();
    store.set_available(false);

    let err = a
        .admit(&ConnectRequest {
            uid: 3,
            device: Device::Web,
            ip: "127.0.0.1".into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, NodeError::Directory(_)));
    assert!(a.connections.is_empty());

    store.set_available(true);
    TestClient::connect(&a, 3, Device::Web).await?;
    assert_eq!(a.connections.len(), 1);
    Ok(())
}

#[tokio::test]
async fn heartbeat_answers_pong() -> Result<()> {
    let (_store, _relay, a, _b) = cluster();

    let mut client = TestClient::connect(&a, 11, Device::Web).await?;
    client.send(Frame::ping())?;
    assert_eq!(client.next_frame().await?.flag(), Flag::Pong);
    Ok(())
}
