//! End-to-end over real sockets: WebSocket clients, the HTTP push surface and
//! the HTTP relay between two nodes.

use crate::*;

use std::net::SocketAddr;

use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use tether_api::{ApiState, HeaderAuthenticator, HttpRelayClient};
use tether_services::MemoryStore;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A node served on a loopback port. Dropping it stops the server.
struct LiveNode {
    addr: SocketAddr,
    node: Arc<NodeContext>,
    _stop: oneshot::Sender<()>,
}

impl LiveNode {
    async fn start(store: &MemoryStore) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let relay = HttpRelayClient::new(Duration::from_secs(2))?;
        let node = NodeContext::new(
            node_config(&addr.to_string()),
            Arc::new(store.clone()),
            Arc::new(relay),
        );
        let state = ApiState::new(node.clone(), Arc::new(HeaderAuthenticator));

        let (stop, stopped) = oneshot::channel::<()>();
        tokio::spawn(tether_api::serve_on(listener, state, async move {
            stopped.await.ok();
        }));

        Ok(Self {
            addr,
            node,
            _stop: stop,
        })
    }

    fn api(&self, path: &str) -> String {
        format!("http://{}/api{}", self.addr, path)
    }

    async fn connect(&self, uid: Uid, device: &str) -> Result<Ws> {
        let mut request = format!("ws://{}/ws?device={}", self.addr, device).into_client_request()?;
        request
            .headers_mut()
            .insert("x-tether-uid", HeaderValue::from_str(&uid.to_string())?);
        let (ws, _) = connect_async(request).await?;
        Ok(ws)
    }
}

async fn send(ws: &mut Ws, frame: Frame) -> Result<()> {
    ws.send(Message::Binary(frame.encode()?)).await?;
    Ok(())
}

async fn recv(ws: &mut Ws) -> Result<Frame> {
    loop {
        let msg = tokio::time::timeout(FRAME_WAIT, ws.next())
            .await
            .context("no frame in time")?
            .context("socket closed")??;
        match msg {
            Message::Binary(raw) => return Ok(wire::decode(raw)?),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => bail!("unexpected message {:?}", other),
        }
    }
}

async fn push(client: &reqwest::Client, node: &LiveNode, uid: Uid, text: &str) -> Result<Value> {
    let resp = client
        .post(node.api("/push"))
        .json(&json!({ "uid": uid, "payload": hex::encode(text) }))
        .send()
        .await?;
    anyhow::ensure!(resp.status().is_success(), "push failed: {}", resp.status());
    Ok(resp.json().await?)
}

#[tokio::test]
async fn websocket_client_gets_pong_and_pushes() -> Result<()> {
    let store = MemoryStore::new();
    let live = LiveNode::start(&store).await?;
    let http = reqwest::Client::new();

    let mut ws = live.connect(42, "web").await?;
    send(&mut ws, Frame::ping()).await?;
    assert_eq!(recv(&mut ws).await?.flag(), Flag::Pong);

    let body = push(&http, &live, 42, "hello").await?;
    assert_eq!(body["report"]["local"], 1);
    let frame = recv(&mut ws).await?;
    assert_eq!(frame.flag(), Flag::Data);
    assert_eq!(frame.payload, Bytes::from_static(b"hello"));

    let sessions: Value = http.get(live.api("/sessions/42")).send().await?.json().await?;
    let sessions = sessions["sessions"].as_array().context("sessions list")?;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["status"], "active");
    assert_eq!(sessions[0]["device"], "web");

    let status: Value = http.get(live.api("/status")).send().await?.json().await?;
    assert_eq!(status["connections"].as_array().map(Vec::len), Some(1));
    Ok(())
}

#[tokio::test]
async fn protocol_violation_gets_err_frame() -> Result<()> {
    let store = MemoryStore::new();
    let live = LiveNode::start(&store).await?;

    let mut ws = live.connect(8, "ios").await?;
    send(&mut ws, Frame::pong()).await?;
    assert_eq!(recv(&mut ws).await?.flag(), Flag::Err);

    // Still open afterwards.
    send(&mut ws, Frame::ping()).await?;
    assert_eq!(recv(&mut ws).await?.flag(), Flag::Pong);
    Ok(())
}

#[tokio::test]
async fn upgrade_without_identity_is_refused() -> Result<()> {
    let store = MemoryStore::new();
    let live = LiveNode::start(&store).await?;

    match connect_async(format!("ws://{}/ws", live.addr)).await {
        Err(WsError::Http(resp)) => assert_eq!(resp.status().as_u16(), 401),
        Err(e) => bail!("unexpected error {e}"),
        Ok(_) => bail!("anonymous upgrade accepted"),
    }
    assert_eq!(store.key_count(), 0);
    Ok(())
}

#[tokio::test]
async fn push_relays_between_nodes_over_http() -> Result<()> {
    let store = MemoryStore::new();
    let a = LiveNode::start(&store).await?;
    let b = LiveNode::start(&store).await?;
    let http = reqwest::Client::new();

    let mut ws = b.connect(99, "android").await?;

    let body = push(&http, &a, 99, "via-a").await?;
    assert_eq!(body["report"]["relayed"], 1);
    assert_eq!(body["report"]["local"], 0);

    let frame = recv(&mut ws).await?;
    assert_eq!(frame.payload, Bytes::from_static(b"via-a"));
    Ok(())
}

#[tokio::test]
async fn client_hang_up_releases_session() -> Result<()> {
    let store = MemoryStore::new();
    let live = LiveNode::start(&store).await?;

    let mut ws = live.connect(5, "desktop").await?;
    send(&mut ws, Frame::ping()).await?;
    recv(&mut ws).await?;
    ws.close(None).await?;

    let deadline = tokio::time::Instant::now() + FRAME_WAIT;
    loop {
        let records = live.node.directory.get_by_uid(5).await?;
        if records.iter().all(|r| r.status == tether_core::Status::NoActive) {
            break;
        }
        anyhow::ensure!(tokio::time::Instant::now() < deadline, "session still active");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(live.node.connections.is_empty());
    Ok(())
}
