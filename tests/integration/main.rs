//! Tether integration test harness.
//!
//! Nodes run in-process. Multi-node tests share one `MemoryStore` as the
//! cluster directory and reach each other through `LoopbackRelay`, which
//! hands each relay straight to the destination node's forwarder and records
//! it. The gateway tests start real HTTP servers on loopback ports.
//!
//!   cargo test --test integration

mod forwarding;
mod gateway;
mod scenario;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};

use tether_core::config::TetherConfig;
use tether_core::wire::{self, Flag, Frame};
use tether_core::{Device, ForwardAck, ForwardRequest, Uid};
use tether_services::{
    CloseReason, ConnectRequest, Connection, DirectoryStore, FrameSink, NodeContext, RelayClient,
    RelayError, TransportError, TransportMessage,
};

// ── Harness ───────────────────────────────────────────────────────────────────

pub const NODE_A: &str = "node-a:7400";
pub const NODE_B: &str = "node-b:7400";

/// How long a test waits for a frame before failing.
pub const FRAME_WAIT: Duration = Duration::from_secs(2);

/// In-process relay between registered nodes.
#[derive(Default)]
pub struct LoopbackRelay {
    nodes: RwLock<HashMap<String, Arc<NodeContext>>>,
    calls: Mutex<Vec<(String, ForwardRequest)>>,
}

impl LoopbackRelay {
    pub fn register(&self, node: &Arc<NodeContext>) {
        self.nodes
            .write()
            .unwrap()
            .insert(node.identity.clone(), node.clone());
    }

    /// Every relay made so far, as (destination, request).
    pub fn calls(&self) -> Vec<(String, ForwardRequest)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl RelayClient for LoopbackRelay {
    async fn push_forward(&self, node: &str, request: ForwardRequest) -> Result<ForwardAck, RelayError> {
        self.calls
            .lock()
            .unwrap()
            .push((node.to_string(), request.clone()));
        let target = self.nodes.read().unwrap().get(node).cloned();
        match target {
            Some(target) => Ok(target.forwarder.handle_forward(request).await),
            None => Err(RelayError::Failed {
                node: node.to_string(),
                reason: "no such node".into(),
            }),
        }
    }
}

pub fn node_config(identity: &str) -> TetherConfig {
    let mut config = TetherConfig::default();
    config.node.advertise_addr = identity.to_string();
    config
}

/// Build a node on `store` and register it with `relay`.
pub fn spawn_node(
    identity: &str,
    store: Arc<dyn DirectoryStore>,
    relay: &Arc<LoopbackRelay>,
) -> Arc<NodeContext> {
    let node = NodeContext::new(node_config(identity), store, relay.clone());
    relay.register(&node);
    node
}

/// A client socket attached to a node through in-memory channels.
pub struct TestClient {
    pub conn: Arc<Connection>,
    pub task: tokio::task::JoinHandle<CloseReason>,
    inbound: mpsc::UnboundedSender<Result<TransportMessage, TransportError>>,
    outbound: mpsc::UnboundedReceiver<TransportMessage>,
}

impl TestClient {
    pub async fn connect(node: &Arc<NodeContext>, uid: Uid, device: Device) -> Result<Self> {
        let (out_tx, outbound) = mpsc::unbounded::<TransportMessage>();
        let (inbound, in_rx) = mpsc::unbounded();
        let sink: FrameSink = Box::pin(out_tx.sink_map_err(|e| TransportError(e.to_string())));

        let conn = node
            .open(
                ConnectRequest {
                    uid,
                    device,
                    ip: "127.0.0.1".into(),
                },
                sink,
            )
            .await
            .context("connect failed")?;

        let task = tokio::spawn({
            let node = node.clone();
            let conn = conn.clone();
            async move { node.run(conn, in_rx).await }
        });

        Ok(Self {
            conn,
            task,
            inbound,
            outbound,
        })
    }

    pub fn id(&self) -> &str {
        self.conn.id()
    }

    pub fn send(&self, frame: Frame) -> Result<()> {
        self.inbound
            .unbounded_send(Ok(TransportMessage::Binary(frame.encode()?)))
            .context("socket gone")
    }

    pub async fn next_frame(&mut self) -> Result<Frame> {
        match tokio::time::timeout(FRAME_WAIT, self.outbound.next()).await {
            Err(_) => bail!("no frame within {:?}", FRAME_WAIT),
            Ok(None) => bail!("socket closed"),
            Ok(Some(TransportMessage::Binary(raw))) => Ok(wire::decode(raw)?),
            Ok(Some(other)) => bail!("unexpected transport message {:?}", other),
        }
    }

    /// Next `DATA` payload, skipping other frames.
    pub async fn next_data(&mut self) -> Result<Bytes> {
        loop {
            let frame = self.next_frame().await?;
            if frame.flag() == Flag::Data {
                return Ok(frame.payload);
            }
        }
    }

    /// Peer-side close.
    pub async fn hang_up(self) -> Result<CloseReason> {
        self.inbound
            .unbounded_send(Ok(TransportMessage::Close))
            .context("socket gone")?;
        Ok(self.task.await?)
    }
}
