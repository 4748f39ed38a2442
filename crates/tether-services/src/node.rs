//! Node context: everything one gateway node owns, built once at startup and
//! handed to the API layer and background tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use futures::Stream;

use tether_core::config::TetherConfig;
use tether_core::{NodeId, SessionRecord};

use crate::connection::{
    CloseReason, Connection, ConnectionHandler, ConnectionInfo, ConnectionSettings, FrameSink,
    TransportError, TransportMessage,
};
use crate::directory::{DirectoryError, SessionDirectory};
use crate::forwarder::{Forwarder, RelayClient};
use crate::keepalive::KeepaliveScheduler;
use crate::lifecycle::{ConnectRequest, OfflineReport, SessionLifecycle};
use crate::router::PushRouter;
use crate::store::DirectoryStore;
use crate::table::ConnectionTable;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("node is draining")]
    Draining,
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

pub struct NodeContext {
    pub identity: NodeId,
    pub config: TetherConfig,
    pub directory: SessionDirectory,
    pub connections: ConnectionTable,
    pub lifecycle: SessionLifecycle,
    pub router: PushRouter,
    pub forwarder: Arc<Forwarder>,
    pub keepalive: KeepaliveScheduler,
    draining: AtomicBool,
}

impl NodeContext {
    pub fn new(
        config: TetherConfig,
        store: Arc<dyn DirectoryStore>,
        relay: Arc<dyn RelayClient>,
    ) -> Arc<Self> {
        let identity = config.node.identity();
        let directory = SessionDirectory::new(store, config.directory.session_ttl());
        let connections = ConnectionTable::new();
        let lifecycle = SessionLifecycle::new(
            directory.clone(),
            identity.clone(),
            config.directory.offline_concurrency,
        );
        let forwarder = Arc::new(Forwarder::new(
            identity.clone(),
            directory.clone(),
            connections.clone(),
            relay,
            &config.forward,
        ));
        let router = PushRouter::new(
            identity.clone(),
            directory.clone(),
            connections.clone(),
            forwarder.clone(),
            &config.push,
        );
        let keepalive = KeepaliveScheduler::new(config.keepalive.heartbeat_timeout());

        Arc::new(Self {
            identity,
            config,
            directory,
            connections,
            lifecycle,
            router,
            forwarder,
            keepalive,
            draining: AtomicBool::new(false),
        })
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Resolve the session for an authenticated client and register its
    /// socket. The returned connection must then be driven by [`run`].
    ///
    /// [`run`]: NodeContext::run
    pub async fn open(&self, req: ConnectRequest, sink: FrameSink) -> Result<Arc<Connection>, NodeError> {
        let record = self.admit(&req).await?;
        Ok(self.attach(record, sink))
    }

    /// Write the `Active` session record for a client about to upgrade.
    pub async fn admit(&self, req: &ConnectRequest) -> Result<SessionRecord, NodeError> {
        if self.is_draining() {
            return Err(NodeError::Draining);
        }
        Ok(self.lifecycle.connect(req).await?)
    }

    /// Wrap the upgraded socket of an admitted session and register it.
    pub fn attach(&self, record: SessionRecord, sink: FrameSink) -> Arc<Connection> {
        let conn = Connection::new(
            ConnectionInfo {
                id: record.id,
                uid: record.uid,
                device: record.device,
                ip: record.ip,
            },
            sink,
            ConnectionSettings::from(&self.config.connection),
        );
        if let Some(previous) = self.connections.insert(conn.clone()) {
            tracing::info!(session_id = %previous.id(), "replacing older socket for resumed session");
            tokio::spawn(async move {
                previous.close().await;
            });
        }
        if self.config.keepalive.enabled {
            self.keepalive.schedule(conn.id(), Instant::now());
        }
        tracing::info!(
            session_id = %conn.id(),
            uid = conn.uid(),
            connections = self.connections.len(),
            "connection opened"
        );
        conn
    }

    /// Drive the read loop of a connection returned by [`NodeContext::open`].
    pub async fn run<R>(self: &Arc<Self>, conn: Arc<Connection>, reader: R) -> CloseReason
    where
        R: Stream<Item = Result<TransportMessage, TransportError>> + Unpin + Send,
    {
        let handler: Arc<dyn ConnectionHandler> = self.clone();
        conn.serve(reader, handler).await
    }

    /// Graceful shutdown: stop accepting, mark every local session
    /// `TemporaryOffline`, then close the sockets.
    pub async fn drain(&self) -> Result<OfflineReport, DirectoryError> {
        self.draining.store(true, Ordering::Release);

        let conns = self.connections.snapshot();
        let ids: Vec<String> = conns.iter().map(|c| c.id().to_string()).collect();
        tracing::info!(sessions = ids.len(), "draining node");

        let offlined = self.lifecycle.offline_sessions(&ids).await;
        if let Err(e) = &offlined {
            tracing::warn!(error = %e, "offline before drain incomplete");
        }

        join_all(conns.iter().map(|c| c.close())).await;
        tracing::info!("drain complete");
        offlined
    }

    /// Grace-close local connections whose heartbeat deadline passed.
    /// Returns how many were closed.
    pub async fn sweep_keepalive(&self, now: Instant) -> usize {
        let expired = self.keepalive.pop_expired(now);
        let mut closed = 0;
        for id in expired {
            if let Some(conn) = self.connections.get(&id) {
                tracing::info!(session_id = %id, "heartbeat overdue, closing");
                if conn.close().await {
                    closed += 1;
                }
            }
        }
        closed
    }

    fn note_alive(&self, id: &str) {
        if self.config.keepalive.enabled {
            self.keepalive.schedule(id, Instant::now());
        }
    }
}

#[async_trait]
impl ConnectionHandler for NodeContext {
    async fn on_heartbeat(&self, conn: &Connection) {
        self.note_alive(conn.id());
        if let Err(e) = self.lifecycle.heartbeat(conn.id()).await {
            tracing::warn!(session_id = %conn.id(), error = %e, "heartbeat not recorded");
        }
    }

    async fn on_data(&self, conn: &Connection, payload: Bytes) {
        self.note_alive(conn.id());
        if let Err(e) = self.lifecycle.on_data(conn.id(), &payload).await {
            tracing::warn!(session_id = %conn.id(), error = %e, "client data not recorded");
        }
    }

    async fn after_closed(&self, conn: &Arc<Connection>, reason: CloseReason) {
        let lifetime = conn.established_at().elapsed();
        if !self.connections.remove_if_same(conn) {
            tracing::debug!(session_id = %conn.id(), %reason, "superseded socket closed");
            return;
        }
        self.keepalive.remove(conn.id());

        // Drain has already offlined the session.
        if !self.is_draining() {
            if let Err(e) = self.lifecycle.release(conn.id()).await {
                tracing::warn!(session_id = %conn.id(), error = %e, "release failed");
            }
        }
        tracing::info!(
            session_id = %conn.id(),
            %reason,
            lifetime_ms = lifetime.as_millis() as u64,
            "connection closed"
        );
    }
}
