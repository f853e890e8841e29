//! The gossip node: accept loop, heartbeats, broadcast relay.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use snapmesh_primitives::NodeId;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec::{Message, MessageCodec, MAX_MESSAGE_SIZE};
use crate::config::GossipConfig;
use crate::message::{Envelope, Payload};
use crate::peer::{PeerInfo, PeerSet};
use crate::GossipError;

const SEEN_CAPACITY: usize = 8192;
const SEND_TIMEOUT: Duration = Duration::from_secs(1);
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

/// A broadcast payload delivered to the application exactly once.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Broadcast {
    pub origin: NodeId,
    pub data: Vec<u8>,
}

/// Application hook for request/response exchanges over the transport.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, origin: &NodeId, data: Vec<u8>) -> Vec<u8>;
}

/// Bounded at-most-once filter over `(origin, message_id)`.
#[derive(Debug, Default)]
struct SeenSet {
    set: HashSet<(NodeId, u64)>,
    order: VecDeque<(NodeId, u64)>,
}

impl SeenSet {
    /// Returns `false` if the id was already recorded.
    fn insert(&mut self, origin: NodeId, message_id: u64) -> bool {
        let key = (origin, message_id);

        if !self.set.insert(key.clone()) {
            return false;
        }

        self.order.push_back(key);
        while self.order.len() > SEEN_CAPACITY {
            if let Some(evicted) = self.order.pop_front() {
                let _removed = self.set.remove(&evicted);
            }
        }

        true
    }
}

#[derive(Debug)]
struct Shared {
    node_id: NodeId,
    config: GossipConfig,
    listen_addr: SocketAddr,
    peers: Mutex<PeerSet>,
    seen: Mutex<SeenSet>,
    next_message_id: AtomicU64,
    deliver_tx: mpsc::Sender<Broadcast>,
    handler: RwLock<Option<Arc<dyn RequestHandler>>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for dyn RequestHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RequestHandler")
    }
}

/// One node's membership in the gossip mesh.
#[derive(Clone, Debug)]
pub struct GossipNode {
    shared: Arc<Shared>,
}

impl GossipNode {
    /// Binds the listener, joins any bootstrap peers, and starts the
    /// accept and heartbeat loops. The returned receiver yields every
    /// broadcast seen for the first time.
    pub async fn bind(
        node_id: NodeId,
        config: GossipConfig,
    ) -> Result<(Self, mpsc::Receiver<Broadcast>), GossipError> {
        let listener = TcpListener::bind(config.listen).await?;
        let listen_addr = listener.local_addr()?;

        let (deliver_tx, deliver_rx) = mpsc::channel(256);

        let shared = Arc::new(Shared {
            node_id,
            config,
            listen_addr,
            peers: Mutex::new(PeerSet::default()),
            seen: Mutex::new(SeenSet::default()),
            next_message_id: AtomicU64::new(1),
            deliver_tx,
            handler: RwLock::new(None),
            cancel: CancellationToken::new(),
        });

        let _accept = tokio::spawn(accept_loop(Arc::clone(&shared), listener));
        let _heartbeat = tokio::spawn(heartbeat_loop(Arc::clone(&shared)));

        let node = Self { shared };

        for addr in node.shared.config.bootstrap.clone() {
            if let Err(err) = node.add_peer(addr).await {
                warn!(%addr, %err, "failed to join bootstrap peer");
            }
        }

        Ok((node, deliver_rx))
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.listen_addr
    }

    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        &self.shared.node_id
    }

    /// Installs the handler invoked for inbound request frames.
    pub fn set_request_handler(&self, handler: Arc<dyn RequestHandler>) {
        *self.shared.handler.write() = Some(handler);
    }

    /// Joins `addr`: sends the membership handshake and folds the peer
    /// list it returns into our own.
    pub async fn add_peer(&self, addr: SocketAddr) -> Result<(), GossipError> {
        let envelope = self.shared.envelope(Payload::Join {
            listen_addr: self.shared.listen_addr,
        });

        let reply = tokio::time::timeout(
            EXCHANGE_TIMEOUT,
            exchange(addr, envelope),
        )
        .await
        .map_err(|_| {
            GossipError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "join handshake timed out",
            ))
        })??;

        let Payload::PeerList { peers } = reply.payload else {
            return Err(GossipError::PeerClosed(addr));
        };

        let mut table = self.shared.peers.lock();
        let _new = table.upsert(addr);
        for peer in peers {
            if peer != self.shared.listen_addr {
                let _new = table.upsert(peer);
            }
        }
        drop(table);

        debug!(%addr, "joined peer");

        Ok(())
    }

    #[must_use]
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.shared
            .peers
            .lock()
            .infos(self.shared.config.failure_threshold)
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.shared.peers.lock().len()
    }

    /// Sends `data` to `fanout` random peers. Recipients relay it onward;
    /// the seen-set keeps delivery at-most-once everywhere.
    pub async fn broadcast(&self, data: Vec<u8>) -> Result<usize, GossipError> {
        if self.shared.cancel.is_cancelled() {
            return Err(GossipError::Terminated);
        }

        let envelope = self.shared.envelope(Payload::Broadcast { data });

        // Never deliver our own broadcast back to ourselves.
        let _first = self
            .shared
            .seen
            .lock()
            .insert(envelope.origin.clone(), envelope.message_id);

        let targets = self
            .shared
            .peers
            .lock()
            .sample(self.shared.config.fanout, &mut rand::thread_rng());

        let sent = fan_out(&envelope, &targets).await;

        Ok(sent)
    }

    /// Request/response against a single peer over one stream.
    pub async fn request(
        &self,
        addr: SocketAddr,
        data: Vec<u8>,
    ) -> Result<Vec<u8>, GossipError> {
        let envelope = self.shared.envelope(Payload::Request { data });

        let reply = tokio::time::timeout(
            EXCHANGE_TIMEOUT,
            exchange(addr, envelope),
        )
        .await
        .map_err(|_| {
            GossipError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "request timed out",
            ))
        })??;

        match reply.payload {
            Payload::Response { data } => Ok(data),
            _ => Err(GossipError::PeerClosed(addr)),
        }
    }

    /// Addresses of currently known peers; used for random peer selection
    /// by the layer above.
    #[must_use]
    pub fn peer_addrs(&self) -> Vec<SocketAddr> {
        self.shared.peers.lock().addrs()
    }

    /// Drops a peer from the active set (e.g. after repeated sync
    /// failures). It may rejoin through the normal handshake.
    pub fn remove_peer(&self, addr: &SocketAddr) -> bool {
        self.shared.peers.lock().remove(addr)
    }

    pub fn shutdown(&self) {
        self.shared.cancel.cancel();
    }
}

impl Shared {
    fn envelope(&self, payload: Payload) -> Envelope {
        Envelope {
            origin: self.node_id.clone(),
            message_id: self.next_message_id.fetch_add(1, Ordering::Relaxed),
            payload,
        }
    }
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    loop {
        tokio::select! {
            () = shared.cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    let shared = Arc::clone(&shared);
                    let _task = tokio::spawn(async move {
                        if let Err(err) = handle_connection(shared, stream).await {
                            debug!(%remote, %err, "connection handling failed");
                        }
                    });
                }
                Err(err) => {
                    warn!(%err, "accept failed");
                }
            },
        }
    }
}

async fn handle_connection(shared: Arc<Shared>, stream: TcpStream) -> Result<(), GossipError> {
    let mut framed = Framed::new(stream, MessageCodec::new(MAX_MESSAGE_SIZE));

    let Some(frame) = framed.next().await else {
        return Ok(());
    };
    let envelope: Envelope = serde_json::from_slice(&frame?.data)?;

    match &envelope.payload {
        Payload::Join { listen_addr } => {
            let listen_addr = *listen_addr;
            let peers = {
                let mut table = shared.peers.lock();
                let _new = table.upsert(listen_addr);
                table
                    .addrs()
                    .into_iter()
                    .filter(|addr| *addr != listen_addr)
                    .collect()
            };

            let reply = shared.envelope(Payload::PeerList { peers });
            send_frame(&mut framed, &reply).await?;
        }

        Payload::Heartbeat { listen_addr } => {
            let _new = shared.peers.lock().upsert(*listen_addr);
        }

        Payload::PeerFailed { addr } => {
            let first_sighting = shared
                .seen
                .lock()
                .insert(envelope.origin.clone(), envelope.message_id);

            if first_sighting && shared.peers.lock().remove(addr) {
                debug!(%addr, reporter = %envelope.origin, "peer removal propagated");
                relay(&shared, &envelope).await;
            }
        }

        Payload::Broadcast { data } => {
            let first_sighting = shared
                .seen
                .lock()
                .insert(envelope.origin.clone(), envelope.message_id);

            if first_sighting {
                let delivery = Broadcast {
                    origin: envelope.origin.clone(),
                    data: data.clone(),
                };
                // Receiver gone means the node is shutting down.
                let _delivered = shared.deliver_tx.send(delivery).await;

                relay(&shared, &envelope).await;
            }
        }

        Payload::Request { data } => {
            let handler = shared.handler.read().clone();

            if let Some(handler) = handler {
                let response = handler.handle(&envelope.origin, data.clone()).await;
                let reply = shared.envelope(Payload::Response { data: response });
                send_frame(&mut framed, &reply).await?;
            }
        }

        Payload::PeerList { .. } | Payload::Response { .. } => {
            debug!(origin = %envelope.origin, "unsolicited reply payload dropped");
        }
    }

    Ok(())
}

async fn heartbeat_loop(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(shared.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = shared.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let envelope = shared.envelope(Payload::Heartbeat {
            listen_addr: shared.listen_addr,
        });
        let targets = shared.peers.lock().addrs();
        let _sent = fan_out(&envelope, &targets).await;

        let failed = shared.peers.lock().sweep(
            shared.config.heartbeat_interval,
            shared.config.failure_threshold,
        );

        for addr in failed {
            warn!(%addr, "peer failed heartbeat check, removing");

            let removal = shared.envelope(Payload::PeerFailed { addr });
            let _first = shared
                .seen
                .lock()
                .insert(removal.origin.clone(), removal.message_id);

            let remaining = shared.peers.lock().addrs();
            let _sent = fan_out(&removal, &remaining).await;
        }
    }
}

/// Forwards a foreign envelope, preserving its origin and id.
async fn relay(shared: &Arc<Shared>, envelope: &Envelope) {
    let targets = shared
        .peers
        .lock()
        .sample(shared.config.fanout, &mut rand::thread_rng());

    let _sent = fan_out(envelope, &targets).await;
}

/// Best-effort concurrent send to every target; returns how many landed.
async fn fan_out(envelope: &Envelope, targets: &[SocketAddr]) -> usize {
    let sends = targets.iter().map(|addr| {
        let addr = *addr;
        let envelope = envelope.clone();
        async move {
            tokio::time::timeout(SEND_TIMEOUT, send_to(addr, &envelope))
                .await
                .map_err(|_| ())
                .and_then(|result| result.map_err(|_| ()))
                .is_ok()
        }
    });

    futures_util::future::join_all(sends)
        .await
        .into_iter()
        .filter(|ok| *ok)
        .count()
}

async fn send_to(addr: SocketAddr, envelope: &Envelope) -> Result<(), GossipError> {
    let stream = TcpStream::connect(addr).await?;
    let mut framed = Framed::new(stream, MessageCodec::new(MAX_MESSAGE_SIZE));
    send_frame(&mut framed, envelope).await
}

/// Sends one envelope and waits for exactly one reply frame.
async fn exchange(addr: SocketAddr, envelope: Envelope) -> Result<Envelope, GossipError> {
    let stream = TcpStream::connect(addr).await?;
    let mut framed = Framed::new(stream, MessageCodec::new(MAX_MESSAGE_SIZE));

    send_frame(&mut framed, &envelope).await?;

    let Some(frame) = framed.next().await else {
        return Err(GossipError::PeerClosed(addr));
    };

    Ok(serde_json::from_slice(&frame?.data)?)
}

async fn send_frame(
    framed: &mut Framed<TcpStream, MessageCodec>,
    envelope: &Envelope,
) -> Result<(), GossipError> {
    let data = serde_json::to_vec(envelope)?;
    framed.send(Message { data }).await
}
