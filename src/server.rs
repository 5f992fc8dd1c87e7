//! Server supervisor: one socket, many peers keyed by source virtual
//! address.
//!
//! All peer state is owned by a single serve task that selects over the
//! datagram queue, the user-send queue, the shutdown signal, and a one
//! second housekeeping tick. Users talk to it through bounded channels.

use crate::addr::{LocalAddr, RemoteAddr};
use crate::chan::{spawn_reader, Status, TxRequest, UserMessage, USER_RX_CAPACITY};
use crate::error::SudpError;
use crate::peer::{EngineCtx, Peer};
use crate::tsync::TimeSync;
use crate::wire::{Header, PktBuff, HDR_SIZE};
use p256::ecdsa::SigningKey;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Housekeeping cadence.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// A ready peer silent for longer than this is reset.
const PEER_TTL: Duration = Duration::from_secs(5);

/// Handle to a running server. All operations are safe to call from any
/// task; once closed, every operation fails fast with [`SudpError::Closed`].
#[derive(Debug)]
pub struct ServerConn {
    socket: Arc<UdpSocket>,
    user_tx: mpsc::Sender<TxRequest>,
    user_rx: Mutex<mpsc::Receiver<UserMessage>>,
    shutdown_tx: mpsc::Sender<()>,
    result_rx: Mutex<mpsc::Receiver<Result<(), SudpError>>>,
    status: Status,
    closed: Mutex<bool>,
}

/// Bind a UDP socket and start serving the configured peers.
///
/// Peers without a public key cannot be authenticated and are skipped.
pub async fn listen(local: &LocalAddr, peers: &[RemoteAddr]) -> Result<ServerConn, SudpError> {
    let private = local
        .private_key
        .clone()
        .ok_or(SudpError::ConfigMissing("private key"))?;
    let bind = local
        .network_address
        .ok_or(SudpError::ConfigMissing("bind address"))?;

    let socket = Arc::new(UdpSocket::bind(bind).await?);
    info!("listening on {} as virtual address {}", bind, local.virtual_address);

    let mut peer_map = HashMap::new();
    for remote in peers {
        let Some(public_key) = remote.public_key.clone() else {
            warn!("skipping peer {}: no public key", remote.virtual_address);
            continue;
        };
        info!("configured {remote}");
        peer_map.insert(
            remote.virtual_address,
            Peer::new(
                remote.virtual_address,
                public_key,
                remote.hmac_key.clone().unwrap_or_default(),
                remote.network_address,
            ),
        );
    }

    let (to_user, user_rx) = mpsc::channel(USER_RX_CAPACITY);
    let (user_tx, user_tx_rx) = mpsc::channel(1);
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let (result_tx, result_rx) = mpsc::channel(1);
    let (net_rx, net_err_rx, reader) = spawn_reader(socket.clone(), None);
    let status = Status::new_open();

    let task = ServeTask {
        vaddr: local.virtual_address,
        private,
        socket: socket.clone(),
        peers: peer_map,
        net_rx,
        net_err_rx,
        user_tx_rx,
        to_user,
        shutdown_rx,
        result_tx,
        status: status.clone(),
        reader,
    };
    tokio::spawn(task.run());

    Ok(ServerConn {
        socket,
        user_tx,
        user_rx: Mutex::new(user_rx),
        shutdown_tx,
        result_rx: Mutex::new(result_rx),
        status,
        closed: Mutex::new(false),
    })
}

impl ServerConn {
    /// Encrypt `payload` to the peer at virtual address `dst` and wait for
    /// the serve task to emit it. Fails with [`SudpError::NotReady`] when
    /// the peer is unknown or has no established epoch; never blocks on the
    /// handshake path.
    pub async fn send_to(&self, payload: &[u8], dst: u16) -> Result<(), SudpError> {
        if !self.status.is_open() {
            return Err(SudpError::Closed);
        }
        let (reply, answer) = oneshot::channel();
        self.user_tx
            .send(TxRequest {
                payload: payload.to_vec(),
                dst,
                reply,
            })
            .await
            .map_err(|_| SudpError::Closed)?;
        answer.await.map_err(|_| SudpError::Closed)?
    }

    /// Next decrypted payload, with the sender's virtual address.
    pub async fn recv_from(&self) -> Result<(Vec<u8>, u16), SudpError> {
        if !self.status.is_open() {
            return Err(SudpError::Closed);
        }
        match self.user_rx.lock().await.recv().await {
            Some(msg) => Ok((msg.payload, msg.src)),
            None => Err(SudpError::Closed),
        }
    }

    /// Shut the server down and return its final status. Idempotent:
    /// repeated calls after the first are no-ops.
    pub async fn close(&self) -> Result<(), SudpError> {
        let mut closed = self.closed.lock().await;
        if *closed {
            return Ok(());
        }
        *closed = true;
        let _ = self.shutdown_tx.send(()).await;
        match self.result_rx.lock().await.recv().await {
            Some(result) => result,
            None => Ok(()),
        }
    }

    /// Bound address of the underlying socket.
    pub fn local_addr(&self) -> Result<SocketAddr, SudpError> {
        Ok(self.socket.local_addr()?)
    }
}

struct ServeTask {
    vaddr: u16,
    private: SigningKey,
    socket: Arc<UdpSocket>,
    peers: HashMap<u16, Peer>,
    net_rx: mpsc::Receiver<PktBuff>,
    net_err_rx: mpsc::Receiver<std::io::Error>,
    user_tx_rx: mpsc::Receiver<TxRequest>,
    to_user: mpsc::Sender<UserMessage>,
    shutdown_rx: mpsc::Receiver<()>,
    result_tx: mpsc::Sender<Result<(), SudpError>>,
    status: Status,
    reader: JoinHandle<()>,
}

impl ServeTask {
    async fn run(mut self) {
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        let mut net_open = true;

        let result = loop {
            tokio::select! {
                // also fires when the handle is dropped without close()
                _ = self.shutdown_rx.recv() => break Ok(()),
                maybe_pkt = self.net_rx.recv(), if net_open => {
                    match maybe_pkt {
                        Some(mut pkt) => self.on_packet(&mut pkt).await,
                        None => net_open = false,
                    }
                }
                Some(e) = self.net_err_rx.recv() => {
                    break Err(SudpError::Socket(e));
                }
                Some(req) = self.user_tx_rx.recv() => self.on_send(req).await,
                _ = tick.tick() => self.on_tick(),
            }
        };
        self.finish(result).await;
    }

    async fn on_packet(&mut self, pkt: &mut PktBuff) {
        if let Err(e) = self.dispatch(pkt).await {
            warn!(error = %e, "dropping packet");
        }
    }

    /// The ingress filter: peer lookup by the cheap src/dst peek, then the
    /// full header decode under that peer's HMAC key, then the time window,
    /// then the kind handler.
    async fn dispatch(&mut self, pkt: &mut PktBuff) -> Result<(), SudpError> {
        let (src, dst) = Header::peek_src_dst(pkt.remaining())
            .ok_or(SudpError::MalformedPacket("short packet"))?;
        if dst != self.vaddr {
            return Err(SudpError::UnknownPeer(src));
        }
        let peer = self
            .peers
            .get_mut(&src)
            .ok_or(SudpError::UnknownPeer(src))?;

        let hdr = Header::decode(pkt.head(HDR_SIZE)?, &peer.hmac_key)?;

        match &peer.tsync {
            None => peer.tsync = Some(TimeSync::new(hdr.time)?),
            Some(ts) => {
                if !ts.in_window(hdr.time) {
                    return Err(SudpError::StalePacket);
                }
            }
        }

        let ctx = EngineCtx {
            vaddr: self.vaddr,
            private: &self.private,
            socket: &self.socket,
            to_user: &self.to_user,
        };
        peer.handle_packet(&hdr, pkt, &ctx).await
    }

    async fn on_send(&mut self, req: TxRequest) {
        let result = match self.peers.get(&req.dst) {
            Some(peer) if peer.ready => peer.send_data(self.vaddr, &req.payload, &self.socket).await,
            _ => Err(SudpError::NotReady),
        };
        let _ = req.reply.send(result);
    }

    /// Liveness sweep: a ready peer silent past its TTL is reset and must
    /// handshake again.
    fn on_tick(&mut self) {
        for peer in self.peers.values_mut() {
            if peer.ready && peer.expired(PEER_TTL) {
                info!(peer = peer.vaddr, "no traffic for {PEER_TTL:?}, resetting peer");
                peer.reset();
            }
        }
    }

    async fn finish(mut self, result: Result<(), SudpError>) {
        self.status.set_closed();
        self.reader.abort();

        // fail queued sends instead of leaving callers hanging
        self.user_tx_rx.close();
        while let Some(req) = self.user_tx_rx.recv().await {
            let _ = req.reply.send(Err(SudpError::Closed));
        }
        drop(self.to_user);

        if let Err(ref e) = result {
            warn!(error = %e, "server shut down");
        } else {
            info!("server shut down");
        }
        let _ = self.result_tx.send(result).await;
    }
}
