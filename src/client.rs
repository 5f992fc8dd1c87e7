//! Client supervisor: the single-peer counterpart of the server, plus the
//! pieces only a client owns: handshake retry, the 500 ms keep-alive, and
//! the periodic epoch change.

use crate::addr::{LocalAddr, RemoteAddr};
use crate::chan::{spawn_reader, Status, TxRequest, UserMessage, USER_RX_CAPACITY};
use crate::error::SudpError;
use crate::peer::{EngineCtx, Peer};
use crate::tsync::TimeSync;
use crate::wire::{Header, PktBuff, HDR_SIZE, KEEP_ALIVE};
use p256::ecdsa::SigningKey;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Cadence of the keep-alive / handshake-retry tick.
const CONTROL_INTERVAL: Duration = Duration::from_millis(500);

/// Connection tuning. The defaults give up on a dead server after
/// roughly `tries × time_retry` (8 s) and rotate epochs twice a minute.
#[derive(Debug, Clone)]
pub struct ClientOpts {
    /// Handshake attempts before the connection fails with `Timeout`.
    pub tries: u32,
    /// Spacing between handshake retransmissions.
    pub time_retry: Duration,
    /// Interval between forward-secrecy epoch rotations.
    pub epoch_change: Duration,
}

impl Default for ClientOpts {
    fn default() -> Self {
        Self {
            tries: 4,
            time_retry: Duration::from_secs(2),
            epoch_change: Duration::from_secs(30),
        }
    }
}

/// Handle to a connected client. Closed connections fail every operation
/// fast with [`SudpError::Closed`].
#[derive(Debug)]
pub struct ClientConn {
    remote_vaddr: u16,
    remote_naddr: SocketAddr,
    user_tx: mpsc::Sender<TxRequest>,
    user_rx: Mutex<mpsc::Receiver<UserMessage>>,
    shutdown_tx: mpsc::Sender<()>,
    result_rx: Mutex<mpsc::Receiver<Result<(), SudpError>>>,
    status: Status,
    closed: Mutex<bool>,
}

/// Bind a local socket, perform the initial handshake, and return once the
/// connection is ready. Fails with [`SudpError::Timeout`] when the server
/// never answers within the configured retries.
pub async fn connect(
    local: &LocalAddr,
    remote: &RemoteAddr,
    opts: ClientOpts,
) -> Result<ClientConn, SudpError> {
    let remote_naddr = remote
        .network_address
        .ok_or(SudpError::ConfigMissing("peer network address"))?;
    let private = local
        .private_key
        .clone()
        .ok_or(SudpError::ConfigMissing("private key"))?;
    let public_key = remote
        .public_key
        .clone()
        .ok_or(SudpError::ConfigMissing("peer public key"))?;

    let bind = local
        .network_address
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
    let socket = Arc::new(UdpSocket::bind(bind).await?);
    info!(
        "connecting to {} (virtual address {}) as virtual address {}",
        remote_naddr, remote.virtual_address, local.virtual_address
    );

    let peer = Peer::new(
        remote.virtual_address,
        public_key,
        remote.hmac_key.clone().unwrap_or_default(),
        Some(remote_naddr),
    );

    let (to_user, user_rx) = mpsc::channel(USER_RX_CAPACITY);
    let (user_tx, user_tx_rx) = mpsc::channel(1);
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let (result_tx, result_rx) = mpsc::channel(1);
    let (ready_tx, ready_rx) = oneshot::channel();
    let (net_rx, net_err_rx, reader) = spawn_reader(socket.clone(), Some(remote_naddr));
    let status = Status::new_open();

    let task = ServeTask {
        vaddr: local.virtual_address,
        private,
        socket,
        peer,
        opts,
        net_rx,
        net_err_rx,
        user_tx_rx,
        to_user,
        shutdown_rx,
        result_tx,
        ready_tx: Some(ready_tx),
        status: status.clone(),
        reader,
    };
    tokio::spawn(task.run());

    match ready_rx.await {
        Ok(Ok(())) => Ok(ClientConn {
            remote_vaddr: remote.virtual_address,
            remote_naddr,
            user_tx,
            user_rx: Mutex::new(user_rx),
            shutdown_tx,
            result_rx: Mutex::new(result_rx),
            status,
            closed: Mutex::new(false),
        }),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(SudpError::Closed),
    }
}

impl ClientConn {
    /// Encrypt `payload` to the server under the current epoch.
    pub async fn send(&self, payload: &[u8]) -> Result<(), SudpError> {
        if !self.status.is_open() {
            return Err(SudpError::Closed);
        }
        let (reply, answer) = oneshot::channel();
        self.user_tx
            .send(TxRequest {
                payload: payload.to_vec(),
                dst: self.remote_vaddr,
                reply,
            })
            .await
            .map_err(|_| SudpError::Closed)?;
        answer.await.map_err(|_| SudpError::Closed)?
    }

    /// Next decrypted payload from the server.
    pub async fn recv(&self) -> Result<Vec<u8>, SudpError> {
        if !self.status.is_open() {
            return Err(SudpError::Closed);
        }
        match self.user_rx.lock().await.recv().await {
            Some(msg) => Ok(msg.payload),
            None => Err(SudpError::Closed),
        }
    }

    /// Shut the connection down and return its final status. Idempotent.
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

    /// Network address of the server.
    pub fn remote_address(&self) -> SocketAddr {
        self.remote_naddr
    }
}

struct ServeTask {
    vaddr: u16,
    private: SigningKey,
    socket: Arc<UdpSocket>,
    peer: Peer,
    opts: ClientOpts,
    net_rx: mpsc::Receiver<PktBuff>,
    net_err_rx: mpsc::Receiver<std::io::Error>,
    user_tx_rx: mpsc::Receiver<TxRequest>,
    to_user: mpsc::Sender<UserMessage>,
    shutdown_rx: mpsc::Receiver<()>,
    result_tx: mpsc::Sender<Result<(), SudpError>>,
    /// Present until the first ready transition; resolves `connect`.
    ready_tx: Option<oneshot::Sender<Result<(), SudpError>>>,
    status: Status,
    reader: JoinHandle<()>,
}

impl ServeTask {
    async fn run(mut self) {
        // kick off the initial handshake before serving
        if let Err(e) = self.begin_handshake().await {
            self.finish(Err(e)).await;
            return;
        }

        let mut control = tokio::time::interval(CONTROL_INTERVAL);
        let mut refresh = tokio::time::interval_at(
            tokio::time::Instant::now() + self.opts.epoch_change,
            self.opts.epoch_change,
        );
        let mut net_open = true;

        let result = loop {
            tokio::select! {
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
                _ = control.tick() => {
                    if let Err(e) = self.on_control_tick().await {
                        break Err(e);
                    }
                }
                _ = refresh.tick() => self.on_epoch_change().await,
            }

            // the first ready transition unblocks connect()
            if self.peer.ready {
                if let Some(tx) = self.ready_tx.take() {
                    let _ = tx.send(Ok(()));
                }
            }
        };
        self.finish(result).await;
    }

    /// Open a new pending epoch and emit its handshake. The first epoch id
    /// is random; later rotations use `current + 1`.
    async fn begin_handshake(&mut self) -> Result<(), SudpError> {
        let epoch = match self.peer.epochs.current() {
            Some(current) => current.id.wrapping_add(1),
            None => rand::random::<u16>() as u32,
        };
        let pkt = self.peer.start_handshake(epoch, self.vaddr, &self.private)?;
        pkt.send(&self.socket).await
    }

    async fn on_packet(&mut self, pkt: &mut PktBuff) {
        if let Err(e) = self.dispatch(pkt).await {
            warn!(error = %e, "dropping packet");
        }
    }

    /// Single-peer ingress filter, identical in shape to the server's.
    async fn dispatch(&mut self, pkt: &mut PktBuff) -> Result<(), SudpError> {
        let (src, dst) = Header::peek_src_dst(pkt.remaining())
            .ok_or(SudpError::MalformedPacket("short packet"))?;
        if src != self.peer.vaddr || dst != self.vaddr {
            return Err(SudpError::UnknownPeer(src));
        }

        let hdr = Header::decode(pkt.head(HDR_SIZE)?, &self.peer.hmac_key)?;

        match &self.peer.tsync {
            None => self.peer.tsync = Some(TimeSync::new(hdr.time)?),
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
        self.peer.handle_packet(&hdr, pkt, &ctx).await
    }

    async fn on_send(&mut self, req: TxRequest) {
        let result = if req.dst == self.peer.vaddr && self.peer.ready {
            self.peer.send_data(self.vaddr, &req.payload, &self.socket).await
        } else {
            Err(SudpError::NotReady)
        };
        let _ = req.reply.send(result);
    }

    /// Keep-alive while ready; handshake retransmission while one is
    /// unanswered. Retry exhaustion is fatal to the connection.
    async fn on_control_tick(&mut self) -> Result<(), SudpError> {
        if self.peer.ready {
            if let Some(current) = self.peer.epochs.current() {
                let epoch = current.id;
                let ctx = EngineCtx {
                    vaddr: self.vaddr,
                    private: &self.private,
                    socket: &self.socket,
                    to_user: &self.to_user,
                };
                if let Err(e) = self.peer.send_ctrl(KEEP_ALIVE, epoch, &ctx).await {
                    warn!(error = %e, "keep-alive failed");
                }
            }
        }

        let due = self
            .peer
            .retry
            .as_ref()
            .is_some_and(|r| r.due(self.opts.time_retry));
        if due {
            if let Some(retry) = self.peer.retry.as_mut() {
                if retry.tries >= self.opts.tries {
                    warn!(tries = retry.tries, "handshake retries exhausted");
                    return Err(SudpError::Timeout);
                }
                debug!(tries = retry.tries, "retransmitting handshake");
                match retry.repack(&self.private, &self.peer.hmac_key) {
                    Ok(mut pkt) => {
                        pkt.addr = self.peer.naddr;
                        if let Err(e) = pkt.send(&self.socket).await {
                            warn!(error = %e, "handshake retransmission failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "handshake repack failed"),
                }
            }
        }
        Ok(())
    }

    /// Epoch-change timer: rotate forward secrecy without disturbing the
    /// established epoch. Skipped while a handshake is already in flight.
    async fn on_epoch_change(&mut self) {
        if !self.peer.ready || self.peer.epochs.pending().is_some() {
            return;
        }
        info!("rotating epoch");
        if let Err(e) = self.begin_handshake().await {
            warn!(error = %e, "epoch change failed");
        }
    }

    async fn finish(mut self, result: Result<(), SudpError>) {
        self.status.set_closed();
        self.reader.abort();

        self.user_tx_rx.close();
        while let Some(req) = self.user_tx_rx.recv().await {
            let _ = req.reply.send(Err(SudpError::Closed));
        }
        drop(self.to_user);

        if let Err(ref e) = result {
            warn!(error = %e, "connection closed");
        } else {
            info!("connection closed");
        }
        match self.ready_tx.take() {
            // connect() is still waiting: surface the failure there
            Some(tx) => {
                let _ = tx.send(Err(match result {
                    Ok(()) => SudpError::Closed,
                    Err(e) => e,
                }));
                let _ = self.result_tx.send(Ok(())).await;
            }
            None => {
                let _ = self.result_tx.send(result).await;
            }
        }
    }
}
