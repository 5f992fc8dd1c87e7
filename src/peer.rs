//! Per-peer protocol engine: packet dispatch by kind, the handshake and
//! epoch side of the state machine, encrypted data send, and liveness
//! bookkeeping.
//!
//! Peers are owned by their supervisor's serve task; handlers take
//! `&mut Peer` and never escape it, so no locking happens here.

use crate::chan::UserMessage;
use crate::epoch::EpochRing;
use crate::error::SudpError;
use crate::tsync::TimeSync;
use crate::wire::ctrl::RTT;
use crate::wire::{
    CtrlMessage, DataBody, Handshake, HandshakeRetry, Header, PacketKind, PktBuff, CTRL_SIZE,
    DATA_OVERHEAD, EPOCH_ACK, HANDSHAKE_SIZE, HDR_SIZE, KEEP_ALIVE, KEEP_ALIVE_ACK,
};
use p256::ecdsa::{SigningKey, VerifyingKey};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// What a handler needs from its supervisor: the local identity, the shared
/// socket, and the queue toward the user.
pub(crate) struct EngineCtx<'a> {
    pub vaddr: u16,
    pub private: &'a SigningKey,
    pub socket: &'a UdpSocket,
    pub to_user: &'a mpsc::Sender<UserMessage>,
}

pub(crate) struct Peer {
    pub vaddr: u16,
    pub pubkey: VerifyingKey,
    /// Shared HMAC key for header MACs; empty when none is configured.
    pub hmac_key: Vec<u8>,
    /// Last verified network address; adopted from authenticated traffic.
    pub naddr: Option<SocketAddr>,
    /// Time of last valid message.
    pub ttlm: Option<Instant>,
    pub tsync: Option<TimeSync>,
    /// Whether the current epoch is usable for data.
    pub ready: bool,
    /// Retained outbound handshake, present while one is unanswered.
    pub retry: Option<HandshakeRetry>,
    pub epochs: EpochRing,
}

impl Peer {
    pub fn new(
        vaddr: u16,
        pubkey: VerifyingKey,
        hmac_key: Vec<u8>,
        naddr: Option<SocketAddr>,
    ) -> Self {
        Self {
            vaddr,
            pubkey,
            hmac_key,
            naddr,
            ttlm: None,
            tsync: None,
            ready: false,
            retry: None,
            epochs: EpochRing::new(),
        }
    }

    pub fn handshake_pending(&self) -> bool {
        self.retry.is_some()
    }

    /// Dispatch a filtered packet to its kind handler. Any error means the
    /// packet is dropped; `ttlm` and the network address move only on
    /// success.
    pub async fn handle_packet(
        &mut self,
        hdr: &Header,
        pkt: &mut PktBuff,
        ctx: &EngineCtx<'_>,
    ) -> Result<(), SudpError> {
        let addr = pkt
            .addr
            .ok_or(SudpError::MalformedPacket("packet without source"))?;
        let body_len = (hdr.len as usize)
            .checked_sub(HDR_SIZE)
            .ok_or(SudpError::MalformedPacket("invalid length field"))?;
        let body = pkt.head(body_len)?;

        match hdr.kind {
            PacketKind::ClientHandshake => self.on_client_handshake(hdr, body, addr, ctx).await,
            PacketKind::ServerHandshake => self.on_server_handshake(hdr, body, addr, ctx).await,
            PacketKind::Ctrl => self.on_ctrl(hdr, body, addr, ctx).await,
            PacketKind::Data => self.on_data(hdr, body, addr, ctx).await,
        }
    }

    /// Server side: a peer opens (or rotates) an epoch. Derive the shared
    /// secret for the pending slot and answer with our ephemeral half.
    /// Promotion waits for the peer's ack or first traffic on the epoch.
    async fn on_client_handshake(
        &mut self,
        hdr: &Header,
        body: &[u8],
        addr: SocketAddr,
        ctx: &EngineCtx<'_>,
    ) -> Result<(), SudpError> {
        if body.len() != HANDSHAKE_SIZE {
            return Err(SudpError::MalformedPacket("invalid handshake length"));
        }
        let hs = Handshake::decode(body, &self.pubkey)?;
        if hs.mac != hdr.mac {
            return Err(SudpError::AuthFailure);
        }

        let entry = self.epochs.new_pending(hdr.epoch);
        entry.cipher.derive(&hs.pubkey)?;
        let public = entry.cipher.public_bytes();
        self.touch(addr);

        let mut pkt = PktBuff::alloc();
        pkt.addr = self.naddr;
        let mut reply = Header::new(
            PacketKind::ServerHandshake,
            hdr.epoch,
            hdr.dst,
            hdr.src,
            (HDR_SIZE + HANDSHAKE_SIZE) as u16,
        );
        reply.encode(pkt.tail(HDR_SIZE)?, &self.hmac_key)?;
        let mut answer = Handshake::new(reply.mac, public);
        answer.encode(pkt.tail(HANDSHAKE_SIZE)?, ctx.private)?;
        debug!(epoch = hdr.epoch, peer = self.vaddr, "answering handshake");
        pkt.send(ctx.socket).await
    }

    /// Client side: the server answered our handshake. Derive, promote, and
    /// acknowledge the new epoch.
    async fn on_server_handshake(
        &mut self,
        hdr: &Header,
        body: &[u8],
        addr: SocketAddr,
        ctx: &EngineCtx<'_>,
    ) -> Result<(), SudpError> {
        if body.len() != HANDSHAKE_SIZE {
            return Err(SudpError::MalformedPacket("invalid handshake length"));
        }
        let hs = Handshake::decode(body, &self.pubkey)?;
        if hs.mac != hdr.mac {
            return Err(SudpError::AuthFailure);
        }
        if !self.epochs.is_pending(hdr.epoch) {
            return Err(SudpError::UnexpectedEpoch);
        }

        self.epochs.derive(&hs.pubkey)?;
        self.epochs.promote(hdr.epoch)?;
        self.ready = true;
        self.retry = None;
        self.touch(addr);
        info!(epoch = hdr.epoch, peer = self.vaddr, "epoch established");

        self.send_ctrl(EPOCH_ACK, hdr.epoch, ctx).await
    }

    async fn on_ctrl(
        &mut self,
        hdr: &Header,
        body: &[u8],
        addr: SocketAddr,
        ctx: &EngineCtx<'_>,
    ) -> Result<(), SudpError> {
        if body.len() != CTRL_SIZE {
            return Err(SudpError::MalformedPacket("invalid ctrl length"));
        }
        let ctrl = CtrlMessage::decode(body, &self.pubkey)?;
        if ctrl.mac != hdr.mac {
            return Err(SudpError::AuthFailure);
        }

        // An EpochAck for the pending epoch promotes it; so does any other
        // authenticated control traffic already using that epoch.
        if self.epochs.is_pending(hdr.epoch) {
            self.epochs.promote(hdr.epoch)?;
            self.ready = true;
            info!(epoch = hdr.epoch, peer = self.vaddr, "epoch promoted");
        }
        self.touch(addr);

        if ctrl.is_set(KEEP_ALIVE) {
            self.send_ctrl(KEEP_ALIVE_ACK, hdr.epoch, ctx).await?;
        }
        if ctrl.is_set(RTT) {
            // no RTT handler yet; accepted and ignored
            debug!(peer = self.vaddr, "ignoring rtt flag");
        }
        Ok(())
    }

    async fn on_data(
        &mut self,
        hdr: &Header,
        body: &[u8],
        addr: SocketAddr,
        ctx: &EngineCtx<'_>,
    ) -> Result<(), SudpError> {
        // Data on the pending epoch proves the peer promoted it; follow
        // before decrypting.
        if self.epochs.is_pending(hdr.epoch)
            && self.epochs.pending().is_some_and(|e| e.cipher.is_ready())
        {
            self.epochs.promote(hdr.epoch)?;
            self.ready = true;
            info!(epoch = hdr.epoch, peer = self.vaddr, "epoch promoted");
        }

        let cipher = if self.epochs.is_current(hdr.epoch) {
            self.epochs.current().map(|e| &e.cipher)
        } else if self.epochs.is_prev(hdr.epoch) {
            self.epochs.prev().map(|e| &e.cipher)
        } else {
            None
        }
        .ok_or(SudpError::UnexpectedEpoch)?;

        let data = DataBody::decode(body, cipher)?;
        if data.mac != hdr.mac {
            return Err(SudpError::AuthFailure);
        }
        self.touch(addr);

        ctx.to_user
            .send(UserMessage {
                payload: data.payload,
                src: hdr.src,
            })
            .await
            .map_err(|_| SudpError::Closed)
    }

    /// Encrypt and emit a user payload under the current epoch.
    pub async fn send_data(
        &self,
        src: u16,
        payload: &[u8],
        socket: &UdpSocket,
    ) -> Result<(), SudpError> {
        let current = self.epochs.current().ok_or(SudpError::NotReady)?;
        let total = HDR_SIZE + DATA_OVERHEAD + payload.len();
        if total > crate::wire::PKT_BUF_SIZE {
            return Err(SudpError::MalformedPacket("payload exceeds datagram size"));
        }

        let mut pkt = PktBuff::alloc();
        pkt.addr = self.naddr;
        let mut hdr = Header::new(PacketKind::Data, current.id, src, self.vaddr, total as u16);
        hdr.encode(pkt.tail(HDR_SIZE)?, &self.hmac_key)?;
        let body = DataBody {
            mac: hdr.mac,
            payload: payload.to_vec(),
        };
        body.encode(
            &current.cipher,
            pkt.tail(DATA_OVERHEAD + payload.len())?,
        )?;
        pkt.send(socket).await
    }

    /// Emit a control message with the given flags at `epoch`.
    pub async fn send_ctrl(
        &self,
        flags: u32,
        epoch: u32,
        ctx: &EngineCtx<'_>,
    ) -> Result<(), SudpError> {
        let mut pkt = PktBuff::alloc();
        pkt.addr = self.naddr;
        let mut hdr = Header::new(
            PacketKind::Ctrl,
            epoch,
            ctx.vaddr,
            self.vaddr,
            (HDR_SIZE + CTRL_SIZE) as u16,
        );
        hdr.encode(pkt.tail(HDR_SIZE)?, &self.hmac_key)?;
        let mut ctrl = CtrlMessage::new(hdr.mac);
        ctrl.set(flags);
        ctrl.encode(pkt.tail(CTRL_SIZE)?, ctx.private)?;
        pkt.send(ctx.socket).await
    }

    /// Client side: open a new pending epoch and build its handshake
    /// packet. The packet is retained for retransmission until answered.
    pub fn start_handshake(
        &mut self,
        epoch: u32,
        local_vaddr: u16,
        private: &SigningKey,
    ) -> Result<PktBuff, SudpError> {
        let entry = self.epochs.new_pending(epoch);
        let public = entry.cipher.public_bytes();

        let mut pkt = PktBuff::alloc();
        pkt.addr = self.naddr;
        let mut hdr = Header::new(
            PacketKind::ClientHandshake,
            epoch,
            local_vaddr,
            self.vaddr,
            (HDR_SIZE + HANDSHAKE_SIZE) as u16,
        );
        hdr.encode(pkt.tail(HDR_SIZE)?, &self.hmac_key)?;
        let mut body = Handshake::new(hdr.mac, public);
        body.encode(pkt.tail(HANDSHAKE_SIZE)?, private)?;

        debug!(epoch, peer = self.vaddr, "handshake started");
        self.retry = Some(HandshakeRetry::new(hdr, body));
        Ok(pkt)
    }

    /// Record a verified message: refresh liveness and adopt the observed
    /// network address when it moved (NAT rebinding). Safe because every
    /// caller has already passed MAC, signature, and time checks.
    fn touch(&mut self, addr: SocketAddr) {
        self.ttlm = Some(Instant::now());
        if self.naddr != Some(addr) {
            info!(peer = self.vaddr, %addr, "adopting new network address");
            self.naddr = Some(addr);
        }
    }

    pub fn expired(&self, ttl: Duration) -> bool {
        self.ttlm.map(|t| t.elapsed() > ttl).unwrap_or(false)
    }

    /// Forget everything negotiated with this peer; its static
    /// configuration (keys, virtual address) survives.
    pub fn reset(&mut self) {
        self.epochs.reset();
        self.naddr = None;
        self.tsync = None;
        self.ttlm = None;
        self.ready = false;
        self.retry = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_key;
    use std::sync::Arc;

    struct Side {
        peer: Peer,
        private: SigningKey,
        vaddr: u16,
        socket: Arc<UdpSocket>,
        to_user: mpsc::Sender<UserMessage>,
        user_rx: mpsc::Receiver<UserMessage>,
    }

    async fn bind() -> Arc<UdpSocket> {
        Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap())
    }

    async fn make_side(
        vaddr: u16,
        private: SigningKey,
        remote_vaddr: u16,
        remote_key: &SigningKey,
    ) -> Side {
        let socket = bind().await;
        let (to_user, user_rx) = mpsc::channel(10);
        let peer = Peer::new(
            remote_vaddr,
            (*remote_key.verifying_key()).clone(),
            b"password".to_vec(),
            None,
        );
        Side {
            peer,
            private,
            vaddr,
            socket,
            to_user,
            user_rx,
        }
    }

    /// Receive one datagram and run it through header decode + dispatch.
    async fn pump(side: &mut Side) {
        let mut pkt = PktBuff::alloc();
        let (len, addr) = side.socket.recv_from(pkt.recv_buf()).await.unwrap();
        pkt.mark_received(len, addr);
        let hdr_bytes = pkt.head(HDR_SIZE).unwrap().to_vec();
        let hdr = Header::decode(&hdr_bytes, &side.peer.hmac_key).unwrap();
        let ctx = EngineCtx {
            vaddr: side.vaddr,
            private: &side.private,
            socket: &side.socket,
            to_user: &side.to_user,
        };
        side.peer.handle_packet(&hdr, &mut pkt, &ctx).await.unwrap();
    }

    #[tokio::test]
    async fn full_handshake_then_data_and_nat_rebind() {
        // client vaddr 1001 talks to server vaddr 0
        let client_key = generate_key();
        let server_key = generate_key();

        // server's record of the client, client's record of the server
        let mut server = make_side(0, server_key.clone(), 1001, &client_key).await;
        let mut client = make_side(1001, client_key.clone(), 0, &server_key).await;
        client.peer.naddr = Some(server.socket.local_addr().unwrap());

        // client -> server: ClientHandshake at epoch 7
        let pkt = client
            .peer
            .start_handshake(7, 1001, &client.private)
            .unwrap();
        pkt.send(&client.socket).await.unwrap();
        assert!(client.peer.handshake_pending());

        // server answers, learns the client address
        pump(&mut server).await;
        assert!(server.peer.epochs.is_pending(7));
        assert!(!server.peer.ready);
        assert_eq!(
            server.peer.naddr,
            Some(client.socket.local_addr().unwrap())
        );

        // client promotes and acks
        pump(&mut client).await;
        assert!(client.peer.ready);
        assert!(client.peer.epochs.is_current(7));
        assert!(!client.peer.handshake_pending());

        // server promotes on the EpochAck
        pump(&mut server).await;
        assert!(server.peer.ready);
        assert!(server.peer.epochs.is_current(7));

        // data round trip
        client
            .peer
            .send_data(1001, b"hello", &client.socket)
            .await
            .unwrap();
        pump(&mut server).await;
        let msg = server.user_rx.recv().await.unwrap();
        assert_eq!(msg.payload, b"hello");
        assert_eq!(msg.src, 1001);

        // NAT rebind: same peer, new socket; the server adopts the new
        // address on the first verified packet
        let rebound = bind().await;
        client
            .peer
            .send_data(1001, b"moved", &rebound)
            .await
            .unwrap();
        pump(&mut server).await;
        assert_eq!(server.peer.naddr, Some(rebound.local_addr().unwrap()));
        assert_eq!(server.user_rx.recv().await.unwrap().payload, b"moved");

        // and the server's replies now reach the new socket
        server
            .peer
            .send_data(0, b"world", &server.socket)
            .await
            .unwrap();
        let mut pkt = PktBuff::alloc();
        let (len, addr) = rebound.recv_from(pkt.recv_buf()).await.unwrap();
        pkt.mark_received(len, addr);
        let hdr_bytes = pkt.head(HDR_SIZE).unwrap().to_vec();
        let hdr = Header::decode(&hdr_bytes, b"password").unwrap();
        let ctx = EngineCtx {
            vaddr: client.vaddr,
            private: &client.private,
            socket: &rebound,
            to_user: &client.to_user,
        };
        client
            .peer
            .handle_packet(&hdr, &mut pkt, &ctx)
            .await
            .unwrap();
        assert_eq!(client.user_rx.recv().await.unwrap().payload, b"world");
    }

    #[tokio::test]
    async fn epoch_rotation_keeps_prev_decryptable() {
        let client_key = generate_key();
        let server_key = generate_key();

        let mut server = make_side(0, server_key.clone(), 1001, &client_key).await;
        let mut client = make_side(1001, client_key.clone(), 0, &server_key).await;
        client.peer.naddr = Some(server.socket.local_addr().unwrap());

        // epoch 7
        let pkt = client
            .peer
            .start_handshake(7, 1001, &client.private)
            .unwrap();
        pkt.send(&client.socket).await.unwrap();
        pump(&mut server).await;
        pump(&mut client).await;
        pump(&mut server).await;

        // seal a data packet under epoch 7 but hold it in flight
        let held = {
            let current = client.peer.epochs.current().unwrap();
            let payload = b"in flight";
            let total = HDR_SIZE + DATA_OVERHEAD + payload.len();
            let mut pkt = PktBuff::alloc();
            pkt.addr = client.peer.naddr;
            let mut hdr =
                Header::new(PacketKind::Data, current.id, 1001, 0, total as u16);
            hdr.encode(pkt.tail(HDR_SIZE).unwrap(), b"password").unwrap();
            let body = DataBody {
                mac: hdr.mac,
                payload: payload.to_vec(),
            };
            body.encode(
                &current.cipher,
                pkt.tail(DATA_OVERHEAD + payload.len()).unwrap(),
            )
            .unwrap();
            pkt
        };

        // rotate to epoch 8 on both sides
        let pkt = client
            .peer
            .start_handshake(8, 1001, &client.private)
            .unwrap();
        pkt.send(&client.socket).await.unwrap();
        pump(&mut server).await; // ClientHandshake(8) -> answer
        pump(&mut client).await; // ServerHandshake(8) -> promote + ack
        pump(&mut server).await; // EpochAck(8) -> promote
        assert!(client.peer.epochs.is_current(8));
        assert!(client.peer.epochs.is_prev(7));
        assert!(server.peer.epochs.is_current(8));
        assert!(server.peer.epochs.is_prev(7));

        // the held epoch-7 packet lands after the promotion: prev decrypts
        held.send(&client.socket).await.unwrap();
        pump(&mut server).await;
        assert_eq!(server.user_rx.recv().await.unwrap().payload, b"in flight");

        // traffic under the new epoch still flows
        client
            .peer
            .send_data(1001, b"fresh", &client.socket)
            .await
            .unwrap();
        pump(&mut server).await;
        assert_eq!(server.user_rx.recv().await.unwrap().payload, b"fresh");
    }

    #[tokio::test]
    async fn send_data_requires_ready_epoch() {
        let key = generate_key();
        let side = make_side(0, generate_key(), 1001, &key).await;
        let err = side
            .peer
            .send_data(0, b"x", &side.socket)
            .await
            .unwrap_err();
        assert!(matches!(err, SudpError::NotReady));
    }
}
