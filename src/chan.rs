//! In-process plumbing shared by the two supervisors: message types, the
//! socket reader task, and the user-visible open flag.

use crate::error::SudpError;
use crate::wire::PktBuff;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

/// Decrypted payload delivered to the user, tagged with the sender's
/// virtual address.
pub(crate) struct UserMessage {
    pub payload: Vec<u8>,
    pub src: u16,
}

/// A user send request. The caller blocks on `reply` until the serve task
/// has emitted the datagram or failed.
pub(crate) struct TxRequest {
    pub payload: Vec<u8>,
    pub dst: u16,
    pub reply: oneshot::Sender<Result<(), SudpError>>,
}

/// Capacity of the user-receive queue.
pub(crate) const USER_RX_CAPACITY: usize = 10;

/// Capacity of the raw-datagram queue between the reader and serve tasks.
pub(crate) const NET_RX_CAPACITY: usize = 64;

/// The one piece of state shared outside the serve task: whether the
/// connection is open, behind a reader-writer lock.
#[derive(Clone, Debug)]
pub(crate) struct Status(Arc<RwLock<bool>>);

impl Status {
    pub fn new_open() -> Self {
        Self(Arc::new(RwLock::new(true)))
    }

    pub fn is_open(&self) -> bool {
        self.0.read().map(|flag| *flag).unwrap_or(false)
    }

    pub fn set_closed(&self) {
        if let Ok(mut flag) = self.0.write() {
            *flag = false;
        }
    }
}

/// Spawn the socket-read loop: one task blocking on `recv_from`, publishing
/// datagrams to a queue. A read error is published on the error channel and
/// ends the task; the serve task treats it as fatal.
///
/// With `from` set (client side), datagrams from any other network address
/// are discarded before they reach the protocol filter.
pub(crate) fn spawn_reader(
    socket: Arc<UdpSocket>,
    from: Option<SocketAddr>,
) -> (
    mpsc::Receiver<PktBuff>,
    mpsc::Receiver<std::io::Error>,
    JoinHandle<()>,
) {
    let (pkt_tx, pkt_rx) = mpsc::channel(NET_RX_CAPACITY);
    let (err_tx, err_rx) = mpsc::channel(1);

    let handle = tokio::spawn(async move {
        loop {
            let mut pkt = PktBuff::alloc();
            match socket.recv_from(pkt.recv_buf()).await {
                Ok((len, addr)) => {
                    if let Some(expected) = from {
                        if addr != expected {
                            debug!("dropping datagram from unexpected address {addr}");
                            continue;
                        }
                    }
                    pkt.mark_received(len, addr);
                    if pkt_tx.send(pkt).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = err_tx.send(e).await;
                    break;
                }
            }
        }
    });

    (pkt_rx, err_rx, handle)
}
