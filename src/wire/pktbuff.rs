//! Head/tail cursor buffer over a single datagram.
//!
//! Outbound packets append fixed-width fields with `tail`; inbound packets
//! consume them with `head`. Neither copies: both hand out views into the
//! one allocation made per datagram.

use crate::error::SudpError;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

/// Size of the buffer allocated per datagram; the protocol's hard limit on
/// a single packet.
pub const PKT_BUF_SIZE: usize = 2048;

pub(crate) struct PktBuff {
    /// Source (inbound) or destination (outbound) network address.
    pub addr: Option<SocketAddr>,
    buf: Vec<u8>,
    head: usize,
    len: usize,
}

impl PktBuff {
    pub fn alloc() -> Self {
        Self {
            addr: None,
            buf: vec![0u8; PKT_BUF_SIZE],
            head: 0,
            len: 0,
        }
    }

    /// Whole backing buffer, for the socket read.
    pub fn recv_buf(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Record a received datagram: its length and source address.
    pub fn mark_received(&mut self, len: usize, addr: SocketAddr) {
        self.len = len.min(self.buf.len());
        self.head = 0;
        self.addr = Some(addr);
    }

    /// Consume `n` bytes from the front.
    pub fn head(&mut self, n: usize) -> Result<&[u8], SudpError> {
        if self.head + n > self.len {
            return Err(SudpError::MalformedPacket("short packet"));
        }
        let out = &self.buf[self.head..self.head + n];
        self.head += n;
        Ok(out)
    }

    /// Reserve `n` bytes at the back for writing.
    pub fn tail(&mut self, n: usize) -> Result<&mut [u8], SudpError> {
        if self.len + n > self.buf.len() {
            return Err(SudpError::MalformedPacket("packet buffer overflow"));
        }
        let out = &mut self.buf[self.len..self.len + n];
        self.len += n;
        Ok(out)
    }

    /// Unconsumed bytes.
    pub fn remaining(&self) -> &[u8] {
        &self.buf[self.head..self.len]
    }

    pub async fn send(&self, socket: &UdpSocket) -> Result<(), SudpError> {
        let addr = self
            .addr
            .ok_or(SudpError::MalformedPacket("packet without destination"))?;
        socket.send_to(self.remaining(), addr).await?;
        Ok(())
    }
}
