//! Wire codec: packet buffer, header, and the three body layouts.
//!
//! All multi-byte integers are big-endian. A packet is `header(20) ‖ body`;
//! the 24-byte keyed header MAC is not carried in the header itself, each
//! body binds to it by repeating the tag as its first field.

pub mod ctrl;
pub mod data;
pub mod handshake;
pub mod header;
pub mod pktbuff;

pub(crate) use ctrl::{CtrlMessage, CTRL_SIZE, EPOCH_ACK, KEEP_ALIVE, KEEP_ALIVE_ACK};
pub(crate) use data::{DataBody, DATA_OVERHEAD};
pub(crate) use handshake::{Handshake, HandshakeRetry, HANDSHAKE_SIZE};
pub(crate) use header::{Header, PacketKind, HDR_SIZE};
pub(crate) use pktbuff::{PktBuff, PKT_BUF_SIZE};
