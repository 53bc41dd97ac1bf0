//! RTC networks: first-byte demultiplexing, the UDP sendonly-socket cache
//! and the framed TCP connection.

pub mod tcp;
pub mod udp;

use std::net::SocketAddr;

use shared::error::Result;
use shared::util;

/// Classification of one inbound datagram, RFC 7983.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PacketKind {
    Stun,
    Dtls,
    Rtp,
    Rtcp,
    /// TURN channel data; relaying is out of scope, the kind only exists so
    /// the demultiplexer can name what it drops.
    Turn,
    Unknown(u8),
}

pub fn demux(buf: &[u8]) -> PacketKind {
    if util::is_stun(buf) {
        PacketKind::Stun
    } else if util::is_dtls(buf) {
        PacketKind::Dtls
    } else if util::is_rtcp(buf) {
        PacketKind::Rtcp
    } else if util::is_rtp_or_rtcp(buf) {
        PacketKind::Rtp
    } else if !buf.is_empty() && (64..=79).contains(&buf[0]) {
        PacketKind::Turn
    } else {
        PacketKind::Unknown(buf.first().copied().unwrap_or(0))
    }
}

/// The socket seam: writes one packet towards a fixed peer. Implemented on
/// real sockets in the binary and on recording mocks in tests.
pub trait NetworkWriter {
    fn write_packet(&self, data: &[u8]) -> Result<usize>;
    fn peer_addr(&self) -> SocketAddr;
    fn local_addr(&self) -> SocketAddr;
}
