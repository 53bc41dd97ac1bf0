use bytes::BytesMut;
use serde::Serialize;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Instant;

/// Type of transport protocol, either UDP or TCP
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum TransportProtocol {
    /// UDP
    #[default]
    UDP,
    /// TCP
    TCP,
}

/// Transport Context with local address, peer address and protocol.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportContext {
    /// Local socket address, either IPv4 or IPv6
    pub local_addr: SocketAddr,
    /// Peer socket address, either IPv4 or IPv6
    pub peer_addr: SocketAddr,
    /// Type of transport protocol, either UDP or TCP
    pub transport_protocol: TransportProtocol,
}

impl Default for TransportContext {
    fn default() -> Self {
        Self {
            local_addr: SocketAddr::from_str("0.0.0.0:0").unwrap(),
            peer_addr: SocketAddr::from_str("0.0.0.0:0").unwrap(),
            transport_protocol: TransportProtocol::UDP,
        }
    }
}

/// A generic transmit with [TransportContext]
pub struct TransportMessage<T> {
    /// Received/Sent time
    pub now: Instant,
    /// A transport context with local and peer addresses
    pub transport: TransportContext,
    /// Message body with generic type
    pub message: T,
}

/// BytesMut type transmit with [TransportContext]
pub type TaggedBytesMut = TransportMessage<BytesMut>;

/// Four Tuple consists of local address and peer address
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct FourTuple {
    /// Local socket address, either IPv4 or IPv6
    pub local_addr: SocketAddr,
    /// Peer socket address, either IPv4 or IPv6
    pub peer_addr: SocketAddr,
}

impl From<&TransportContext> for FourTuple {
    fn from(value: &TransportContext) -> Self {
        Self {
            local_addr: value.local_addr,
            peer_addr: value.peer_addr,
        }
    }
}

/// Five Tuple consists of local address, peer address and protocol
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize)]
pub struct FiveTuple {
    /// Local socket address, either IPv4 or IPv6
    pub local_addr: SocketAddr,
    /// Peer socket address, either IPv4 or IPv6
    pub peer_addr: SocketAddr,
    /// Type of protocol, either UDP or TCP
    pub transport_protocol: TransportProtocol,
}

impl From<&TransportContext> for FiveTuple {
    fn from(value: &TransportContext) -> Self {
        Self {
            local_addr: value.local_addr,
            peer_addr: value.peer_addr,
            transport_protocol: value.transport_protocol,
        }
    }
}

impl FiveTuple {
    /// The 64-bit fast-id used to register an owning session with the
    /// resource manager: `port << 48 | ipv4`.
    pub fn peer_fast_id(&self) -> u64 {
        let ip = match self.peer_addr.ip() {
            std::net::IpAddr::V4(v4) => u32::from(v4) as u64,
            std::net::IpAddr::V6(v6) => {
                // Fold the lower 32 bits, IPv6 peers are rare on media paths.
                let o = v6.octets();
                u32::from_be_bytes([o[12], o[13], o[14], o[15]]) as u64
            }
        };
        ((self.peer_addr.port() as u64) << 48) | ip
    }

    /// The string id for the peer, e.g. `10.0.0.1:8000`.
    pub fn peer_id(&self) -> String {
        self.peer_addr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_fast_id_v4() {
        let t = FiveTuple {
            local_addr: SocketAddr::from_str("0.0.0.0:0").unwrap(),
            peer_addr: SocketAddr::from_str("1.2.3.4:8000").unwrap(),
            transport_protocol: TransportProtocol::UDP,
        };
        let ip = u32::from_be_bytes([1, 2, 3, 4]) as u64;
        assert_eq!(t.peer_fast_id(), (8000u64 << 48) | ip);
        assert_eq!(t.peer_id(), "1.2.3.4:8000");
    }

    #[test]
    fn test_five_tuple_from_context() {
        let ctx = TransportContext::default();
        let t = FiveTuple::from(&ctx);
        assert_eq!(t.local_addr, ctx.local_addr);
        assert_eq!(t.peer_addr, ctx.peer_addr);
        assert_eq!(t.transport_protocol, TransportProtocol::UDP);
    }
}
