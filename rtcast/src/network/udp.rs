//! UDP network: caches one sendonly socket per peer 5-tuple and uses the
//! most recent one as the egress path.

use log::{debug, warn};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::rc::{Rc, Weak};
use std::time::Instant;

use shared::error::{Error, Result};

use super::NetworkWriter;
use crate::manager::{Resource, ResourceManager};
use crate::session::RtcSession;
use crate::transport::TransportState;

pub struct RtcUdpNetwork {
    session: Weak<RtcSession>,
    manager: Weak<ResourceManager>,
    sendonly_sockets: HashMap<String, Rc<dyn NetworkWriter>>,
    current_peer: Option<String>,
    state: TransportState,
}

impl RtcUdpNetwork {
    pub fn new(session: Weak<RtcSession>, manager: Weak<ResourceManager>) -> Self {
        Self {
            session,
            manager,
            sendonly_sockets: HashMap::new(),
            current_peer: None,
            state: TransportState::Init,
        }
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == TransportState::Established
    }

    fn session(&self) -> Result<Rc<RtcSession>> {
        self.session.upgrade().ok_or(Error::ErrSessionNotFound)
    }

    /// Caches a sendonly socket for the peer's 5-tuple. Duplicate updates
    /// for the same peer id are no-ops; the first update registers the
    /// owning session in the manager under the peer string id and the
    /// 64-bit fast id `port << 48 | ipv4`.
    pub fn update_sendonly_socket(&mut self, writer: Rc<dyn NetworkWriter>) {
        let peer = writer.peer_addr();
        let peer_id = peer.to_string();
        if self.sendonly_sockets.contains_key(&peer_id) {
            return;
        }

        debug!("udp: cache sendonly socket for peer {peer_id}");
        self.sendonly_sockets.insert(peer_id.clone(), writer);
        self.current_peer = Some(peer_id.clone());

        if let (Some(manager), Some(session)) = (self.manager.upgrade(), self.session.upgrade()) {
            let r: Rc<dyn Resource> = session;
            manager.add_with_id(&peer_id, r.clone());
            manager.add_with_fast_id(peer_fast_id(&peer), r);
        }
    }

    fn current_writer(&self) -> Option<&Rc<dyn NetworkWriter>> {
        self.current_peer
            .as_ref()
            .and_then(|id| self.sendonly_sockets.get(id))
    }

    pub fn peer_ip(&self) -> Option<IpAddr> {
        self.current_writer().map(|w| w.peer_addr().ip())
    }

    pub fn peer_port(&self) -> Option<u16> {
        self.current_writer().map(|w| w.peer_addr().port())
    }

    pub fn write_packet(&self, data: &[u8]) -> Result<usize> {
        let writer = self.current_writer().ok_or(Error::ErrSessionNotFound)?;
        writer.write_packet(data)
    }

    /// STUN input. A Binding Request is authorized by the session and
    /// answered through the cached sendonly socket; everything else is
    /// ignored successfully.
    pub fn on_stun(&mut self, data: &[u8]) -> Result<()> {
        let req = stun::Message::decode(data)?;
        if !req.is_binding_request() {
            return Ok(());
        }

        let session = self.session()?;
        let ice_pwd = session.on_binding_request(&req, data)?;

        let writer = self.current_writer().ok_or(Error::ErrSessionNotFound)?;
        let mut resp = stun::Message::binding_response(&req);
        resp.set_xor_mapped_address(&writer.peer_addr());
        let wire = resp.encode_with_integrity(&ice_pwd);
        writer.write_packet(&wire)?;

        if self.state == TransportState::Init || self.state == TransportState::WaitingStun {
            self.state = TransportState::Dtls;
        }
        Ok(())
    }

    /// Feeds inbound DTLS to the transport, writes its answers, and routes
    /// completion and alerts to the session.
    pub fn on_dtls(&mut self, data: &[u8]) -> Result<()> {
        let session = self.session()?;
        let events = session.transport().borrow_mut().on_dtls(data)?;

        for record in &events.outbound {
            self.write_packet(record)?;
        }
        if let Some(alert) = events.alert {
            session.on_dtls_alert(alert);
            return Ok(());
        }
        if events.handshake_done_now {
            session.on_dtls_handshake_done()?;
            self.state = TransportState::Established;
        }
        Ok(())
    }

    pub fn on_rtp(&mut self, data: &[u8], now: Instant) -> Result<()> {
        let session = self.session()?;
        session.on_rtp_cipher(data, now)
    }

    pub fn on_rtcp(&mut self, data: &[u8]) -> Result<()> {
        let session = self.session()?;
        let resends = session.on_rtcp_cipher(data)?;
        for wire in resends {
            let mut cipher = wire.to_vec();
            if let Err(e) = session.transport().borrow_mut().protect_rtp(&mut cipher) {
                warn!("udp: protect resend failed: {e}");
                continue;
            }
            self.write_packet(&cipher)?;
        }
        Ok(())
    }

    /// Handshake ARQ driving, forwarded to the session transport.
    pub fn on_timer(&mut self, now: Instant) -> Result<()> {
        let session = self.session()?;
        let resends = session.transport().borrow_mut().on_timer(now);
        for record in resends {
            self.write_packet(&record)?;
        }
        Ok(())
    }
}

/// 64-bit fast id of a peer: `port << 48 | ipv4`.
pub fn peer_fast_id(addr: &SocketAddr) -> u64 {
    let ip = match addr.ip() {
        IpAddr::V4(v4) => u32::from(v4) as u64,
        IpAddr::V6(v6) => {
            let o = v6.octets();
            u32::from_be_bytes([o[12], o[13], o[14], o[15]]) as u64
        }
    };
    ((addr.port() as u64) << 48) | ip
}

#[cfg(test)]
mod tests {
    use super::super::testutil::MockWriter;
    use super::*;
    use crate::transport::PlaintextTransport;

    fn setup() -> (Rc<ResourceManager>, Rc<RtcSession>, RtcUdpNetwork) {
        let manager = ResourceManager::new("mgr");
        let session = RtcSession::new(
            &manager,
            "localufrag",
            "localpwd",
            Box::new(PlaintextTransport),
        );
        let network = RtcUdpNetwork::new(Rc::downgrade(&session), Rc::downgrade(&manager));
        (manager, session, network)
    }

    #[test]
    fn test_update_sendonly_socket_registers_session() {
        let (manager, _session, mut network) = setup();
        let writer = MockWriter::new("9.8.7.6:5000");
        network.update_sendonly_socket(writer.clone());

        assert_eq!(network.peer_port(), Some(5000));
        assert_eq!(network.peer_ip().unwrap().to_string(), "9.8.7.6");

        // Registered under the peer string id and the fast id.
        assert!(manager.find_by_id("9.8.7.6:5000").is_some());
        let fast = peer_fast_id(&writer.peer_addr());
        assert!(manager.find_by_fast_id(fast).is_some());

        // Duplicate update for the same peer id is a no-op.
        let writer2 = MockWriter::new("9.8.7.6:5000");
        network.update_sendonly_socket(writer2);
        assert_eq!(network.sendonly_sockets.len(), 1);
    }

    #[test]
    fn test_latest_peer_wins() {
        let (_manager, _session, mut network) = setup();
        network.update_sendonly_socket(MockWriter::new("1.1.1.1:1111"));
        network.update_sendonly_socket(MockWriter::new("2.2.2.2:2222"));
        assert_eq!(network.peer_port(), Some(2222));
        assert_eq!(network.sendonly_sockets.len(), 2);
    }

    #[test]
    fn test_binding_request_answered() {
        let (_manager, session, mut network) = setup();
        let writer = MockWriter::new("9.8.7.6:5000");
        network.update_sendonly_socket(writer.clone());

        let mut req = stun::Message::new(stun::MessageType::BindingRequest);
        req.set_username("localufrag", "remoteufrag");
        let wire = req.encode_with_integrity("localpwd");

        network.on_stun(&wire).unwrap();
        assert_eq!(writer.nn_writes(), 1);
        // Exactly one STUN response, decodable, same transaction.
        let resp = stun::Message::decode(&writer.written.borrow()[0]).unwrap();
        assert_eq!(resp.typ, stun::MessageType::BindingResponse);
        assert_eq!(resp.transaction_id, req.transaction_id);
        assert_eq!(network.state(), TransportState::Dtls);
        assert_eq!(session.state(), TransportState::Dtls);
    }

    #[test]
    fn test_non_binding_stun_ignored() {
        let (_manager, _session, mut network) = setup();
        network.update_sendonly_socket(MockWriter::new("9.8.7.6:5000"));

        let other = stun::Message::new(stun::MessageType::Other(0x0004));
        network.on_stun(&other.encode()).unwrap();
        assert_eq!(network.state(), TransportState::Init);
    }

    #[test]
    fn test_bad_integrity_rejected() {
        let (_manager, _session, mut network) = setup();
        let writer = MockWriter::new("9.8.7.6:5000");
        network.update_sendonly_socket(writer.clone());

        let mut req = stun::Message::new(stun::MessageType::BindingRequest);
        req.set_username("localufrag", "remoteufrag");
        let wire = req.encode_with_integrity("wrong-pwd");

        assert!(network.on_stun(&wire).is_err());
        assert_eq!(writer.nn_writes(), 0);
    }
}
