//! TCP network and connection: RFC 4571 framing, STUN-driven session
//! attach, and the WaitingStun → Dtls → Established progression.

use log::debug;
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Instant;

use shared::error::{Error, Result};
use shared::tcp_framing::{frame_packet, TcpFrameDecoder};

use super::{demux, NetworkWriter, PacketKind};
use crate::manager::ResourceManager;
use crate::session::RtcSession;
use crate::transport::TransportState;

pub struct RtcTcpNetwork {
    session: Weak<RtcSession>,
    writer: Option<Rc<dyn NetworkWriter>>,
    state: TransportState,
}

impl RtcTcpNetwork {
    pub fn new(session: Weak<RtcSession>) -> Self {
        Self {
            session,
            writer: None,
            state: TransportState::Init,
        }
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn set_state(&mut self, state: TransportState) {
        self.state = state;
    }

    pub fn is_established(&self) -> bool {
        self.state == TransportState::Established
    }

    /// Attaches the accepted connection's writer and arms the handshake.
    pub fn set_writer(&mut self, writer: Rc<dyn NetworkWriter>) {
        self.writer = Some(writer);
        if self.state == TransportState::Init {
            self.state = TransportState::WaitingStun;
        }
    }

    fn session(&self) -> Result<Rc<RtcSession>> {
        self.session.upgrade().ok_or(Error::ErrSessionNotFound)
    }

    /// Writes one packet with the 2-byte length prefix.
    pub fn write_framed(&self, data: &[u8]) -> Result<usize> {
        let writer = self.writer.as_ref().ok_or(Error::ErrConnectionClosed)?;
        let framed = frame_packet(data).ok_or(Error::ErrPacketTooBig)?;
        writer.write_packet(&framed)
    }

    /// One de-framed packet from the connection. Unknown types are an
    /// error; the connection closes on them.
    pub fn on_tcp_pkt(&mut self, data: &[u8], now: Instant) -> Result<()> {
        match demux(data) {
            PacketKind::Stun => self.on_stun(data),
            PacketKind::Dtls => self.on_dtls(data),
            PacketKind::Rtp => self.on_rtp(data, now),
            PacketKind::Rtcp => self.on_rtcp(data),
            PacketKind::Turn | PacketKind::Unknown(_) => {
                Err(Error::ErrUnknownPacketType(data.first().copied().unwrap_or(0)))
            }
        }
    }

    pub fn on_stun(&mut self, data: &[u8]) -> Result<()> {
        let req = stun::Message::decode(data)?;
        if !req.is_binding_request() {
            return Ok(());
        }

        let session = self.session()?;
        let ice_pwd = session.on_binding_request(&req, data)?;

        let writer = self.writer.as_ref().ok_or(Error::ErrConnectionClosed)?;
        let mut resp = stun::Message::binding_response(&req);
        resp.set_xor_mapped_address(&writer.peer_addr());
        let wire = resp.encode_with_integrity(&ice_pwd);
        let framed = frame_packet(&wire).ok_or(Error::ErrPacketTooBig)?;
        writer.write_packet(&framed)?;

        if self.state == TransportState::WaitingStun || self.state == TransportState::Init {
            self.state = TransportState::Dtls;
        }
        Ok(())
    }

    pub fn on_dtls(&mut self, data: &[u8]) -> Result<()> {
        let session = self.session()?;
        let events = session.transport().borrow_mut().on_dtls(data)?;

        for record in &events.outbound {
            self.write_framed(record)?;
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
        self.session()?.on_rtp_cipher(data, now)
    }

    pub fn on_rtcp(&mut self, data: &[u8]) -> Result<()> {
        let session = self.session()?;
        let resends = session.on_rtcp_cipher(data)?;
        for wire in resends {
            let mut cipher = wire.to_vec();
            session.transport().borrow_mut().protect_rtp(&mut cipher)?;
            self.write_framed(&cipher)?;
        }
        Ok(())
    }
}

/// One accepted media TCP connection. Until the STUN handshake resolves a
/// session, packets buffer through the handshake path; afterwards they feed
/// the attached session's TCP network.
pub struct RtcTcpConn {
    manager: Weak<ResourceManager>,
    writer: Rc<dyn NetworkWriter>,
    decoder: TcpFrameDecoder,
    session: RefCell<Option<Rc<RtcSession>>>,
    context_id: String,
}

impl RtcTcpConn {
    pub fn new(manager: &Rc<ResourceManager>, writer: Rc<dyn NetworkWriter>, context_id: &str) -> Self {
        Self {
            manager: Rc::downgrade(manager),
            writer,
            decoder: TcpFrameDecoder::new(),
            session: RefCell::new(None),
            context_id: context_id.to_string(),
        }
    }

    pub fn session(&self) -> Option<Rc<RtcSession>> {
        self.session.borrow().clone()
    }

    /// Raw socket bytes in; complete frames are routed.
    pub fn on_data(&mut self, data: &[u8], now: Instant) -> Result<()> {
        self.decoder.extend_from_slice(data);
        while let Some(pkt) = self.decoder.next_packet() {
            self.on_packet(&pkt, now)?;
        }
        Ok(())
    }

    fn on_packet(&mut self, pkt: &[u8], now: Instant) -> Result<()> {
        let attached = self.session.borrow().is_some();
        if attached {
            let session = self.session.borrow().clone().unwrap();
            return session.tcp_network().borrow_mut().on_tcp_pkt(pkt, now);
        }
        self.handshake(pkt, now)
    }

    /// First packet must be a STUN Binding Request; the USERNAME attribute
    /// (`remote_ufrag:local_ufrag`) resolves the session, the context id
    /// switches onto it, the connection attaches, then the packet is
    /// re-fed into the now-attached network.
    fn handshake(&mut self, pkt: &[u8], now: Instant) -> Result<()> {
        let req = stun::Message::decode(pkt)?;
        if !req.is_binding_request() {
            return Err(Error::ErrNotStunMessage);
        }
        let username = req.username().ok_or(Error::ErrAttributeNotFound)?;

        let manager = self.manager.upgrade().ok_or(Error::ErrSessionNotFound)?;
        let resource = manager
            .find_by_name(&username)
            .ok_or(Error::ErrSessionNotFound)?;
        let session = resource
            .as_any_rc()
            .downcast::<RtcSession>()
            .map_err(|_| Error::ErrSessionNotFound)?;

        debug!("tcp: attach connection to session {username}");
        session.set_context_id(&self.context_id);
        {
            let tcp_network = session.tcp_network();
            let mut network = tcp_network.borrow_mut();
            network.set_writer(self.writer.clone());
        }
        *self.session.borrow_mut() = Some(session.clone());

        // Re-feed the original STUN packet into the attached network.
        session.tcp_network().borrow_mut().on_tcp_pkt(pkt, now)
    }
}
