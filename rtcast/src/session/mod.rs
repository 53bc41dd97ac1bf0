//! Per-peer RTC session: SDP/ICE identity, security transport, publish and
//! play streams, RTCP feedback dispatch.

pub mod track;

use bytes::BytesMut;
use log::{debug, warn};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Instant;

use rtp::codec::Codec;
use rtp::rtcp::{self, RtcpPacket};
use rtp::RtpPacket;
use shared::error::{Error, Result};

use crate::manager::{Resource, ResourceManager};
use crate::network::tcp::RtcTcpNetwork;
use crate::network::udp::RtcUdpNetwork;
use crate::source::RtcSource;
use crate::stats::CircuitBreaker;
use crate::transport::dtls::Alert;
use crate::transport::{MediaTransport, TransportState};
use track::{RecvTrack, SendTrack, TrackKind};

/// Where outbound media bytes go; the networks implement this, tests mock
/// it.
pub trait RtcPacketSender {
    fn send_rtp(&self, data: &[u8]) -> Result<()>;
    fn send_rtcp(&self, data: &[u8]) -> Result<()>;
}

/// Publisher half: receive tracks routed by SSRC.
pub struct RtcPublishStream {
    pub audio_tracks: Vec<RecvTrack>,
    pub video_tracks: Vec<RecvTrack>,
}

impl RtcPublishStream {
    pub fn new() -> Self {
        Self {
            audio_tracks: vec![],
            video_tracks: vec![],
        }
    }

    pub fn set_all_tracks_status(&mut self, active: bool) {
        for t in self.audio_tracks.iter_mut().chain(self.video_tracks.iter_mut()) {
            t.set_track_status(active);
        }
    }

    fn track_by_ssrc(&mut self, ssrc: u32) -> Option<&mut RecvTrack> {
        self.audio_tracks
            .iter_mut()
            .chain(self.video_tracks.iter_mut())
            .find(|t| t.has_ssrc(ssrc))
    }

    /// Routes one plaintext RTP datagram to its receive track. Unknown
    /// SSRCs are dropped with an error for the counter.
    pub fn on_rtp(&mut self, source: &RtcSource, data: &[u8], now: Instant) -> Result<()> {
        if data.len() < 12 {
            return Err(Error::ErrTooShortRtp);
        }
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
        let track = self
            .track_by_ssrc(ssrc)
            .ok_or(Error::ErrTrackNotFound(ssrc))?;

        let codec = track.desc.codec();
        let mut pkt = RtpPacket::decode(data, codec)?;
        track.on_rtp(source, &mut pkt, now);
        Ok(())
    }

    pub fn on_rtcp_sr(&mut self, sr: &rtcp::SenderReport) {
        let ntp_ms = rtp::ntp::Ntp::to_time_ms(sr.ntp).system_ms;
        if let Some(track) = self.track_by_ssrc(sr.ssrc) {
            track.on_sender_report(ntp_ms, sr.rtp_ts);
        }
    }

    /// Timer tick: gathers NACK requests across tracks.
    pub fn tick_nacks(&mut self, now: Instant) -> Vec<rtcp::Nack> {
        self.audio_tracks
            .iter_mut()
            .chain(self.video_tracks.iter_mut())
            .filter_map(|t| t.tick_nack(now))
            .collect()
    }
}

impl Default for RtcPublishStream {
    fn default() -> Self {
        Self::new()
    }
}

/// Player half: send tracks keyed by the upstream SSRC they subscribe to.
pub struct RtcPlayStream {
    pub audio_tracks: Vec<SendTrack>,
    pub video_tracks: Vec<SendTrack>,
}

impl RtcPlayStream {
    pub fn new() -> Self {
        Self {
            audio_tracks: vec![],
            video_tracks: vec![],
        }
    }

    pub fn set_all_tracks_status(&mut self, active: bool) {
        for t in self.audio_tracks.iter_mut().chain(self.video_tracks.iter_mut()) {
            t.set_track_status(active);
        }
    }

    /// Sends one source packet through the matching send track.
    pub fn on_packet(&mut self, pkt: &mut RtpPacket) -> Result<Option<BytesMut>> {
        let kind = match pkt.frame_type {
            rtp::FrameType::Audio => TrackKind::Audio,
            _ => TrackKind::Video,
        };
        let track = match kind {
            TrackKind::Audio => self.audio_tracks.first_mut(),
            TrackKind::Video => self.video_tracks.first_mut(),
        };
        match track {
            Some(track) => track.on_packet(pkt),
            None => Ok(None),
        }
    }

    /// Handles peer NACK feedback: resend from the matching track's ring.
    pub fn on_rtcp_nack(&mut self, nack: &rtcp::Nack) -> Result<Vec<(BytesMut, bool)>> {
        let lost = nack.lost_sns();
        for t in self.video_tracks.iter_mut().chain(self.audio_tracks.iter_mut()) {
            if t.desc.ssrc == nack.media_ssrc {
                return t.on_recv_nack(&lost);
            }
        }
        Ok(vec![])
    }
}

impl Default for RtcPlayStream {
    fn default() -> Self {
        Self::new()
    }
}

/// A per-peer session. Owned by the resource manager; networks hold weak
/// back-pointers.
pub struct RtcSession {
    manager: Weak<ResourceManager>,
    self_weak: RefCell<Option<Weak<RtcSession>>>,

    pub username: String,
    pub local_ufrag: String,
    pub local_pwd: String,
    pub remote_ufrag: RefCell<String>,
    pub remote_pwd: RefCell<String>,
    pub local_sdp: RefCell<String>,
    pub remote_sdp: RefCell<String>,

    transport: RefCell<Box<dyn MediaTransport>>,
    state: Cell<TransportState>,
    pub publisher: RefCell<Option<RtcPublishStream>>,
    pub player: RefCell<Option<RtcPlayStream>>,
    source: RefCell<Option<Rc<RtcSource>>>,

    udp_network: RefCell<Option<Rc<RefCell<RtcUdpNetwork>>>>,
    tcp_network: RefCell<Option<Rc<RefCell<RtcTcpNetwork>>>>,

    context_id: RefCell<String>,
    disposing: Cell<bool>,
    last_alive: Cell<Instant>,
    pub nn_dropped: Cell<u64>,
}

impl RtcSession {
    pub fn new(
        manager: &Rc<ResourceManager>,
        local_ufrag: &str,
        local_pwd: &str,
        transport: Box<dyn MediaTransport>,
    ) -> Rc<Self> {
        let session = Rc::new(Self {
            manager: Rc::downgrade(manager),
            self_weak: RefCell::new(None),
            username: String::new(),
            local_ufrag: local_ufrag.to_string(),
            local_pwd: local_pwd.to_string(),
            remote_ufrag: RefCell::new(String::new()),
            remote_pwd: RefCell::new(String::new()),
            local_sdp: RefCell::new(String::new()),
            remote_sdp: RefCell::new(String::new()),
            transport: RefCell::new(transport),
            state: Cell::new(TransportState::Init),
            publisher: RefCell::new(None),
            player: RefCell::new(None),
            source: RefCell::new(None),
            udp_network: RefCell::new(None),
            tcp_network: RefCell::new(None),
            context_id: RefCell::new(String::new()),
            disposing: Cell::new(false),
            last_alive: Cell::new(Instant::now()),
            nn_dropped: Cell::new(0),
        });
        *session.self_weak.borrow_mut() = Some(Rc::downgrade(&session));
        *session.udp_network.borrow_mut() = Some(Rc::new(RefCell::new(RtcUdpNetwork::new(
            Rc::downgrade(&session),
            Rc::downgrade(manager),
        ))));
        *session.tcp_network.borrow_mut() = Some(Rc::new(RefCell::new(RtcTcpNetwork::new(
            Rc::downgrade(&session),
        ))));
        session
    }

    /// The UDP network of this session; created with the session.
    pub fn udp_network(&self) -> Rc<RefCell<RtcUdpNetwork>> {
        self.udp_network
            .borrow()
            .clone()
            .expect("networks are created with the session")
    }

    /// The TCP network of this session; created with the session.
    pub fn tcp_network(&self) -> Rc<RefCell<RtcTcpNetwork>> {
        self.tcp_network
            .borrow()
            .clone()
            .expect("networks are created with the session")
    }

    /// Routes one UDP datagram for this session by its first byte.
    pub fn on_udp_packet(&self, data: &[u8], now: Instant) -> Result<()> {
        use crate::network::{demux, PacketKind};
        let network = self.udp_network();
        let mut network = network.borrow_mut();
        match demux(data) {
            PacketKind::Stun => network.on_stun(data),
            PacketKind::Dtls => network.on_dtls(data),
            PacketKind::Rtp => network.on_rtp(data, now),
            PacketKind::Rtcp => network.on_rtcp(data),
            // TURN relaying is out of scope; unknown bytes drop quietly.
            PacketKind::Turn | PacketKind::Unknown(_) => Ok(()),
        }
    }

    pub fn state(&self) -> TransportState {
        self.state.get()
    }

    pub fn set_state(&self, state: TransportState) {
        self.state.set(state);
    }

    pub fn set_context_id(&self, cid: &str) {
        *self.context_id.borrow_mut() = cid.to_string();
    }

    pub fn context_id(&self) -> String {
        self.context_id.borrow().clone()
    }

    pub fn set_source(&self, source: Rc<RtcSource>) {
        *self.source.borrow_mut() = Some(source);
    }

    pub fn source(&self) -> Option<Rc<RtcSource>> {
        self.source.borrow().clone()
    }

    pub fn is_disposing(&self) -> bool {
        self.disposing.get()
    }

    /// Alive when ICE and DTLS completed and a network is established.
    pub fn is_alive(&self) -> bool {
        !self.disposing.get() && self.state.get() == TransportState::Established
    }

    pub fn mark_alive(&self) {
        self.last_alive.set(Instant::now());
    }

    pub fn last_alive(&self) -> Instant {
        self.last_alive.get()
    }

    /// Authorizes a STUN Binding Request: verifies the short-term
    /// credential against the local ice-pwd and refreshes liveness.
    /// Returns the pwd the response must be integrity-protected with.
    pub fn on_binding_request(&self, req: &stun::Message, raw: &[u8]) -> Result<String> {
        if !req.is_binding_request() {
            return Err(Error::ErrNotStunMessage);
        }
        stun::Message::verify_integrity(raw, &self.local_pwd)?;
        self.mark_alive();
        if self.state.get() == TransportState::Init
            || self.state.get() == TransportState::WaitingStun
        {
            self.state.set(TransportState::Dtls);
        }
        Ok(self.local_pwd.clone())
    }

    /// DTLS completion; idempotent across handshake ARQ.
    pub fn on_dtls_handshake_done(&self) -> Result<()> {
        if self.state.get() == TransportState::Established {
            return Ok(());
        }
        debug!("session {}: DTLS handshake done", self.username);
        self.state.set(TransportState::Established);
        self.mark_alive();
        Ok(())
    }

    /// Alert routing: `close_notify` expires the session, anything else is
    /// surfaced and logged.
    pub fn on_dtls_alert(&self, alert: Alert) {
        if alert.is_close_notify() {
            self.expire();
        } else {
            warn!(
                "session {}: DTLS alert level={} desc={}",
                self.username, alert.level, alert.description
            );
        }
    }

    /// Disposal goes through the manager, never a direct drop.
    pub fn expire(&self) {
        if self.disposing.replace(true) {
            return;
        }
        self.state.set(TransportState::Closed);
        let weak = self.self_weak.borrow().clone();
        if let (Some(manager), Some(me)) = (self.manager.upgrade(), weak.and_then(|w| w.upgrade()))
        {
            let r: Rc<dyn Resource> = me;
            manager.remove(&r);
        }
    }

    pub fn transport(&self) -> &RefCell<Box<dyn MediaTransport>> {
        &self.transport
    }

    /// Inbound ciphered RTP: unprotect, then dispatch to the publisher.
    pub fn on_rtp_cipher(&self, data: &[u8], now: Instant) -> Result<()> {
        let mut plaintext = data.to_vec();
        self.transport.borrow_mut().unprotect_rtp(&mut plaintext)?;
        self.on_rtp_plaintext(&plaintext, now)
    }

    pub fn on_rtp_plaintext(&self, data: &[u8], now: Instant) -> Result<()> {
        self.mark_alive();
        let source = self.source();
        let mut publisher = self.publisher.borrow_mut();
        let Some(publisher) = publisher.as_mut() else {
            self.nn_dropped.set(self.nn_dropped.get() + 1);
            return Ok(());
        };
        let Some(source) = source else {
            self.nn_dropped.set(self.nn_dropped.get() + 1);
            return Ok(());
        };
        match publisher.on_rtp(&source, data, now) {
            Ok(()) => Ok(()),
            Err(Error::ErrTrackNotFound(_)) => {
                // Unknown SSRC: drop and count.
                self.nn_dropped.set(self.nn_dropped.get() + 1);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Inbound ciphered RTCP: unprotect, parse the compound, dispatch.
    /// Returns RTX/resend payloads the caller must protect and write.
    pub fn on_rtcp_cipher(&self, data: &[u8]) -> Result<Vec<BytesMut>> {
        let mut plaintext = data.to_vec();
        self.transport.borrow_mut().unprotect_rtcp(&mut plaintext)?;
        self.on_rtcp_plaintext(&plaintext)
    }

    pub fn on_rtcp_plaintext(&self, data: &[u8]) -> Result<Vec<BytesMut>> {
        self.mark_alive();
        let mut resends = vec![];
        for pkt in rtcp::parse_compound(data)? {
            match pkt {
                RtcpPacket::SenderReport(sr) => {
                    if let Some(publisher) = self.publisher.borrow_mut().as_mut() {
                        publisher.on_rtcp_sr(&sr);
                    }
                }
                RtcpPacket::Nack(nack) => {
                    if let Some(player) = self.player.borrow_mut().as_mut() {
                        for (wire, _is_rtx) in player.on_rtcp_nack(&nack)? {
                            resends.push(wire);
                        }
                    }
                }
                RtcpPacket::Pli(_) | RtcpPacket::ReceiverReport(_) | RtcpPacket::Other { .. } => {}
            }
        }
        Ok(resends)
    }

    /// Egress: pull from the source consumer, rewrite via the play stream,
    /// protect, and hand the cipher text to the sender.
    pub fn deliver_packet(
        &self,
        pkt: &mut RtpPacket,
        sender: &dyn RtcPacketSender,
    ) -> Result<()> {
        let wire = {
            let mut player = self.player.borrow_mut();
            let Some(player) = player.as_mut() else {
                return Ok(());
            };
            player.on_packet(pkt)?
        };
        if let Some(wire) = wire {
            let mut cipher = wire.to_vec();
            self.transport.borrow_mut().protect_rtp(&mut cipher)?;
            sender.send_rtp(&cipher)?;
        }
        Ok(())
    }

    pub fn set_all_tracks_status(&self, active: bool) {
        if let Some(publisher) = self.publisher.borrow_mut().as_mut() {
            publisher.set_all_tracks_status(active);
        }
        if let Some(player) = self.player.borrow_mut().as_mut() {
            player.set_all_tracks_status(active);
        }
    }

    /// Timer tick: gathers due NACK requests as protected RTCP payloads.
    /// Under circuit-breaker pressure the feedback work is shed.
    pub fn tick_feedback(
        &self,
        now: Instant,
        breaker: Option<&CircuitBreaker>,
    ) -> Result<Vec<BytesMut>> {
        if breaker.map(|b| b.hybrid_high_water_level()).unwrap_or(false) {
            return Ok(vec![]);
        }
        let nacks = match self.publisher.borrow_mut().as_mut() {
            Some(publisher) => publisher.tick_nacks(now),
            None => return Ok(vec![]),
        };
        let mut out = vec![];
        for nack in nacks {
            let mut cipher = nack.marshal().to_vec();
            self.transport.borrow_mut().protect_rtcp(&mut cipher)?;
            out.push(BytesMut::from(&cipher[..]));
        }
        Ok(out)
    }
}

impl Resource for RtcSession {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_rc(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }

    fn desc(&self) -> String {
        format!("rtc-session/{}", self.local_ufrag)
    }
}

/// The codec a packet should be parsed with, chosen by peeking the payload
/// type before decode; unknown payload types yield no payload and the
/// packet is dropped upstream.
pub fn codec_for_payload_type(pt: u8, audio_pt: u8, video_pt: u8, video_codec: Codec) -> Option<Codec> {
    if pt == audio_pt {
        Some(Codec::Opus)
    } else if pt == video_pt {
        Some(video_codec)
    } else {
        None
    }
}
