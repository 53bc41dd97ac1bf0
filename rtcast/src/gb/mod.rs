//! GB28181 ingest: PS-over-RTP on TCP, long-lived sessions, and the
//! publish API.

pub mod muxer;
pub mod ps;

use log::{debug, warn};
use serde_json::Value;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use shared::error::{Error, Result};
use shared::tcp_framing::TcpFrameDecoder;

use crate::config::AppConfig;
use crate::manager::{Resource, ResourceManager};
use crate::source::{LiveSource, StreamUrl};
use muxer::GbMuxer;
use ps::{PsHandler, PsMessage, RecoverablePsContext};

/// GB28181 sessions are long-lived: the media transport going away returns
/// the session to Init, never to a terminal state.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GbSessionState {
    Init,
    Established,
}

impl fmt::Display for GbSessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GbSessionState::Init => write!(f, "init"),
            GbSessionState::Established => write!(f, "established"),
        }
    }
}

/// One GB28181 publish: device id, negotiated SSRC, and the muxer feeding
/// the live source.
pub struct GbSession {
    pub id: String,
    pub ssrc: u32,
    state: Cell<GbSessionState>,
    muxer: RefCell<GbMuxer>,

    // Totals accumulated across packs.
    pub nn_packs: Cell<u64>,
    pub nn_msgs: Cell<u64>,
    pub nn_recovered: Cell<u64>,
    pub nn_msgs_dropped: Cell<u64>,
    pub nn_reserved: Cell<u64>,
}

impl GbSession {
    pub fn new(id: &str, ssrc: u32, target: Rc<LiveSource>) -> Rc<Self> {
        Rc::new(Self {
            id: id.to_string(),
            ssrc,
            state: Cell::new(GbSessionState::Init),
            muxer: RefCell::new(GbMuxer::new(target)),
            nn_packs: Cell::new(0),
            nn_msgs: Cell::new(0),
            nn_recovered: Cell::new(0),
            nn_msgs_dropped: Cell::new(0),
            nn_reserved: Cell::new(0),
        })
    }

    pub fn state(&self) -> GbSessionState {
        self.state.get()
    }

    /// Media transport liveness drives the state machine: first connect
    /// establishes, disconnect returns to Init so the next publish can
    /// re-accept.
    pub fn on_media_transport(&self, connected: bool) {
        let next = if connected {
            GbSessionState::Established
        } else {
            GbSessionState::Init
        };
        if self.state.get() != next {
            debug!("gb session {}: {} -> {}", self.id, self.state.get(), next);
            self.state.set(next);
        }
    }

    /// One complete PS pack from the media connection.
    pub fn on_ps_pack(&self, pack_id: u32, msgs: &[PsMessage]) -> Result<()> {
        if self.state.get() != GbSessionState::Established {
            return Err(Error::ErrGbSessionNotReady);
        }
        self.nn_packs.set(self.nn_packs.get() + 1);
        self.nn_msgs.set(self.nn_msgs.get() + msgs.len() as u64);
        debug!(
            "gb session {}: pack {} with {} msgs",
            self.id,
            pack_id,
            msgs.len()
        );
        self.muxer.borrow_mut().on_ps_pack(msgs)
    }

    /// Flushes the media-context stats into the session totals when a new
    /// media context takes over.
    pub fn flush_media_stats(&self, recovered: u64, dropped: u64, reserved: u64) {
        self.nn_recovered.set(self.nn_recovered.get() + recovered);
        self.nn_msgs_dropped.set(self.nn_msgs_dropped.get() + dropped);
        self.nn_reserved.set(self.nn_reserved.get() + reserved);
    }
}

impl Resource for GbSession {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_rc(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }

    fn desc(&self) -> String {
        format!("gb-session/{}", self.id)
    }
}

/// Accumulates TS messages for the current pack and forwards complete
/// packs to the bound session.
pub struct PackContext {
    /// Media connection identity; a new media context flushes stats.
    pub media_id: u32,
    pub media_start_time: u64,
    session: Weak<GbSession>,
    current_pack: Option<u32>,
    msgs: Vec<PsMessage>,
    last_dts: u64,
    last_pts: u64,
    pub media_nn_recovered: u64,
    pub media_nn_msgs_dropped: u64,
}

impl PackContext {
    pub fn new(media_id: u32, session: Weak<GbSession>) -> Self {
        Self {
            media_id,
            media_start_time: 0,
            session,
            current_pack: None,
            msgs: vec![],
            last_dts: 0,
            last_pts: 0,
            media_nn_recovered: 0,
            media_nn_msgs_dropped: 0,
        }
    }

    pub fn queued(&self) -> usize {
        self.msgs.len()
    }

    fn flush_pack(&mut self) -> Result<()> {
        let Some(pack_id) = self.current_pack else {
            return Ok(());
        };
        if self.msgs.is_empty() {
            return Ok(());
        }
        let msgs = std::mem::take(&mut self.msgs);
        if let Some(session) = self.session.upgrade() {
            session.on_ps_pack(pack_id, &msgs)?;
        }
        Ok(())
    }
}

impl PsHandler for PackContext {
    /// A new pack id means "emit the previous pack, start a new one".
    /// Zeroed timestamps are corrected from the previous message.
    fn on_ts_message(&mut self, pack_id: u32, mut msg: PsMessage) -> Result<()> {
        if msg.dts == 0 && msg.pts == 0 {
            msg.dts = self.last_dts;
            msg.pts = self.last_pts;
        } else {
            self.last_dts = msg.dts;
            self.last_pts = msg.pts;
        }

        if self.current_pack != Some(pack_id) {
            self.flush_pack()?;
            self.current_pack = Some(pack_id);
        }
        self.msgs.push(msg);
        Ok(())
    }

    /// Recovery statistics: the counter increments exactly once per
    /// recovery entry; everything queued for the current pack is dropped.
    fn on_recover_mode(&mut self, nn_recover: u32) {
        if nn_recover <= 1 {
            self.media_nn_recovered += 1;
        }
        self.media_nn_msgs_dropped += self.msgs.len() as u64;
        self.msgs.clear();
    }
}

/// One accepted media TCP connection: de-frames RTP, binds the session by
/// SSRC on the first packet, and runs the recoverable PS parser.
pub struct GbMediaTcpConn {
    manager: Weak<ResourceManager>,
    decoder: TcpFrameDecoder,
    ps: RecoverablePsContext,
    pack: PackContext,
    session: Option<Rc<GbSession>>,
}

impl GbMediaTcpConn {
    pub fn new(manager: &Rc<ResourceManager>, media_id: u32) -> Self {
        Self {
            manager: Rc::downgrade(manager),
            decoder: TcpFrameDecoder::new(),
            ps: RecoverablePsContext::new(),
            pack: PackContext::new(media_id, Weak::new()),
            session: None,
        }
    }

    pub fn session(&self) -> Option<Rc<GbSession>> {
        self.session.clone()
    }

    /// Binds the owning session by the RTP SSRC (the manager fast-id).
    pub fn bind_session(&mut self, ssrc: u32) -> Result<Rc<GbSession>> {
        if let Some(s) = &self.session {
            return Ok(s.clone());
        }
        let manager = self.manager.upgrade().ok_or(Error::ErrSessionNotFound)?;
        let session = manager
            .find_by_fast_id(ssrc as u64)
            .ok_or(Error::ErrSessionNotFound)?
            .as_any_rc()
            .downcast::<GbSession>()
            .map_err(|_| Error::ErrSessionNotFound)?;

        session.on_media_transport(true);
        self.pack = PackContext::new(self.pack.media_id, Rc::downgrade(&session));
        self.session = Some(session.clone());
        Ok(session)
    }

    /// Raw TCP bytes; complete frames run through the PS parser.
    pub fn on_data(&mut self, data: &[u8]) -> Result<()> {
        self.decoder.extend_from_slice(data);
        while let Some(pkt) = self.decoder.next_packet() {
            self.on_rtp_packet(&pkt)?;
        }
        Ok(())
    }

    fn on_rtp_packet(&mut self, pkt: &[u8]) -> Result<()> {
        if pkt.len() < 12 {
            return Err(Error::ErrTooShortRtp);
        }
        let ssrc = u32::from_be_bytes([pkt[8], pkt[9], pkt[10], pkt[11]]);
        self.bind_session(ssrc)?;
        self.ps.decode_rtp(pkt, 0, &mut self.pack)
    }

    /// The socket dropped: flush stats and return the session to Init.
    pub fn on_disconnect(&mut self) {
        if let Some(session) = &self.session {
            session.flush_media_stats(
                self.pack.media_nn_recovered,
                self.pack.media_nn_msgs_dropped,
                0,
            );
            session.on_media_transport(false);
        }
        self.session = None;
    }
}

/// The GB28181 TCP listener front: owns the port from config and creates a
/// per-connection context for each accepted media socket.
pub struct GbListener {
    manager: Rc<ResourceManager>,
    port: u16,
    output_template: String,
    next_media_id: Cell<u32>,
}

impl GbListener {
    pub fn new(manager: Rc<ResourceManager>, config: &dyn AppConfig) -> Self {
        Self {
            manager,
            port: config.get_stream_caster_listen(),
            output_template: config.get_stream_caster_output(),
            next_media_id: Cell::new(0),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn output_template(&self) -> &str {
        &self.output_template
    }

    /// One media connection per publish.
    pub fn accept(&self) -> GbMediaTcpConn {
        let media_id = self.next_media_id.get() + 1;
        self.next_media_id.set(media_id);
        GbMediaTcpConn::new(&self.manager, media_id)
    }
}

#[derive(serde::Serialize)]
struct GbPublishResponse {
    code: i32,
    port: u16,
    is_tcp: bool,
}

/// `POST /gb/v1/publish/` body `{id, ssrc}`: creates the session,
/// registers it under both keys, and answers `{code, port, is_tcp}`.
pub fn gb_publish(
    manager: &Rc<ResourceManager>,
    config: &dyn AppConfig,
    body: &Value,
) -> Result<Value> {
    let id = body["id"].as_str().unwrap_or_default().to_string();
    if id.is_empty() {
        return Err(Error::ErrGbSsrcInvalid("empty id".to_string()));
    }

    let ssrc_field = &body["ssrc"];
    let ssrc = match (ssrc_field.as_str(), ssrc_field.as_u64()) {
        (Some(s), _) => s
            .parse::<u32>()
            .map_err(|_| Error::ErrGbSsrcInvalid(s.to_string()))?,
        (None, Some(n)) if n <= u32::MAX as u64 => n as u32,
        _ => return Err(Error::ErrGbSsrcInvalid(ssrc_field.to_string())),
    };

    if manager.find_by_id(&id).is_some() {
        warn!("gb: publish for existing session {id}");
        return Err(Error::ErrGbSessionExists(id));
    }

    let source = LiveSource::new(StreamUrl::new("__defaultVhost__", "live", &id));
    source.on_publish();
    let session = GbSession::new(&id, ssrc, source);

    let r: Rc<dyn Resource> = session;
    manager.add_with_id(&id, r.clone());
    manager.add_with_fast_id(ssrc as u64, r);

    serde_json::to_value(GbPublishResponse {
        code: 0,
        port: config.get_stream_caster_listen(),
        is_tcp: true,
    })
    .map_err(|e| Error::Other(e.to_string()))
}
