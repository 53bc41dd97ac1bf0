//! HTTP-remux edge: FLV/TS/AAC/MP3 stream encoders, the per-stream buffer
//! cache, dynamic mount of `/app/stream.<ext>`, and the viewer lifecycle.

use bytes::{BufMut, BytesMut};
use crc::{Crc, CRC_32_MPEG_2};
use log::{debug, warn};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use shared::error::{Error, Result};
use shared::marshal::put_u24;

use super::{HttpMessage, ResponseWriter};
use crate::config::AppConfig;
use crate::hooks::HttpHooks;
use crate::source::{LiveSource, MediaMessage, MessageKind, StreamUrl};
use crate::stats::{ClientType, StatClient, Statistic};

const MPEG2_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// FLV stream encoder. The file header is written on the first media
/// write; with `guess_has_av` the initial burst decides the hasAudio and
/// hasVideo flags.
pub struct FlvStreamEncoder {
    header_written: bool,
    guess_has_av: bool,
    has_audio: bool,
    has_video: bool,
}

impl Default for FlvStreamEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FlvStreamEncoder {
    pub fn new() -> Self {
        Self {
            header_written: false,
            guess_has_av: false,
            has_audio: true,
            has_video: true,
        }
    }

    /// Scan the initial burst to decide the header A/V flags instead of
    /// assuming both.
    pub fn set_guess_has_av(&mut self, v: bool) {
        self.guess_has_av = v;
    }

    fn write_flv_header(&mut self, w: &mut dyn ResponseWriter) -> Result<()> {
        let mut flags = 0u8;
        if self.has_audio {
            flags |= 0x04;
        }
        if self.has_video {
            flags |= 0x01;
        }
        let header = [b'F', b'L', b'V', 0x01, flags, 0, 0, 0, 9, 0, 0, 0, 0];
        w.write(&header)?;
        self.header_written = true;
        Ok(())
    }

    fn write_tag(&mut self, w: &mut dyn ResponseWriter, msg: &MediaMessage) -> Result<()> {
        if !self.header_written {
            self.write_flv_header(w)?;
        }
        let tag_type = match msg.kind {
            MessageKind::Audio => 8,
            MessageKind::Video => 9,
            MessageKind::Metadata => 18,
        };
        let mut tag = BytesMut::with_capacity(11 + msg.payload.len() + 4);
        tag.put_u8(tag_type);
        put_u24(&mut tag, msg.payload.len() as u32);
        put_u24(&mut tag, msg.timestamp & 0xFF_FFFF);
        tag.put_u8((msg.timestamp >> 24) as u8);
        put_u24(&mut tag, 0);
        tag.put_slice(&msg.payload);
        tag.put_u32(11 + msg.payload.len() as u32);
        w.write(&tag)?;
        Ok(())
    }

    /// Batches a burst: with `guess_has_av` the scan runs across the whole
    /// array before the header is emitted.
    pub fn write_tags(&mut self, w: &mut dyn ResponseWriter, msgs: &[MediaMessage]) -> Result<()> {
        if !self.header_written && self.guess_has_av {
            self.has_audio = msgs.iter().any(|m| m.is_audio());
            self.has_video = msgs.iter().any(|m| m.is_video());
        }
        for msg in msgs {
            self.write_tag(w, msg)?;
        }
        Ok(())
    }
}

const TS_PACKET_SIZE: usize = 188;
const PID_PAT: u16 = 0x0000;
const PID_PMT: u16 = 0x1000;
const PID_VIDEO: u16 = 0x0100;
const PID_AUDIO: u16 = 0x0101;

/// Stateless MPEG-TS muxer: PAT and PMT ride ahead of every keyframe, PES
/// packets fill 188-byte cells with adaptation stuffing. There is no
/// client-side cache; the GOP cache lives in the source.
pub struct TsStreamEncoder {
    cc: HashMap<u16, u8>,
    started: bool,
}

impl Default for TsStreamEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl TsStreamEncoder {
    pub fn new() -> Self {
        Self {
            cc: HashMap::new(),
            started: false,
        }
    }

    fn next_cc(&mut self, pid: u16) -> u8 {
        let cc = self.cc.entry(pid).or_insert(0);
        let v = *cc;
        *cc = (*cc + 1) & 0x0F;
        v
    }

    fn write_psi(&mut self, w: &mut dyn ResponseWriter, pid: u16, table: &[u8]) -> Result<()> {
        let mut cell = BytesMut::with_capacity(TS_PACKET_SIZE);
        cell.put_u8(0x47);
        cell.put_u16(0x4000 | pid);
        cell.put_u8(0x10 | self.next_cc(pid));
        cell.put_u8(0); // pointer field
        cell.put_slice(table);
        let crc = MPEG2_CRC.checksum(table);
        cell.put_u32(crc);
        while cell.len() < TS_PACKET_SIZE {
            cell.put_u8(0xFF);
        }
        w.write(&cell)?;
        Ok(())
    }

    fn write_pat_pmt(&mut self, w: &mut dyn ResponseWriter) -> Result<()> {
        // PAT: program 1 -> PMT pid.
        let pat: &[u8] = &[
            0x00, 0xB0, 0x0D, 0x00, 0x01, 0xC1, 0x00, 0x00, 0x00, 0x01, 0xF0, 0x00,
        ];
        self.write_psi(w, PID_PAT, pat)?;

        // PMT: H.264 on the video pid, AAC on the audio pid.
        let pmt: &[u8] = &[
            0x02, 0xB0, 0x17, 0x00, 0x01, 0xC1, 0x00, 0x00, 0xE1, 0x00, 0xF0, 0x00, 0x1B, 0xE1,
            0x00, 0xF0, 0x00, 0x0F, 0xE1, 0x01, 0xF0, 0x00,
        ];
        self.write_psi(w, PID_PMT, pmt)
    }

    fn write_pes(
        &mut self,
        w: &mut dyn ResponseWriter,
        pid: u16,
        sid: u8,
        pts_ms: u32,
        es: &[u8],
    ) -> Result<()> {
        let pts = (pts_ms as u64) * 90;
        let mut pes = BytesMut::with_capacity(14 + es.len());
        pes.put_slice(&[0x00, 0x00, 0x01, sid]);
        let pes_len = 3 + 5 + es.len();
        pes.put_u16(if pes_len > 0xFFFF { 0 } else { pes_len as u16 });
        pes.put_u8(0x80);
        pes.put_u8(0x80); // PTS only
        pes.put_u8(5);
        pes.put_u8(0x21 | (((pts >> 30) as u8 & 0x07) << 1));
        pes.put_u16((((pts >> 15) & 0x7FFF) << 1 | 1) as u16);
        pes.put_u16((((pts) & 0x7FFF) << 1 | 1) as u16);
        pes.put_slice(es);

        let mut offset = 0;
        let mut first = true;
        while offset < pes.len() {
            let mut cell = BytesMut::with_capacity(TS_PACKET_SIZE);
            cell.put_u8(0x47);
            let pusi = if first { 0x4000 } else { 0 };
            cell.put_u16(pusi | pid);
            let remaining = pes.len() - offset;
            let body_budget = TS_PACKET_SIZE - 4;
            if remaining >= body_budget {
                cell.put_u8(0x10 | self.next_cc(pid));
                cell.put_slice(&pes[offset..offset + body_budget]);
                offset += body_budget;
            } else {
                // Adaptation field stuffs the tail.
                cell.put_u8(0x30 | self.next_cc(pid));
                let stuffing = body_budget - remaining - 1;
                cell.put_u8(stuffing as u8);
                if stuffing > 0 {
                    cell.put_u8(0x00);
                    for _ in 1..stuffing {
                        cell.put_u8(0xFF);
                    }
                }
                cell.put_slice(&pes[offset..]);
                offset = pes.len();
            }
            first = false;
            w.write(&cell)?;
        }
        Ok(())
    }

    pub fn write_message(&mut self, w: &mut dyn ResponseWriter, msg: &MediaMessage) -> Result<()> {
        match msg.kind {
            MessageKind::Metadata => Ok(()),
            MessageKind::Video => {
                if !self.started || msg.is_video_keyframe() {
                    self.write_pat_pmt(w)?;
                    self.started = true;
                }
                if msg.payload.len() <= 5 {
                    return Ok(());
                }
                self.write_pes(w, PID_VIDEO, 0xE0, msg.timestamp, &msg.payload[5..])
            }
            MessageKind::Audio => {
                if !self.started {
                    self.write_pat_pmt(w)?;
                    self.started = true;
                }
                if msg.payload.len() <= 2 {
                    return Ok(());
                }
                self.write_pes(w, PID_AUDIO, 0xC0, msg.timestamp, &msg.payload[2..])
            }
        }
    }
}

/// Audio-only AAC encoder: 7-byte ADTS header plus the raw frame. Video
/// and metadata are silently dropped.
pub struct AacStreamEncoder {
    asc: Option<[u8; 2]>,
}

impl Default for AacStreamEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl AacStreamEncoder {
    pub fn new() -> Self {
        Self { asc: None }
    }

    pub fn write_message(&mut self, w: &mut dyn ResponseWriter, msg: &MediaMessage) -> Result<()> {
        if !msg.is_audio() || msg.payload.len() < 2 {
            return Ok(());
        }
        if msg.is_audio_sh() {
            if msg.payload.len() >= 4 {
                self.asc = Some([msg.payload[2], msg.payload[3]]);
            }
            return Ok(());
        }
        let Some(asc) = self.asc else {
            return Ok(());
        };

        let raw = &msg.payload[2..];
        let profile = (asc[0] >> 3).saturating_sub(1);
        let sr_index = ((asc[0] & 0x07) << 1) | (asc[1] >> 7);
        let channels = (asc[1] >> 3) & 0x0F;
        let frame_len = (7 + raw.len()) as u32;

        let adts = [
            0xFF,
            0xF1,
            (profile << 6) | (sr_index << 2) | (channels >> 2),
            ((channels & 0x03) << 6) | ((frame_len >> 11) as u8 & 0x03),
            (frame_len >> 3) as u8,
            (((frame_len & 0x07) as u8) << 5) | 0x1F,
            0xFC,
        ];
        w.write(&adts)?;
        w.write(raw)?;
        Ok(())
    }
}

/// Audio-only MP3 encoder: raw frames, everything else dropped.
#[derive(Default)]
pub struct Mp3StreamEncoder;

impl Mp3StreamEncoder {
    pub fn new() -> Self {
        Self
    }

    pub fn write_message(&self, w: &mut dyn ResponseWriter, msg: &MediaMessage) -> Result<()> {
        if !msg.is_audio() || msg.payload.len() < 2 {
            return Ok(());
        }
        // Strip the one-byte FLV audio tag header.
        w.write(&msg.payload[1..])?;
        Ok(())
    }
}

/// One encoder per mounted extension.
pub enum StreamEncoder {
    Flv(FlvStreamEncoder),
    Ts(TsStreamEncoder),
    Aac(AacStreamEncoder),
    Mp3(Mp3StreamEncoder),
}

impl StreamEncoder {
    pub fn for_ext(ext: &str) -> Result<Self> {
        match ext {
            "flv" => Ok(StreamEncoder::Flv(FlvStreamEncoder::new())),
            "ts" => Ok(StreamEncoder::Ts(TsStreamEncoder::new())),
            "aac" => Ok(StreamEncoder::Aac(AacStreamEncoder::new())),
            "mp3" => Ok(StreamEncoder::Mp3(Mp3StreamEncoder::new())),
            other => Err(Error::ErrFormatNotSupported(other.to_string())),
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            StreamEncoder::Flv(_) => "video/x-flv",
            StreamEncoder::Ts(_) => "video/MP2T",
            StreamEncoder::Aac(_) => "audio/aac",
            StreamEncoder::Mp3(_) => "audio/mpeg",
        }
    }

    /// Whether the encoder carries its own buffer cache (the audio-only
    /// encoders subscribe to the source themselves).
    pub fn has_cache(&self) -> bool {
        matches!(self, StreamEncoder::Aac(_) | StreamEncoder::Mp3(_))
    }

    pub fn write_message(&mut self, w: &mut dyn ResponseWriter, msg: &MediaMessage) -> Result<()> {
        match self {
            StreamEncoder::Flv(e) => e.write_tag(w, msg),
            StreamEncoder::Ts(e) => e.write_message(w, msg),
            StreamEncoder::Aac(e) => e.write_message(w, msg),
            StreamEncoder::Mp3(e) => e.write_message(w, msg),
        }
    }

    pub fn write_tags(&mut self, w: &mut dyn ResponseWriter, msgs: &[MediaMessage]) -> Result<()> {
        match self {
            StreamEncoder::Flv(e) => e.write_tags(w, msgs),
            _ => {
                for msg in msgs {
                    self.write_message(w, msg)?;
                }
                Ok(())
            }
        }
    }
}

/// Per-stream cache keeping a bounded window of the live stream, replayed
/// to new consumers. Disabled when `fast_cache` is zero.
pub struct BufferCache {
    fast_cache: Duration,
    msgs: RefCell<VecDeque<MediaMessage>>,
    alive: Cell<bool>,
}

impl BufferCache {
    pub fn new(fast_cache: Duration) -> Rc<Self> {
        Rc::new(Self {
            fast_cache,
            msgs: RefCell::new(VecDeque::new()),
            alive: Cell::new(true),
        })
    }

    pub fn enabled(&self) -> bool {
        !self.fast_cache.is_zero()
    }

    pub fn alive(&self) -> bool {
        self.alive.get()
    }

    /// Idempotent.
    pub fn stop(&self) {
        self.alive.set(false);
    }

    /// Feeds one live message, expiring everything older than the window.
    pub fn on_message(&self, msg: MediaMessage) {
        if !self.enabled() || !self.alive.get() {
            return;
        }
        let window_ms = self.fast_cache.as_millis() as u32;
        let mut msgs = self.msgs.borrow_mut();
        let newest = msg.timestamp;
        msgs.push_back(msg);
        while let Some(front) = msgs.front() {
            if newest.saturating_sub(front.timestamp) > window_ms {
                msgs.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.msgs.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.msgs.borrow().is_empty()
    }

    /// Replays the window into an encoder for a newly-attached consumer.
    pub fn dump_cache(&self, encoder: &mut StreamEncoder, w: &mut dyn ResponseWriter) -> Result<()> {
        let msgs: Vec<MediaMessage> = self.msgs.borrow().iter().cloned().collect();
        encoder.write_tags(w, &msgs)
    }
}

/// One mounted live stream.
pub struct LiveEntry {
    pub url: StreamUrl,
    pub mount: String,
    pub ext: String,
    pub source: Rc<LiveSource>,
    pub cache: Rc<BufferCache>,
    enabled: Cell<bool>,
    disposing: Cell<bool>,
    viewers: RefCell<Vec<String>>,
}

impl LiveEntry {
    pub fn is_enabled(&self) -> bool {
        self.enabled.get()
    }

    pub fn set_enabled(&self, v: bool) {
        self.enabled.set(v);
    }

    pub fn is_disposing(&self) -> bool {
        self.disposing.get()
    }

    pub fn nb_viewers(&self) -> usize {
        self.viewers.borrow().len()
    }
}

/// Dynamic mount table: first request to `/app/stream.ext` creates the
/// entry from the vhost template, a second request reuses it, and unmount
/// destroys asynchronously.
pub struct HttpStreamServer<C: AppConfig> {
    config: Rc<C>,
    stat: Rc<Statistic>,
    hooks: Rc<dyn HttpHooks>,
    entries: RefCell<HashMap<String, Rc<LiveEntry>>>,
    /// Unmounted entries whose destroy task has not run yet.
    destroying: RefCell<HashMap<String, Rc<LiveEntry>>>,
    next_client_id: Cell<u64>,
}

impl<C: AppConfig> HttpStreamServer<C> {
    pub fn new(config: Rc<C>, stat: Rc<Statistic>, hooks: Rc<dyn HttpHooks>) -> Self {
        Self {
            config,
            stat,
            hooks,
            entries: RefCell::new(HashMap::new()),
            destroying: RefCell::new(HashMap::new()),
            next_client_id: Cell::new(0),
        }
    }

    /// `[vhost]`, `[app]`, `[stream]` and `[ext]` substituted into the
    /// vhost's mount pattern.
    pub fn mount_of(&self, url: &StreamUrl, ext: &str) -> String {
        let template = self.config.get_vhost_http_remux_mount(&url.vhost);
        let mount = template
            .replace("[vhost]", &url.vhost)
            .replace("[app]", &url.app)
            .replace("[stream]", &url.stream)
            .replace("[ext]", ext);
        if mount.starts_with('/') {
            mount
        } else {
            format!("/{mount}")
        }
    }

    /// Mounts a stream, reusing the existing entry for the same URL.
    /// Mount-while-disposing is rejected.
    pub fn http_mount(&self, url: &StreamUrl, ext: &str) -> Result<Rc<LiveEntry>> {
        if !self.config.get_vhost_http_remux_enabled(&url.vhost) {
            return Err(Error::ErrStreamNotFound);
        }
        let mount = self.mount_of(url, ext);
        if self.destroying.borrow().contains_key(&mount) {
            return Err(Error::ErrStreamDisposing);
        }
        if let Some(entry) = self.entries.borrow().get(&mount) {
            return Ok(entry.clone());
        }

        let source = LiveSource::new(url.clone());
        let cache = BufferCache::new(self.config.get_vhost_http_remux_fast_cache(&url.vhost));
        let entry = Rc::new(LiveEntry {
            url: url.clone(),
            mount: mount.clone(),
            ext: ext.to_string(),
            source,
            cache,
            enabled: Cell::new(true),
            disposing: Cell::new(false),
            viewers: RefCell::new(vec![]),
        });
        debug!("http: mount live stream at {mount}");
        self.entries.borrow_mut().insert(mount, entry.clone());
        Ok(entry)
    }

    /// Marks the entry disposing and enqueues the asynchronous destroy.
    pub fn http_unmount(&self, url: &StreamUrl, ext: &str) {
        let mount = self.mount_of(url, ext);
        let entry = self.entries.borrow_mut().remove(&mount);
        if let Some(entry) = entry {
            entry.set_enabled(false);
            entry.disposing.set(true);
            entry.cache.stop();
            self.destroying.borrow_mut().insert(mount, entry);
        }
    }

    /// The async destroy task body: frees every unmounted entry.
    pub fn drive_destroy(&self) {
        self.destroying.borrow_mut().clear();
    }

    pub fn find(&self, mount: &str) -> Option<Rc<LiveEntry>> {
        self.entries.borrow().get(mount).cloned()
    }

    fn next_client_id(&self) -> String {
        let id = self.next_client_id.get() + 1;
        self.next_client_id.set(id);
        format!("http_{id}")
    }

    /// Serves one viewer request end to end: statistic registration,
    /// security check, `on_play` hooks, the stream loop, `on_stop` hooks,
    /// viewer removal. Hooks stay balanced even when the entry is disabled.
    pub fn serve_http(&self, w: &mut dyn ResponseWriter, r: &HttpMessage) -> Result<()> {
        let (app, stream, ext) = r
            .parse_stream_path()
            .ok_or(Error::ErrStreamNotFound)?;
        let url = StreamUrl::new("__defaultVhost__", &app, &stream);
        let entry = self.http_mount(&url, &ext)?;

        let client_id = self.next_client_id();
        let client_type = match ext.as_str() {
            "ts" => ClientType::TsPlay,
            "aac" => ClientType::AacPlay,
            "mp3" => ClientType::Mp3Play,
            _ => ClientType::FlvPlay,
        };
        self.stat.on_client(StatClient {
            id: client_id.clone(),
            vhost: url.vhost.clone(),
            app: url.app.clone(),
            stream: url.stream.clone(),
            typ: client_type,
            ip: String::new(),
        });
        entry.viewers.borrow_mut().push(client_id.clone());

        let hooks_enabled = self.config.get_vhost_http_hooks_enabled(&url.vhost);
        let on_play = if hooks_enabled {
            self.config.get_vhost_on_play(&url.vhost)
        } else {
            vec![]
        };
        let on_stop = if hooks_enabled {
            self.config.get_vhost_on_stop(&url.vhost)
        } else {
            vec![]
        };

        let stream_url = url.url();
        let mut play_err = None;
        for hook_url in &on_play {
            if let Err(e) = self.hooks.on_play(hook_url, &client_id, &stream_url) {
                warn!("http: on_play hook {hook_url} rejected: {e}");
                play_err = Some(e);
                break;
            }
        }

        let result = if let Some(e) = play_err {
            Err(e)
        } else if !entry.is_enabled() {
            Err(Error::ErrStreamNotFound)
        } else {
            self.stream_to(&entry, &ext, w)
        };

        // on_play/on_stop stay balanced on every path.
        for hook_url in &on_stop {
            if let Err(e) = self.hooks.on_stop(hook_url, &client_id, &stream_url) {
                warn!("http: on_stop hook {hook_url} failed: {e}");
            }
        }
        entry.viewers.borrow_mut().retain(|v| v != &client_id);
        self.stat.on_disconnect(&client_id);
        result
    }

    fn stream_to(
        &self,
        entry: &Rc<LiveEntry>,
        ext: &str,
        w: &mut dyn ResponseWriter,
    ) -> Result<()> {
        let mut encoder = StreamEncoder::for_ext(ext)?;
        w.header().set_content_type(encoder.content_type());
        w.header().set("Connection", "Close");
        w.write_header(200);

        if encoder.has_cache() && entry.cache.enabled() {
            entry.cache.dump_cache(&mut encoder, w)?;
        }

        let consumer = entry.source.create_consumer();
        while entry.is_enabled() {
            match consumer.dump() {
                Some(msg) => encoder.write_message(w, &msg)?,
                None => break,
            }
        }
        w.final_request()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::hooks::testutil::RecordingHooks;
    use crate::http::BufferResponseWriter;
    use bytes::Bytes;

    fn server_with(
        config: MemoryConfig,
    ) -> (HttpStreamServer<MemoryConfig>, Rc<RecordingHooks>, Rc<Statistic>) {
        let hooks = Rc::new(RecordingHooks::default());
        let stat = Rc::new(Statistic::new("srv", "svc", "1"));
        let server = HttpStreamServer::new(Rc::new(config), stat.clone(), hooks.clone());
        (server, hooks, stat)
    }

    fn video(ts: u32, keyframe: bool) -> MediaMessage {
        let first = if keyframe { 0x17 } else { 0x27 };
        MediaMessage {
            kind: MessageKind::Video,
            timestamp: ts,
            payload: Bytes::from(vec![first, 0x01, 0, 0, 0, 0xAA, 0xBB]),
        }
    }

    fn audio(ts: u32) -> MediaMessage {
        MediaMessage {
            kind: MessageKind::Audio,
            timestamp: ts,
            payload: Bytes::from(vec![0xAF, 0x01, 0x21, 0x22]),
        }
    }

    #[test]
    fn test_flv_encoder_writes_header_once() {
        let mut enc = FlvStreamEncoder::new();
        let mut w = BufferResponseWriter::new();

        enc.write_tag(&mut w, &video(0, true)).unwrap();
        enc.write_tag(&mut w, &audio(5)).unwrap();

        assert_eq!(&w.body[..3], b"FLV");
        assert_eq!(w.body[4], 0x05); // audio + video
        // Only one header.
        assert_eq!(w.body.windows(3).filter(|s| s == b"FLV").count(), 1);
        // First tag is video.
        assert_eq!(w.body[13], 9);
    }

    #[test]
    fn test_flv_guess_has_av_scans_batch() {
        let mut enc = FlvStreamEncoder::new();
        enc.set_guess_has_av(true);
        let mut w = BufferResponseWriter::new();

        // Video-only burst: audio flag must be off.
        enc.write_tags(&mut w, &[video(0, true), video(40, false)]).unwrap();
        assert_eq!(w.body[4], 0x01);
    }

    #[test]
    fn test_ts_encoder_cells_are_188_bytes() {
        let mut enc = TsStreamEncoder::new();
        let mut w = BufferResponseWriter::new();

        enc.write_message(&mut w, &video(0, true)).unwrap();
        enc.write_message(&mut w, &audio(20)).unwrap();

        assert!(!w.body.is_empty());
        assert_eq!(w.body.len() % TS_PACKET_SIZE, 0);
        // Every cell starts with the sync byte.
        for cell in w.body.chunks(TS_PACKET_SIZE) {
            assert_eq!(cell[0], 0x47);
        }
        // The first cell is the PAT.
        assert_eq!(u16::from_be_bytes([w.body[1], w.body[2]]) & 0x1FFF, PID_PAT);
    }

    #[test]
    fn test_aac_encoder_drops_video_and_emits_adts() {
        let mut enc = AacStreamEncoder::new();
        let mut w = BufferResponseWriter::new();

        // Video is dropped silently.
        enc.write_message(&mut w, &video(0, true)).unwrap();
        assert!(w.body.is_empty());

        // Sequence header arms the encoder, then frames carry ADTS.
        let sh = MediaMessage {
            kind: MessageKind::Audio,
            timestamp: 0,
            payload: Bytes::from(vec![0xAF, 0x00, 0x12, 0x10]),
        };
        enc.write_message(&mut w, &sh).unwrap();
        assert!(w.body.is_empty());

        enc.write_message(&mut w, &audio(10)).unwrap();
        assert_eq!(w.body.len(), 7 + 2);
        assert_eq!(w.body[0], 0xFF);
        assert_eq!(w.body[1] & 0xF0, 0xF0);
        // frame_length covers header + payload.
        let frame_len =
            ((w.body[3] as u32 & 0x03) << 11) | ((w.body[4] as u32) << 3) | (w.body[5] as u32 >> 5);
        assert_eq!(frame_len, 9);
    }

    #[test]
    fn test_mp3_encoder_audio_only() {
        let enc = Mp3StreamEncoder::new();
        let mut w = BufferResponseWriter::new();

        enc.write_message(&mut w, &video(0, true)).unwrap();
        assert!(w.body.is_empty());

        let frame = MediaMessage {
            kind: MessageKind::Audio,
            timestamp: 0,
            payload: Bytes::from(vec![0x2F, 0xFF, 0xFB, 0x90]),
        };
        enc.write_message(&mut w, &frame).unwrap();
        assert_eq!(w.body, vec![0xFF, 0xFB, 0x90]);
    }

    #[test]
    fn test_buffer_cache_window_and_stop() {
        let cache = BufferCache::new(Duration::from_secs(3));
        assert!(cache.enabled());
        assert!(cache.alive());

        cache.on_message(audio(0));
        cache.on_message(audio(1000));
        cache.on_message(audio(5000));
        // The 0 ms message fell out of the 3 s window.
        assert_eq!(cache.len(), 2);

        cache.stop();
        cache.stop(); // idempotent
        assert!(!cache.alive());
        cache.on_message(audio(6000));
        assert_eq!(cache.len(), 2);

        let disabled = BufferCache::new(Duration::ZERO);
        assert!(!disabled.enabled());
        disabled.on_message(audio(0));
        assert!(disabled.is_empty());
    }

    #[test]
    fn test_dynamic_mount_reuses_entry() {
        let (server, _hooks, _stat) = server_with(MemoryConfig::default());
        let url = StreamUrl::new("__defaultVhost__", "live", "s");

        let first = server.http_mount(&url, "flv").unwrap();
        let second = server.http_mount(&url, "flv").unwrap();
        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!(first.mount, "/__defaultVhost__/live/s.flv");
    }

    #[test]
    fn test_unmount_then_mount_is_disposing() {
        let (server, _hooks, _stat) = server_with(MemoryConfig::default());
        let url = StreamUrl::new("__defaultVhost__", "live", "s");

        let entry = server.http_mount(&url, "flv").unwrap();
        server.http_unmount(&url, "flv");
        assert!(entry.is_disposing());
        assert!(!entry.is_enabled());

        // Before the destroy task runs, a mount is rejected.
        assert!(matches!(
            server.http_mount(&url, "flv"),
            Err(Error::ErrStreamDisposing)
        ));

        // After it, mounting works again.
        server.drive_destroy();
        assert!(server.http_mount(&url, "flv").is_ok());
    }

    #[test]
    fn test_serve_streams_cached_gop() {
        let (server, _hooks, stat) = server_with(MemoryConfig::default());
        let url = StreamUrl::new("__defaultVhost__", "live", "s");
        let entry = server.http_mount(&url, "flv").unwrap();
        entry.source.on_publish();
        entry.source.on_message(video(0, true));
        entry.source.on_message(audio(10));

        let mut w = BufferResponseWriter::new();
        let req = HttpMessage::get("/live/s.flv");
        server.serve_http(&mut w, &req).unwrap();

        assert_eq!(w.header.content_type(), "video/x-flv");
        assert_eq!(w.header.get("Connection"), Some("Close"));
        assert_eq!(&w.body[..3], b"FLV");
        // Viewer came and went.
        assert_eq!(entry.nb_viewers(), 0);
        assert_eq!(stat.nb_clients(), 0);
    }

    #[test]
    fn test_serve_disabled_entry_balances_hooks() {
        let config = MemoryConfig {
            http_hooks_enabled: true,
            on_play: vec!["http://hooks/play".to_string()],
            on_stop: vec!["http://hooks/stop".to_string()],
            ..Default::default()
        };
        let (server, hooks, _stat) = server_with(config);
        let url = StreamUrl::new("__defaultVhost__", "live", "s");
        let entry = server.http_mount(&url, "flv").unwrap();
        entry.set_enabled(false);

        let mut w = BufferResponseWriter::new();
        let req = HttpMessage::get("/live/s.flv");
        let result = server.serve_http(&mut w, &req);

        assert_eq!(result, Err(Error::ErrStreamNotFound));
        // on_play and on_stop both fired exactly once.
        assert_eq!(hooks.plays.borrow().len(), 1);
        assert_eq!(hooks.stops.borrow().len(), 1);
    }

    #[test]
    fn test_on_play_rejection_still_balances() {
        let config = MemoryConfig {
            http_hooks_enabled: true,
            on_play: vec!["http://hooks/play".to_string()],
            on_stop: vec!["http://hooks/stop".to_string()],
            ..Default::default()
        };
        let (server, hooks, stat) = server_with(config);
        hooks.fail_on_play.set(true);

        let mut w = BufferResponseWriter::new();
        let req = HttpMessage::get("/live/s.flv");
        assert!(server.serve_http(&mut w, &req).is_err());

        assert_eq!(hooks.plays.borrow().len(), 1);
        assert_eq!(hooks.stops.borrow().len(), 1);
        assert_eq!(stat.nb_clients(), 0);
    }
}
