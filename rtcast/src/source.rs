//! In-memory pub/sub stream sources: one publisher, many consumers, a GOP
//! cache anchored at the most recent keyframe, and replay of cached
//! sequence headers for late joiners.

use bytes::Bytes;
use log::debug;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use rtp::RtpPacket;

/// Media frame classification in the FLV/RTMP domain.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Audio,
    Video,
    Metadata,
}

/// One FLV-shaped media message: tag payload plus a millisecond timestamp.
#[derive(Debug, Clone)]
pub struct MediaMessage {
    pub kind: MessageKind,
    pub timestamp: u32,
    pub payload: Bytes,
}

impl MediaMessage {
    pub fn is_audio(&self) -> bool {
        self.kind == MessageKind::Audio
    }

    pub fn is_video(&self) -> bool {
        self.kind == MessageKind::Video
    }

    pub fn is_metadata(&self) -> bool {
        self.kind == MessageKind::Metadata
    }

    /// FLV video tag: high nibble 1 marks a keyframe.
    pub fn is_video_keyframe(&self) -> bool {
        self.is_video() && !self.payload.is_empty() && self.payload[0] >> 4 == 1
    }

    /// AVC/HEVC sequence header: keyframe with packet type 0.
    pub fn is_video_sh(&self) -> bool {
        self.is_video_keyframe() && self.payload.len() > 1 && self.payload[1] == 0
    }

    /// AAC sequence header: AAC tag with packet type 0.
    pub fn is_audio_sh(&self) -> bool {
        self.is_audio()
            && self.payload.len() > 1
            && self.payload[0] >> 4 == 10
            && self.payload[1] == 0
    }
}

/// Hierarchical stream address, e.g. `live.example.com/live/cam1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamUrl {
    pub vhost: String,
    pub app: String,
    pub stream: String,
}

impl StreamUrl {
    pub fn new(vhost: &str, app: &str, stream: &str) -> Self {
        Self {
            vhost: vhost.to_string(),
            app: app.to_string(),
            stream: stream.to_string(),
        }
    }

    pub fn url(&self) -> String {
        format!("{}/{}/{}", self.vhost, self.app, self.stream)
    }
}

/// A consumer's private cursor over the live stream. The publisher never
/// observes consumer state.
pub struct MediaConsumer {
    queue: RefCell<VecDeque<MediaMessage>>,
}

impl MediaConsumer {
    fn new() -> Rc<Self> {
        Rc::new(Self {
            queue: RefCell::new(VecDeque::new()),
        })
    }

    pub fn enqueue(&self, msg: MediaMessage) {
        self.queue.borrow_mut().push_back(msg);
    }

    pub fn dump(&self) -> Option<MediaMessage> {
        self.queue.borrow_mut().pop_front()
    }

    pub fn dump_all(&self) -> Vec<MediaMessage> {
        self.queue.borrow_mut().drain(..).collect()
    }

    pub fn size(&self) -> usize {
        self.queue.borrow().len()
    }
}

const DEFAULT_GOP_CACHE_MAX: usize = 2048;

/// Single-publisher, many-consumer live stream in the FLV domain.
pub struct LiveSource {
    pub url: StreamUrl,
    metadata: RefCell<Option<MediaMessage>>,
    audio_sh: RefCell<Option<MediaMessage>>,
    video_sh: RefCell<Option<MediaMessage>>,
    gop_cache: RefCell<VecDeque<MediaMessage>>,
    gop_cache_max: usize,
    consumers: RefCell<Vec<Weak<MediaConsumer>>>,
    publishing: Cell<bool>,
}

impl LiveSource {
    pub fn new(url: StreamUrl) -> Rc<Self> {
        Rc::new(Self {
            url,
            metadata: RefCell::new(None),
            audio_sh: RefCell::new(None),
            video_sh: RefCell::new(None),
            gop_cache: RefCell::new(VecDeque::new()),
            gop_cache_max: DEFAULT_GOP_CACHE_MAX,
            consumers: RefCell::new(vec![]),
            publishing: Cell::new(false),
        })
    }

    pub fn on_publish(&self) {
        self.publishing.set(true);
    }

    pub fn on_unpublish(&self) {
        self.publishing.set(false);
        self.gop_cache.borrow_mut().clear();
    }

    pub fn is_publishing(&self) -> bool {
        self.publishing.get()
    }

    pub fn nb_consumers(&self) -> usize {
        self.consumers.borrow().iter().filter(|w| w.strong_count() > 0).count()
    }

    /// Publishes one message: caches headers/metadata, maintains the GOP
    /// window, and fans out to every live consumer in publish order.
    pub fn on_message(&self, msg: MediaMessage) {
        if msg.is_metadata() {
            *self.metadata.borrow_mut() = Some(msg.clone());
        } else if msg.is_audio_sh() {
            *self.audio_sh.borrow_mut() = Some(msg.clone());
        } else if msg.is_video_sh() {
            *self.video_sh.borrow_mut() = Some(msg.clone());
        } else {
            let mut gop = self.gop_cache.borrow_mut();
            if msg.is_video_keyframe() {
                // The window restarts at every keyframe.
                gop.clear();
            }
            if gop.len() >= self.gop_cache_max {
                gop.pop_front();
            }
            gop.push_back(msg.clone());
        }

        let mut consumers = self.consumers.borrow_mut();
        consumers.retain(|w| w.strong_count() > 0);
        for weak in consumers.iter() {
            if let Some(c) = weak.upgrade() {
                c.enqueue(msg.clone());
            }
        }
    }

    /// Attaches a consumer; cached sequence headers and metadata are
    /// replayed before any live frame, then the GOP window.
    pub fn create_consumer(&self) -> Rc<MediaConsumer> {
        let consumer = MediaConsumer::new();

        if let Some(meta) = self.metadata.borrow().as_ref() {
            consumer.enqueue(meta.clone());
        }
        if let Some(sh) = self.audio_sh.borrow().as_ref() {
            consumer.enqueue(sh.clone());
        }
        if let Some(sh) = self.video_sh.borrow().as_ref() {
            consumer.enqueue(sh.clone());
        }
        for msg in self.gop_cache.borrow().iter() {
            consumer.enqueue(msg.clone());
        }

        debug!(
            "source {}: attach consumer, replayed {} cached messages",
            self.url.url(),
            consumer.size()
        );
        self.consumers.borrow_mut().push(Rc::downgrade(&consumer));
        consumer
    }
}

/// A consumer of raw RTP packets from an RTC publisher.
pub struct RtcConsumer {
    queue: RefCell<VecDeque<RtpPacket>>,
}

impl RtcConsumer {
    fn new() -> Rc<Self> {
        Rc::new(Self {
            queue: RefCell::new(VecDeque::new()),
        })
    }

    pub fn enqueue(&self, pkt: RtpPacket) {
        self.queue.borrow_mut().push_back(pkt);
    }

    pub fn dump(&self) -> Option<RtpPacket> {
        self.queue.borrow_mut().pop_front()
    }

    pub fn size(&self) -> usize {
        self.queue.borrow().len()
    }
}

/// RTP-domain source: the RTC publish stream writes packets here; RTC play
/// streams and the RTC→RTMP bridge consume them.
pub struct RtcSource {
    pub url: StreamUrl,
    consumers: RefCell<Vec<Weak<RtcConsumer>>>,
}

impl RtcSource {
    pub fn new(url: StreamUrl) -> Rc<Self> {
        Rc::new(Self {
            url,
            consumers: RefCell::new(vec![]),
        })
    }

    pub fn on_rtp(&self, pkt: &RtpPacket) {
        let mut consumers = self.consumers.borrow_mut();
        consumers.retain(|w| w.strong_count() > 0);
        for weak in consumers.iter() {
            if let Some(c) = weak.upgrade() {
                c.enqueue(pkt.clone());
            }
        }
    }

    pub fn create_consumer(&self) -> Rc<RtcConsumer> {
        let consumer = RtcConsumer::new();
        self.consumers.borrow_mut().push(Rc::downgrade(&consumer));
        consumer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video(ts: u32, keyframe: bool) -> MediaMessage {
        let first = if keyframe { 0x17 } else { 0x27 };
        MediaMessage {
            kind: MessageKind::Video,
            timestamp: ts,
            payload: Bytes::from(vec![first, 0x01, 0, 0, 0, 0xAA]),
        }
    }

    fn video_sh() -> MediaMessage {
        MediaMessage {
            kind: MessageKind::Video,
            timestamp: 0,
            payload: Bytes::from(vec![0x17, 0x00, 0, 0, 0, 0x01, 0x64]),
        }
    }

    fn audio_sh() -> MediaMessage {
        MediaMessage {
            kind: MessageKind::Audio,
            timestamp: 0,
            payload: Bytes::from(vec![0xAF, 0x00, 0x12, 0x10]),
        }
    }

    fn audio(ts: u32) -> MediaMessage {
        MediaMessage {
            kind: MessageKind::Audio,
            timestamp: ts,
            payload: Bytes::from(vec![0xAF, 0x01, 0xBB]),
        }
    }

    #[test]
    fn test_consumer_gets_headers_before_live() {
        let source = LiveSource::new(StreamUrl::new("__defaultVhost__", "live", "cam1"));
        source.on_publish();

        source.on_message(audio_sh());
        source.on_message(video_sh());
        source.on_message(video(40, true));
        source.on_message(audio(45));

        let consumer = source.create_consumer();
        // audio sh, video sh, then the GOP from the keyframe.
        let replay = consumer.dump_all();
        assert_eq!(replay.len(), 4);
        assert!(replay[0].is_audio_sh());
        assert!(replay[1].is_video_sh());
        assert!(replay[2].is_video_keyframe());
        assert!(replay[3].is_audio());
    }

    #[test]
    fn test_gop_cache_restarts_at_keyframe() {
        let source = LiveSource::new(StreamUrl::new("v", "a", "s"));
        source.on_publish();

        source.on_message(video(0, true));
        source.on_message(video(40, false));
        source.on_message(video(80, false));
        // New keyframe restarts the window.
        source.on_message(video(120, true));
        source.on_message(video(160, false));

        let consumer = source.create_consumer();
        let replay = consumer.dump_all();
        assert_eq!(replay.len(), 2);
        assert_eq!(replay[0].timestamp, 120);
        assert_eq!(replay[1].timestamp, 160);
    }

    #[test]
    fn test_fan_out_preserves_order_per_consumer() {
        let source = LiveSource::new(StreamUrl::new("v", "a", "s"));
        source.on_publish();

        let c1 = source.create_consumer();
        let c2 = source.create_consumer();

        source.on_message(video(0, true));
        source.on_message(audio(5));
        source.on_message(video(40, false));

        for c in [&c1, &c2] {
            let msgs = c.dump_all();
            assert_eq!(msgs.len(), 3);
            assert_eq!(msgs[0].timestamp, 0);
            assert_eq!(msgs[1].timestamp, 5);
            assert_eq!(msgs[2].timestamp, 40);
        }
    }

    #[test]
    fn test_dropped_consumer_is_pruned() {
        let source = LiveSource::new(StreamUrl::new("v", "a", "s"));
        let c1 = source.create_consumer();
        {
            let _c2 = source.create_consumer();
        }
        source.on_message(video(0, true));
        assert_eq!(source.nb_consumers(), 1);
        assert_eq!(c1.size(), 1);
    }

    #[test]
    fn test_rtc_source_fan_out() {
        let source = RtcSource::new(StreamUrl::new("v", "a", "s"));
        let consumer = source.create_consumer();

        let mut pkt = RtpPacket::new();
        pkt.header.sequence_number = 3;
        source.on_rtp(&pkt);

        assert_eq!(consumer.size(), 1);
        assert_eq!(consumer.dump().unwrap().header.sequence_number, 3);
    }
}
