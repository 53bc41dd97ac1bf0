//! Track descriptions and the receive/send track machinery.

use bytes::BytesMut;
use std::collections::BTreeMap;
use std::time::Instant;

use rtp::codec::Codec;
use rtp::jitter::{SeqJitter, TsJitter};
use rtp::nack::{NackOptions, NackState};
use rtp::ring::RtpRing;
use rtp::rtcp::Nack;
use rtp::RtpPacket;
use shared::error::Result;

use crate::source::RtcSource;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Direction {
    Sendonly,
    Recvonly,
    Sendrecv,
    #[default]
    Inactive,
}

/// Codec payload of a track: type, clock and format parameters.
#[derive(Debug, Clone)]
pub struct PayloadDesc {
    pub pt: u8,
    pub codec: Codec,
    pub clock_rate: u32,
    pub channels: u8,
    pub fmtp: String,
}

impl PayloadDesc {
    pub fn opus(pt: u8) -> Self {
        Self {
            pt,
            codec: Codec::Opus,
            clock_rate: 48000,
            channels: 2,
            fmtp: String::new(),
        }
    }

    pub fn h264(pt: u8) -> Self {
        Self {
            pt,
            codec: Codec::H264,
            clock_rate: 90000,
            channels: 0,
            fmtp: String::new(),
        }
    }
}

/// Generates the Opus `fmtp` line. When `minptime` is unset the output
/// keeps its historical leading `;` (`;useinbandfec=1`), which remote peers
/// have long accepted; tests lock the string.
pub fn opus_fmtp(minptime: Option<u32>, useinbandfec: bool) -> String {
    let mut fmtp = String::new();
    if let Some(m) = minptime {
        fmtp.push_str(&format!("minptime={m}"));
    }
    if useinbandfec {
        fmtp.push_str(";useinbandfec=1");
    }
    fmtp
}

/// Description of one negotiated track.
#[derive(Debug, Clone)]
pub struct TrackDescription {
    pub kind: TrackKind,
    pub id: String,
    pub ssrc: u32,
    pub rtx_ssrc: Option<u32>,
    pub fec_ssrc: Option<u32>,
    pub direction: Direction,
    pub mid: String,
    pub media: Option<PayloadDesc>,
    pub red: Option<PayloadDesc>,
    pub rtx: Option<PayloadDesc>,
    pub extmaps: BTreeMap<u8, String>,
    /// Tracks default to inactive until the stream flips them on.
    pub is_active: bool,
}

impl TrackDescription {
    pub fn audio(id: &str, ssrc: u32) -> Self {
        Self {
            kind: TrackKind::Audio,
            id: id.to_string(),
            ssrc,
            rtx_ssrc: None,
            fec_ssrc: None,
            direction: Direction::default(),
            mid: String::new(),
            media: Some(PayloadDesc::opus(111)),
            red: None,
            rtx: None,
            extmaps: BTreeMap::new(),
            is_active: false,
        }
    }

    pub fn video(id: &str, ssrc: u32) -> Self {
        Self {
            kind: TrackKind::Video,
            id: id.to_string(),
            ssrc,
            rtx_ssrc: None,
            fec_ssrc: None,
            direction: Direction::default(),
            mid: String::new(),
            media: Some(PayloadDesc::h264(106)),
            red: None,
            rtx: None,
            extmaps: BTreeMap::new(),
            is_active: false,
        }
    }

    pub fn codec(&self) -> Codec {
        self.media.as_ref().map(|m| m.codec).unwrap_or(Codec::Opus)
    }

    pub fn clock_rate(&self) -> u32 {
        self.media.as_ref().map(|m| m.clock_rate).unwrap_or(90000)
    }
}

/// Receive track: feeds NACK state, computes the keyframe flag and the
/// absolute timestamp from Sender Reports, and forwards to the bound
/// source.
pub struct RecvTrack {
    pub desc: TrackDescription,
    nack: NackState,
    sender_ssrc: u32,
    /// Latest and previous Sender Report samples `(ntp_ms, rtp_ts)`.
    last_sr: Option<(u64, u32)>,
    prev_sr: Option<(u64, u32)>,
    pub nn_packets: u64,
}

impl RecvTrack {
    pub fn new(desc: TrackDescription) -> Self {
        Self {
            desc,
            nack: NackState::new(NackOptions::default()),
            sender_ssrc: rand::random(),
            last_sr: None,
            prev_sr: None,
            nn_packets: 0,
        }
    }

    pub fn track_status(&self) -> bool {
        self.desc.is_active
    }

    pub fn set_track_status(&mut self, active: bool) {
        self.desc.is_active = active;
    }

    pub fn has_ssrc(&self, ssrc: u32) -> bool {
        self.desc.ssrc == ssrc
            || self.desc.rtx_ssrc == Some(ssrc)
            || self.desc.fec_ssrc == Some(ssrc)
    }

    /// Stores one Sender Report sample. Duplicates (peer retransmissions)
    /// keep the existing pair so the mapping never degenerates.
    pub fn on_sender_report(&mut self, ntp_ms: u64, rtp_ts: u32) {
        if let Some((_, last_ts)) = self.last_sr {
            if last_ts == rtp_ts {
                return;
            }
        }
        self.prev_sr = self.last_sr;
        self.last_sr = Some((ntp_ms, rtp_ts));
    }

    /// Absolute milliseconds for an RTP timestamp; -1 until two distinct
    /// Sender Reports have arrived.
    pub fn avsync_time(&self, rtp_ts: u32) -> i64 {
        let (Some((ntp2, ts2)), Some((ntp1, ts1))) = (self.last_sr, self.prev_sr) else {
            return -1;
        };

        let rtp_elapsed = ts2.wrapping_sub(ts1) as i32 as f64;
        if rtp_elapsed == 0.0 {
            return -1;
        }
        let sys_elapsed = ntp2 as i64 - ntp1 as i64;
        let rate = sys_elapsed as f64 / rtp_elapsed;

        let delta = rtp_ts.wrapping_sub(ts2) as i32 as f64;
        (ntp2 as f64 + delta * rate).round() as i64
    }

    /// Inbound RTP for this track: updates NACK state, stamps the avsync
    /// time, and forwards to the source. Inactive tracks drop inbound.
    pub fn on_rtp(&mut self, source: &RtcSource, pkt: &mut RtpPacket, now: Instant) {
        pkt.avsync_time = self.avsync_time(pkt.header.timestamp);
        if !self.desc.is_active {
            return;
        }
        self.nn_packets += 1;
        self.nack.on_rtp(pkt.header.sequence_number, now);
        source.on_rtp(pkt);
    }

    /// Timer tick: emits a NACK request when gaps are due.
    pub fn tick_nack(&mut self, now: Instant) -> Option<Nack> {
        let due = self.nack.tick(now);
        if due.is_empty() {
            return None;
        }
        let mut nack = Nack::new(self.sender_ssrc);
        nack.media_ssrc = self.desc.ssrc;
        for sn in due {
            nack.add_lost_sn(sn);
        }
        Some(nack)
    }

    pub fn timeout_nacks(&self) -> u64 {
        self.nack.timeout_nacks
    }
}

const SEND_RING_CAPACITY: usize = 1024;

/// Send track: rewrites sequence/timestamp/SSRC on the way out and keeps
/// the retransmission ring.
pub struct SendTrack {
    pub desc: TrackDescription,
    ring: RtpRing,
    seq_jitter: SeqJitter,
    ts_jitter: TsJitter,
    /// Transfer ring ownership on NACK resend instead of cloning.
    pub nack_no_copy: bool,
    pub nn_sent: u64,
}

impl SendTrack {
    pub fn new(desc: TrackDescription) -> Self {
        let ts_threshold = match desc.kind {
            TrackKind::Video => 90 * 3 * 1000,
            TrackKind::Audio => desc.clock_rate() * 3,
        };
        Self {
            ring: RtpRing::new(SEND_RING_CAPACITY),
            seq_jitter: SeqJitter::new(0),
            ts_jitter: TsJitter::with_threshold(0, ts_threshold),
            nack_no_copy: false,
            nn_sent: 0,
            desc,
        }
    }

    pub fn track_status(&self) -> bool {
        self.desc.is_active
    }

    pub fn set_track_status(&mut self, active: bool) {
        self.desc.is_active = active;
    }

    /// Rewrites and serializes one packet for this track. Inactive tracks
    /// emit nothing.
    pub fn on_packet(&mut self, pkt: &mut RtpPacket) -> Result<Option<BytesMut>> {
        if !self.desc.is_active {
            return Ok(None);
        }

        pkt.header.sequence_number = self.seq_jitter.correct(pkt.header.sequence_number);
        pkt.header.timestamp = self.ts_jitter.correct(pkt.header.timestamp);
        pkt.header.ssrc = self.desc.ssrc;

        let wire = pkt.marshal()?;
        self.ring.set(pkt.header.sequence_number, pkt.clone());
        self.nn_sent += 1;
        Ok(Some(wire))
    }

    /// Exact-sequence lookup into the retransmission ring.
    pub fn fetch_rtp_packet(&self, seq: u16) -> Option<&RtpPacket> {
        self.ring.fetch_exact(seq)
    }

    pub fn ring_set(&mut self, seq: u16, pkt: RtpPacket) {
        self.ring.set(seq, pkt);
    }

    pub fn ring_at(&self, seq: u16) -> Option<&RtpPacket> {
        self.ring.at(seq)
    }

    /// Answers a NACK: returns the wire form of every packet found in the
    /// ring, flagged RTX when an RTX payload is configured.
    pub fn on_recv_nack(&mut self, lost_sns: &[u16]) -> Result<Vec<(BytesMut, bool)>> {
        let is_rtx = self.desc.rtx.is_some() && self.desc.rtx_ssrc.is_some();
        let mut out = vec![];
        for &sn in lost_sns {
            if self.nack_no_copy {
                if let Some(pkt) = self.ring.take_exact(sn) {
                    out.push((pkt.marshal()?, is_rtx));
                }
            } else if let Some(pkt) = self.ring.fetch_exact(sn) {
                out.push((pkt.marshal()?, is_rtx));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::StreamUrl;
    use rtp::ntp::Ntp;

    #[test]
    fn test_track_defaults_inactive() {
        let desc = TrackDescription::video("VMo22nfLDn122nfnDNL2", 200);
        assert!(!desc.is_active);

        let recv = RecvTrack::new(TrackDescription::audio("NSNWOn19NDn12o8nNeji2", 100));
        assert!(!recv.track_status());

        let send = SendTrack::new(TrackDescription::video("VMo22nfLDn122nfnDNL2", 200));
        assert!(!send.track_status());
    }

    #[test]
    fn test_opus_fmtp_without_minptime_keeps_leading_separator() {
        assert_eq!(opus_fmtp(None, true), ";useinbandfec=1");
        assert_eq!(opus_fmtp(Some(10), true), "minptime=10;useinbandfec=1");
        assert_eq!(opus_fmtp(Some(10), false), "minptime=10");
    }

    fn sync_track() -> RecvTrack {
        let mut desc = TrackDescription::video("VMo22nfLDn122nfnDNL2", 200);
        desc.is_active = true;
        RecvTrack::new(desc)
    }

    #[test]
    fn test_avsync_normal() {
        let mut track = sync_track();
        let source = RtcSource::new(StreamUrl::new("v", "a", "s"));
        let now = Instant::now();

        let mut abs_ms: u64 = 1_700_000_000_000;
        let mut rtp_ts: u32 = 123_456;

        let mut pkt = RtpPacket::new();
        pkt.header.timestamp = rtp_ts;
        track.on_rtp(&source, &mut pkt, now);
        // No sender report yet.
        assert_eq!(pkt.avsync_time, -1);

        track.on_sender_report(Ntp::from_time_ms(abs_ms).system_ms, rtp_ts);

        // 90 kHz, 25 fps.
        rtp_ts += 3600;
        abs_ms += 40;
        pkt.header.timestamp = rtp_ts;
        track.on_rtp(&source, &mut pkt, now);
        // One sender report is not enough.
        assert_eq!(pkt.avsync_time, -1);

        track.on_sender_report(Ntp::from_time_ms(abs_ms).system_ms, rtp_ts);

        for _ in 0..=1000 {
            rtp_ts += 3600;
            abs_ms += 40;
            pkt.header.timestamp = rtp_ts;
            track.on_rtp(&source, &mut pkt, now);
            assert!((pkt.avsync_time - abs_ms as i64).abs() <= 1);
        }
    }

    #[test]
    fn test_avsync_out_of_order_sr() {
        let mut track = sync_track();
        let source = RtcSource::new(StreamUrl::new("v", "a", "s"));
        let now = Instant::now();

        let mut abs_ms: u64 = 1_700_000_000_000;
        let mut rtp_ts: u32 = 1_000_000;

        let sr1 = (abs_ms, rtp_ts);
        rtp_ts += 3600;
        abs_ms += 40;
        let sr2 = (abs_ms, rtp_ts);

        // sr2 arrives before sr1.
        track.on_sender_report(sr2.0, sr2.1);
        track.on_sender_report(sr1.0, sr1.1);

        let mut pkt = RtpPacket::new();
        for _ in 0..=1000 {
            rtp_ts += 3600;
            abs_ms += 40;
            pkt.header.timestamp = rtp_ts;
            track.on_rtp(&source, &mut pkt, now);
            assert!((pkt.avsync_time - abs_ms as i64).abs() <= 1);
        }
    }

    #[test]
    fn test_avsync_duplicated_sr() {
        let mut track = sync_track();
        let source = RtcSource::new(StreamUrl::new("v", "a", "s"));
        let now = Instant::now();

        let mut abs_ms: u64 = 1_700_000_000_000;
        let mut rtp_ts: u32 = 5_000;

        track.on_sender_report(abs_ms, rtp_ts);
        rtp_ts += 3600;
        abs_ms += 40;
        track.on_sender_report(abs_ms, rtp_ts);

        let mut pkt = RtpPacket::new();
        for i in 0..=1000u32 {
            rtp_ts += 3600;
            abs_ms += 40;
            pkt.header.timestamp = rtp_ts;
            track.on_rtp(&source, &mut pkt, now);
            assert!((pkt.avsync_time - abs_ms as i64).abs() <= 1);

            // The same report is delivered again and again; every third
            // iteration it is refreshed.
            if i % 3 == 0 {
                track.on_sender_report(abs_ms, rtp_ts);
            }
            track.on_sender_report(abs_ms, rtp_ts);
        }
    }

    #[test]
    fn test_inactive_recv_track_drops() {
        let mut track = RecvTrack::new(TrackDescription::video("t", 200));
        let source = RtcSource::new(StreamUrl::new("v", "a", "s"));
        let consumer = source.create_consumer();

        let mut pkt = RtpPacket::new();
        track.on_rtp(&source, &mut pkt, Instant::now());
        assert_eq!(consumer.size(), 0);

        track.set_track_status(true);
        track.on_rtp(&source, &mut pkt, Instant::now());
        assert_eq!(consumer.size(), 1);
    }

    #[test]
    fn test_send_track_rewrites_and_rings() {
        let mut desc = TrackDescription::video("t", 0xDDDD);
        desc.is_active = true;
        let mut track = SendTrack::new(desc);

        let mut pkt = RtpPacket::new();
        pkt.header.sequence_number = 5000;
        pkt.header.timestamp = 90_000;
        pkt.header.ssrc = 0x1111;
        pkt.payload = rtp::Payload::Raw(bytes::Bytes::from_static(&[1, 2, 3]));

        let wire = track.on_packet(&mut pkt).unwrap().unwrap();
        assert!(!wire.is_empty());
        assert_eq!(pkt.header.ssrc, 0xDDDD);
        // Jitter correctors re-base the first packet to zero.
        assert_eq!(pkt.header.sequence_number, 0);
        assert_eq!(pkt.header.timestamp, 0);

        // The ring answers exact fetches only.
        assert!(track.fetch_rtp_packet(0).is_some());
        assert!(track.fetch_rtp_packet(1024).is_none());
    }

    #[test]
    fn test_send_track_nack_no_copy_transfers_ownership() {
        let mut desc = TrackDescription::video("t", 0xDDDD);
        desc.is_active = true;
        let mut track = SendTrack::new(desc);
        track.nack_no_copy = true;

        let mut pkt = RtpPacket::new();
        pkt.header.sequence_number = 77;
        track.ring_set(77, pkt);

        let resends = track.on_recv_nack(&[77]).unwrap();
        assert_eq!(resends.len(), 1);
        // Ownership transferred out of the ring.
        assert!(track.ring_at(77).is_none());
    }
}
