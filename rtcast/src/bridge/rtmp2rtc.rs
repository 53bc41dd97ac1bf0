//! RTMP→RTC bridge: extracts NALUs from FLV tags and packetizes them to
//! STAP-A/FU-A/raw RTP scheduled on the 90 kHz clock.

use bytes::Bytes;
use std::rc::Rc;

use rtp::codec::h264;
use rtp::packet::{FuA, Payload, RtpPacket, Stap};
use shared::error::{Error, Result};

use crate::source::{MediaMessage, RtcSource};

/// Per-MTU payload budget for one video packet.
const VIDEO_PAYLOAD_BUDGET: usize = 1200;

pub struct RtmpToRtcBridge {
    target: Rc<RtcSource>,
    video_ssrc: u32,
    audio_ssrc: u32,
    video_seq: u16,
    audio_seq: u16,
    pub nn_packets: u64,
}

impl RtmpToRtcBridge {
    pub fn new(target: Rc<RtcSource>) -> Self {
        Self {
            target,
            video_ssrc: rand::random(),
            audio_ssrc: rand::random(),
            video_seq: 0,
            audio_seq: 0,
            nn_packets: 0,
        }
    }

    pub fn video_ssrc(&self) -> u32 {
        self.video_ssrc
    }

    pub fn on_message(&mut self, msg: &MediaMessage) -> Result<()> {
        if msg.is_video() {
            self.on_video(msg)
        } else if msg.is_audio() {
            self.on_audio(msg)
        } else {
            Ok(())
        }
    }

    fn on_audio(&mut self, msg: &MediaMessage) -> Result<()> {
        if msg.payload.len() < 2 || msg.is_audio_sh() {
            return Ok(());
        }
        let rtp_ts = msg.timestamp.wrapping_mul(48); // 48 kHz clock
        let mut pkt = self.base_packet(
            rtp::FrameType::Audio,
            self.audio_ssrc,
            self.audio_seq,
            rtp_ts,
            true,
        );
        self.audio_seq = self.audio_seq.wrapping_add(1);
        pkt.payload = Payload::Raw(msg.payload.slice(2..));
        self.emit(pkt);
        Ok(())
    }

    /// Splits the tag body into NALUs, then packetizes: parameter sets
    /// aggregate into a STAP-A, small slices ride raw, large ones fragment
    /// into FU-A runs. The last packet of the frame carries the marker.
    fn on_video(&mut self, msg: &MediaMessage) -> Result<()> {
        if msg.is_video_sh() || msg.payload.len() < 5 {
            return Ok(());
        }
        let nalus = split_length_prefixed(&msg.payload.slice(5..))?;
        if nalus.is_empty() {
            return Ok(());
        }
        let rtp_ts = msg.timestamp.wrapping_mul(90);

        let mut param_sets: Vec<Bytes> = vec![];
        let mut slices: Vec<Bytes> = vec![];
        for n in nalus {
            match h264::nalu_type(n[0]) {
                h264::NALU_TYPE_SPS | h264::NALU_TYPE_PPS => param_sets.push(n),
                _ => slices.push(n),
            }
        }

        if !param_sets.is_empty() {
            let pkt_seq = self.next_video_seq();
            let mut pkt = self.base_packet(
                rtp::FrameType::Video,
                self.video_ssrc,
                pkt_seq,
                rtp_ts,
                false,
            );
            pkt.payload = Payload::StapA(Stap {
                nri: 0x60,
                nalus: param_sets,
            });
            self.emit(pkt);
        }

        let nn_slices = slices.len();
        for (i, nalu) in slices.into_iter().enumerate() {
            let frame_last = i + 1 == nn_slices;
            if nalu.len() <= VIDEO_PAYLOAD_BUDGET {
                let pkt_seq = self.next_video_seq();
                let mut pkt = self.base_packet(
                    rtp::FrameType::Video,
                    self.video_ssrc,
                    pkt_seq,
                    rtp_ts,
                    frame_last,
                );
                pkt.payload = Payload::Raw(nalu);
                self.emit(pkt);
                continue;
            }

            // Fragment: strip the one-byte NALU header, chunk the rest.
            let nri = nalu[0] & 0x60;
            let nalu_type = h264::nalu_type(nalu[0]);
            let body = nalu.slice(1..);
            let chunks: Vec<Bytes> = body
                .chunks(VIDEO_PAYLOAD_BUDGET)
                .map(Bytes::copy_from_slice)
                .collect();
            let nn_chunks = chunks.len();
            for (j, chunk) in chunks.into_iter().enumerate() {
                let start = j == 0;
                let end = j + 1 == nn_chunks;
                let pkt_seq = self.next_video_seq();
                let mut pkt = self.base_packet(
                    rtp::FrameType::Video,
                    self.video_ssrc,
                    pkt_seq,
                    rtp_ts,
                    frame_last && end,
                );
                pkt.payload = Payload::FuA(FuA {
                    nri,
                    start,
                    end,
                    nalu_type,
                    nalus: vec![chunk],
                });
                self.emit(pkt);
            }
        }
        Ok(())
    }

    fn next_video_seq(&mut self) -> u16 {
        let seq = self.video_seq;
        self.video_seq = self.video_seq.wrapping_add(1);
        seq
    }

    fn base_packet(
        &self,
        frame_type: rtp::FrameType,
        ssrc: u32,
        seq: u16,
        ts: u32,
        marker: bool,
    ) -> RtpPacket {
        let mut pkt = RtpPacket::new();
        pkt.frame_type = frame_type;
        pkt.header.ssrc = ssrc;
        pkt.header.sequence_number = seq;
        pkt.header.timestamp = ts;
        pkt.header.marker = marker;
        pkt
    }

    fn emit(&mut self, pkt: RtpPacket) {
        self.nn_packets += 1;
        self.target.on_rtp(&pkt);
    }
}

/// Splits a 4-byte-length-prefixed NALU stream.
fn split_length_prefixed(data: &Bytes) -> Result<Vec<Bytes>> {
    let mut out = vec![];
    let mut i = 0;
    while i + 4 <= data.len() {
        let len = u32::from_be_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]) as usize;
        i += 4;
        if len > data.len() - i {
            return Err(Error::ErrShortPacket);
        }
        if len > 0 {
            out.push(data.slice(i..i + len));
        }
        i += len;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{MessageKind, StreamUrl};
    use bytes::{BufMut, BytesMut};

    fn video_tag(nalus: &[&[u8]], keyframe: bool) -> MediaMessage {
        let mut payload = BytesMut::new();
        payload.put_u8(if keyframe { 0x17 } else { 0x27 });
        payload.put_u8(0x01);
        payload.put_slice(&[0, 0, 0]);
        for n in nalus {
            payload.put_u32(n.len() as u32);
            payload.put_slice(n);
        }
        MediaMessage {
            kind: MessageKind::Video,
            timestamp: 40,
            payload: payload.freeze(),
        }
    }

    #[test]
    fn test_parameter_sets_aggregate_into_stap() {
        let source = RtcSource::new(StreamUrl::new("v", "a", "s"));
        let consumer = source.create_consumer();
        let mut bridge = RtmpToRtcBridge::new(source);

        let sps = [0x67u8, 0x64, 0x00, 0x1F];
        let pps = [0x68u8, 0xEE];
        let idr = [0x65u8, 1, 2, 3];
        bridge
            .on_message(&video_tag(&[&sps, &pps, &idr], true))
            .unwrap();

        // STAP-A with both parameter sets, then the raw IDR with the marker.
        let first = consumer.dump().unwrap();
        match first.payload {
            Payload::StapA(s) => assert_eq!(s.nalus.len(), 2),
            other => panic!("unexpected payload {:?}", other.kind()),
        }
        assert!(!first.header.marker);

        let second = consumer.dump().unwrap();
        assert!(second.header.marker);
        assert_eq!(second.header.timestamp, 40 * 90);
        assert!(matches!(second.payload, Payload::Raw(_)));
    }

    #[test]
    fn test_large_nalu_fragments_into_fua() {
        let source = RtcSource::new(StreamUrl::new("v", "a", "s"));
        let consumer = source.create_consumer();
        let mut bridge = RtmpToRtcBridge::new(source);

        let mut idr = vec![0x65u8];
        idr.extend_from_slice(&vec![0xAB; 3000]);
        bridge.on_message(&video_tag(&[&idr], true)).unwrap();

        let mut starts = 0;
        let mut ends = 0;
        let mut total = 0;
        let mut markers = 0;
        while let Some(pkt) = consumer.dump() {
            if let Payload::FuA(f) = &pkt.payload {
                assert_eq!(f.nalu_type, h264::NALU_TYPE_IDR);
                if f.start {
                    starts += 1;
                }
                if f.end {
                    ends += 1;
                }
                total += f.nalus.iter().map(|n| n.len()).sum::<usize>();
            }
            if pkt.header.marker {
                markers += 1;
            }
        }
        assert_eq!(starts, 1);
        assert_eq!(ends, 1);
        assert_eq!(markers, 1);
        assert_eq!(total, 3000);
    }

    #[test]
    fn test_sequence_numbers_are_continuous() {
        let source = RtcSource::new(StreamUrl::new("v", "a", "s"));
        let consumer = source.create_consumer();
        let mut bridge = RtmpToRtcBridge::new(source);

        bridge.on_message(&video_tag(&[&[0x41, 1]], false)).unwrap();
        bridge.on_message(&video_tag(&[&[0x41, 2]], false)).unwrap();

        let a = consumer.dump().unwrap();
        let b = consumer.dump().unwrap();
        assert_eq!(
            b.header.sequence_number,
            a.header.sequence_number.wrapping_add(1)
        );
    }

    #[test]
    fn test_sequence_header_tag_skipped() {
        let source = RtcSource::new(StreamUrl::new("v", "a", "s"));
        let consumer = source.create_consumer();
        let mut bridge = RtmpToRtcBridge::new(source);

        let sh = MediaMessage {
            kind: MessageKind::Video,
            timestamp: 0,
            payload: Bytes::from(vec![0x17, 0x00, 0, 0, 0, 1, 2, 3]),
        };
        bridge.on_message(&sh).unwrap();
        assert!(consumer.dump().is_none());
    }
}
