//! RTC→RTMP bridge: consumes RTP from an RTC source, reassembles
//! H.264/H.265/AAC, and publishes FLV-shaped messages to a live source.

use bytes::{BufMut, Bytes, BytesMut};
use log::debug;
use std::rc::Rc;

use rtp::codec::{h264, h265, Codec};
use rtp::packet::{Payload, RtpPacket};
use shared::error::Result;

use super::frame::{packet_payload_size, write_packet_payload};
use crate::source::{LiveSource, MediaMessage, MessageKind, RtcConsumer};

const FLV_AVC: u8 = 7;
const FLV_HEVC: u8 = 12;

pub struct RtcToRtmpBridge {
    consumer: Rc<RtcConsumer>,
    target: Rc<LiveSource>,
    video_codec: Codec,

    /// Packets of the frame being assembled, in arrival order.
    frame_packets: Vec<RtpPacket>,
    sps: Option<Bytes>,
    pps: Option<Bytes>,
    vps: Option<Bytes>,
    video_sh_sent: bool,
    audio_sh_sent: bool,
    pub nn_frames: u64,
    pub nn_dropped_frames: u64,
}

impl RtcToRtmpBridge {
    pub fn new(consumer: Rc<RtcConsumer>, target: Rc<LiveSource>, video_codec: Codec) -> Self {
        Self {
            consumer,
            target,
            video_codec,
            frame_packets: vec![],
            sps: None,
            pps: None,
            vps: None,
            video_sh_sent: false,
            audio_sh_sent: false,
            nn_frames: 0,
            nn_dropped_frames: 0,
        }
    }

    /// Drains the consumer queue; the event loop calls this per tick.
    pub fn cycle(&mut self) -> Result<()> {
        while let Some(pkt) = self.consumer.dump() {
            self.on_rtp(pkt)?;
        }
        Ok(())
    }

    pub fn on_rtp(&mut self, pkt: RtpPacket) -> Result<()> {
        match pkt.frame_type {
            rtp::FrameType::Audio => self.on_audio(pkt),
            _ => self.on_video(pkt),
        }
    }

    /// Audio arrives as ADTS frames; the first one derives the AAC
    /// sequence header.
    fn on_audio(&mut self, pkt: RtpPacket) -> Result<()> {
        let Payload::Raw(adts) = &pkt.payload else {
            return Ok(());
        };
        if adts.len() < 7 || adts[0] != 0xFF || adts[1] & 0xF0 != 0xF0 {
            return Ok(());
        }

        let timestamp = to_ms(&pkt);
        if !self.audio_sh_sent {
            let asc = adts_to_asc(adts);
            let mut payload = BytesMut::with_capacity(2 + asc.len());
            payload.put_slice(&[0xAF, 0x00]);
            payload.put_slice(&asc);
            self.target.on_message(MediaMessage {
                kind: MessageKind::Audio,
                timestamp,
                payload: payload.freeze(),
            });
            self.audio_sh_sent = true;
        }

        // Protection-absent header is 7 bytes.
        let mut payload = BytesMut::with_capacity(2 + adts.len() - 7);
        payload.put_slice(&[0xAF, 0x01]);
        payload.put_slice(&adts[7..]);
        self.target.on_message(MediaMessage {
            kind: MessageKind::Audio,
            timestamp,
            payload: payload.freeze(),
        });
        Ok(())
    }

    fn on_video(&mut self, pkt: RtpPacket) -> Result<()> {
        self.collect_parameter_sets(&pkt);

        let marker = pkt.header.marker;
        self.frame_packets.push(pkt);
        if marker {
            self.packet_video_frame()?;
        }
        Ok(())
    }

    fn collect_parameter_sets(&mut self, pkt: &RtpPacket) {
        let nalus: Vec<Bytes> = match &pkt.payload {
            Payload::Raw(b) if !b.is_empty() => vec![b.clone()],
            Payload::StapA(s) | Payload::StapHevc(s) => s.nalus.clone(),
            _ => vec![],
        };
        for n in nalus.into_iter().filter(|n| !n.is_empty()) {
            match self.video_codec {
                Codec::H265 => match h265::nalu_type(n[0]) {
                    h265::NALU_TYPE_VPS => self.vps = Some(n),
                    h265::NALU_TYPE_SPS => self.sps = Some(n),
                    h265::NALU_TYPE_PPS => self.pps = Some(n),
                    _ => {}
                },
                _ => match h264::nalu_type(n[0]) {
                    h264::NALU_TYPE_SPS => self.sps = Some(n),
                    h264::NALU_TYPE_PPS => self.pps = Some(n),
                    _ => {}
                },
            }
        }
    }

    /// Assembles the collected packets into one FLV video tag. A frame
    /// whose computed payload size is zero is skipped without emitting an
    /// empty message; assembly continues with the next range.
    fn packet_video_frame(&mut self) -> Result<()> {
        let packets = std::mem::take(&mut self.frame_packets);
        if packets.is_empty() {
            return Ok(());
        }

        let total: usize = packets.iter().map(packet_payload_size).sum();
        if total == 0 {
            self.nn_dropped_frames += 1;
            return Ok(());
        }

        let keyframe = packets.iter().any(|p| p.is_keyframe(self.video_codec));
        let timestamp = to_ms(&packets[0]);

        if keyframe && !self.video_sh_sent {
            if let Some(sh) = self.sequence_header() {
                self.target.on_message(MediaMessage {
                    kind: MessageKind::Video,
                    timestamp,
                    payload: sh,
                });
                self.video_sh_sent = true;
            }
        }

        let codec_id = match self.video_codec {
            Codec::H265 => FLV_HEVC,
            _ => FLV_AVC,
        };
        let mut payload = BytesMut::with_capacity(5 + total);
        payload.put_u8(if keyframe { 0x10 | codec_id } else { 0x20 | codec_id });
        payload.put_u8(0x01);
        payload.put_slice(&[0, 0, 0]); // cts

        let mut nalu_len = 0usize;
        for pkt in &packets {
            write_packet_payload(pkt, &mut payload, &mut nalu_len);
        }

        self.nn_frames += 1;
        self.target.on_message(MediaMessage {
            kind: MessageKind::Video,
            timestamp,
            payload: payload.freeze(),
        });
        Ok(())
    }

    fn sequence_header(&self) -> Option<Bytes> {
        let sps = self.sps.as_ref()?;
        let pps = self.pps.as_ref()?;

        let mut payload = BytesMut::new();
        match self.video_codec {
            Codec::H265 => {
                let vps = self.vps.as_ref()?;
                payload.put_slice(&[0x10 | FLV_HEVC, 0x00, 0, 0, 0]);
                payload.put_slice(&hvcc_record(vps, sps, pps));
            }
            _ => {
                payload.put_slice(&[0x10 | FLV_AVC, 0x00, 0, 0, 0]);
                payload.put_slice(&avcc_record(sps, pps));
            }
        }
        debug!(
            "bridge {}: emit {} sequence header, {} bytes",
            self.target.url.url(),
            if self.video_codec == Codec::H265 { "hevc" } else { "avc" },
            payload.len()
        );
        Some(payload.freeze())
    }
}

/// Milliseconds for a 90 kHz video / packet clock, preferring the
/// SR-derived absolute time when present.
fn to_ms(pkt: &RtpPacket) -> u32 {
    if pkt.avsync_time >= 0 {
        pkt.avsync_time as u32
    } else {
        pkt.header.timestamp / 90
    }
}

/// AVCDecoderConfigurationRecord from in-band SPS/PPS.
pub(crate) fn avcc_record(sps: &Bytes, pps: &Bytes) -> Vec<u8> {
    let mut v = Vec::with_capacity(11 + sps.len() + pps.len());
    v.push(0x01);
    v.push(if sps.len() > 1 { sps[1] } else { 0 });
    v.push(if sps.len() > 2 { sps[2] } else { 0 });
    v.push(if sps.len() > 3 { sps[3] } else { 0 });
    v.push(0xFF);
    v.push(0xE1);
    v.extend_from_slice(&(sps.len() as u16).to_be_bytes());
    v.extend_from_slice(sps);
    v.push(0x01);
    v.extend_from_slice(&(pps.len() as u16).to_be_bytes());
    v.extend_from_slice(pps);
    v
}

/// HEVCDecoderConfigurationRecord carrying the VPS/SPS/PPS arrays.
pub(crate) fn hvcc_record(vps: &Bytes, sps: &Bytes, pps: &Bytes) -> Vec<u8> {
    let mut v = vec![0u8; 22];
    v[0] = 0x01;
    v[13] = 0xF0; // parallelismType reserved bits
    v[15] = 0xFC;
    v[16] = 0xFC;
    v[17] = 0xF8;
    v[18] = 0xF8;
    v[21] = 0x03; // lengthSizeMinusOne=3, temporal layers zeroed
    v.push(3); // numOfArrays
    for (t, nalu) in [
        (h265::NALU_TYPE_VPS, vps),
        (h265::NALU_TYPE_SPS, sps),
        (h265::NALU_TYPE_PPS, pps),
    ] {
        v.push(t);
        v.extend_from_slice(&1u16.to_be_bytes());
        v.extend_from_slice(&(nalu.len() as u16).to_be_bytes());
        v.extend_from_slice(nalu);
    }
    v
}

/// Converts a 7-byte ADTS header into the 2-byte AudioSpecificConfig.
pub(crate) fn adts_to_asc(adts: &Bytes) -> [u8; 2] {
    let profile = (adts[2] >> 6) + 1;
    let sr_index = (adts[2] >> 2) & 0x0F;
    let channels = ((adts[2] & 0x01) << 2) | (adts[3] >> 6);
    [
        (profile << 3) | (sr_index >> 1),
        ((sr_index & 0x01) << 7) | (channels << 3),
    ]
}
