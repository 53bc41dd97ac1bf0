//! Converts PS elementary streams into FLV-shaped messages published to a
//! live source.

use bytes::{BufMut, Bytes, BytesMut};
use memchr::memmem;
use std::rc::Rc;

use rtp::codec::h264;
use shared::error::Result;

use super::ps::PsMessage;
use crate::bridge::rtc2rtmp::{adts_to_asc, avcc_record};
use crate::source::{LiveSource, MediaMessage, MessageKind};

pub struct GbMuxer {
    target: Rc<LiveSource>,
    sps: Option<Bytes>,
    pps: Option<Bytes>,
    video_sh_sent: bool,
    audio_sh_sent: bool,
    pub nn_videos: u64,
    pub nn_audios: u64,
}

impl GbMuxer {
    pub fn new(target: Rc<LiveSource>) -> Self {
        Self {
            target,
            sps: None,
            pps: None,
            video_sh_sent: false,
            audio_sh_sent: false,
            nn_videos: 0,
            nn_audios: 0,
        }
    }

    /// One PS pack worth of messages: audio goes out one message at a
    /// time, consecutive video messages of the pack are grouped into one
    /// burst.
    pub fn on_ps_pack(&mut self, msgs: &[PsMessage]) -> Result<()> {
        let mut video_group: Vec<&PsMessage> = vec![];
        for msg in msgs {
            if msg.is_video() {
                video_group.push(msg);
                continue;
            }
            self.flush_video_group(&mut video_group)?;
            if msg.is_audio() {
                self.on_audio(msg)?;
            }
        }
        self.flush_video_group(&mut video_group)?;
        Ok(())
    }

    fn flush_video_group(&mut self, group: &mut Vec<&PsMessage>) -> Result<()> {
        if group.is_empty() {
            return Ok(());
        }
        let first_dts = group[0].dts;
        let mut es = BytesMut::new();
        for msg in group.drain(..) {
            es.extend_from_slice(&msg.payload);
        }
        self.on_video_es(&es.freeze(), first_dts)
    }

    fn on_video_es(&mut self, es: &Bytes, dts: u64) -> Result<()> {
        let nalus = split_annexb(es);
        if nalus.is_empty() {
            return Ok(());
        }

        let mut keyframe = false;
        for n in &nalus {
            match h264::nalu_type(n[0]) {
                h264::NALU_TYPE_SPS => self.sps = Some(n.clone()),
                h264::NALU_TYPE_PPS => self.pps = Some(n.clone()),
                h264::NALU_TYPE_IDR => keyframe = true,
                _ => {}
            }
        }

        let timestamp = (dts / 90) as u32;
        if keyframe && !self.video_sh_sent {
            if let (Some(sps), Some(pps)) = (self.sps.as_ref(), self.pps.as_ref()) {
                let mut payload = BytesMut::new();
                payload.put_slice(&[0x17, 0x00, 0, 0, 0]);
                payload.put_slice(&avcc_record(sps, pps));
                self.target.on_message(MediaMessage {
                    kind: MessageKind::Video,
                    timestamp,
                    payload: payload.freeze(),
                });
                self.video_sh_sent = true;
            }
        }

        let mut payload = BytesMut::new();
        payload.put_u8(if keyframe { 0x17 } else { 0x27 });
        payload.put_u8(0x01);
        payload.put_slice(&[0, 0, 0]);
        for n in nalus {
            // Parameter sets ride in the sequence header, not the frame.
            let t = h264::nalu_type(n[0]);
            if t == h264::NALU_TYPE_SPS || t == h264::NALU_TYPE_PPS {
                continue;
            }
            payload.put_u32(n.len() as u32);
            payload.put_slice(&n);
        }
        if payload.len() <= 5 {
            return Ok(());
        }

        self.nn_videos += 1;
        self.target.on_message(MediaMessage {
            kind: MessageKind::Video,
            timestamp,
            payload: payload.freeze(),
        });
        Ok(())
    }

    fn on_audio(&mut self, msg: &PsMessage) -> Result<()> {
        let adts = &msg.payload;
        if adts.len() < 7 || adts[0] != 0xFF || adts[1] & 0xF0 != 0xF0 {
            return Ok(());
        }
        let timestamp = (msg.dts / 90) as u32;

        if !self.audio_sh_sent {
            let asc = adts_to_asc(adts);
            let mut payload = BytesMut::with_capacity(4);
            payload.put_slice(&[0xAF, 0x00]);
            payload.put_slice(&asc);
            self.target.on_message(MediaMessage {
                kind: MessageKind::Audio,
                timestamp,
                payload: payload.freeze(),
            });
            self.audio_sh_sent = true;
        }

        let mut payload = BytesMut::with_capacity(2 + adts.len() - 7);
        payload.put_slice(&[0xAF, 0x01]);
        payload.put_slice(&adts[7..]);
        self.nn_audios += 1;
        self.target.on_message(MediaMessage {
            kind: MessageKind::Audio,
            timestamp,
            payload: payload.freeze(),
        });
        Ok(())
    }
}

/// Splits an annex-B stream on 3- and 4-byte start codes.
pub fn split_annexb(data: &Bytes) -> Vec<Bytes> {
    let mut out = vec![];
    let mut starts: Vec<(usize, usize)> = vec![];
    for at in memmem::find_iter(data, &[0, 0, 1]) {
        // A 4-byte start code shares its tail with the 3-byte pattern.
        if at > 0 && data[at - 1] == 0 && starts.last().map(|&(s, _)| s) != Some(at - 1) {
            starts.push((at - 1, at + 3));
        } else {
            starts.push((at, at + 3));
        }
    }
    for (i, &(_, body)) in starts.iter().enumerate() {
        let end = starts
            .get(i + 1)
            .map(|&(next, _)| next)
            .unwrap_or(data.len());
        if body < end {
            out.push(data.slice(body..end));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::StreamUrl;

    fn es(parts: &[&[u8]]) -> Bytes {
        let mut v = vec![];
        for p in parts {
            v.extend_from_slice(&[0, 0, 0, 1]);
            v.extend_from_slice(p);
        }
        Bytes::from(v)
    }

    fn ps_video(dts: u64, payload: Bytes) -> PsMessage {
        PsMessage {
            sid: super::super::ps::SID_VIDEO_COMMON,
            dts,
            pts: dts,
            pes_packet_length: payload.len(),
            payload,
        }
    }

    fn ps_audio(dts: u64) -> PsMessage {
        let mut adts = vec![0xFF, 0xF1, 0x50, 0x80, 0x01, 0x7F, 0xFC];
        adts.extend_from_slice(&[9, 9, 9]);
        PsMessage {
            sid: super::super::ps::SID_AUDIO_COMMON,
            dts,
            pts: dts,
            pes_packet_length: adts.len(),
            payload: Bytes::from(adts),
        }
    }

    #[test]
    fn test_split_annexb() {
        let data = es(&[&[0x67, 1], &[0x68, 2], &[0x65, 3, 4]]);
        let nalus = split_annexb(&data);
        assert_eq!(nalus.len(), 3);
        assert_eq!(&nalus[0][..], &[0x67, 1]);
        assert_eq!(&nalus[2][..], &[0x65, 3, 4]);

        // 3-byte start codes too.
        let data = Bytes::from(vec![0, 0, 1, 0x41, 0xAA, 0, 0, 1, 0x41, 0xBB]);
        let nalus = split_annexb(&data);
        assert_eq!(nalus.len(), 2);
    }

    #[test]
    fn test_sps_pps_idr_produces_header_and_frame() {
        let source = LiveSource::new(StreamUrl::new("v", "live", "gb"));
        let viewer = source.create_consumer();
        let mut muxer = GbMuxer::new(source);

        let msg = ps_video(90_000, es(&[&[0x67, 0x64, 0, 0x1F], &[0x68, 0xEE], &[0x65, 1, 2]]));
        muxer.on_ps_pack(&[msg]).unwrap();

        let msgs = viewer.dump_all();
        assert_eq!(msgs.len(), 2);
        assert!(msgs[0].is_video_sh());
        assert!(msgs[1].is_video_keyframe());
        assert_eq!(msgs[1].timestamp, 1000);
        // The frame body carries only the IDR.
        assert_eq!(&msgs[1].payload[5..9], &3u32.to_be_bytes());
    }

    #[test]
    fn test_audio_single_video_grouped() {
        let source = LiveSource::new(StreamUrl::new("v", "live", "gb"));
        let viewer = source.create_consumer();
        let mut muxer = GbMuxer::new(source);

        // video, video, audio, video: the two leading videos group.
        let msgs = vec![
            ps_video(0, es(&[&[0x41, 1]])),
            ps_video(0, es(&[&[0x41, 2]])),
            ps_audio(90 * 40),
            ps_video(90 * 40, es(&[&[0x41, 3]])),
        ];
        muxer.on_ps_pack(&msgs).unwrap();

        let out = viewer.dump_all();
        // grouped video, audio sh, audio, trailing video
        assert_eq!(out.len(), 4);
        assert!(out[0].is_video());
        assert!(out[1].is_audio_sh());
        assert!(out[2].is_audio());
        assert!(out[3].is_video());
        assert_eq!(muxer.nn_videos, 2);
        assert_eq!(muxer.nn_audios, 1);
    }
}
