//! RTP packet with codec-aware payload variants.

use bytes::{BufMut, Bytes, BytesMut};
use shared::error::{Error, Result};

use crate::codec::{h264, h265, Codec};
use crate::header::RtpHeader;

/// Media frame classification for downstream delivery.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum FrameType {
    #[default]
    Audio,
    Video,
    Script,
}

/// Discriminates the payload variants without inspecting them.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum PayloadKind {
    #[default]
    None,
    Raw,
    FuA,
    FuA2,
    StapA,
    FuHevc,
    FuHevc2,
    StapHevc,
    Rtcp,
}

/// H.264 FU-A fragment backed by one contiguous buffer (the on-wire form).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FuA2 {
    pub nri: u8,
    pub start: bool,
    pub end: bool,
    pub nalu_type: u8,
    pub payload: Bytes,
}

/// H.264 FU-A fragment assembled from NALU slices (the packetizer form).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FuA {
    pub nri: u8,
    pub start: bool,
    pub end: bool,
    pub nalu_type: u8,
    pub nalus: Vec<Bytes>,
}

/// HEVC FU fragment, single buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FuHevc2 {
    pub start: bool,
    pub end: bool,
    pub nalu_type: u8,
    pub payload: Bytes,
}

/// HEVC FU fragment, NALU slices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FuHevc {
    pub start: bool,
    pub end: bool,
    pub nalu_type: u8,
    pub nalus: Vec<Bytes>,
}

/// Aggregation packet for both codecs; the payload kind tells them apart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stap {
    pub nri: u8,
    pub nalus: Vec<Bytes>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Payload {
    #[default]
    None,
    Raw(Bytes),
    FuA(FuA),
    FuA2(FuA2),
    StapA(Stap),
    FuHevc(FuHevc),
    FuHevc2(FuHevc2),
    StapHevc(Stap),
    Rtcp(Bytes),
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::None => PayloadKind::None,
            Payload::Raw(_) => PayloadKind::Raw,
            Payload::FuA(_) => PayloadKind::FuA,
            Payload::FuA2(_) => PayloadKind::FuA2,
            Payload::StapA(_) => PayloadKind::StapA,
            Payload::FuHevc(_) => PayloadKind::FuHevc,
            Payload::FuHevc2(_) => PayloadKind::FuHevc2,
            Payload::StapHevc(_) => PayloadKind::StapHevc,
            Payload::Rtcp(_) => PayloadKind::Rtcp,
        }
    }

    /// Picks the payload variant from the first byte(s) of the de-padded
    /// body and decodes it. Returns the payload and the NALU type of the
    /// carried unit (for fragments, the fragmented type).
    pub fn decode(codec: Codec, body: Bytes) -> Result<(Payload, u8)> {
        if body.is_empty() {
            return Ok((Payload::Raw(body), 0));
        }
        match codec {
            Codec::H264 => match h264::nalu_type(body[0]) {
                h264::NALU_TYPE_STAP_A => {
                    let stap = Self::decode_stap_a(&body)?;
                    Ok((Payload::StapA(stap), h264::NALU_TYPE_STAP_A))
                }
                h264::NALU_TYPE_FU_A => {
                    let fua = Self::decode_fu_a(&body)?;
                    let t = fua.nalu_type;
                    Ok((Payload::FuA2(fua), t))
                }
                t => Ok((Payload::Raw(body), t)),
            },
            Codec::H265 => match h265::nalu_type(body[0]) {
                h265::NALU_TYPE_STAP => {
                    let stap = Self::decode_stap_hevc(&body)?;
                    Ok((Payload::StapHevc(stap), h265::NALU_TYPE_STAP))
                }
                h265::NALU_TYPE_FU => {
                    let fu = Self::decode_fu_hevc(&body)?;
                    let t = fu.nalu_type;
                    Ok((Payload::FuHevc2(fu), t))
                }
                t => Ok((Payload::Raw(body), t)),
            },
            _ => Ok((Payload::Raw(body), 0)),
        }
    }

    fn decode_fu_a(body: &Bytes) -> Result<FuA2> {
        if body.len() < 2 {
            return Err(Error::ErrShortPacket);
        }
        let indicator = body[0];
        let fu = body[1];
        Ok(FuA2 {
            nri: indicator & 0x60,
            start: fu & 0x80 != 0,
            end: fu & 0x40 != 0,
            nalu_type: fu & 0x1F,
            payload: body.slice(2..),
        })
    }

    fn decode_stap_a(body: &Bytes) -> Result<Stap> {
        let mut stap = Stap {
            nri: body[0] & 0x60,
            nalus: vec![],
        };
        let mut i = 1;
        while i < body.len() {
            if i + 2 > body.len() {
                return Err(Error::ErrShortPacket);
            }
            let size = u16::from_be_bytes([body[i], body[i + 1]]) as usize;
            i += 2;
            if size > body.len() - i {
                return Err(Error::ErrStapSizeLargerThanBuffer(size, body.len() - i));
            }
            stap.nalus.push(body.slice(i..i + size));
            i += size;
        }
        Ok(stap)
    }

    fn decode_fu_hevc(body: &Bytes) -> Result<FuHevc2> {
        if body.len() < 3 {
            return Err(Error::ErrH265CorruptedPacket);
        }
        let fu = body[2];
        Ok(FuHevc2 {
            start: fu & 0x80 != 0,
            end: fu & 0x40 != 0,
            nalu_type: fu & 0x3F,
            payload: body.slice(3..),
        })
    }

    fn decode_stap_hevc(body: &Bytes) -> Result<Stap> {
        if body.len() < 2 {
            return Err(Error::ErrH265CorruptedPacket);
        }
        let mut stap = Stap::default();
        let mut i = 2;
        while i < body.len() {
            if i + 2 > body.len() {
                return Err(Error::ErrH265CorruptedPacket);
            }
            let size = u16::from_be_bytes([body[i], body[i + 1]]) as usize;
            i += 2;
            if size > body.len() - i {
                return Err(Error::ErrStapSizeLargerThanBuffer(size, body.len() - i));
            }
            stap.nalus.push(body.slice(i..i + size));
            i += size;
        }
        Ok(stap)
    }

    pub fn marshal_size(&self) -> usize {
        match self {
            Payload::None => 0,
            Payload::Raw(b) | Payload::Rtcp(b) => b.len(),
            Payload::FuA2(f) => 2 + f.payload.len(),
            Payload::FuA(f) => 2 + f.nalus.iter().map(|n| n.len()).sum::<usize>(),
            Payload::StapA(s) => {
                1 + s
                    .nalus
                    .iter()
                    .filter(|n| !n.is_empty())
                    .map(|n| 2 + n.len())
                    .sum::<usize>()
            }
            Payload::FuHevc2(f) => 3 + f.payload.len(),
            Payload::FuHevc(f) => 3 + f.nalus.iter().map(|n| n.len()).sum::<usize>(),
            Payload::StapHevc(s) => {
                2 + s
                    .nalus
                    .iter()
                    .filter(|n| !n.is_empty())
                    .map(|n| 2 + n.len())
                    .sum::<usize>()
            }
        }
    }

    pub fn marshal_to(&self, buf: &mut BytesMut) {
        match self {
            Payload::None => {}
            Payload::Raw(b) | Payload::Rtcp(b) => buf.put_slice(b),
            Payload::FuA2(f) => {
                buf.put_u8(f.nri | h264::NALU_TYPE_FU_A);
                buf.put_u8(Self::fu_header(f.start, f.end) | f.nalu_type);
                buf.put_slice(&f.payload);
            }
            Payload::FuA(f) => {
                buf.put_u8(f.nri | h264::NALU_TYPE_FU_A);
                buf.put_u8(Self::fu_header(f.start, f.end) | f.nalu_type);
                for n in &f.nalus {
                    buf.put_slice(n);
                }
            }
            Payload::StapA(s) => {
                buf.put_u8(s.nri | h264::NALU_TYPE_STAP_A);
                for n in s.nalus.iter().filter(|n| !n.is_empty()) {
                    buf.put_u16(n.len() as u16);
                    buf.put_slice(n);
                }
            }
            Payload::FuHevc2(f) => {
                buf.put_slice(&h265::nalu_header(h265::NALU_TYPE_FU));
                buf.put_u8(Self::fu_header(f.start, f.end) | f.nalu_type);
                buf.put_slice(&f.payload);
            }
            Payload::FuHevc(f) => {
                buf.put_slice(&h265::nalu_header(h265::NALU_TYPE_FU));
                buf.put_u8(Self::fu_header(f.start, f.end) | f.nalu_type);
                for n in &f.nalus {
                    buf.put_slice(n);
                }
            }
            Payload::StapHevc(s) => {
                buf.put_slice(&h265::nalu_header(h265::NALU_TYPE_STAP));
                for n in s.nalus.iter().filter(|n| !n.is_empty()) {
                    buf.put_u16(n.len() as u16);
                    buf.put_slice(n);
                }
            }
        }
    }

    fn fu_header(start: bool, end: bool) -> u8 {
        let mut b = 0;
        if start {
            b |= 0x80;
        }
        if end {
            b |= 0x40;
        }
        b
    }
}

/// A decoded RTP packet.
#[derive(Debug, Clone, Default)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Payload,
    pub frame_type: FrameType,
    /// Codec-specific type of the carried NALU; for fragments, the type of
    /// the NALU being fragmented.
    pub nalu_type: u8,
    /// Absolute time in milliseconds computed from Sender Reports, -1 if
    /// unknown.
    pub avsync_time: i64,
}

impl RtpPacket {
    pub fn new() -> Self {
        Self {
            header: RtpHeader::new(),
            avsync_time: -1,
            ..Default::default()
        }
    }

    /// Decodes header and payload from one datagram. The packet must be
    /// plaintext; padding is stripped before payload selection.
    pub fn decode(data: &[u8], codec: Codec) -> Result<Self> {
        let mut header = RtpHeader::default();
        let offset = header.decode(data)?;
        let end = data.len() - header.padding_length as usize;
        let body = Bytes::copy_from_slice(&data[offset..end]);

        let (payload, nalu_type) = Payload::decode(codec, body)?;
        Ok(Self {
            header,
            payload,
            frame_type: if codec.is_video() {
                FrameType::Video
            } else {
                FrameType::Audio
            },
            nalu_type,
            avsync_time: -1,
        })
    }

    pub fn marshal(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::with_capacity(self.header.marshal_size() + self.payload.marshal_size());
        self.header.marshal_to(&mut buf)?;
        self.payload.marshal_to(&mut buf);
        Ok(buf)
    }

    /// Keyframe classification across payload variants. For raw payloads
    /// the codec decides how to read the first byte.
    pub fn is_keyframe(&self, codec: Codec) -> bool {
        match (&self.payload, codec) {
            (Payload::Raw(b), Codec::H264) => {
                !b.is_empty() && h264::is_keyframe_nalu(h264::nalu_type(b[0]))
            }
            (Payload::Raw(b), Codec::H265) => {
                !b.is_empty() && h265::is_keyframe_nalu(h265::nalu_type(b[0]))
            }
            (Payload::FuA2(f), _) => h264::is_keyframe_nalu(f.nalu_type),
            (Payload::FuA(f), _) => h264::is_keyframe_nalu(f.nalu_type),
            (Payload::StapA(s), _) => s
                .nalus
                .iter()
                .any(|n| !n.is_empty() && h264::is_keyframe_nalu(h264::nalu_type(n[0]))),
            (Payload::FuHevc2(f), _) => h265::is_keyframe_nalu(f.nalu_type),
            (Payload::FuHevc(f), _) => h265::is_keyframe_nalu(f.nalu_type),
            (Payload::StapHevc(s), _) => s
                .nalus
                .iter()
                .any(|n| !n.is_empty() && h265::is_keyframe_nalu(h265::nalu_type(n[0]))),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes_of(len: usize, fill: u8) -> Bytes {
        Bytes::from(vec![fill; len])
    }

    #[test]
    fn test_fu_a_round_trip() {
        let fua = Payload::FuA2(FuA2 {
            nri: 0x60,
            start: true,
            end: false,
            nalu_type: h264::NALU_TYPE_IDR,
            payload: bytes_of(25, 0xCD),
        });

        let mut buf = BytesMut::new();
        fua.marshal_to(&mut buf);
        assert_eq!(buf.len(), 27);
        assert_eq!(buf[0], 0x60 | h264::NALU_TYPE_FU_A);
        assert_eq!(buf[1], 0x80 | h264::NALU_TYPE_IDR);

        let (decoded, nalu_type) = Payload::decode(Codec::H264, buf.freeze()).unwrap();
        assert_eq!(nalu_type, h264::NALU_TYPE_IDR);
        match decoded {
            Payload::FuA2(f) => {
                assert!(f.start);
                assert!(!f.end);
                assert_eq!(f.payload.len(), 25);
            }
            other => panic!("unexpected payload {:?}", other.kind()),
        }
    }

    #[test]
    fn test_stap_a_round_trip_skips_empty() {
        let stap = Payload::StapA(Stap {
            nri: 0x60,
            nalus: vec![bytes_of(20, 0x67), Bytes::new(), bytes_of(10, 0x68)],
        });

        // Empty NALU is not encoded and not counted.
        assert_eq!(stap.marshal_size(), 1 + (2 + 20) + (2 + 10));

        let mut buf = BytesMut::new();
        stap.marshal_to(&mut buf);

        let (decoded, _) = Payload::decode(Codec::H264, buf.freeze()).unwrap();
        match decoded {
            Payload::StapA(s) => {
                assert_eq!(s.nalus.len(), 2);
                assert_eq!(s.nalus[0].len(), 20);
                assert_eq!(s.nalus[1].len(), 10);
            }
            other => panic!("unexpected payload {:?}", other.kind()),
        }
    }

    #[test]
    fn test_stap_a_declared_size_too_large() {
        // indicator + size 100 but only 3 bytes follow
        let body = Bytes::from_static(&[0x78, 0x00, 0x64, 1, 2, 3]);
        let err = Payload::decode(Codec::H264, body).unwrap_err();
        assert_eq!(err, Error::ErrStapSizeLargerThanBuffer(100, 3));
    }

    #[test]
    fn test_fu_hevc_round_trip() {
        let fu = Payload::FuHevc2(FuHevc2 {
            start: true,
            end: false,
            nalu_type: h265::NALU_TYPE_IDR_W_RADL,
            payload: bytes_of(40, 0xAB),
        });

        let mut buf = BytesMut::new();
        fu.marshal_to(&mut buf);
        assert_eq!(buf.len(), 43);
        assert_eq!(buf[0], h265::NALU_TYPE_FU << 1);
        assert_eq!(buf[1], 0x01);
        assert_eq!(buf[2], 0x80 | h265::NALU_TYPE_IDR_W_RADL);

        let (decoded, nalu_type) = Payload::decode(Codec::H265, buf.freeze()).unwrap();
        assert_eq!(nalu_type, h265::NALU_TYPE_IDR_W_RADL);
        match decoded {
            Payload::FuHevc2(f) => assert_eq!(f.payload.len(), 40),
            other => panic!("unexpected payload {:?}", other.kind()),
        }
    }

    #[test]
    fn test_stap_hevc_round_trip() {
        let stap = Payload::StapHevc(Stap {
            nri: 0,
            nalus: vec![
                Bytes::from(vec![0x40, 0x01, 1, 1, 1]), // VPS
                Bytes::from(vec![0x42, 0x01, 2, 2]),    // SPS
            ],
        });

        let mut buf = BytesMut::new();
        stap.marshal_to(&mut buf);
        assert_eq!(buf[0], h265::NALU_TYPE_STAP << 1);

        let (decoded, _) = Payload::decode(Codec::H265, buf.freeze()).unwrap();
        match decoded {
            Payload::StapHevc(s) => {
                assert_eq!(s.nalus.len(), 2);
                assert_eq!(s.nalus[0].len(), 5);
                assert_eq!(s.nalus[1].len(), 4);
            }
            other => panic!("unexpected payload {:?}", other.kind()),
        }
    }

    #[test]
    fn test_hevc_keyframe_classification() {
        // STAP-Hevc containing a VPS is a keyframe.
        let mut pkt = RtpPacket::new();
        pkt.payload = Payload::StapHevc(Stap {
            nri: 0,
            nalus: vec![Bytes::from(vec![0x40, 0x01])],
        });
        assert!(pkt.is_keyframe(Codec::H265));

        // FU-Hevc2 fragmenting an IDR is a keyframe.
        pkt.payload = Payload::FuHevc2(FuHevc2 {
            start: true,
            end: false,
            nalu_type: h265::NALU_TYPE_IDR_W_RADL,
            payload: Bytes::new(),
        });
        assert!(pkt.is_keyframe(Codec::H265));

        // A lone TRAIL_R is not.
        pkt.payload = Payload::Raw(Bytes::from(vec![h265::NALU_TYPE_TRAIL_R << 1, 0x01, 0xAA]));
        assert!(!pkt.is_keyframe(Codec::H265));
    }

    #[test]
    fn test_decode_whole_packet() {
        let mut pkt = RtpPacket::new();
        pkt.header.payload_type = 96;
        pkt.header.sequence_number = 7;
        pkt.header.timestamp = 9000;
        pkt.header.ssrc = 0x1234;
        pkt.payload = Payload::Raw(Bytes::from(vec![0x65, 1, 2, 3]));

        let wire = pkt.marshal().unwrap();
        let decoded = RtpPacket::decode(&wire, Codec::H264).unwrap();
        assert_eq!(decoded.header.sequence_number, 7);
        assert_eq!(decoded.nalu_type, h264::NALU_TYPE_IDR);
        assert_eq!(decoded.frame_type, FrameType::Video);
        assert!(decoded.is_keyframe(Codec::H264));
        assert_eq!(decoded.avsync_time, -1);
    }
}
