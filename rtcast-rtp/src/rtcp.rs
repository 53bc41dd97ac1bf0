//! RTCP wire codecs: SR, RR, transport-layer NACK and PLI, RFC 3550 and
//! RFC 4585.

use bytes::{BufMut, BytesMut};
use shared::error::{Error, Result};
use std::collections::BTreeSet;

pub const PT_SR: u8 = 200;
pub const PT_RR: u8 = 201;
pub const PT_SDES: u8 = 202;
pub const PT_BYE: u8 = 203;
pub const PT_APP: u8 = 204;
pub const PT_RTPFB: u8 = 205;
pub const PT_PSFB: u8 = 206;
pub const PT_XR: u8 = 207;

const FMT_NACK: u8 = 1;
const FMT_PLI: u8 = 1;

const HEADER_SIZE: usize = 4;

fn put_header(buf: &mut BytesMut, count: u8, pt: u8, words_minus_one: u16) {
    buf.put_u8(0x80 | (count & 0x1F));
    buf.put_u8(pt);
    buf.put_u16(words_minus_one);
}

fn check_header(data: &[u8], pt: u8) -> Result<(u8, usize)> {
    if data.len() < HEADER_SIZE {
        return Err(Error::ErrPacketTooShort);
    }
    if data[0] >> 6 != 2 {
        return Err(Error::ErrBadVersion);
    }
    if data[1] != pt {
        return Err(Error::ErrWrongPayloadType);
    }
    let len = (u16::from_be_bytes([data[2], data[3]]) as usize + 1) * 4;
    if data.len() < len {
        return Err(Error::ErrPacketTooShort);
    }
    Ok((data[0] & 0x1F, len))
}

/// RTCP Sender Report, report blocks elided: the server consumes only the
/// NTP/RTP mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SenderReport {
    pub ssrc: u32,
    pub ntp: u64,
    pub rtp_ts: u32,
    pub packet_count: u32,
    pub octet_count: u32,
}

impl SenderReport {
    pub fn marshal(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + 24);
        put_header(&mut buf, 0, PT_SR, 6);
        buf.put_u32(self.ssrc);
        buf.put_u64(self.ntp);
        buf.put_u32(self.rtp_ts);
        buf.put_u32(self.packet_count);
        buf.put_u32(self.octet_count);
        buf
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let (_, len) = check_header(data, PT_SR)?;
        if len < HEADER_SIZE + 24 {
            return Err(Error::ErrHeaderTooSmall);
        }
        Ok(Self {
            ssrc: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ntp: u64::from_be_bytes([
                data[8], data[9], data[10], data[11], data[12], data[13], data[14], data[15],
            ]),
            rtp_ts: u32::from_be_bytes([data[16], data[17], data[18], data[19]]),
            packet_count: u32::from_be_bytes([data[20], data[21], data[22], data[23]]),
            octet_count: u32::from_be_bytes([data[24], data[25], data[26], data[27]]),
        })
    }
}

/// One receiver report block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportBlock {
    pub ssrc: u32,
    pub fraction_lost: u8,
    pub cumulative_lost: u32,
    pub highest_seq: u32,
    pub jitter: u32,
    pub lsr: u32,
    pub dlsr: u32,
}

/// RTCP Receiver Report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiverReport {
    pub ssrc: u32,
    pub blocks: Vec<ReportBlock>,
}

impl ReceiverReport {
    pub fn marshal(&self) -> BytesMut {
        let words = (4 + self.blocks.len() * 24) / 4 + 1;
        let mut buf = BytesMut::with_capacity(words * 4);
        put_header(&mut buf, self.blocks.len() as u8, PT_RR, (words - 1) as u16);
        buf.put_u32(self.ssrc);
        for b in &self.blocks {
            buf.put_u32(b.ssrc);
            buf.put_u8(b.fraction_lost);
            buf.put_u8(((b.cumulative_lost >> 16) & 0xFF) as u8);
            buf.put_u8(((b.cumulative_lost >> 8) & 0xFF) as u8);
            buf.put_u8((b.cumulative_lost & 0xFF) as u8);
            buf.put_u32(b.highest_seq);
            buf.put_u32(b.jitter);
            buf.put_u32(b.lsr);
            buf.put_u32(b.dlsr);
        }
        buf
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let (count, len) = check_header(data, PT_RR)?;
        if len < HEADER_SIZE + 4 + count as usize * 24 {
            return Err(Error::ErrHeaderTooSmall);
        }
        let mut rr = ReceiverReport {
            ssrc: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            blocks: vec![],
        };
        let mut i = 8;
        for _ in 0..count {
            rr.blocks.push(ReportBlock {
                ssrc: u32::from_be_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]),
                fraction_lost: data[i + 4],
                cumulative_lost: u32::from_be_bytes([0, data[i + 5], data[i + 6], data[i + 7]]),
                highest_seq: u32::from_be_bytes([data[i + 8], data[i + 9], data[i + 10], data[i + 11]]),
                jitter: u32::from_be_bytes([data[i + 12], data[i + 13], data[i + 14], data[i + 15]]),
                lsr: u32::from_be_bytes([data[i + 16], data[i + 17], data[i + 18], data[i + 19]]),
                dlsr: u32::from_be_bytes([data[i + 20], data[i + 21], data[i + 22], data[i + 23]]),
            });
            i += 24;
        }
        Ok(rr)
    }
}

/// Transport-layer NACK. The lost set is kept sorted; encoding packs
/// contiguous runs into `pid`/`blp` FCI blocks, decoding expands them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Nack {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    lost: BTreeSet<u16>,
}

impl Nack {
    pub fn new(sender_ssrc: u32) -> Self {
        Self {
            sender_ssrc,
            ..Default::default()
        }
    }

    pub fn add_lost_sn(&mut self, sn: u16) {
        self.lost.insert(sn);
    }

    pub fn empty(&self) -> bool {
        self.lost.is_empty()
    }

    pub fn lost_sns(&self) -> Vec<u16> {
        self.lost.iter().copied().collect()
    }

    fn fci_blocks(&self) -> Vec<(u16, u16)> {
        let mut blocks: Vec<(u16, u16)> = vec![];
        for &sn in &self.lost {
            let mut packed = false;
            if let Some((pid, blp)) = blocks.last_mut() {
                let d = sn.wrapping_sub(*pid);
                if (1..=16).contains(&d) {
                    *blp |= 1 << (d - 1);
                    packed = true;
                }
            }
            if !packed {
                blocks.push((sn, 0));
            }
        }
        blocks
    }

    pub fn marshal(&self) -> BytesMut {
        let blocks = self.fci_blocks();
        let words = (8 + blocks.len() * 4) / 4 + 1;
        let mut buf = BytesMut::with_capacity(words * 4);
        put_header(&mut buf, FMT_NACK, PT_RTPFB, (words - 1) as u16);
        buf.put_u32(self.sender_ssrc);
        buf.put_u32(self.media_ssrc);
        for (pid, blp) in blocks {
            buf.put_u16(pid);
            buf.put_u16(blp);
        }
        buf
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let (fmt, len) = check_header(data, PT_RTPFB)?;
        if fmt != FMT_NACK {
            return Err(Error::ErrWrongFeedbackType);
        }
        if len < HEADER_SIZE + 8 {
            return Err(Error::ErrHeaderTooSmall);
        }
        let mut nack = Nack {
            sender_ssrc: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            media_ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            lost: BTreeSet::new(),
        };
        let mut i = 12;
        while i + 4 <= len {
            let pid = u16::from_be_bytes([data[i], data[i + 1]]);
            let blp = u16::from_be_bytes([data[i + 2], data[i + 3]]);
            nack.lost.insert(pid);
            for bit in 0..16u16 {
                if blp & (1 << bit) != 0 {
                    nack.lost.insert(pid.wrapping_add(bit + 1));
                }
            }
            i += 4;
        }
        Ok(nack)
    }
}

/// Picture Loss Indication.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pli {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
}

impl Pli {
    pub fn marshal(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(12);
        put_header(&mut buf, FMT_PLI, PT_PSFB, 2);
        buf.put_u32(self.sender_ssrc);
        buf.put_u32(self.media_ssrc);
        buf
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let (fmt, len) = check_header(data, PT_PSFB)?;
        if fmt != FMT_PLI {
            return Err(Error::ErrWrongFeedbackType);
        }
        if len < 12 {
            return Err(Error::ErrHeaderTooSmall);
        }
        Ok(Self {
            sender_ssrc: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            media_ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        })
    }
}

/// A single parsed RTCP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    SenderReport(SenderReport),
    ReceiverReport(ReceiverReport),
    Nack(Nack),
    Pli(Pli),
    /// SDES/BYE/APP/XR and unknown feedback, carried opaque.
    Other { pt: u8 },
}

/// Splits a compound RTCP datagram and parses each packet.
pub fn parse_compound(data: &[u8]) -> Result<Vec<RtcpPacket>> {
    let mut out = vec![];
    let mut rest = data;
    while rest.len() >= HEADER_SIZE {
        let len = (u16::from_be_bytes([rest[2], rest[3]]) as usize + 1) * 4;
        if rest.len() < len {
            return Err(Error::ErrPacketTooShort);
        }
        let pt = rest[1];
        let fmt = rest[0] & 0x1F;
        let pkt = match pt {
            PT_SR => RtcpPacket::SenderReport(SenderReport::unmarshal(&rest[..len])?),
            PT_RR => RtcpPacket::ReceiverReport(ReceiverReport::unmarshal(&rest[..len])?),
            PT_RTPFB if fmt == FMT_NACK => RtcpPacket::Nack(Nack::unmarshal(&rest[..len])?),
            PT_PSFB if fmt == FMT_PLI => RtcpPacket::Pli(Pli::unmarshal(&rest[..len])?),
            _ => RtcpPacket::Other { pt },
        };
        out.push(pkt);
        rest = &rest[len..];
    }
    Ok(out)
}
