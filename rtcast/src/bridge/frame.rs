//! Reassembly of RTP payload variants into length-prefixed NALU streams.
//!
//! Every NALU is written as a 4-byte big-endian length followed by its
//! bytes. A fragmented unit spans several packets: the start fragment
//! leaves a length placeholder and the end fragment patches it once the
//! accumulated size is known.

use bytes::{BufMut, BytesMut};

use rtp::packet::{Payload, RtpPacket};

const LENGTH_PREFIX: usize = 4;
const AVC_FU_HEADER: usize = 1;
const HEVC_FU_HEADER: usize = 2;

/// Bytes this packet will contribute to the NALU stream. Start fragments
/// count their length prefix and reconstructed NALU header; middle and end
/// fragments only their payload.
pub fn packet_payload_size(pkt: &RtpPacket) -> usize {
    match &pkt.payload {
        Payload::None | Payload::Rtcp(_) => 0,
        Payload::Raw(b) => {
            if b.is_empty() {
                0
            } else {
                LENGTH_PREFIX + b.len()
            }
        }
        Payload::FuA2(f) => {
            if f.payload.is_empty() {
                0
            } else if f.start {
                LENGTH_PREFIX + AVC_FU_HEADER + f.payload.len()
            } else {
                f.payload.len()
            }
        }
        Payload::FuA(f) => {
            let size: usize = f.nalus.iter().map(|n| n.len()).sum();
            if size == 0 {
                0
            } else if f.start {
                LENGTH_PREFIX + AVC_FU_HEADER + size
            } else {
                size
            }
        }
        Payload::FuHevc2(f) => {
            if f.payload.is_empty() {
                0
            } else if f.start {
                LENGTH_PREFIX + HEVC_FU_HEADER + f.payload.len()
            } else {
                f.payload.len()
            }
        }
        Payload::FuHevc(f) => {
            let size: usize = f.nalus.iter().map(|n| n.len()).sum();
            if size == 0 {
                0
            } else if f.start {
                LENGTH_PREFIX + HEVC_FU_HEADER + size
            } else {
                size
            }
        }
        Payload::StapA(s) | Payload::StapHevc(s) => s
            .nalus
            .iter()
            .filter(|n| !n.is_empty())
            .map(|n| LENGTH_PREFIX + n.len())
            .sum(),
    }
}

/// Appends this packet's payload to the NALU stream. `nalu_len` carries the
/// accumulated fragmented-unit size across FU start/middle/end packets; the
/// end fragment back-patches the 4-byte prefix the start fragment reserved.
pub fn write_packet_payload(pkt: &RtpPacket, buf: &mut BytesMut, nalu_len: &mut usize) {
    match &pkt.payload {
        Payload::None | Payload::Rtcp(_) => {}
        Payload::Raw(b) => {
            if !b.is_empty() {
                buf.put_u32(b.len() as u32);
                buf.put_slice(b);
            }
        }
        Payload::FuA2(f) => {
            if f.payload.is_empty() {
                return;
            }
            if f.start {
                *nalu_len = AVC_FU_HEADER + f.payload.len();
                buf.put_u32(0);
                buf.put_u8(f.nri | f.nalu_type);
            } else {
                *nalu_len += f.payload.len();
            }
            buf.put_slice(&f.payload);
            if f.end {
                patch_length_prefix(buf, *nalu_len);
            }
        }
        Payload::FuA(f) => {
            let size: usize = f.nalus.iter().map(|n| n.len()).sum();
            if size == 0 {
                return;
            }
            if f.start {
                *nalu_len = AVC_FU_HEADER + size;
                buf.put_u32(0);
                buf.put_u8(f.nri | f.nalu_type);
            } else {
                *nalu_len += size;
            }
            for n in &f.nalus {
                buf.put_slice(n);
            }
            if f.end {
                patch_length_prefix(buf, *nalu_len);
            }
        }
        Payload::FuHevc2(f) => {
            if f.payload.is_empty() {
                return;
            }
            if f.start {
                *nalu_len = HEVC_FU_HEADER + f.payload.len();
                buf.put_u32(0);
                buf.put_slice(&rtp::codec::h265::nalu_header(f.nalu_type));
            } else {
                *nalu_len += f.payload.len();
            }
            buf.put_slice(&f.payload);
            if f.end {
                patch_length_prefix(buf, *nalu_len);
            }
        }
        Payload::FuHevc(f) => {
            let size: usize = f.nalus.iter().map(|n| n.len()).sum();
            if size == 0 {
                return;
            }
            if f.start {
                *nalu_len = HEVC_FU_HEADER + size;
                buf.put_u32(0);
                buf.put_slice(&rtp::codec::h265::nalu_header(f.nalu_type));
            } else {
                *nalu_len += size;
            }
            for n in &f.nalus {
                buf.put_slice(n);
            }
            if f.end {
                patch_length_prefix(buf, *nalu_len);
            }
        }
        Payload::StapA(s) | Payload::StapHevc(s) => {
            for n in s.nalus.iter().filter(|n| !n.is_empty()) {
                buf.put_u32(n.len() as u32);
                buf.put_slice(n);
            }
        }
    }
}

/// Writes the accumulated NALU length into the placeholder the start
/// fragment reserved, `nalu_len + 4` bytes back from the cursor.
fn patch_length_prefix(buf: &mut BytesMut, nalu_len: usize) {
    if buf.len() < nalu_len + LENGTH_PREFIX {
        return;
    }
    let at = buf.len() - nalu_len - LENGTH_PREFIX;
    buf[at..at + LENGTH_PREFIX].copy_from_slice(&(nalu_len as u32).to_be_bytes());
}
