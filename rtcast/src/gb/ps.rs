//! MPEG-2 Program Stream over RTP, parsed incrementally with a recover
//! mode that resynchronizes on the next pack start code after corruption.

use bytes::{Buf, Bytes, BytesMut};
use log::{debug, warn};

use shared::error::{Error, Result};
use shared::tcp_framing::LARGE_PACKET_SIZE;

/// Pack start code `00 00 01 BA`.
pub const PACK_START_CODE: [u8; 4] = [0x00, 0x00, 0x01, 0xBA];
const SYSTEM_HEADER_CODE: u8 = 0xBB;
const PSM_CODE: u8 = 0xBC;
const PROGRAM_END_CODE: u8 = 0xB9;

/// PES stream ids: video common range and audio common range.
pub const SID_VIDEO_COMMON: u8 = 0xE0;
pub const SID_AUDIO_COMMON: u8 = 0xC0;

/// One elementary-stream message reassembled from PES packets.
#[derive(Debug, Clone)]
pub struct PsMessage {
    pub sid: u8,
    /// 90 kHz clock.
    pub dts: u64,
    pub pts: u64,
    pub pes_packet_length: usize,
    pub payload: Bytes,
}

impl PsMessage {
    pub fn is_video(&self) -> bool {
        (0xE0..=0xEF).contains(&self.sid)
    }

    pub fn is_audio(&self) -> bool {
        (0xC0..=0xDF).contains(&self.sid)
    }
}

/// Consumer of parsed messages and recovery notifications.
pub trait PsHandler {
    fn on_ts_message(&mut self, pack_id: u32, msg: PsMessage) -> Result<()>;
    /// Entered recover mode; `nn_recover` is the recovery counter value at
    /// entry (before this one).
    fn on_recover_mode(&mut self, nn_recover: u32);
}

/// RTP fields of the packet currently being decoded, kept for diagnostics
/// and pack grouping.
#[derive(Debug, Clone, Default)]
pub struct PsDecodeHelper {
    pub rtp_seq: u16,
    pub rtp_ts: u32,
    pub rtp_pt: u8,
    pub pack_id: u32,
    pub pack_first_seq: u16,
    pub pack_pre_msg_last_seq: u16,
    pub pack_nn_msgs: u32,
}

struct PartialPes {
    sid: u8,
    dts: u64,
    pts: u64,
    pes_packet_length: usize,
    collected: BytesMut,
}

/// Plain PS parser: pack/system/PSM headers and PES reassembly. Errors
/// leave the cursor where decoding failed; the recoverable wrapper owns
/// resynchronization.
pub struct PsContext {
    helper: PsDecodeHelper,
    last: Option<PartialPes>,
}

impl Default for PsContext {
    fn default() -> Self {
        Self::new()
    }
}

impl PsContext {
    pub fn new() -> Self {
        Self {
            helper: PsDecodeHelper::default(),
            last: None,
        }
    }

    pub fn helper(&self) -> &PsDecodeHelper {
        &self.helper
    }

    pub fn helper_mut(&mut self) -> &mut PsDecodeHelper {
        &mut self.helper
    }

    pub fn drop_partial(&mut self) {
        self.last = None;
    }

    /// Decodes everything currently available in `buf`.
    pub fn decode(&mut self, buf: &mut &[u8], handler: &mut dyn PsHandler) -> Result<()> {
        // A PES payload may continue across RTP packets.
        let mut complete = false;
        if let Some(partial) = self.last.as_mut() {
            let missing = partial.pes_packet_length - partial.collected.len();
            let want = missing.min(buf.remaining());
            partial.collected.extend_from_slice(&buf[..want]);
            buf.advance(want);
            complete = partial.collected.len() >= partial.pes_packet_length;
            if !complete {
                return Ok(());
            }
        }
        if complete {
            if let Some(p) = self.last.take() {
                self.emit(p, handler)?;
            }
        }

        while buf.remaining() >= 4 {
            if buf[0] != 0 || buf[1] != 0 || buf[2] != 1 {
                return Err(Error::ErrGbPsHeader);
            }
            let code = buf[3];
            match code {
                0xBA => self.decode_pack_header(buf)?,
                SYSTEM_HEADER_CODE | PSM_CODE => Self::skip_sized_section(buf)?,
                PROGRAM_END_CODE => {
                    buf.advance(4);
                }
                sid if (0xC0..=0xEF).contains(&sid) => self.decode_pes(buf, handler)?,
                _ => return Err(Error::ErrGbPsMedia),
            }
        }
        Ok(())
    }

    fn decode_pack_header(&mut self, buf: &mut &[u8]) -> Result<()> {
        // 14 fixed bytes, then stuffing told by the low 3 bits of byte 13.
        if buf.remaining() < 14 {
            return Err(Error::ErrGbPsHeader);
        }
        let stuffing = (buf[13] & 0x07) as usize;
        if buf.remaining() < 14 + stuffing {
            return Err(Error::ErrGbPsHeader);
        }
        buf.advance(14 + stuffing);

        self.helper.pack_id = self.helper.pack_id.wrapping_add(1);
        self.helper.pack_first_seq = self.helper.rtp_seq;
        self.helper.pack_nn_msgs = 0;
        debug!("ps: new pack id={}", self.helper.pack_id);
        Ok(())
    }

    fn skip_sized_section(buf: &mut &[u8]) -> Result<()> {
        if buf.remaining() < 6 {
            return Err(Error::ErrGbPsHeader);
        }
        let len = u16::from_be_bytes([buf[4], buf[5]]) as usize;
        if buf.remaining() < 6 + len {
            return Err(Error::ErrGbPsHeader);
        }
        buf.advance(6 + len);
        Ok(())
    }

    fn decode_pes(&mut self, buf: &mut &[u8], handler: &mut dyn PsHandler) -> Result<()> {
        if buf.remaining() < 9 {
            return Err(Error::ErrGbPsMedia);
        }
        let sid = buf[3];
        let pes_packet_length = u16::from_be_bytes([buf[4], buf[5]]) as usize;
        let flags = buf[7];
        let header_len = buf[8] as usize;
        if buf.remaining() < 9 + header_len {
            return Err(Error::ErrGbPsMedia);
        }

        let mut pts = 0u64;
        let mut dts = 0u64;
        let pts_dts_flags = flags >> 6;
        if pts_dts_flags >= 0b10 && header_len >= 5 {
            pts = decode_pes_timestamp(&buf[9..14])?;
            dts = pts;
        }
        if pts_dts_flags == 0b11 && header_len >= 10 {
            dts = decode_pes_timestamp(&buf[14..19])?;
        }

        buf.advance(9 + header_len);

        // Payload length excludes the 3 flag/len bytes of the PES header.
        let payload_len = pes_packet_length.saturating_sub(3 + header_len);
        let available = buf.remaining().min(payload_len);
        let mut collected = BytesMut::with_capacity(payload_len);
        collected.extend_from_slice(&buf[..available]);
        buf.advance(available);

        let partial = PartialPes {
            sid,
            dts,
            pts,
            pes_packet_length: payload_len,
            collected,
        };
        if partial.collected.len() >= payload_len {
            self.emit(partial, handler)?;
        } else {
            self.last = Some(partial);
        }
        Ok(())
    }

    fn emit(&mut self, partial: PartialPes, handler: &mut dyn PsHandler) -> Result<()> {
        self.helper.pack_nn_msgs += 1;
        self.helper.pack_pre_msg_last_seq = self.helper.rtp_seq;
        handler.on_ts_message(
            self.helper.pack_id,
            PsMessage {
                sid: partial.sid,
                dts: partial.dts,
                pts: partial.pts,
                pes_packet_length: partial.pes_packet_length,
                payload: partial.collected.freeze(),
            },
        )
    }
}

fn decode_pes_timestamp(b: &[u8]) -> Result<u64> {
    if b.len() < 5 {
        return Err(Error::ErrGbPsMedia);
    }
    let ts = ((b[0] as u64 >> 1) & 0x07) << 30
        | (b[1] as u64) << 22
        | ((b[2] as u64 >> 1) & 0x7F) << 15
        | (b[3] as u64) << 7
        | (b[4] as u64 >> 1) & 0x7F;
    Ok(ts)
}

/// Advances the cursor to the next `00 00 01 BA`; false when none remains
/// (the buffer is then fully consumed).
pub fn skip_until_pack(buf: &mut &[u8]) -> bool {
    let hay = *buf;
    for i in 0..hay.len().saturating_sub(3) {
        if hay[i..i + 4] == PACK_START_CODE {
            buf.advance(i);
            return true;
        }
    }
    buf.advance(hay.len());
    false
}

/// PS parser with recovery: on a decode error it discards the rest of the
/// packet, counts one recovery per entry, and rescans for the pack start
/// code in subsequent input before resuming.
pub struct RecoverablePsContext {
    pub ctx: PsContext,
    pub recover: u32,
}

impl Default for RecoverablePsContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoverablePsContext {
    pub fn new() -> Self {
        Self {
            ctx: PsContext::new(),
            recover: 0,
        }
    }

    /// Feeds one RTP packet carrying PS. `reserved` bytes after the RTP
    /// header are skipped before the payload.
    pub fn decode_rtp(
        &mut self,
        data: &[u8],
        reserved: usize,
        handler: &mut dyn PsHandler,
    ) -> Result<()> {
        if data.len() < 12 {
            return Err(Error::ErrTooShortRtp);
        }
        let h = self.ctx.helper_mut();
        h.rtp_pt = data[1] & 0x7F;
        h.rtp_seq = u16::from_be_bytes([data[2], data[3]]);
        h.rtp_ts = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);

        let cc = (data[0] & 0x0F) as usize;
        let offset = 12 + cc * 4 + reserved;
        if data.len() < offset {
            return Err(Error::ErrTooShortRtp);
        }
        let mut body = &data[offset..];
        self.decode(&mut body, handler)
    }

    pub fn decode(&mut self, buf: &mut &[u8], handler: &mut dyn PsHandler) -> Result<()> {
        if self.recover > 0 {
            if !skip_until_pack(buf) {
                return Ok(());
            }
            self.quit_recover_mode(handler);
        }

        let total = buf.remaining();
        match self.ctx.decode(buf, handler) {
            Ok(()) => Ok(()),
            Err(err) => self.enter_recover_mode(buf, handler, total, err),
        }
    }

    /// Enters recover mode. An oversized packet (≥1500 bytes) is discarded
    /// silently; otherwise the recovery is counted exactly once per entry.
    pub fn enter_recover_mode(
        &mut self,
        buf: &mut &[u8],
        handler: &mut dyn PsHandler,
        packet_size: usize,
        err: Error,
    ) -> Result<()> {
        self.ctx.drop_partial();
        let remaining = buf.remaining();
        buf.advance(remaining);

        if packet_size >= LARGE_PACKET_SIZE {
            debug!("ps: drop oversized packet of {packet_size} bytes: {err}");
            handler.on_recover_mode(self.recover);
            return Ok(());
        }

        warn!("ps: enter recover mode: {err}");
        handler.on_recover_mode(self.recover);
        self.recover += 1;
        Ok(())
    }

    /// Parsing succeeded at the new anchor; the cursor stays at the pack
    /// header.
    pub fn quit_recover_mode(&mut self, _handler: &mut dyn PsHandler) {
        debug!("ps: quit recover mode after {} entries", self.recover);
        self.recover = 0;
        self.ctx.drop_partial();
    }
}
