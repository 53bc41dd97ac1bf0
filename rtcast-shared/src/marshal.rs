//! Wire codec traits shared by the RTP, RTCP and STUN packet types.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Error, Result};

pub trait MarshalSize {
    fn marshal_size(&self) -> usize;
}

pub trait Marshal: MarshalSize {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize>;

    fn marshal(&self) -> Result<BytesMut> {
        let l = self.marshal_size();
        let mut buf = BytesMut::with_capacity(l);
        buf.resize(l, 0);
        let n = self.marshal_to(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }
}

pub trait Unmarshal: MarshalSize {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf;
}

/// Writes a 24-bit big-endian integer, used by FLV tag sizes.
pub fn put_u24<B: BufMut>(buf: &mut B, v: u32) {
    buf.put_u8(((v >> 16) & 0xFF) as u8);
    buf.put_u8(((v >> 8) & 0xFF) as u8);
    buf.put_u8((v & 0xFF) as u8);
}

/// Reads a 24-bit big-endian integer.
pub fn get_u24<B: Buf>(buf: &mut B) -> Result<u32> {
    if buf.remaining() < 3 {
        return Err(Error::ErrShortPacket);
    }
    let a = buf.get_u8() as u32;
    let b = buf.get_u8() as u32;
    let c = buf.get_u8() as u32;
    Ok((a << 16) | (b << 8) | c)
}
