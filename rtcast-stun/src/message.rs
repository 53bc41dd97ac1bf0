//! STUN message codec, scoped to the Binding exchange the media server
//! performs: decode Binding Requests, verify short-term credentials, and
//! encode integrity-protected Binding Responses.

use crc::{Crc, CRC_32_ISO_HDLC};
use ring::hmac;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use shared::error::{Error, Result};

use crate::attributes::*;

pub const MAGIC_COOKIE: u32 = 0x2112A442;
pub const HEADER_SIZE: usize = 20;
pub const TRANSACTION_ID_SIZE: usize = 12;

const MESSAGE_INTEGRITY_SIZE: usize = 20;
const FINGERPRINT_SIZE: usize = 4;
const FINGERPRINT_XOR: u32 = 0x5354554E;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MessageType {
    BindingRequest,
    BindingResponse,
    BindingError,
    Other(u16),
}

impl MessageType {
    pub fn from_wire(v: u16) -> Self {
        match v {
            0x0001 => MessageType::BindingRequest,
            0x0101 => MessageType::BindingResponse,
            0x0111 => MessageType::BindingError,
            other => MessageType::Other(other),
        }
    }

    pub fn to_wire(self) -> u16 {
        match self {
            MessageType::BindingRequest => 0x0001,
            MessageType::BindingResponse => 0x0101,
            MessageType::BindingError => 0x0111,
            MessageType::Other(v) => v,
        }
    }
}

/// A decoded STUN message: type, transaction id and raw attributes in wire
/// order.
#[derive(Debug, Clone)]
pub struct Message {
    pub typ: MessageType,
    pub transaction_id: [u8; TRANSACTION_ID_SIZE],
    attrs: Vec<(u16, Vec<u8>)>,
}

impl Default for Message {
    fn default() -> Self {
        Self::new(MessageType::BindingRequest)
    }
}

impl Message {
    pub fn new(typ: MessageType) -> Self {
        let mut transaction_id = [0u8; TRANSACTION_ID_SIZE];
        for b in transaction_id.iter_mut() {
            *b = rand::random();
        }
        Self {
            typ,
            transaction_id,
            attrs: vec![],
        }
    }

    /// A Binding Response answering `req`, echoing its transaction id.
    pub fn binding_response(req: &Message) -> Self {
        Self {
            typ: MessageType::BindingResponse,
            transaction_id: req.transaction_id,
            attrs: vec![],
        }
    }

    pub fn is_binding_request(&self) -> bool {
        self.typ == MessageType::BindingRequest
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::ErrUnexpectedHeaderEof);
        }
        if data[0] & 0xC0 != 0 {
            return Err(Error::ErrNotStunMessage);
        }
        let cookie = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if cookie != MAGIC_COOKIE {
            return Err(Error::ErrNotStunMessage);
        }

        let typ = MessageType::from_wire(u16::from_be_bytes([data[0], data[1]]));
        let length = u16::from_be_bytes([data[2], data[3]]) as usize;
        if data.len() < HEADER_SIZE + length {
            return Err(Error::ErrUnexpectedHeaderEof);
        }

        let mut transaction_id = [0u8; TRANSACTION_ID_SIZE];
        transaction_id.copy_from_slice(&data[8..HEADER_SIZE]);

        let mut attrs = vec![];
        let mut i = HEADER_SIZE;
        let end = HEADER_SIZE + length;
        while i + 4 <= end {
            let attr_type = u16::from_be_bytes([data[i], data[i + 1]]);
            let attr_len = u16::from_be_bytes([data[i + 2], data[i + 3]]) as usize;
            i += 4;
            if i + attr_len > end {
                return Err(Error::ErrAttributeSizeInvalid);
            }
            attrs.push((attr_type, data[i..i + attr_len].to_vec()));
            i += padded_len(attr_len);
        }

        Ok(Self {
            typ,
            transaction_id,
            attrs,
        })
    }

    pub fn attr(&self, typ: u16) -> Option<&[u8]> {
        self.attrs
            .iter()
            .find(|(t, _)| *t == typ)
            .map(|(_, v)| v.as_slice())
    }

    pub fn set_attr(&mut self, typ: u16, value: Vec<u8>) {
        self.attrs.retain(|(t, _)| *t != typ);
        self.attrs.push((typ, value));
    }

    /// The USERNAME attribute, formatted `"<remote_ufrag>:<local_ufrag>"`.
    pub fn username(&self) -> Option<String> {
        self.attr(ATTR_USERNAME)
            .and_then(|v| String::from_utf8(v.to_vec()).ok())
    }

    pub fn set_username(&mut self, remote_ufrag: &str, local_ufrag: &str) {
        self.set_attr(
            ATTR_USERNAME,
            format!("{remote_ufrag}:{local_ufrag}").into_bytes(),
        );
    }

    /// Splits the USERNAME into `(remote_ufrag, local_ufrag)`.
    pub fn split_username(&self) -> Option<(String, String)> {
        let full = self.username()?;
        let mut parts = full.splitn(2, ':');
        let remote = parts.next()?.to_string();
        let local = parts.next()?.to_string();
        Some((remote, local))
    }

    pub fn set_xor_mapped_address(&mut self, addr: &SocketAddr) {
        let xport = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
        let mut v = vec![0u8];
        match addr.ip() {
            IpAddr::V4(ip) => {
                v.push(0x01);
                v.extend_from_slice(&xport.to_be_bytes());
                let xip = u32::from(ip) ^ MAGIC_COOKIE;
                v.extend_from_slice(&xip.to_be_bytes());
            }
            IpAddr::V6(ip) => {
                v.push(0x02);
                v.extend_from_slice(&xport.to_be_bytes());
                let mut xor = [0u8; 16];
                xor[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
                xor[4..].copy_from_slice(&self.transaction_id);
                let octets = ip.octets();
                for (i, b) in octets.iter().enumerate() {
                    v.push(b ^ xor[i]);
                }
            }
        }
        self.set_attr(ATTR_XOR_MAPPED_ADDRESS, v);
    }

    pub fn xor_mapped_address(&self) -> Result<SocketAddr> {
        let v = self
            .attr(ATTR_XOR_MAPPED_ADDRESS)
            .ok_or(Error::ErrAttributeNotFound)?;
        if v.len() < 8 {
            return Err(Error::ErrBadIpLength);
        }
        let port = u16::from_be_bytes([v[2], v[3]]) ^ (MAGIC_COOKIE >> 16) as u16;
        match v[1] {
            0x01 => {
                let xip = u32::from_be_bytes([v[4], v[5], v[6], v[7]]);
                let ip = Ipv4Addr::from(xip ^ MAGIC_COOKIE);
                Ok(SocketAddr::new(IpAddr::V4(ip), port))
            }
            0x02 => {
                if v.len() < 20 {
                    return Err(Error::ErrBadIpLength);
                }
                let mut xor = [0u8; 16];
                xor[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
                xor[4..].copy_from_slice(&self.transaction_id);
                let mut octets = [0u8; 16];
                for i in 0..16 {
                    octets[i] = v[4 + i] ^ xor[i];
                }
                Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
            }
            _ => Err(Error::ErrBadIpLength),
        }
    }

    fn attrs_wire_len(&self) -> usize {
        self.attrs
            .iter()
            .map(|(_, v)| 4 + padded_len(v.len()))
            .sum()
    }

    fn encode_into(&self, out: &mut Vec<u8>, body_len: usize) {
        out.extend_from_slice(&self.typ.to_wire().to_be_bytes());
        out.extend_from_slice(&(body_len as u16).to_be_bytes());
        out.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        out.extend_from_slice(&self.transaction_id);
        for (t, v) in &self.attrs {
            out.extend_from_slice(&t.to_be_bytes());
            out.extend_from_slice(&(v.len() as u16).to_be_bytes());
            out.extend_from_slice(v);
            for _ in v.len()..padded_len(v.len()) {
                out.push(0);
            }
        }
    }

    /// Encodes without integrity protection.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.attrs_wire_len());
        self.encode_into(&mut out, self.attrs_wire_len());
        out
    }

    /// Encodes with MESSAGE-INTEGRITY (short-term credential `pwd`) and
    /// FINGERPRINT appended, in that order.
    pub fn encode_with_integrity(&self, pwd: &str) -> Vec<u8> {
        let attrs_len = self.attrs_wire_len();
        let mut out = Vec::with_capacity(HEADER_SIZE + attrs_len + 32);

        // Length covers the integrity attribute while it is computed.
        self.encode_into(&mut out, attrs_len + 4 + MESSAGE_INTEGRITY_SIZE);

        let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, pwd.as_bytes());
        let tag = hmac::sign(&key, &out);
        out.extend_from_slice(&ATTR_MESSAGE_INTEGRITY.to_be_bytes());
        out.extend_from_slice(&(MESSAGE_INTEGRITY_SIZE as u16).to_be_bytes());
        out.extend_from_slice(tag.as_ref());

        // Grow the length to cover the fingerprint, then checksum.
        let full_len = attrs_len + 4 + MESSAGE_INTEGRITY_SIZE + 4 + FINGERPRINT_SIZE;
        out[2..4].copy_from_slice(&(full_len as u16).to_be_bytes());
        let checksum = CRC32.checksum(&out) ^ FINGERPRINT_XOR;
        out.extend_from_slice(&ATTR_FINGERPRINT.to_be_bytes());
        out.extend_from_slice(&(FINGERPRINT_SIZE as u16).to_be_bytes());
        out.extend_from_slice(&checksum.to_be_bytes());

        out
    }

    /// Verifies MESSAGE-INTEGRITY on a raw datagram with the short-term
    /// credential `pwd`.
    pub fn verify_integrity(data: &[u8], pwd: &str) -> Result<()> {
        let (mi_offset, expected) = Self::find_integrity(data)?;

        let mut covered = data[..mi_offset].to_vec();
        let adjusted = mi_offset - HEADER_SIZE + 4 + MESSAGE_INTEGRITY_SIZE;
        covered[2..4].copy_from_slice(&(adjusted as u16).to_be_bytes());

        let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, pwd.as_bytes());
        hmac::verify(&key, &covered, &expected).map_err(|_| Error::ErrIntegrityMismatch)
    }

    fn find_integrity(data: &[u8]) -> Result<(usize, Vec<u8>)> {
        if data.len() < HEADER_SIZE {
            return Err(Error::ErrUnexpectedHeaderEof);
        }
        let length = u16::from_be_bytes([data[2], data[3]]) as usize;
        let end = (HEADER_SIZE + length).min(data.len());
        let mut i = HEADER_SIZE;
        while i + 4 <= end {
            let attr_type = u16::from_be_bytes([data[i], data[i + 1]]);
            let attr_len = u16::from_be_bytes([data[i + 2], data[i + 3]]) as usize;
            if attr_type == ATTR_MESSAGE_INTEGRITY {
                if attr_len != MESSAGE_INTEGRITY_SIZE || i + 4 + attr_len > end {
                    return Err(Error::ErrAttributeSizeInvalid);
                }
                return Ok((i, data[i + 4..i + 4 + attr_len].to_vec()));
            }
            i += 4 + padded_len(attr_len);
        }
        Err(Error::ErrAttributeNotFound)
    }
}
