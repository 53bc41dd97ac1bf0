//! RTP fixed-header codec, RFC 3550 with RFC 5285 header extensions.

use bytes::{BufMut, Bytes, BytesMut};
use shared::error::{Error, Result};

/// One-byte extension profile marker, RFC 5285.
pub const EXTENSION_PROFILE_ONE_BYTE: u16 = 0xBEDE;
/// Two-byte extension profile marker, RFC 5285.
pub const EXTENSION_PROFILE_TWO_BYTE: u16 = 0x1000;

pub const FIXED_HEADER_SIZE: usize = 12;

/// A parsed header extension element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionEntry {
    pub id: u8,
    pub payload: Bytes,
}

/// RTP packet header.
///
/// Decoding a packet whose padding bit is set validates the padding length
/// against the packet tail. For packets that are still ciphered (SRTP), the
/// tail is not meaningful yet; the caller sets [RtpHeader::ignore_padding]
/// and the outer layer validates padding after decryption.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RtpHeader {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrcs: Vec<u32>,
    pub extension_profile: u16,
    pub extensions: Vec<ExtensionEntry>,
    /// Number of padding bytes at the tail, valid after a non-ignored decode.
    pub padding_length: u8,
    ignore_padding: bool,
}

impl RtpHeader {
    pub fn new() -> Self {
        Self {
            version: 2,
            ..Default::default()
        }
    }

    /// Skip the padding-length check during decode, so an outer layer can
    /// validate it after decryption.
    pub fn ignore_padding(&mut self, v: bool) {
        self.ignore_padding = v;
    }

    /// Decodes the header from `buf`, returning the payload offset.
    pub fn decode(&mut self, buf: &[u8]) -> Result<usize> {
        if buf.len() < FIXED_HEADER_SIZE {
            return Err(Error::ErrHeaderSizeInsufficient);
        }

        let b0 = buf[0];
        self.version = b0 >> 6;
        if self.version != 2 {
            return Err(Error::ErrBadVersion);
        }
        self.padding = (b0 >> 5) & 0x1 == 1;
        self.extension = (b0 >> 4) & 0x1 == 1;
        let cc = (b0 & 0x0F) as usize;

        let b1 = buf[1];
        self.marker = b1 >> 7 == 1;
        self.payload_type = b1 & 0x7F;

        self.sequence_number = u16::from_be_bytes([buf[2], buf[3]]);
        self.timestamp = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        self.ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);

        let mut pos = FIXED_HEADER_SIZE;
        if buf.len() < pos + cc * 4 {
            return Err(Error::ErrHeaderSizeInsufficient);
        }
        self.csrcs.clear();
        for _ in 0..cc {
            self.csrcs
                .push(u32::from_be_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]));
            pos += 4;
        }

        self.extensions.clear();
        if self.extension {
            if buf.len() < pos + 4 {
                return Err(Error::ErrHeaderSizeInsufficientForExtension);
            }
            self.extension_profile = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
            let ext_words = u16::from_be_bytes([buf[pos + 2], buf[pos + 3]]) as usize;
            pos += 4;

            let ext_len = ext_words * 4;
            if buf.len() < pos + ext_len {
                return Err(Error::ErrHeaderSizeInsufficientForExtension);
            }
            let ext = &buf[pos..pos + ext_len];
            pos += ext_len;

            self.parse_extensions(ext)?;
        }

        if self.padding && !self.ignore_padding {
            self.padding_length = buf[buf.len() - 1];
            if self.padding_length == 0 || (self.padding_length as usize) > buf.len() - pos {
                return Err(Error::ErrBadPadding);
            }
        }

        Ok(pos)
    }

    fn parse_extensions(&mut self, ext: &[u8]) -> Result<()> {
        match self.extension_profile {
            EXTENSION_PROFILE_ONE_BYTE => {
                let mut i = 0;
                while i < ext.len() {
                    let b = ext[i];
                    if b == 0 {
                        // word-alignment padding
                        i += 1;
                        continue;
                    }
                    let id = b >> 4;
                    let len = (b & 0x0F) as usize + 1;
                    if id == 0x0F {
                        break;
                    }
                    i += 1;
                    if ext.len() < i + len {
                        return Err(Error::ErrHeaderSizeInsufficientForExtension);
                    }
                    self.extensions.push(ExtensionEntry {
                        id,
                        payload: Bytes::copy_from_slice(&ext[i..i + len]),
                    });
                    i += len;
                }
            }
            EXTENSION_PROFILE_TWO_BYTE => {
                let mut i = 0;
                while i + 1 < ext.len() {
                    let id = ext[i];
                    if id == 0 {
                        i += 1;
                        continue;
                    }
                    let len = ext[i + 1] as usize;
                    i += 2;
                    if ext.len() < i + len {
                        return Err(Error::ErrHeaderSizeInsufficientForExtension);
                    }
                    self.extensions.push(ExtensionEntry {
                        id,
                        payload: Bytes::copy_from_slice(&ext[i..i + len]),
                    });
                    i += len;
                }
            }
            _ => {
                // RFC 3550 generic extension, kept opaque under id 0.
                self.extensions.push(ExtensionEntry {
                    id: 0,
                    payload: Bytes::copy_from_slice(ext),
                });
            }
        }
        Ok(())
    }

    pub fn marshal_size(&self) -> usize {
        let mut size = FIXED_HEADER_SIZE + self.csrcs.len() * 4;
        if self.extension {
            size += 4 + self.extensions_payload_len();
        }
        size
    }

    fn extensions_payload_len(&self) -> usize {
        let raw: usize = match self.extension_profile {
            EXTENSION_PROFILE_ONE_BYTE => self
                .extensions
                .iter()
                .map(|e| 1 + e.payload.len())
                .sum(),
            EXTENSION_PROFILE_TWO_BYTE => self
                .extensions
                .iter()
                .map(|e| 2 + e.payload.len())
                .sum(),
            _ => self.extensions.iter().map(|e| e.payload.len()).sum(),
        };
        (raw + 3) / 4 * 4
    }

    /// Encodes the header into `buf`, returning the bytes written.
    pub fn marshal_to(&self, buf: &mut BytesMut) -> Result<usize> {
        let start = buf.len();

        let mut b0 = (self.version << 6) | (self.csrcs.len() as u8);
        if self.padding {
            b0 |= 1 << 5;
        }
        if self.extension {
            b0 |= 1 << 4;
        }
        buf.put_u8(b0);

        let mut b1 = self.payload_type;
        if self.marker {
            b1 |= 1 << 7;
        }
        buf.put_u8(b1);

        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        for csrc in &self.csrcs {
            buf.put_u32(*csrc);
        }

        if self.extension {
            let payload_len = self.extensions_payload_len();
            buf.put_u16(self.extension_profile);
            buf.put_u16((payload_len / 4) as u16);

            let ext_start = buf.len();
            match self.extension_profile {
                EXTENSION_PROFILE_ONE_BYTE => {
                    for e in &self.extensions {
                        buf.put_u8((e.id << 4) | ((e.payload.len() as u8) - 1));
                        buf.put_slice(&e.payload);
                    }
                }
                EXTENSION_PROFILE_TWO_BYTE => {
                    for e in &self.extensions {
                        buf.put_u8(e.id);
                        buf.put_u8(e.payload.len() as u8);
                        buf.put_slice(&e.payload);
                    }
                }
                _ => {
                    for e in &self.extensions {
                        buf.put_slice(&e.payload);
                    }
                }
            }
            while (buf.len() - ext_start) < payload_len {
                buf.put_u8(0);
            }
        }

        Ok(buf.len() - start)
    }
}
