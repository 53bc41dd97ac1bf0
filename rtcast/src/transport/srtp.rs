//! SRTP protect/unprotect, RFC 3711: AES-CM-128 keystream with
//! HMAC-SHA1 authentication (80- and 32-bit tags), session keys derived
//! from the DTLS-exported master material.

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ring::hmac;
use std::collections::HashMap;
use subtle::ConstantTimeEq;

use shared::error::{Error, Result};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

const MASTER_KEY_LEN: usize = 16;
const MASTER_SALT_LEN: usize = 14;
const AUTH_KEY_LEN: usize = 20;
const SRTCP_INDEX_LEN: usize = 4;

const LABEL_RTP_ENCRYPTION: u8 = 0;
const LABEL_RTP_AUTH: u8 = 1;
const LABEL_RTP_SALT: u8 = 2;
const LABEL_RTCP_ENCRYPTION: u8 = 3;
const LABEL_RTCP_AUTH: u8 = 4;
const LABEL_RTCP_SALT: u8 = 5;

/// Negotiated protection profile.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SrtpProfile {
    AesCm128HmacSha1_80,
    AesCm128HmacSha1_32,
}

impl SrtpProfile {
    /// RTP auth tag length. RTCP always uses the 80-bit tag.
    pub fn rtp_tag_len(&self) -> usize {
        match self {
            SrtpProfile::AesCm128HmacSha1_80 => 10,
            SrtpProfile::AesCm128HmacSha1_32 => 4,
        }
    }

    pub fn rtcp_tag_len(&self) -> usize {
        10
    }
}

/// Master keys exported from the DTLS `use_srtp` extension, both
/// directions.
#[derive(Debug, Clone)]
pub struct SrtpKeyMaterial {
    pub profile: SrtpProfile,
    pub local_key: Vec<u8>,
    pub local_salt: Vec<u8>,
    pub remote_key: Vec<u8>,
    pub remote_salt: Vec<u8>,
}

/// RFC 3711 AES-CM key derivation: keystream at `label` from the master
/// key/salt.
fn derive_key(master_key: &[u8; MASTER_KEY_LEN], master_salt: &[u8], label: u8, len: usize) -> Vec<u8> {
    let mut iv = [0u8; 16];
    iv[..MASTER_SALT_LEN].copy_from_slice(master_salt);
    iv[7] ^= label;

    let mut out = vec![0u8; len];
    let mut cipher = Aes128Ctr::new(master_key.into(), &iv.into());
    cipher.apply_keystream(&mut out);
    out
}

fn to_key(v: &[u8]) -> [u8; MASTER_KEY_LEN] {
    let mut out = [0u8; MASTER_KEY_LEN];
    out.copy_from_slice(&v[..MASTER_KEY_LEN]);
    out
}

fn to_salt(v: &[u8]) -> [u8; MASTER_SALT_LEN] {
    let mut out = [0u8; MASTER_SALT_LEN];
    out.copy_from_slice(&v[..MASTER_SALT_LEN]);
    out
}

struct RocState {
    roc: u32,
    highest_seq: u16,
    started: bool,
}

/// One direction of session keys plus replay/rollover state.
struct Direction {
    rtp_key: [u8; MASTER_KEY_LEN],
    rtp_auth: hmac::Key,
    rtp_salt: [u8; MASTER_SALT_LEN],
    rtcp_key: [u8; MASTER_KEY_LEN],
    rtcp_auth: hmac::Key,
    rtcp_salt: [u8; MASTER_SALT_LEN],
    rtp_roc: HashMap<u32, RocState>,
    rtcp_index: HashMap<u32, u32>,
}

impl Direction {
    fn new(master_key: &[u8], master_salt: &[u8]) -> Result<Self> {
        if master_key.len() < MASTER_KEY_LEN || master_salt.len() < MASTER_SALT_LEN {
            return Err(Error::ErrShortSrtpMasterKey);
        }
        let master_key = to_key(master_key);
        let auth = derive_key(&master_key, master_salt, LABEL_RTP_AUTH, AUTH_KEY_LEN);
        let rtcp_auth = derive_key(&master_key, master_salt, LABEL_RTCP_AUTH, AUTH_KEY_LEN);
        Ok(Self {
            rtp_key: to_key(&derive_key(&master_key, master_salt, LABEL_RTP_ENCRYPTION, MASTER_KEY_LEN)),
            rtp_auth: hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, &auth),
            rtp_salt: to_salt(&derive_key(&master_key, master_salt, LABEL_RTP_SALT, MASTER_SALT_LEN)),
            rtcp_key: to_key(&derive_key(&master_key, master_salt, LABEL_RTCP_ENCRYPTION, MASTER_KEY_LEN)),
            rtcp_auth: hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, &rtcp_auth),
            rtcp_salt: to_salt(&derive_key(&master_key, master_salt, LABEL_RTCP_SALT, MASTER_SALT_LEN)),
            rtp_roc: HashMap::new(),
            rtcp_index: HashMap::new(),
        })
    }

    /// Estimates the packet index, updating the rollover counter as the
    /// sequence space wraps.
    fn update_roc(&mut self, ssrc: u32, seq: u16) -> u32 {
        let state = self.rtp_roc.entry(ssrc).or_insert(RocState {
            roc: 0,
            highest_seq: seq,
            started: false,
        });
        if !state.started {
            state.started = true;
            state.highest_seq = seq;
            return state.roc;
        }

        let delta = seq.wrapping_sub(state.highest_seq) as i16;
        if delta >= 0 {
            if delta > 0 && seq < state.highest_seq {
                // Wrapped forward.
                state.roc = state.roc.wrapping_add(1);
            }
            state.highest_seq = seq;
            state.roc
        } else if seq > state.highest_seq {
            // Late packet from before the last wrap.
            state.roc.wrapping_sub(1)
        } else {
            state.roc
        }
    }
}

fn rtp_iv(salt: &[u8], ssrc: u32, roc: u32, seq: u16) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..MASTER_SALT_LEN].copy_from_slice(salt);
    for (i, b) in ssrc.to_be_bytes().iter().enumerate() {
        iv[4 + i] ^= b;
    }
    for (i, b) in roc.to_be_bytes().iter().enumerate() {
        iv[8 + i] ^= b;
    }
    for (i, b) in seq.to_be_bytes().iter().enumerate() {
        iv[12 + i] ^= b;
    }
    iv
}

fn rtcp_iv(salt: &[u8], ssrc: u32, index: u32) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..MASTER_SALT_LEN].copy_from_slice(salt);
    for (i, b) in ssrc.to_be_bytes().iter().enumerate() {
        iv[4 + i] ^= b;
    }
    for (i, b) in index.to_be_bytes().iter().enumerate() {
        iv[10 + i] ^= b;
    }
    iv
}

/// Payload offset of an RTP packet: fixed header, CSRCs, extension.
fn rtp_header_len(buf: &[u8]) -> Result<usize> {
    if buf.len() < 12 {
        return Err(Error::ErrTooShortRtp);
    }
    let cc = (buf[0] & 0x0F) as usize;
    let has_ext = buf[0] & 0x10 != 0;
    let mut len = 12 + cc * 4;
    if has_ext {
        if buf.len() < len + 4 {
            return Err(Error::ErrTooShortRtp);
        }
        let words = u16::from_be_bytes([buf[len + 2], buf[len + 3]]) as usize;
        len += 4 + words * 4;
    }
    if buf.len() < len {
        return Err(Error::ErrTooShortRtp);
    }
    Ok(len)
}

/// Bidirectional SRTP context: `protect_*` uses the local keys, in place;
/// `unprotect_*` validates with the remote keys and strips the tag.
pub struct SrtpContext {
    profile: SrtpProfile,
    local: Direction,
    remote: Direction,
}

impl SrtpContext {
    pub fn new(keys: SrtpKeyMaterial) -> Result<Self> {
        Ok(Self {
            profile: keys.profile,
            local: Direction::new(&keys.local_key, &keys.local_salt)?,
            remote: Direction::new(&keys.remote_key, &keys.remote_salt)?,
        })
    }

    pub fn protect_rtp(&mut self, packet: &mut Vec<u8>) -> Result<()> {
        let header_len = rtp_header_len(packet)?;
        let ssrc = u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]);
        let seq = u16::from_be_bytes([packet[2], packet[3]]);
        let roc = self.local.update_roc(ssrc, seq);

        let iv = rtp_iv(&self.local.rtp_salt, ssrc, roc, seq);
        let mut cipher = Aes128Ctr::new(&self.local.rtp_key.into(), &iv.into());
        cipher.apply_keystream(&mut packet[header_len..]);

        let mut auth_input = packet.clone();
        auth_input.extend_from_slice(&roc.to_be_bytes());
        let tag = hmac::sign(&self.local.rtp_auth, &auth_input);
        packet.extend_from_slice(&tag.as_ref()[..self.profile.rtp_tag_len()]);
        Ok(())
    }

    pub fn unprotect_rtp(&mut self, packet: &mut Vec<u8>) -> Result<()> {
        let tag_len = self.profile.rtp_tag_len();
        if packet.len() < 12 + tag_len {
            return Err(Error::ErrTooShortRtp);
        }
        let body_len = packet.len() - tag_len;
        let ssrc = u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]);
        let seq = u16::from_be_bytes([packet[2], packet[3]]);
        let roc = self.remote.update_roc(ssrc, seq);

        let mut auth_input = packet[..body_len].to_vec();
        auth_input.extend_from_slice(&roc.to_be_bytes());
        let expected = hmac::sign(&self.remote.rtp_auth, &auth_input);
        let ok: bool = expected.as_ref()[..tag_len]
            .ct_eq(&packet[body_len..])
            .into();
        if !ok {
            return Err(Error::ErrFailedToVerifyAuthTag);
        }

        packet.truncate(body_len);
        let header_len = rtp_header_len(packet)?;
        let iv = rtp_iv(&self.remote.rtp_salt, ssrc, roc, seq);
        let mut cipher = Aes128Ctr::new(&self.remote.rtp_key.into(), &iv.into());
        cipher.apply_keystream(&mut packet[header_len..]);
        Ok(())
    }

    pub fn protect_rtcp(&mut self, packet: &mut Vec<u8>) -> Result<()> {
        if packet.len() < 8 {
            return Err(Error::ErrTooShortRtcp);
        }
        let ssrc = u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);
        let index = {
            let e = self.local.rtcp_index.entry(ssrc).or_insert(0);
            *e += 1;
            *e & 0x7FFF_FFFF
        };

        let iv = rtcp_iv(&self.local.rtcp_salt, ssrc, index);
        let mut cipher = Aes128Ctr::new(&self.local.rtcp_key.into(), &iv.into());
        cipher.apply_keystream(&mut packet[8..]);

        // E-bit set: the payload is encrypted.
        packet.extend_from_slice(&(index | 0x8000_0000).to_be_bytes());

        let tag = hmac::sign(&self.local.rtcp_auth, packet);
        packet.extend_from_slice(&tag.as_ref()[..self.profile.rtcp_tag_len()]);
        Ok(())
    }

    pub fn unprotect_rtcp(&mut self, packet: &mut Vec<u8>) -> Result<()> {
        let tag_len = self.profile.rtcp_tag_len();
        if packet.len() < 8 + SRTCP_INDEX_LEN + tag_len {
            return Err(Error::ErrTooShortRtcp);
        }

        let tag_start = packet.len() - tag_len;
        let expected = hmac::sign(&self.remote.rtcp_auth, &packet[..tag_start]);
        let ok: bool = expected.as_ref()[..tag_len]
            .ct_eq(&packet[tag_start..])
            .into();
        if !ok {
            return Err(Error::ErrFailedToVerifyAuthTag);
        }

        let index_start = tag_start - SRTCP_INDEX_LEN;
        let index_word = u32::from_be_bytes([
            packet[index_start],
            packet[index_start + 1],
            packet[index_start + 2],
            packet[index_start + 3],
        ]);
        let encrypted = index_word & 0x8000_0000 != 0;
        let index = index_word & 0x7FFF_FFFF;

        packet.truncate(index_start);
        if encrypted {
            let ssrc = u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);
            let iv = rtcp_iv(&self.remote.rtcp_salt, ssrc, index);
            let mut cipher = Aes128Ctr::new(&self.remote.rtcp_key.into(), &iv.into());
            cipher.apply_keystream(&mut packet[8..]);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_material() -> (SrtpKeyMaterial, SrtpKeyMaterial) {
        let a_key = vec![0x11; 16];
        let a_salt = vec![0x22; 14];
        let b_key = vec![0x33; 16];
        let b_salt = vec![0x44; 14];
        let local = SrtpKeyMaterial {
            profile: SrtpProfile::AesCm128HmacSha1_80,
            local_key: a_key.clone(),
            local_salt: a_salt.clone(),
            remote_key: b_key.clone(),
            remote_salt: b_salt.clone(),
        };
        let peer = SrtpKeyMaterial {
            profile: SrtpProfile::AesCm128HmacSha1_80,
            local_key: b_key,
            local_salt: b_salt,
            remote_key: a_key,
            remote_salt: a_salt,
        };
        (local, peer)
    }

    fn sample_rtp(seq: u16) -> Vec<u8> {
        let mut pkt = rtp::RtpPacket::new();
        pkt.header.payload_type = 96;
        pkt.header.sequence_number = seq;
        pkt.header.timestamp = 1234;
        pkt.header.ssrc = 0xBEEF;
        pkt.payload = rtp::Payload::Raw(bytes::Bytes::from_static(b"media payload body"));
        pkt.marshal().unwrap().to_vec()
    }

    #[test]
    fn test_rtp_round_trip() {
        let (local, peer) = test_material();
        let mut sender = SrtpContext::new(local).unwrap();
        let mut receiver = SrtpContext::new(peer).unwrap();

        for seq in [0u16, 1, 2, 65535] {
            let plain = sample_rtp(seq);
            let mut wire = plain.clone();
            sender.protect_rtp(&mut wire).unwrap();
            assert_eq!(wire.len(), plain.len() + 10);
            assert_ne!(&wire[12..plain.len()], &plain[12..]);

            receiver.unprotect_rtp(&mut wire).unwrap();
            assert_eq!(wire, plain);
        }
    }

    #[test]
    fn test_rtp_tamper_detected() {
        let (local, peer) = test_material();
        let mut sender = SrtpContext::new(local).unwrap();
        let mut receiver = SrtpContext::new(peer).unwrap();

        let mut wire = sample_rtp(10);
        sender.protect_rtp(&mut wire).unwrap();
        wire[14] ^= 0x01;
        assert_eq!(
            receiver.unprotect_rtp(&mut wire),
            Err(Error::ErrFailedToVerifyAuthTag)
        );
    }

    #[test]
    fn test_rtcp_round_trip() {
        let (local, peer) = test_material();
        let mut sender = SrtpContext::new(local).unwrap();
        let mut receiver = SrtpContext::new(peer).unwrap();

        let plain = rtp::rtcp::SenderReport {
            ssrc: 0xBEEF,
            ntp: 42,
            rtp_ts: 90000,
            packet_count: 1,
            octet_count: 100,
        }
        .marshal()
        .to_vec();

        let mut wire = plain.clone();
        sender.protect_rtcp(&mut wire).unwrap();
        assert_eq!(wire.len(), plain.len() + 4 + 10);

        receiver.unprotect_rtcp(&mut wire).unwrap();
        assert_eq!(wire, plain);
    }

    #[test]
    fn test_short_master_key_rejected() {
        let bad = SrtpKeyMaterial {
            profile: SrtpProfile::AesCm128HmacSha1_80,
            local_key: vec![0; 3],
            local_salt: vec![0; 14],
            remote_key: vec![0; 16],
            remote_salt: vec![0; 14],
        };
        assert!(matches!(
            SrtpContext::new(bad),
            Err(Error::ErrShortSrtpMasterKey)
        ));
    }

    #[test]
    fn test_32bit_tag_profile() {
        let (mut local, mut peer) = test_material();
        local.profile = SrtpProfile::AesCm128HmacSha1_32;
        peer.profile = SrtpProfile::AesCm128HmacSha1_32;
        let mut sender = SrtpContext::new(local).unwrap();
        let mut receiver = SrtpContext::new(peer).unwrap();

        let plain = sample_rtp(55);
        let mut wire = plain.clone();
        sender.protect_rtp(&mut wire).unwrap();
        assert_eq!(wire.len(), plain.len() + 4);
        receiver.unprotect_rtp(&mut wire).unwrap();
        assert_eq!(wire, plain);
    }
}
