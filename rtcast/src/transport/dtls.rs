//! The DTLS seam.
//!
//! The transport owns a [DtlsCtx]: feed it inbound records, write the
//! records it emits, drive [DtlsCtx::poll_retransmit] for handshake ARQ,
//! and export SRTP keying material once done. Production deployments plug a
//! TLS-library-backed context here; [MemoryDtls] is the in-process
//! implementation used by loopback transports and tests. Both speak the
//! same record framing (content types 22/21 within the RFC 7983 DTLS
//! range), so the demultiplexer treats them alike.

use bytes::Bytes;
use ring::hmac;
use std::time::{Duration, Instant};

use shared::error::{Error, Result};

use super::srtp::{SrtpKeyMaterial, SrtpProfile};

/// Handshake role: the active side sends the first flight.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DtlsRole {
    /// Active, initiates the handshake.
    Client,
    /// Passive, answers.
    Server,
}

/// A TLS alert surfaced to the session. `close_notify` is a clean end.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Alert {
    pub level: u8,
    pub description: u8,
}

pub const ALERT_CLOSE_NOTIFY: u8 = 0;
pub const ALERT_LEVEL_WARNING: u8 = 1;
pub const ALERT_LEVEL_FATAL: u8 = 2;

impl Alert {
    pub fn is_close_notify(&self) -> bool {
        self.description == ALERT_CLOSE_NOTIFY
    }
}

/// What feeding one datagram produced.
#[derive(Default)]
pub struct DtlsOutput {
    pub records: Vec<Bytes>,
    pub handshake_done: bool,
    pub alert: Option<Alert>,
}

/// The OpenSSL-shaped seam the security transport drives.
pub trait DtlsCtx {
    fn role(&self) -> DtlsRole;

    /// Client role: produce the first flight. Server role: nothing to send.
    fn start_handshake(&mut self) -> Result<Vec<Bytes>>;

    /// Feed one inbound record.
    fn handle_input(&mut self, data: &[u8]) -> Result<DtlsOutput>;

    /// Handshake ARQ: records to resend, empty when none are due.
    fn poll_retransmit(&mut self, now: Instant) -> Vec<Bytes>;

    fn is_done(&self) -> bool;

    fn export_srtp_keys(&self) -> Result<SrtpKeyMaterial>;
}

/// Self-signed certificate identity for the DTLS endpoint, with the
/// SDP-facing SHA-256 fingerprint.
pub struct DtlsCertificate {
    pub cert_pem: String,
    pub key_pem: String,
    pub fingerprint: String,
}

impl DtlsCertificate {
    pub fn generate() -> Result<Self> {
        let certified = rcgen::generate_simple_self_signed(vec!["rtcast".to_string()])
            .map_err(|e| Error::Other(e.to_string()))?;

        let digest = ring::digest::digest(&ring::digest::SHA256, certified.cert.der());
        let hex: Vec<String> = digest.as_ref().iter().map(|b| format!("{b:02X}")).collect();

        Ok(Self {
            cert_pem: certified.cert.pem(),
            key_pem: certified.key_pair.serialize_pem(),
            fingerprint: format!("sha-256 {}", hex.join(":")),
        })
    }
}

const CONTENT_HANDSHAKE: u8 = 22;
const CONTENT_ALERT: u8 = 21;

const MSG_CLIENT_HELLO: u8 = 1;
const MSG_SERVER_HELLO: u8 = 2;
const MSG_FINISHED: u8 = 20;

const RANDOM_LEN: usize = 32;
const ARQ_INTERVAL: Duration = Duration::from_millis(500);

/// In-process DTLS context with a deterministic two-flight handshake and
/// keys stretched from the exchanged randoms.
pub struct MemoryDtls {
    role: DtlsRole,
    local_random: [u8; RANDOM_LEN],
    remote_random: Option<[u8; RANDOM_LEN]>,
    done: bool,
    last_flight: Vec<Bytes>,
    next_arq: Option<Instant>,
}

impl MemoryDtls {
    pub fn new(role: DtlsRole) -> Self {
        let mut local_random = [0u8; RANDOM_LEN];
        for b in local_random.iter_mut() {
            *b = rand::random();
        }
        Self {
            role,
            local_random,
            remote_random: None,
            done: false,
            last_flight: vec![],
            next_arq: None,
        }
    }

    /// A client/server pair for loopback wiring.
    pub fn pair() -> (Self, Self) {
        (Self::new(DtlsRole::Client), Self::new(DtlsRole::Server))
    }

    /// Builds a close_notify alert record to send to the peer.
    pub fn close_notify_record() -> Bytes {
        Bytes::from(vec![CONTENT_ALERT, ALERT_LEVEL_WARNING, ALERT_CLOSE_NOTIFY])
    }

    fn handshake_record(&self, msg: u8) -> Bytes {
        let mut v = Vec::with_capacity(2 + RANDOM_LEN);
        v.push(CONTENT_HANDSHAKE);
        v.push(msg);
        v.extend_from_slice(&self.local_random);
        Bytes::from(v)
    }

    fn master_secret(&self) -> Result<Vec<u8>> {
        let remote = self.remote_random.ok_or(Error::ErrHandshakeInProgress)?;
        // client random always first, so both sides agree.
        let mut master = Vec::with_capacity(RANDOM_LEN * 2);
        match self.role {
            DtlsRole::Client => {
                master.extend_from_slice(&self.local_random);
                master.extend_from_slice(&remote);
            }
            DtlsRole::Server => {
                master.extend_from_slice(&remote);
                master.extend_from_slice(&self.local_random);
            }
        }
        Ok(master)
    }
}

/// Stretches `master` into `len` bytes with HMAC-SHA1 over a label.
fn stretch(master: &[u8], label: &str, len: usize) -> Vec<u8> {
    let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, master);
    let mut out = Vec::with_capacity(len + 20);
    let mut counter = 0u8;
    while out.len() < len {
        let mut data = label.as_bytes().to_vec();
        data.push(counter);
        out.extend_from_slice(hmac::sign(&key, &data).as_ref());
        counter += 1;
    }
    out.truncate(len);
    out
}

impl DtlsCtx for MemoryDtls {
    fn role(&self) -> DtlsRole {
        self.role
    }

    fn start_handshake(&mut self) -> Result<Vec<Bytes>> {
        match self.role {
            DtlsRole::Client => {
                let flight = vec![self.handshake_record(MSG_CLIENT_HELLO)];
                self.last_flight = flight.clone();
                Ok(flight)
            }
            DtlsRole::Server => Ok(vec![]),
        }
    }

    fn handle_input(&mut self, data: &[u8]) -> Result<DtlsOutput> {
        if data.len() < 2 {
            return Err(Error::ErrDtlsPacketInvalidLength);
        }

        if data[0] == CONTENT_ALERT {
            if data.len() < 3 {
                return Err(Error::ErrDtlsPacketInvalidLength);
            }
            return Ok(DtlsOutput {
                alert: Some(Alert {
                    level: data[1],
                    description: data[2],
                }),
                ..Default::default()
            });
        }

        if data[0] != CONTENT_HANDSHAKE || data.len() < 2 + RANDOM_LEN {
            return Err(Error::ErrDtlsPacketInvalidLength);
        }
        let mut random = [0u8; RANDOM_LEN];
        random.copy_from_slice(&data[2..2 + RANDOM_LEN]);

        let mut out = DtlsOutput::default();
        match (self.role, data[1]) {
            (DtlsRole::Server, MSG_CLIENT_HELLO) => {
                // A retransmitted ClientHello re-answers with the same hello.
                self.remote_random = Some(random);
                let flight = vec![self.handshake_record(MSG_SERVER_HELLO)];
                self.last_flight = flight.clone();
                out.records = flight;
            }
            (DtlsRole::Client, MSG_SERVER_HELLO) => {
                self.remote_random = Some(random);
                let flight = vec![self.handshake_record(MSG_FINISHED)];
                self.last_flight = flight.clone();
                out.records = flight;
                self.done = true;
                out.handshake_done = true;
            }
            (DtlsRole::Server, MSG_FINISHED) => {
                if self.remote_random != Some(random) {
                    return Err(Error::ErrInvalidFsmTransition);
                }
                self.done = true;
                out.handshake_done = true;
            }
            _ => return Err(Error::ErrInvalidFsmTransition),
        }
        Ok(out)
    }

    fn poll_retransmit(&mut self, now: Instant) -> Vec<Bytes> {
        if self.done || self.last_flight.is_empty() {
            return vec![];
        }
        match self.next_arq {
            Some(at) if now < at => vec![],
            _ => {
                self.next_arq = Some(now + ARQ_INTERVAL);
                self.last_flight.clone()
            }
        }
    }

    fn is_done(&self) -> bool {
        self.done
    }

    fn export_srtp_keys(&self) -> Result<SrtpKeyMaterial> {
        if !self.done {
            return Err(Error::ErrNoSrtpKeyingMaterial);
        }
        let master = self.master_secret()?;

        let client = stretch(&master, "client write", 16 + 14);
        let server = stretch(&master, "server write", 16 + 14);
        let (local, remote) = match self.role {
            DtlsRole::Client => (client, server),
            DtlsRole::Server => (server, client),
        };

        Ok(SrtpKeyMaterial {
            profile: SrtpProfile::AesCm128HmacSha1_80,
            local_key: local[..16].to_vec(),
            local_salt: local[16..30].to_vec(),
            remote_key: remote[..16].to_vec(),
            remote_salt: remote[16..30].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_completes_both_sides() {
        let (mut client, mut server) = MemoryDtls::pair();

        let flight1 = client.start_handshake().unwrap();
        let reply = server.handle_input(&flight1[0]).unwrap();
        assert!(!reply.handshake_done);

        let finish = client.handle_input(&reply.records[0]).unwrap();
        assert!(finish.handshake_done);
        assert!(client.is_done());

        let done = server.handle_input(&finish.records[0]).unwrap();
        assert!(done.handshake_done);
        assert!(server.is_done());
    }

    #[test]
    fn test_exported_keys_mirror() {
        let (mut client, mut server) = MemoryDtls::pair();
        let f1 = client.start_handshake().unwrap();
        let f2 = server.handle_input(&f1[0]).unwrap();
        let f3 = client.handle_input(&f2.records[0]).unwrap();
        server.handle_input(&f3.records[0]).unwrap();

        let ck = client.export_srtp_keys().unwrap();
        let sk = server.export_srtp_keys().unwrap();
        assert_eq!(ck.local_key, sk.remote_key);
        assert_eq!(ck.local_salt, sk.remote_salt);
        assert_eq!(ck.remote_key, sk.local_key);
    }

    #[test]
    fn test_export_before_done_fails() {
        let (client, _server) = MemoryDtls::pair();
        assert!(matches!(
            client.export_srtp_keys(),
            Err(Error::ErrNoSrtpKeyingMaterial)
        ));
    }

    #[test]
    fn test_alert_parsing() {
        let (_client, mut server) = MemoryDtls::pair();
        let record = MemoryDtls::close_notify_record();
        let out = server.handle_input(&record).unwrap();
        let alert = out.alert.unwrap();
        assert!(alert.is_close_notify());
    }

    #[test]
    fn test_certificate_fingerprint_format() {
        let cert = DtlsCertificate::generate().unwrap();
        assert!(cert.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(cert.key_pem.contains("PRIVATE KEY"));
        assert!(cert.fingerprint.starts_with("sha-256 "));
        // 32 hash bytes, colon separated.
        assert_eq!(cert.fingerprint.split(':').count(), 32);
    }

    #[test]
    fn test_retransmit_pacing() {
        let (mut client, _server) = MemoryDtls::pair();
        let flight = client.start_handshake().unwrap();

        let now = Instant::now();
        assert_eq!(client.poll_retransmit(now), flight);
        // Within the interval nothing is due.
        assert!(client.poll_retransmit(now).is_empty());
        // After it, the flight goes out again.
        assert_eq!(client.poll_retransmit(now + ARQ_INTERVAL), flight);
    }
}
