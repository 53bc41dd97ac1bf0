//! RTC handshake scenarios: STUN binding over TCP with session attach,
//! then DTLS and ciphered media end to end.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::str::FromStr;
use std::time::Instant;

use rtcast::manager::{Resource, ResourceManager};
use rtcast::network::tcp::RtcTcpConn;
use rtcast::network::NetworkWriter;
use rtcast::session::{RtcPublishStream, RtcSession};
use rtcast::source::{RtcSource, StreamUrl};
use rtcast::transport::dtls::MemoryDtls;
use rtcast::transport::{MediaTransport, PlaintextTransport, SecureTransport, TransportState};
use shared::tcp_framing::frame_packet;

struct RecordingWriter {
    peer: SocketAddr,
    written: RefCell<Vec<Vec<u8>>>,
}

impl RecordingWriter {
    fn new(peer: &str) -> Rc<Self> {
        Rc::new(Self {
            peer: SocketAddr::from_str(peer).unwrap(),
            written: RefCell::new(vec![]),
        })
    }
}

impl NetworkWriter for RecordingWriter {
    fn write_packet(&self, data: &[u8]) -> shared::error::Result<usize> {
        self.written.borrow_mut().push(data.to_vec());
        Ok(data.len())
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn local_addr(&self) -> SocketAddr {
        SocketAddr::from_str("127.0.0.1:8000").unwrap()
    }
}

// A synthetic Binding Request with USERNAME "test:session" attaches the
// connection, transitions WaitingStun -> Dtls, and answers with exactly
// one length-prefixed STUN response.
#[test]
fn test_tcp_stun_binding_scenario() {
    let manager = ResourceManager::new("mgr");
    let session = RtcSession::new(&manager, "session", "icepwdsecret", Box::new(PlaintextTransport));
    let r: Rc<dyn Resource> = session.clone();
    manager.add_with_name("test:session", r);

    let writer = RecordingWriter::new("192.0.2.9:4000");
    let mut conn = RtcTcpConn::new(&manager, writer.clone(), "cid-7");

    let mut req = stun::Message::new(stun::MessageType::BindingRequest);
    req.set_username("test", "session");
    let wire = req.encode_with_integrity("icepwdsecret");
    let framed = frame_packet(&wire).unwrap();

    conn.on_data(&framed, Instant::now()).unwrap();

    // Exactly one write: 2-byte length prefix + STUN Binding Response.
    let written = writer.written.borrow();
    assert_eq!(written.len(), 1);
    let out = &written[0];
    let len = u16::from_be_bytes([out[0], out[1]]) as usize;
    assert_eq!(len, out.len() - 2);

    let resp = stun::Message::decode(&out[2..]).unwrap();
    assert_eq!(resp.typ, stun::MessageType::BindingResponse);
    assert_eq!(resp.transaction_id, req.transaction_id);
    stun::Message::verify_integrity(&out[2..], "icepwdsecret").unwrap();

    assert_eq!(session.tcp_network().borrow().state(), TransportState::Dtls);
    assert_eq!(session.context_id(), "cid-7");
}

// DTLS completes over the memory contexts, SRTP keys mirror, and a
// ciphered publish flows into the session's source.
#[test]
fn test_dtls_then_ciphered_media() {
    let manager = ResourceManager::new("mgr");
    let (client_dtls, server_dtls) = MemoryDtls::pair();
    let session = RtcSession::new(
        &manager,
        "localufrag",
        "localpwd",
        Box::new(SecureTransport::new(Box::new(server_dtls))),
    );

    let source = RtcSource::new(StreamUrl::new("v", "live", "cam"));
    let media = source.create_consumer();
    session.set_source(source);

    let mut publisher = RtcPublishStream::new();
    let mut desc = rtcast::session::track::TrackDescription::video("cam-video", 0xC0DE);
    desc.is_active = true;
    publisher.audio_tracks.clear();
    publisher
        .video_tracks
        .push(rtcast::session::track::RecvTrack::new(desc));
    publisher.set_all_tracks_status(true);
    *session.publisher.borrow_mut() = Some(publisher);

    // Drive the handshake: client flights feed the session transport.
    let mut client = SecureTransport::new(Box::new(client_dtls));
    let flight1 = client.start_active_handshake().unwrap();
    let mut to_client = vec![];
    for record in &flight1 {
        let ev = session.transport().borrow_mut().on_dtls(record).unwrap();
        to_client.extend(ev.outbound);
    }
    let mut finished = vec![];
    for record in &to_client {
        let ev = client.on_dtls(record).unwrap();
        finished.extend(ev.outbound);
    }
    for record in &finished {
        let ev = session.transport().borrow_mut().on_dtls(record).unwrap();
        if ev.handshake_done_now {
            session.on_dtls_handshake_done().unwrap();
        }
    }
    assert_eq!(session.state(), TransportState::Established);
    assert!(session.is_alive());

    // The peer protects a packet; the session unprotects and routes it.
    let mut pkt = rtp::RtpPacket::new();
    pkt.header.payload_type = 106;
    pkt.header.ssrc = 0xC0DE;
    pkt.header.sequence_number = 77;
    pkt.payload = rtp::Payload::Raw(bytes::Bytes::from(vec![0x65, 1, 2, 3]));
    let mut wire = pkt.marshal().unwrap().to_vec();
    client.protect_rtp(&mut wire).unwrap();

    session.on_rtp_cipher(&wire, Instant::now()).unwrap();
    let got = media.dump().unwrap();
    assert_eq!(got.header.sequence_number, 77);
    assert!(got.is_keyframe(rtp::codec::Codec::H264));
    assert_eq!(session.nn_dropped.get(), 0);
}
