//! RFC 4571 framing for media packets carried over TCP.
//!
//! Both the RTC TCP network and the GB28181 media connection carry their
//! packets with a 2-byte big-endian length prefix:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! -----------------------------------------------------------------
//! |             LENGTH            |  STUN/DTLS/RTP packet ...     |
//! -----------------------------------------------------------------
//! ```

/// Length of the framing header (2 bytes for length prefix).
pub const FRAMING_HEADER_LEN: usize = 2;

/// Maximum packet size that can be framed.
pub const MAX_FRAMED_PACKET_SIZE: usize = u16::MAX as usize;

/// A payload at or beyond this size is treated as oversized when the PS
/// parser hits a decode error, and discarded without counting a recovery.
pub const LARGE_PACKET_SIZE: usize = 1500;

/// Adds the 2-byte length prefix to an outbound packet.
///
/// Returns `None` when the packet exceeds [MAX_FRAMED_PACKET_SIZE].
pub fn frame_packet(buf: &[u8]) -> Option<Vec<u8>> {
    if buf.len() > MAX_FRAMED_PACKET_SIZE {
        return None;
    }

    let mut framed = Vec::with_capacity(FRAMING_HEADER_LEN + buf.len());
    framed.extend_from_slice(&(buf.len() as u16).to_be_bytes());
    framed.extend_from_slice(buf);
    Some(framed)
}

/// A stateful decoder for length-prefixed TCP packets.
///
/// Buffers incoming TCP data and extracts complete framed packets; partial
/// reads in any chunk size are handled.
#[derive(Debug, Default)]
pub struct TcpFrameDecoder {
    buffer: Vec<u8>,
}

impl TcpFrameDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Appends data as it arrives from the socket.
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to extract the next complete packet, without the 2-byte
    /// header. Returns `None` if more data is needed.
    pub fn next_packet(&mut self) -> Option<Vec<u8>> {
        if self.buffer.len() < FRAMING_HEADER_LEN {
            return None;
        }

        let length = u16::from_be_bytes([self.buffer[0], self.buffer[1]]) as usize;
        let total_len = FRAMING_HEADER_LEN + length;
        if self.buffer.len() < total_len {
            return None;
        }

        let packet = self.buffer[FRAMING_HEADER_LEN..total_len].to_vec();
        self.buffer.drain(..total_len);
        Some(packet)
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_packet() {
        let framed = frame_packet(b"binding request").unwrap();
        assert_eq!(framed.len(), FRAMING_HEADER_LEN + 15);
        assert_eq!(&framed[0..2], &[0, 15]);
        assert_eq!(&framed[2..], b"binding request");
    }

    #[test]
    fn test_frame_packet_too_large() {
        let huge = vec![0u8; MAX_FRAMED_PACKET_SIZE + 1];
        assert!(frame_packet(&huge).is_none());
    }

    #[test]
    fn test_decoder_partial_reads() {
        let mut decoder = TcpFrameDecoder::new();

        decoder.extend_from_slice(&[0]);
        assert!(decoder.next_packet().is_none());

        decoder.extend_from_slice(&[5, b'H', b'e']);
        assert!(decoder.next_packet().is_none());
        assert_eq!(decoder.buffered_len(), 4);

        decoder.extend_from_slice(&[b'l', b'l', b'o']);
        assert_eq!(decoder.next_packet(), Some(b"Hello".to_vec()));
        assert!(decoder.is_empty());
    }

    #[test]
    fn test_decoder_multiple_packets() {
        let mut decoder = TcpFrameDecoder::new();
        decoder.extend_from_slice(&frame_packet(b"first").unwrap());
        decoder.extend_from_slice(&frame_packet(b"second").unwrap());

        assert_eq!(decoder.next_packet(), Some(b"first".to_vec()));
        assert_eq!(decoder.next_packet(), Some(b"second".to_vec()));
        assert!(decoder.next_packet().is_none());
    }

    #[test]
    fn test_empty_packet() {
        let mut decoder = TcpFrameDecoder::new();
        decoder.extend_from_slice(&frame_packet(b"").unwrap());
        assert_eq!(decoder.next_packet(), Some(vec![]));
    }
}
