//! First-byte packet classification per RFC 7983, plus logging helpers.
//!
//! ```text
//!              +----------------+
//!              |        [0..3] -+--> forward to STUN
//!              |                |
//!              |      [20..63] -+--> forward to DTLS
//!              |                |
//!  packet -->  |      [64..79] -+--> forward to TURN Channel
//!              |                |
//!              |    [128..191] -+--> forward to RTP/RTCP
//!              +----------------+
//! ```

/// Accepts packets with the first byte in [0..3], the STUN range.
pub fn is_stun(buf: &[u8]) -> bool {
    !buf.is_empty() && buf[0] < 4
}

/// Accepts DTLS records, first byte in [20..63] and at least the record
/// header present.
pub fn is_dtls(buf: &[u8]) -> bool {
    buf.len() >= 13 && buf[0] > 19 && buf[0] < 64
}

/// Accepts RTP or RTCP packets, first byte in [128..191] and a full fixed
/// header present.
pub fn is_rtp_or_rtcp(buf: &[u8]) -> bool {
    buf.len() >= 12 && buf[0] >= 128 && buf[0] <= 191
}

/// Within the RTP range, RTCP packet types occupy [192..223] in the second
/// byte (SR=200, RR=201, SDES=202, BYE=203, APP=204, RTPFB=205, PSFB=206,
/// XR=207).
pub fn is_rtcp(buf: &[u8]) -> bool {
    is_rtp_or_rtcp(buf) && buf[1] >= 192 && buf[1] <= 223
}

/// Dumps up to `limit` bytes as lowercase hex separated by spaces, for
/// protocol tracing.
pub fn dump_hex_limit(data: &[u8], limit: usize) -> String {
    let n = data.len().min(limit);
    let mut out = String::with_capacity(n * 3);
    for (i, b) in data[..n].iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Dumps the whole slice as hex.
pub fn dump_hex(data: &[u8]) -> String {
    dump_hex_limit(data, usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_type_dtls() {
        // change_cipher_spec(20), alert(21), handshake(22), application_data(23)
        for first in [20u8, 21, 22, 23] {
            let mut data = [0u8; 13];
            data[0] = first;
            assert!(is_dtls(&data));
            assert!(!is_dtls(&data[..1]));

            assert!(!is_stun(&data));
            assert!(!is_rtp_or_rtcp(&data));
            assert!(!is_rtcp(&data));
        }
    }

    #[test]
    fn test_packet_type_stun() {
        // binding request, binding success response
        for first in [0u8, 1] {
            let data = [first];
            assert!(is_stun(&data));
            assert!(!is_stun(&data[..0]));

            assert!(!is_dtls(&data));
            assert!(!is_rtp_or_rtcp(&data));
            assert!(!is_rtcp(&data));
        }
    }

    #[test]
    fn test_packet_type_rtcp() {
        for second in [192u8, 200, 201, 202, 203, 204, 223] {
            let mut data = [0u8; 12];
            data[0] = 0x80;
            data[1] = second;
            assert!(is_rtcp(&data));
            assert!(!is_rtcp(&data[..2]));

            assert!(!is_stun(&data));
            assert!(!is_dtls(&data));
            assert!(is_rtp_or_rtcp(&data));
        }
    }

    #[test]
    fn test_packet_type_rtp() {
        for second in [96u8, 127, 224, 255] {
            let mut data = [0u8; 12];
            data[0] = 0x80;
            data[1] = second;
            assert!(is_rtp_or_rtcp(&data));
            assert!(!is_rtp_or_rtcp(&data[..2]));
            assert!(!is_rtcp(&data));

            assert!(!is_stun(&data));
            assert!(!is_dtls(&data));
        }
    }

    #[test]
    fn test_dump_hex() {
        assert_eq!(dump_hex(&[]), "");
        assert_eq!(dump_hex(&[0, 0, 0, 0]), "00 00 00 00");
        assert_eq!(dump_hex(&[0, 1, 2, 3]), "00 01 02 03");
        assert_eq!(dump_hex(&[0x0a, 3, 0x0f, 3]), "0a 03 0f 03");
        assert_eq!(dump_hex_limit(&[0x0a, 3, 0x0f], 2), "0a 03");
    }
}
