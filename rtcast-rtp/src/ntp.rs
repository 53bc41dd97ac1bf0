//! NTP timestamp conversion for Sender Report synchronization.

use std::time::{SystemTime, UNIX_EPOCH};

/// Offset in seconds between the unix epoch and the NTP epoch (1900-01-01).
const NTP_EPOCH_OFFSET: u64 = 2_208_988_800;

/// 2^32, the fixed-point unit of the NTP fractional field.
const NTP_FRACTIONAL_UNIT: u64 = 1 << 32;

/// A 64-bit NTP timestamp paired with the system time it was derived from.
///
/// The upper 32 bits of `ntp` are seconds since the NTP epoch, the lower 32
/// bits the fraction of a second. Converting any integer millisecond through
/// [Ntp::from_time_ms] and back through [Ntp::to_time_ms] is lossless.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Ntp {
    pub ntp: u64,
    pub system_ms: u64,
}

impl Ntp {
    pub fn from_time_ms(ms: u64) -> Self {
        let seconds = ms / 1000 + NTP_EPOCH_OFFSET;
        let fractions = (ms % 1000) * NTP_FRACTIONAL_UNIT / 1000;
        Ntp {
            ntp: (seconds << 32) | fractions,
            system_ms: ms,
        }
    }

    pub fn to_time_ms(ntp: u64) -> Self {
        let seconds = (ntp >> 32).saturating_sub(NTP_EPOCH_OFFSET);
        let fractions = ntp & 0xFFFF_FFFF;
        // Integer truncation in from_time_ms loses up to one unit, rounding
        // here restores the exact millisecond.
        let frac_ms = ((fractions as f64) * 1000.0 / NTP_FRACTIONAL_UNIT as f64).round() as u64;
        Ntp {
            ntp,
            system_ms: seconds * 1000 + frac_ms,
        }
    }

    pub fn now() -> Self {
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Ntp::from_time_ms(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ntp_round_trip_small() {
        for ms in 0u64..10_000 {
            let ntp = Ntp::from_time_ms(ms);
            assert_eq!(ntp.system_ms, ms);

            let back = Ntp::to_time_ms(ntp.ntp);
            assert_eq!(back.system_ms, ms);
        }
    }

    #[test]
    fn test_ntp_round_trip_now() {
        let ntp = Ntp::now();
        let back = Ntp::to_time_ms(ntp.ntp);
        assert_eq!(back.system_ms, ntp.system_ms);
    }

    #[test]
    fn test_ntp_seconds_field() {
        let ntp = Ntp::from_time_ms(1000);
        assert_eq!(ntp.ntp >> 32, 1 + NTP_EPOCH_OFFSET);
        assert_eq!(ntp.ntp & 0xFFFF_FFFF, 0);
    }
}
