//! Stream bridges: repackage RTC media into RTMP/FLV messages and back.

pub mod frame;
pub mod rtc2rtmp;
pub mod rtmp2rtc;
