#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod codec;
pub mod header;
pub mod jitter;
pub mod nack;
pub mod ntp;
pub mod packet;
pub mod queue;
pub mod ring;
pub mod rtcp;
pub mod seq;

pub use header::RtpHeader;
pub use packet::{FrameType, Payload, PayloadKind, RtpPacket};
