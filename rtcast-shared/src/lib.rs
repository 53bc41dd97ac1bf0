#![warn(rust_2018_idioms)]

pub mod error;
pub mod marshal;
pub mod tcp_framing;
pub(crate) mod transport;
pub mod util;

pub use transport::{
    FiveTuple, FourTuple, TaggedBytesMut, TransportContext, TransportMessage, TransportProtocol,
};
