#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod attributes;
pub mod message;

pub use message::{Message, MessageType, TRANSACTION_ID_SIZE};
