//! capstan-core — wire protocol, typed packets, codec, and configuration.
//! Both the client library and the test harness depend on this crate.

pub mod codec;
pub mod config;
pub mod packet;
pub mod wire;

pub use codec::{decode_packet, encode_packet, Decoded};
pub use packet::{JobHandle, Packet, Priority};
