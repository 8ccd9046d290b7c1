//! The codec core: byte streams, wire formats, the per-peer accumulator
//! and decoder pool, the encode pipeline and the connection state machine.

pub mod accumulator;
pub mod buffer;
pub mod connection;
pub mod encode;
pub mod identity;
pub mod packet;
pub mod pool;
pub mod stream;
pub mod support;
pub mod wire;
pub mod zip;
