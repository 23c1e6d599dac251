//! Hop Core - Shared protocol types
//!
//! This crate contains the protocol and record types shared between the Hop
//! server (`hop-server`) and its clients for communication via Unix sockets.

mod protocol;

pub use protocol::*;
