//! badsocks Protocol - Addresses, connection contracts and wire codecs
//!
//! This crate defines the data structures shared by every badsocks layer:
//! - `SocksAddr`: SOCKS5-style destination address (IP or domain + port)
//! - `Network`: the network kinds an outbound can dial (TCP / UDP)
//! - `BoxedStream`, `PacketConn`, `BoundPacketConn`: connection contracts
//! - UDP-over-TCP and multiplex request framing

mod address;
mod io;
mod mux;
mod network;
mod uot;

pub use address::*;
pub use io::*;
pub use mux::*;
pub use network::*;
pub use uot::*;
