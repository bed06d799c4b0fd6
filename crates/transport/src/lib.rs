//! badsocks Transport - Dialing and stream transports
//!
//! This crate provides:
//! - `Dialer` / `DefaultDialer`: raw TCP and UDP sockets to the proxy server
//! - `DialContext`: cancellation and timeout for in-flight dials
//! - `ProxyDialer`: the raw proxied dial capability consumed by the clients below
//! - Datagrams framed over a byte stream
//! - UDP-over-TCP tunnel client
//! - Multiplexing client (yamux session pool)

mod context;
mod dialer;
mod error;
mod mux;
mod mux_session;
mod packet;
mod uot;

pub use context::*;
pub use dialer::*;
pub use error::*;
pub use mux::*;
pub use packet::*;
pub use uot::*;
