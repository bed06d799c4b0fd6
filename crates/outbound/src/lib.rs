//! badsocks Outbound - Connection dispatch to a badsocks server
//!
//! This crate provides:
//! - `BadsocksOutbound`: dials streams and datagram channels through the
//!   server, either directly, multiplexed or tunneled over UDP-over-TCP
//! - `BadsocksOutboundOptions`: TOML/serde configuration
//! - Inbound relaying for accepted connections

mod dialer;
mod error;
mod metadata;
mod options;
mod outbound;
mod relay;

pub use dialer::*;
pub use error::*;
pub use metadata::*;
pub use options::*;
pub use outbound::*;
pub use relay::*;
