//! badsocks Crypto - Cipher methods
//!
//! This crate provides:
//! - `CipherMethod`: wraps raw streams and datagram sockets into obfuscated ones
//! - `ShadowsocksMethod`: AEAD / AEAD-2022 method backed by the `shadowsocks` crate

mod method;
mod ss_method;

pub use method::*;
pub use ss_method::*;
