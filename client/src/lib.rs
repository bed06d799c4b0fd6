//! badsocks Client Library

pub mod config;
pub mod socks5;
