//! Reverse tunnel: a public endpoint relays one client at a time to a private
//! service through a single outbound link dialed by the agent.
//!
//! The link carries a stream of frames (`Data`, `HeartBeat`, `EndOfStream`, see
//! `protocol`); every session ends with an `EndOfStream` in each direction, which
//! lets the same link carry the next session.

pub mod agent;
pub mod protocol;
pub mod pump;
pub mod server;
pub mod session;
pub mod transport;
