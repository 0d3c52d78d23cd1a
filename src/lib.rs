//! linedrop: a capacity-bounded line-protocol file server
//!
//! Clients connect over TCP, receive a server-assigned session name, and
//! issue newline-terminated text commands. Files from a flat repository
//! directory are streamed with a size + SHA-256 header so the receiver can
//! verify integrity.
//!
//! Components:
//! - `channel`: newline-framed text over a byte stream
//! - `transfer`: file framing, streaming and verification
//! - `registry`: shared session records
//! - `admission`: concurrent session cap
//! - `protocol`: command parsing and response lines
//! - `session`: per-connection state machine
//! - `server`: acceptor loop
//! - `client`: protocol consumer used by `linedrop-client`

pub mod admission;
pub mod channel;
pub mod client;
pub mod config;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod transfer;
