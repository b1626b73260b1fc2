//! `shareway`: a rendezvous broker that relays one file from a sender to a
//! receiver over a hand-rolled [WebSocket protocol](https://datatracker.org/doc/html/rfc6455)
//! transport. One sender and one receiver each upgrade an HTTP connection,
//! are paired by a short random share code, and a dedicated task forwards
//! their application-level messages in lockstep until the transfer
//! completes or either side faults.

pub mod app;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod http;
pub mod registry;
pub mod share;
