//! Module services built on the command engine: identity and signal, network
//! and packet data, TLS contexts, the GNSS receiver and its geo-fences.

pub mod geo;
pub mod gnss;
pub mod info;
pub mod network;
pub mod tls;
