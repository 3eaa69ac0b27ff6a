//! Host DNS
//!
//! Local caching-resolver endpoint: listeners on the host DNS addresses that
//! forward queries to the upstreams currently published by the resolver
//! status.

pub mod forwarder;

pub use forwarder::{DnsConfig, DnsServer, Transport, Upstreams};
