//! Resolver resources

use super::nethelpers::ConfigLayer;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Well-known id of the final resolver spec and status
pub const RESOLVER_ID: &str = "resolvers";

/// Desired DNS servers and search domains
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResolverSpec {
    pub dns_servers: Vec<IpAddr>,
    pub search_domains: Vec<String>,
    pub config_layer: ConfigLayer,
}

/// Applied resolver configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResolverStatus {
    pub dns_servers: Vec<IpAddr>,
    pub search_domains: Vec<String>,
}
