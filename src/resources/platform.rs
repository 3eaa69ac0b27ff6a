//! Platform network snapshot

use super::{
    AddressSpec, HostnameSpec, LinkSpec, OperatorSpec, ProbeSpec, ResolverSpec, RouteSpec,
    TimeServerSpec,
};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Snapshot fetched from the live platform
pub const PLATFORM_CONFIG_ACTIVE_ID: &str = "active";
/// Snapshot loaded from the state volume
pub const PLATFORM_CONFIG_CACHED_ID: &str = "cached";

/// Platform-provided instance metadata
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlatformMetadata {
    pub platform: String,
    pub hostname: String,
    pub region: String,
    pub zone: String,
    pub instance_type: String,
    pub instance_id: String,
    pub provider_id: String,
    pub spot: bool,
}

/// Platform network configuration; persisted verbatim as YAML
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlatformConfig {
    pub addresses: Vec<AddressSpec>,
    pub links: Vec<LinkSpec>,
    pub routes: Vec<RouteSpec>,
    pub hostnames: Vec<HostnameSpec>,
    pub resolvers: Vec<ResolverSpec>,
    pub time_servers: Vec<TimeServerSpec>,
    pub operators: Vec<OperatorSpec>,
    pub external_ips: Vec<IpAddr>,
    pub probes: Vec<ProbeSpec>,
    pub metadata: Option<PlatformMetadata>,
}
