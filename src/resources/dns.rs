//! Host DNS resources

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Well-known id of the host DNS configuration
pub const HOST_DNS_CONFIG_ID: &str = "config";

/// Address the forwarder listens on for host processes
pub const HOST_DNS_LISTEN_ADDRESS: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 53)), 53);

/// Address pods reach the host forwarder on
pub const HOST_DNS_SERVICE_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::new(169, 254, 116, 108));

/// Host DNS forwarder configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostDnsConfig {
    pub enabled: bool,
    pub listen_addresses: Vec<SocketAddr>,
    pub service_host_dns_address: Option<IpAddr>,
    pub resolve_member_names: bool,
}

/// State of a forwarder runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsCacheState {
    #[default]
    Starting,
    Running,
    Stopped,
}

impl fmt::Display for DnsCacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DnsCacheState::Starting => write!(f, "starting"),
            DnsCacheState::Running => write!(f, "running"),
            DnsCacheState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Per-transport forwarder status (id = `tcp` or `udp`)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DnsResolveCache {
    pub status: DnsCacheState,
}

/// Upstream server used by the forwarder (id = server address)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DnsUpstream {
    pub addr: Option<SocketAddr>,
}
