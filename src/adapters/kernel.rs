//! Kernel Ports
//!
//! Typed operations on links, addresses, routes, ethtool settings,
//! wireguard devices, nftables and host identity. Controllers only talk to
//! the kernel through these traits; raw attribute payloads stay inside the
//! adapters.

use super::link_data::LinkData;
use super::nftables::{NfBatch, NfChainState, NfTableRef};
use super::wireguard::{WireguardDevice, WireguardPatch};
use crate::error::Result;
use crate::resources::nethelpers::{
    AddressFlags, Duplex, Family, HardwareAddr, LinkFlags, LinkType, OperState, Port,
    RouteFlags, RouteProtocol, RouteType, RoutingTable, Scope, WolMode,
};
use crate::resources::{
    EthernetChannels, EthernetChannelsStatus, EthernetRings, EthernetRingsStatus,
};
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use tokio::sync::broadcast;

// =============================================================================
// Kernel Objects
// =============================================================================

/// `IFLA_LINKINFO` block
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LinkInfo {
    pub kind: String,
    pub data: LinkData,
    pub slave_kind: String,
}

/// Link as reported by RTM_GETLINK
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KernelLink {
    pub index: u32,
    pub name: String,
    pub link_type: LinkType,
    pub flags: LinkFlags,
    pub mtu: u32,
    pub master_index: u32,
    pub parent_index: u32,
    pub hardware_addr: HardwareAddr,
    pub permanent_addr: HardwareAddr,
    pub broadcast_addr: HardwareAddr,
    pub oper_state: OperState,
    pub alias: String,
    pub bus_path: String,
    pub pci_id: String,
    pub driver: String,
    pub info: Option<LinkInfo>,
}

impl KernelLink {
    pub fn kind(&self) -> &str {
        self.info.as_ref().map(|i| i.kind.as_str()).unwrap_or_default()
    }

    pub fn is_up(&self) -> bool {
        self.flags.contains(LinkFlags::UP)
    }
}

/// Request for RTM_NEWLINK
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LinkRequest {
    pub name: String,
    pub kind: String,
    pub link_type: LinkType,
    pub mtu: u32,
    pub parent_index: u32,
    pub data: LinkData,
}

/// Address as reported by RTM_GETADDR
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelAddress {
    pub index: u32,
    pub family: Family,
    pub prefix: IpNetwork,
    pub local: Option<IpAddr>,
    pub broadcast: Option<IpAddr>,
    pub anycast: Option<IpAddr>,
    pub multicast: Option<IpAddr>,
    pub scope: Scope,
    pub flags: AddressFlags,
}

impl KernelAddress {
    /// Address to install: IPv4 prefixes carry a computed broadcast
    pub fn new(index: u32, prefix: IpNetwork, scope: Scope, flags: AddressFlags) -> Self {
        Self {
            index,
            family: Family::of(&prefix.ip()),
            prefix,
            local: Some(prefix.ip()),
            broadcast: ipv4_broadcast(&prefix).map(IpAddr::V4),
            anycast: None,
            multicast: None,
            scope,
            flags,
        }
    }
}

/// IPv4 broadcast address: `ip | ~mask`
pub fn ipv4_broadcast(prefix: &IpNetwork) -> Option<Ipv4Addr> {
    match prefix {
        IpNetwork::V4(net) if net.prefix() < 31 => {
            let mask = u32::from(net.mask());
            Some(Ipv4Addr::from(u32::from(net.ip()) | !mask))
        }
        _ => None,
    }
}

/// Route as reported by RTM_GETROUTE
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KernelRoute {
    pub family: Family,
    pub destination: Option<IpNetwork>,
    pub source: Option<IpAddr>,
    pub gateway: Option<IpAddr>,
    pub out_index: u32,
    pub table: RoutingTable,
    pub priority: u32,
    pub protocol: RouteProtocol,
    pub scope: Scope,
    pub route_type: RouteType,
    pub flags: RouteFlags,
    pub mtu: u32,
}

impl KernelRoute {
    /// Identity used for matching: `(family, dst, gateway, table, priority)`
    pub fn same_key(&self, other: &KernelRoute) -> bool {
        self.family == other.family
            && self.destination == other.destination
            && self.gateway == other.gateway
            && self.table == other.table
            && self.priority == other.priority
    }
}

/// ethtool link mode report
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EthtoolLinkState {
    pub link_up: bool,
    pub speed_mbit: Option<u32>,
    pub port: Port,
    pub duplex: Duplex,
}

/// Multicast notification from a kernel watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelEvent {
    Link,
    Address,
    Route,
    Ethtool,
}

// =============================================================================
// Ports
// =============================================================================

/// rtnetlink link operations
#[async_trait]
pub trait LinkBackend: Send + Sync {
    async fn list_links(&self) -> Result<Vec<KernelLink>>;

    /// Create a link, returning its index
    async fn create_link(&self, request: LinkRequest) -> Result<u32>;

    async fn delete_link(&self, index: u32) -> Result<()>;

    async fn set_link_up(&self, index: u32, up: bool) -> Result<()>;

    async fn set_link_mtu(&self, index: u32, mtu: u32) -> Result<()>;

    /// Enslave to `master_index`; 0 releases the link
    async fn set_link_master(&self, index: u32, master_index: u32) -> Result<()>;

    async fn set_link_alias(&self, index: u32, alias: &str) -> Result<()>;

    /// Replace the kind-specific settings (`IFLA_INFO_DATA`)
    async fn set_link_data(&self, index: u32, data: LinkData) -> Result<()>;

    fn watch_links(&self) -> broadcast::Receiver<KernelEvent>;
}

/// rtnetlink address operations
#[async_trait]
pub trait AddressBackend: Send + Sync {
    async fn list_addresses(&self) -> Result<Vec<KernelAddress>>;

    async fn add_address(&self, address: KernelAddress) -> Result<()>;

    async fn delete_address(&self, index: u32, prefix: IpNetwork) -> Result<()>;

    fn watch_addresses(&self) -> broadcast::Receiver<KernelEvent>;
}

/// rtnetlink route operations
#[async_trait]
pub trait RouteBackend: Send + Sync {
    async fn list_routes(&self) -> Result<Vec<KernelRoute>>;

    async fn add_route(&self, route: KernelRoute) -> Result<()>;

    async fn delete_route(&self, route: &KernelRoute) -> Result<()>;

    fn watch_routes(&self) -> broadcast::Receiver<KernelEvent>;
}

/// ethtool genetlink operations; unsupported settings return `KernelUnsupported`
#[async_trait]
pub trait EthtoolBackend: Send + Sync {
    async fn link_state(&self, name: &str) -> Result<EthtoolLinkState>;

    async fn rings(&self, name: &str) -> Result<EthernetRingsStatus>;

    async fn set_rings(&self, name: &str, rings: &EthernetRings) -> Result<()>;

    async fn features(&self, name: &str) -> Result<BTreeMap<String, bool>>;

    async fn set_features(&self, name: &str, features: &BTreeMap<String, bool>) -> Result<()>;

    async fn channels(&self, name: &str) -> Result<EthernetChannelsStatus>;

    async fn set_channels(&self, name: &str, channels: &EthernetChannels) -> Result<()>;

    async fn wake_on_lan(&self, name: &str) -> Result<Vec<WolMode>>;

    async fn set_wake_on_lan(&self, name: &str, modes: &[WolMode]) -> Result<()>;

    fn watch_ethtool(&self) -> broadcast::Receiver<KernelEvent>;
}

/// wgctrl operations
#[async_trait]
pub trait WireguardBackend: Send + Sync {
    async fn wireguard_device(&self, name: &str) -> Result<WireguardDevice>;

    async fn configure_wireguard(&self, name: &str, patch: WireguardPatch) -> Result<()>;
}

/// nftables operations
#[async_trait]
pub trait NfTablesBackend: Send + Sync {
    async fn list_tables(&self) -> Result<Vec<NfTableRef>>;

    async fn list_chains(&self, table: &NfTableRef) -> Result<Vec<NfChainState>>;

    /// Apply a batch atomically
    async fn apply(&self, batch: NfBatch) -> Result<()>;
}

/// Host identity syscalls
#[async_trait]
pub trait HostBackend: Send + Sync {
    async fn set_hostname(&self, hostname: &str) -> Result<()>;

    async fn set_domainname(&self, domainname: &str) -> Result<()>;
}

/// Every kernel surface the controllers use
pub trait Kernel:
    LinkBackend
    + AddressBackend
    + RouteBackend
    + EthtoolBackend
    + WireguardBackend
    + NfTablesBackend
    + HostBackend
{
}

impl<T> Kernel for T where
    T: LinkBackend
        + AddressBackend
        + RouteBackend
        + EthtoolBackend
        + WireguardBackend
        + NfTablesBackend
        + HostBackend
{
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_broadcast() {
        let prefix: IpNetwork = "10.5.0.7/24".parse().unwrap();
        assert_eq!(ipv4_broadcast(&prefix), Some("10.5.0.255".parse().unwrap()));

        let host: IpNetwork = "10.5.0.7/32".parse().unwrap();
        assert_eq!(ipv4_broadcast(&host), None);

        let v6: IpNetwork = "2001:db8::1/64".parse().unwrap();
        assert_eq!(ipv4_broadcast(&v6), None);

        let addr = KernelAddress::new(2, prefix, Scope::Global, AddressFlags::PERMANENT);
        assert_eq!(addr.family, Family::Inet4);
        assert_eq!(addr.broadcast, Some("10.5.0.255".parse().unwrap()));
    }
}
