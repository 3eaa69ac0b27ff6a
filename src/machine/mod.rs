//! Machine Configuration
//!
//! The subset of the machine configuration document consumed by the network
//! controllers, plus kernel command line parsing. The document is an input:
//! it is decoded with `serde_yaml` and stored as a resource with id
//! [`MACHINE_CONFIG_ID`] in the `machine` namespace.

pub mod cmdline;

pub use cmdline::*;

use crate::error::{Error, Result};
use crate::resources::nethelpers::{
    AdSelect, ArpAllTargets, ArpValidate, BondMode, BondXmitHashPolicy, DefaultAction,
    FailOverMac, LacpRate, PrimaryReselect, Protocol, WolMode,
};
use crate::resources::{EthernetChannels, EthernetRings};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};

/// Well-known id of the machine configuration resource
pub const MACHINE_CONFIG_ID: &str = "v1alpha1";

// =============================================================================
// Document Root
// =============================================================================

/// Machine configuration document
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MachineConfig {
    pub machine: MachineSection,
    pub cluster: Option<ClusterSection>,
    pub network_rules: Option<NetworkRules>,
}

impl MachineConfig {
    pub fn from_yaml(data: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(data)?)
    }

    pub fn network(&self) -> &NetworkSection {
        &self.machine.network
    }

    pub fn devices(&self) -> &[Device] {
        &self.machine.network.interfaces
    }

    /// Pod CIDRs followed by service CIDRs
    pub fn cluster_cidrs(&self) -> Vec<IpNetwork> {
        self.cluster
            .as_ref()
            .map(|c| {
                c.network
                    .pod_subnets
                    .iter()
                    .chain(c.network.service_subnets.iter())
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MachineSection {
    pub network: NetworkSection,
    pub time: TimeSection,
    pub features: Features,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeSection {
    pub disabled: bool,
    pub servers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Features {
    #[serde(rename = "hostDNS")]
    pub host_dns: HostDnsFeature,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostDnsFeature {
    pub enabled: bool,
    #[serde(rename = "forwardKubeDNSToHost")]
    pub forward_kube_dns_to_host: bool,
    pub resolve_member_names: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterSection {
    pub network: ClusterNetwork,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterNetwork {
    pub pod_subnets: Vec<IpNetwork>,
    pub service_subnets: Vec<IpNetwork>,
}

// =============================================================================
// Network Section
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkSection {
    pub hostname: String,
    pub nameservers: Vec<IpAddr>,
    pub search_domains: Vec<String>,
    pub disable_search_domain: bool,
    pub extra_host_entries: Vec<ExtraHost>,
    pub interfaces: Vec<Device>,
    pub kubespan: KubeSpan,
    pub ethernet: Vec<EthernetConfig>,
    pub link_aliases: Vec<LinkAliasConfig>,
    pub probes: Vec<ProbeConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtraHost {
    pub ip: IpAddr,
    #[serde(default)]
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KubeSpan {
    pub enabled: bool,
}

/// Ethtool settings for a link
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EthernetConfig {
    pub name: String,
    pub rings: EthernetRings,
    pub features: BTreeMap<String, bool>,
    pub channels: EthernetChannels,
    pub wake_on_lan: Option<Vec<WolMode>>,
}

/// Alias assigned to the single link matching the selector
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LinkAliasConfig {
    pub name: String,
    pub selector: DeviceSelector,
}

/// TCP probe definition; durations in seconds
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProbeConfig {
    pub endpoint: String,
    pub interval: u64,
    pub timeout: u64,
    pub failure_threshold: u32,
}

// =============================================================================
// Devices
// =============================================================================

/// Glob expressions over link status fields; all set fields must match
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceSelector {
    pub hardware_addr: String,
    pub permanent_addr: String,
    #[serde(rename = "pciID")]
    pub pci_id: String,
    #[serde(rename = "driver")]
    pub kernel_driver: String,
    pub bus_path: String,
    pub physical: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Device {
    pub interface: String,
    pub device_selector: Option<DeviceSelector>,
    pub addresses: Vec<IpNetwork>,
    pub routes: Vec<RouteConfig>,
    pub mtu: u32,
    pub dhcp: bool,
    pub dhcp_options: Option<DhcpOptions>,
    pub ignore: bool,
    pub dummy: bool,
    pub bond: Option<BondConfig>,
    pub vlans: Vec<VlanConfig>,
    pub wireguard: Option<WireguardConfig>,
    pub vip: Option<VipConfig>,
}

impl Device {
    pub fn dhcp_ipv4(&self) -> bool {
        self.dhcp_options
            .as_ref()
            .and_then(|o| o.ipv4)
            .unwrap_or(true)
    }

    pub fn dhcp_ipv6(&self) -> bool {
        self.dhcp_options
            .as_ref()
            .and_then(|o| o.ipv6)
            .unwrap_or(false)
    }

    pub fn dhcp_route_metric(&self) -> u32 {
        self.dhcp_options
            .as_ref()
            .map(|o| o.route_metric)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouteConfig {
    pub network: Option<IpNetwork>,
    pub gateway: Option<IpAddr>,
    pub source: Option<IpAddr>,
    pub metric: u32,
    pub mtu: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DhcpOptions {
    pub route_metric: u32,
    pub ipv4: Option<bool>,
    pub ipv6: Option<bool>,
    #[serde(rename = "duidv6")]
    pub duid_v6: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VipConfig {
    pub ip: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VlanConfig {
    #[serde(rename = "vlanId")]
    pub vlan_id: u16,
    pub addresses: Vec<IpNetwork>,
    pub routes: Vec<RouteConfig>,
    pub dhcp: bool,
    pub mtu: u32,
    pub vip: Option<VipConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BondConfig {
    pub interfaces: Vec<String>,
    pub device_selectors: Vec<DeviceSelector>,
    pub mode: BondMode,
    pub xmit_hash_policy: BondXmitHashPolicy,
    pub lacp_rate: LacpRate,
    pub arp_validate: ArpValidate,
    pub arp_all_targets: ArpAllTargets,
    #[serde(rename = "arpIPTarget")]
    pub arp_ip_target: Vec<Ipv4Addr>,
    pub primary: String,
    pub primary_reselect: PrimaryReselect,
    pub fail_over_mac: FailOverMac,
    pub ad_select: AdSelect,
    pub miimon: u32,
    #[serde(rename = "updelay")]
    pub up_delay: u32,
    #[serde(rename = "downdelay")]
    pub down_delay: u32,
    pub arp_interval: u32,
    pub resend_igmp: u32,
    pub min_links: u32,
    pub lp_interval: u32,
    pub packets_per_slave: u32,
    pub num_peer_notif: u8,
    pub tlb_dynamic_lb: u8,
    pub all_slaves_active: u8,
    pub use_carrier: Option<bool>,
    pub ad_actor_sys_prio: u16,
    pub ad_user_port_key: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WireguardConfig {
    pub private_key: String,
    pub listen_port: u16,
    pub firewall_mark: u32,
    pub peers: Vec<WireguardPeerConfig>,
}

/// Peer definition; keepalive in seconds
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WireguardPeerConfig {
    pub public_key: String,
    pub endpoint: String,
    pub persistent_keepalive_interval: u64,
    #[serde(rename = "allowedIPs")]
    pub allowed_ips: Vec<IpNetwork>,
}

// =============================================================================
// Network Rules
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkRules {
    pub default_action: DefaultAction,
    pub rules: Vec<NetworkRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkRule {
    pub name: String,
    pub port_selector: PortSelector,
    pub ingress: Vec<IngressRule>,
}

impl NetworkRule {
    pub fn subnets(&self) -> Vec<IpNetwork> {
        self.ingress.iter().map(|i| i.subnet).collect()
    }

    pub fn except_subnets(&self) -> Vec<IpNetwork> {
        self.ingress.iter().filter_map(|i| i.except).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PortSelector {
    pub ports: Vec<PortValue>,
    pub protocol: Protocol,
}

impl PortSelector {
    /// Inclusive ranges in document order
    pub fn port_ranges(&self) -> Result<Vec<(u16, u16)>> {
        self.ports.iter().map(PortValue::range).collect()
    }
}

/// A port (`443`) or an inclusive range (`"50000-50010"`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortValue {
    Number(u16),
    Text(String),
}

impl PortValue {
    pub fn range(&self) -> Result<(u16, u16)> {
        match self {
            PortValue::Number(p) => Ok((*p, *p)),
            PortValue::Text(s) => {
                let parse = |v: &str| {
                    v.trim()
                        .parse::<u16>()
                        .map_err(|_| Error::Configuration(format!("invalid port {:?}", s)))
                };

                let (lo, hi) = match s.split_once('-') {
                    Some((lo, hi)) => (parse(lo)?, parse(hi)?),
                    None => {
                        let p = parse(s)?;
                        (p, p)
                    }
                };

                if lo > hi {
                    return Err(Error::Configuration(format!("invalid port range {:?}", s)));
                }

                Ok((lo, hi))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressRule {
    pub subnet: IpNetwork,
    #[serde(default)]
    pub except: Option<IpNetwork>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCUMENT: &str = r#"
machine:
  network:
    hostname: foo.example.com
    nameservers: [1.1.1.1, 2.2.2.2]
    interfaces:
      - interface: eth0
        addresses: [10.0.0.35/32]
        mtu: 9000
        dhcp: true
        dhcpOptions:
          routeMetric: 512
          ipv6: true
        vlans:
          - vlanId: 100
            addresses: [192.168.100.2/24]
      - interface: bond0
        bond:
          mode: 802.3ad
          lacpRate: fast
          deviceSelectors:
            - permanentAddr: "00:*"
  time:
    servers: [pool.ntp.org]
  features:
    hostDNS:
      enabled: true
      forwardKubeDNSToHost: true
cluster:
  network:
    podSubnets: [10.244.0.0/16]
    serviceSubnets: [10.96.0.0/12]
networkRules:
  defaultAction: block
  rules:
    - name: kubelet
      portSelector:
        ports: [10250, "50000-50010"]
        protocol: tcp
      ingress:
        - subnet: 10.0.0.0/8
          except: 10.3.0.0/16
"#;

    #[test]
    fn test_decode_document() {
        let cfg = MachineConfig::from_yaml(DOCUMENT).unwrap();

        assert_eq!(cfg.network().hostname, "foo.example.com");
        assert_eq!(cfg.devices().len(), 2);

        let eth0 = &cfg.devices()[0];
        assert_eq!(eth0.mtu, 9000);
        assert!(eth0.dhcp_ipv4());
        assert!(eth0.dhcp_ipv6());
        assert_eq!(eth0.dhcp_route_metric(), 512);
        assert_eq!(eth0.vlans[0].vlan_id, 100);

        let bond = cfg.devices()[1].bond.as_ref().unwrap();
        assert_eq!(bond.mode, BondMode::Ieee8023ad);
        assert_eq!(bond.lacp_rate, LacpRate::Fast);
        assert_eq!(bond.device_selectors[0].permanent_addr, "00:*");

        assert!(cfg.machine.features.host_dns.forward_kube_dns_to_host);
        assert_eq!(cfg.cluster_cidrs().len(), 2);
    }

    #[test]
    fn test_network_rules() {
        let cfg = MachineConfig::from_yaml(DOCUMENT).unwrap();
        let rules = cfg.network_rules.unwrap();

        assert_eq!(rules.default_action, DefaultAction::Block);
        assert_eq!(
            rules.rules[0].port_selector.port_ranges().unwrap(),
            vec![(10250, 10250), (50000, 50010)]
        );
        assert_eq!(
            rules.rules[0].except_subnets(),
            vec!["10.3.0.0/16".parse::<IpNetwork>().unwrap()]
        );
    }

    #[test]
    fn test_invalid_port_range() {
        assert!(PortValue::Text("20-10".into()).range().is_err());
        assert!(PortValue::Text("abc".into()).range().is_err());
    }
}
