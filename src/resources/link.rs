//! Link resources
//!
//! Desired links carry VLAN, bond and wireguard settings as typed structs;
//! the byte-level encoding lives in the netlink adapter.

use super::nethelpers::{
    AdSelect, ArpAllTargets, ArpValidate, BondMode, BondXmitHashPolicy, ConfigLayer, Duplex,
    FailOverMac, HardwareAddr, LacpRate, LinkFlags, LinkType, OperState, Port, PrimaryReselect,
    VlanProtocol,
};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;

// =============================================================================
// Link Kinds
// =============================================================================

pub const KIND_BOND: &str = "bond";
pub const KIND_VLAN: &str = "vlan";
pub const KIND_WIREGUARD: &str = "wireguard";
pub const KIND_BRIDGE: &str = "bridge";
pub const KIND_DUMMY: &str = "dummy";
pub const KIND_TUN: &str = "tun";

/// Link name of the wireguard mesh interface
pub const KUBESPAN_LINK_NAME: &str = "kubespan";
/// Link name of the management tunnel interface
pub const SIDEROLINK_NAME: &str = "siderolink";

// =============================================================================
// VLAN
// =============================================================================

/// VLAN settings of a link
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VlanSpec {
    pub vid: u16,
    pub protocol: VlanProtocol,
}

impl VlanSpec {
    pub fn is_zero(&self) -> bool {
        self.vid == 0
    }
}

/// Name of a VLAN sub-link: `{parent}.{vid}`
pub fn vlan_link_name(parent: &str, vid: u16) -> String {
    format!("{}.{}", parent, vid)
}

// =============================================================================
// Bond
// =============================================================================

/// Bond master settings
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BondMasterSpec {
    pub mode: BondMode,
    pub hash_policy: BondXmitHashPolicy,
    pub lacp_rate: LacpRate,
    pub arp_validate: ArpValidate,
    pub arp_all_targets: ArpAllTargets,
    pub arp_ip_targets: Vec<Ipv4Addr>,
    pub primary_index: u32,
    pub primary_reselect: PrimaryReselect,
    pub fail_over_mac: FailOverMac,
    pub ad_select: AdSelect,
    pub miimon: u32,
    pub up_delay: u32,
    pub down_delay: u32,
    pub arp_interval: u32,
    pub resend_igmp: u32,
    pub min_links: u32,
    pub lp_interval: u32,
    pub packets_per_slave: u32,
    pub num_peer_notif: u8,
    pub tlb_dynamic_lb: u8,
    pub all_slaves_active: u8,
    pub use_carrier: bool,
    pub ad_actor_sys_prio: u16,
    pub ad_user_port_key: u16,
}

impl BondMasterSpec {
    pub fn is_zero(&self) -> bool {
        *self == BondMasterSpec::default()
    }
}

/// Bond slave settings of a link
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BondSlave {
    pub master_name: String,
    pub slave_index: u32,
}

impl BondSlave {
    pub fn is_zero(&self) -> bool {
        self.master_name.is_empty()
    }
}

// =============================================================================
// Wireguard
// =============================================================================

/// Wireguard peer
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WireguardPeer {
    pub public_key: String,
    pub preshared_key: String,
    pub endpoint: String,
    pub persistent_keepalive_interval: Duration,
    pub allowed_ips: Vec<IpNetwork>,
}

/// Wireguard device settings
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WireguardSpec {
    pub private_key: String,
    pub public_key: String,
    pub listen_port: u16,
    pub firewall_mark: u32,
    pub peers: Vec<WireguardPeer>,
}

impl WireguardSpec {
    pub fn is_zero(&self) -> bool {
        *self == WireguardSpec::default()
    }

    /// Canonical order: peers by public key, allowed IPs ascending
    pub fn sort(&mut self) {
        self.peers
            .sort_by(|a, b| a.public_key.cmp(&b.public_key));

        for peer in &mut self.peers {
            peer.allowed_ips
                .sort_by(|a, b| (a.ip(), a.prefix()).cmp(&(b.ip(), b.prefix())));
        }
    }

    /// Merge a later layer: non-zero scalars override, peers are unioned
    pub fn merge(&mut self, other: &WireguardSpec) {
        if !other.private_key.is_empty() {
            self.private_key = other.private_key.clone();
        }

        if !other.public_key.is_empty() {
            self.public_key = other.public_key.clone();
        }

        if other.listen_port != 0 {
            self.listen_port = other.listen_port;
        }

        if other.firewall_mark != 0 {
            self.firewall_mark = other.firewall_mark;
        }

        // peers are keyed by public key; the first layer to name a peer keeps it
        for peer in &other.peers {
            if !self.peers.iter().any(|p| p.public_key == peer.public_key) {
                self.peers.push(peer.clone());
            }
        }
    }
}

// =============================================================================
// LinkSpec
// =============================================================================

/// Desired interface
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LinkSpec {
    pub name: String,
    pub logical: bool,
    pub up: bool,
    pub mtu: u32,
    pub kind: String,
    #[serde(rename = "type")]
    pub link_type: LinkType,
    pub parent_name: String,
    pub bond_slave: BondSlave,
    pub vlan: VlanSpec,
    pub bond_master: BondMasterSpec,
    pub wireguard: WireguardSpec,
    pub config_layer: ConfigLayer,
}

impl LinkSpec {
    /// Physical link brought up at the given layer
    pub fn up(name: &str, layer: ConfigLayer) -> Self {
        Self {
            name: name.to_string(),
            up: true,
            config_layer: layer,
            ..Default::default()
        }
    }

    /// Fold a later layer into this spec
    pub fn merge(&mut self, other: &LinkSpec) {
        if !other.name.is_empty() {
            self.name = other.name.clone();
        }

        if other.logical {
            self.logical = true;
        }

        if other.up {
            self.up = true;
        }

        if other.mtu != 0 {
            self.mtu = other.mtu;
        }

        if !other.kind.is_empty() {
            self.kind = other.kind.clone();
        }

        if other.link_type != LinkType::default() {
            self.link_type = other.link_type;
        }

        if !other.parent_name.is_empty() {
            self.parent_name = other.parent_name.clone();
        }

        if !other.bond_slave.is_zero() {
            self.bond_slave = other.bond_slave.clone();
        }

        if !other.vlan.is_zero() {
            self.vlan = other.vlan.clone();
        }

        if !other.bond_master.is_zero() {
            self.bond_master = other.bond_master.clone();
        }

        // earlier layers may carry wireguard values later layers leave zero
        if !other.wireguard.is_zero() {
            if self.wireguard.is_zero() {
                self.wireguard = other.wireguard.clone();
            } else {
                self.wireguard.merge(&other.wireguard);
            }
        }

        if other.config_layer > self.config_layer {
            self.config_layer = other.config_layer;
        }
    }
}

// =============================================================================
// LinkStatus
// =============================================================================

/// Observed link
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LinkStatus {
    pub index: u32,
    #[serde(rename = "type")]
    pub link_type: LinkType,
    /// Parent link index (VLAN)
    pub link_index: u32,
    pub flags: LinkFlags,
    pub hardware_addr: HardwareAddr,
    pub permanent_addr: HardwareAddr,
    pub broadcast_addr: HardwareAddr,
    pub mtu: u32,
    pub master_index: u32,
    pub oper_state: OperState,
    pub kind: String,
    pub slave_kind: String,
    pub alias: String,
    pub bus_path: String,
    pub pci_id: String,
    pub driver: String,
    pub link_state: bool,
    pub port: Port,
    pub duplex: Duplex,
    pub speed_mbit: u32,
    pub vlan: VlanSpec,
    pub bond_master: BondMasterSpec,
    pub wireguard: WireguardSpec,
}

impl LinkStatus {
    /// No kind set and hardware type ether
    pub fn physical(&self) -> bool {
        self.kind.is_empty() && self.link_type == LinkType::Ether
    }

    pub fn is_up(&self) -> bool {
        matches!(self.oper_state, OperState::Up | OperState::Unknown)
    }
}

/// Generation counter bumped to force a link status re-read
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LinkRefresh {
    pub generation: u64,
}

impl LinkRefresh {
    pub fn bump(&mut self) {
        self.generation += 1;
    }
}

/// Alias to set on a physical link (id = link name)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LinkAliasSpec {
    pub alias: String,
}

/// Alias observed on a physical link after the spec controller applied it
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LinkAliasStatus {
    pub alias: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(key: &str) -> WireguardPeer {
        WireguardPeer {
            public_key: key.into(),
            endpoint: "10.0.0.1:51820".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_link_merge_scalars() {
        let mut base = LinkSpec {
            name: "eth0".into(),
            up: true,
            mtu: 1500,
            config_layer: ConfigLayer::Default,
            ..Default::default()
        };

        base.merge(&LinkSpec {
            name: "eth0".into(),
            mtu: 9000,
            config_layer: ConfigLayer::Configuration,
            ..Default::default()
        });

        assert!(base.up);
        assert_eq!(base.mtu, 9000);
        assert_eq!(base.config_layer, ConfigLayer::Configuration);
    }

    #[test]
    fn test_link_merge_keeps_logical() {
        let mut base = LinkSpec {
            name: "bond0".into(),
            logical: true,
            kind: KIND_BOND.into(),
            ..Default::default()
        };

        base.merge(&LinkSpec::up("bond0", ConfigLayer::Platform));

        assert!(base.logical);
        assert_eq!(base.kind, KIND_BOND);
    }

    #[test]
    fn test_wireguard_merge_unions_peers() {
        let mut base = LinkSpec {
            name: "wg0".into(),
            wireguard: WireguardSpec {
                private_key: "old".into(),
                listen_port: 51820,
                peers: vec![peer("a")],
                ..Default::default()
            },
            ..Default::default()
        };

        base.merge(&LinkSpec {
            name: "wg0".into(),
            wireguard: WireguardSpec {
                private_key: "new".into(),
                peers: vec![peer("a"), peer("b")],
                ..Default::default()
            },
            ..Default::default()
        });

        assert_eq!(base.wireguard.private_key, "new");
        assert_eq!(base.wireguard.listen_port, 51820);
        assert_eq!(base.wireguard.peers.len(), 2);
    }

    #[test]
    fn test_wireguard_merge_keys_peers_by_public_key() {
        let mut platform = WireguardSpec {
            peers: vec![peer("PEERKEY=")],
            ..Default::default()
        };

        let mut moved = peer("PEERKEY=");
        moved.endpoint = "10.0.0.2:51820".into();

        platform.merge(&WireguardSpec {
            peers: vec![moved],
            ..Default::default()
        });

        assert_eq!(platform.peers.len(), 1);
        assert_eq!(platform.peers[0].endpoint, "10.0.0.1:51820");
    }

    #[test]
    fn test_physical() {
        let status = LinkStatus {
            link_type: LinkType::Ether,
            ..Default::default()
        };
        assert!(status.physical());

        let bond = LinkStatus {
            link_type: LinkType::Ether,
            kind: KIND_BOND.into(),
            ..Default::default()
        };
        assert!(!bond.physical());
    }
}
