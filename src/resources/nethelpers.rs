//! Network Helper Types
//!
//! Kernel-facing enumerations and bit sets shared by resources, adapters and
//! controllers. Every enum keeps its kernel numeric value next to the label
//! used in configuration documents and logs.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

macro_rules! named_enum {
    (
        $(#[$meta:meta])*
        $name:ident : $repr:ty {
            $( $(#[$vmeta:meta])* $variant:ident = $value:expr => $label:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            /// Kernel numeric value
            pub fn value(self) -> $repr {
                match self {
                    $( $name::$variant => $value ),+
                }
            }

            /// Decode from the kernel numeric value
            pub fn from_value(value: $repr) -> Option<Self> {
                $(
                    if value == $value {
                        return Some($name::$variant);
                    }
                )+
                None
            }

            pub fn as_str(self) -> &'static str {
                match self {
                    $( $name::$variant => $label ),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $( $label => Ok($name::$variant), )+
                    _ => Err(Error::Configuration(format!(
                        "unknown {} {:?}",
                        stringify!($name),
                        s
                    ))),
                }
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

// =============================================================================
// Config Layers
// =============================================================================

named_enum! {
    /// Source of a piece of network intent; higher layers win on conflict
    ConfigLayer: u8 {
        #[default]
        Default = 0 => "default",
        Platform = 1 => "platform",
        Operator = 2 => "operator",
        Cmdline = 3 => "cmdline",
        Configuration = 4 => "configuration",
    }
}

// =============================================================================
// Addressing
// =============================================================================

named_enum! {
    /// Address family
    Family: u8 {
        #[default]
        Unspec = 0 => "unspec",
        Inet4 = 2 => "inet4",
        Inet6 = 10 => "inet6",
    }
}

impl Family {
    pub fn of(addr: &std::net::IpAddr) -> Self {
        match addr {
            std::net::IpAddr::V4(_) => Family::Inet4,
            std::net::IpAddr::V6(_) => Family::Inet6,
        }
    }
}

named_enum! {
    /// Address and route scope (RT_SCOPE_*)
    Scope: u8 {
        #[default]
        Global = 0 => "global",
        Site = 200 => "site",
        Link = 253 => "link",
        Host = 254 => "host",
        Nowhere = 255 => "nowhere",
    }
}

named_enum! {
    /// Route type (RTN_*)
    RouteType: u8 {
        Unspec = 0 => "unspec",
        #[default]
        Unicast = 1 => "unicast",
        Local = 2 => "local",
        Broadcast = 3 => "broadcast",
        Anycast = 4 => "anycast",
        Multicast = 5 => "multicast",
        Blackhole = 6 => "blackhole",
        Unreachable = 7 => "unreachable",
        Prohibit = 8 => "prohibit",
        Throw = 9 => "throw",
        Nat = 10 => "nat",
    }
}

named_enum! {
    /// Route protocol (RTPROT_*)
    RouteProtocol: u8 {
        Unspec = 0 => "unspec",
        Redirect = 1 => "redirect",
        Kernel = 2 => "kernel",
        Boot = 3 => "boot",
        #[default]
        Static = 4 => "static",
        Ra = 9 => "ra",
        Dhcp = 16 => "dhcp",
    }
}

/// Routing table id; well-known tables render by name
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RoutingTable(pub u32);

impl RoutingTable {
    pub const UNSPEC: RoutingTable = RoutingTable(0);
    pub const DEFAULT: RoutingTable = RoutingTable(253);
    pub const MAIN: RoutingTable = RoutingTable(254);
    pub const LOCAL: RoutingTable = RoutingTable(255);
}

impl Default for RoutingTable {
    fn default() -> Self {
        RoutingTable::MAIN
    }
}

impl fmt::Display for RoutingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            RoutingTable::UNSPEC => write!(f, "unspec"),
            RoutingTable::DEFAULT => write!(f, "default"),
            RoutingTable::MAIN => write!(f, "main"),
            RoutingTable::LOCAL => write!(f, "local"),
            RoutingTable(n) => write!(f, "{}", n),
        }
    }
}

impl FromStr for RoutingTable {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unspec" => Ok(RoutingTable::UNSPEC),
            "default" => Ok(RoutingTable::DEFAULT),
            "main" => Ok(RoutingTable::MAIN),
            "local" => Ok(RoutingTable::LOCAL),
            other => other
                .parse::<u32>()
                .map(RoutingTable)
                .map_err(|_| Error::Configuration(format!("unknown routing table {:?}", other))),
        }
    }
}

impl Serialize for RoutingTable {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RoutingTable {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

macro_rules! bit_flags {
    (
        $(#[$meta:meta])*
        $name:ident { $( $flag:ident = $value:expr => $label:literal ),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl $name {
            $( pub const $flag: $name = $name($value); )+

            pub fn contains(self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }

            pub fn insert(&mut self, other: $name) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: $name) {
                self.0 &= !other.0;
            }
        }

        impl std::ops::BitOr for $name {
            type Output = $name;

            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let mut labels = Vec::new();
                $(
                    if $value != 0 && self.0 & $value == $value {
                        labels.push($label);
                    }
                )+
                write!(f, "{}", labels.join(","))
            }
        }
    };
}

bit_flags! {
    /// Address flags (IFA_F_*)
    AddressFlags {
        SECONDARY = 0x01 => "secondary",
        NODAD = 0x02 => "nodad",
        OPTIMISTIC = 0x04 => "optimistic",
        DADFAILED = 0x08 => "dadfailed",
        HOMEADDRESS = 0x10 => "homeaddress",
        DEPRECATED = 0x20 => "deprecated",
        TENTATIVE = 0x40 => "tentative",
        PERMANENT = 0x80 => "permanent",
        MANAGETEMPADDR = 0x100 => "mngtmpaddr",
        NOPREFIXROUTE = 0x200 => "noprefixroute",
    }
}

bit_flags! {
    /// Route flags (RTM_F_*)
    RouteFlags {
        NOTIFY = 0x100 => "notify",
        CLONED = 0x200 => "cloned",
        EQUALIZE = 0x400 => "equalize",
        PREFIX = 0x800 => "prefix",
    }
}

bit_flags! {
    /// Link flags (IFF_*)
    LinkFlags {
        UP = 0x1 => "UP",
        BROADCAST = 0x2 => "BROADCAST",
        LOOPBACK = 0x8 => "LOOPBACK",
        POINTTOPOINT = 0x10 => "POINTTOPOINT",
        RUNNING = 0x40 => "RUNNING",
        NOARP = 0x80 => "NOARP",
        MASTER = 0x400 => "MASTER",
        SLAVE = 0x800 => "SLAVE",
        MULTICAST = 0x1000 => "MULTICAST",
    }
}

// =============================================================================
// Links
// =============================================================================

named_enum! {
    /// Operational state (IF_OPER_*)
    OperState: u8 {
        #[default]
        Unknown = 0 => "unknown",
        NotPresent = 1 => "notPresent",
        Down = 2 => "down",
        LowerLayerDown = 3 => "lowerLayerDown",
        Testing = 4 => "testing",
        Dormant = 5 => "dormant",
        Up = 6 => "up",
    }
}

named_enum! {
    /// Hardware link type (ARPHRD_*)
    LinkType: u16 {
        Netrom = 0 => "netrom",
        #[default]
        Ether = 1 => "ether",
        Infiniband = 32 => "infiniband",
        Tunnel = 768 => "ipip",
        Tunnel6 = 769 => "tunnel6",
        Loopback = 772 => "loopback",
        Sit = 776 => "sit",
        Ipgre = 778 => "ipgre",
        None = 65534 => "none",
        Void = 65535 => "void",
    }
}

named_enum! {
    /// Ethernet duplex
    Duplex: u8 {
        Half = 0 => "half",
        Full = 1 => "full",
        #[default]
        Unknown = 255 => "unknown",
    }
}

named_enum! {
    /// Ethernet port type (PORT_*)
    Port: u8 {
        TwistedPair = 0 => "twisted-pair",
        Aui = 1 => "aui",
        Bnc = 2 => "bnc",
        Mii = 3 => "mii",
        Fibre = 4 => "fibre",
        DirectAttach = 5 => "direct-attach",
        None = 0xef => "none",
        #[default]
        Other = 0xff => "other",
    }
}

named_enum! {
    /// VLAN encapsulation protocol
    VlanProtocol: u16 {
        #[default]
        Ieee8021q = 0x8100 => "802.1q",
        Ieee8021ad = 0x88a8 => "802.1ad",
    }
}

named_enum! {
    /// Bond mode (IFLA_BOND_MODE)
    BondMode: u8 {
        #[default]
        RoundRobin = 0 => "balance-rr",
        ActiveBackup = 1 => "active-backup",
        Xor = 2 => "balance-xor",
        Broadcast = 3 => "broadcast",
        Ieee8023ad = 4 => "802.3ad",
        Tlb = 5 => "balance-tlb",
        Alb = 6 => "balance-alb",
    }
}

named_enum! {
    /// Bond transmit hash policy
    BondXmitHashPolicy: u8 {
        #[default]
        Layer2 = 0 => "layer2",
        Layer34 = 1 => "layer3+4",
        Layer23 = 2 => "layer2+3",
        Encap23 = 3 => "encap2+3",
        Encap34 = 4 => "encap3+4",
    }
}

named_enum! {
    /// LACP rate
    LacpRate: u8 {
        #[default]
        Slow = 0 => "slow",
        Fast = 1 => "fast",
    }
}

named_enum! {
    /// ARP validation mode
    ArpValidate: u32 {
        #[default]
        None = 0 => "none",
        Active = 1 => "active",
        Backup = 2 => "backup",
        All = 3 => "all",
    }
}

named_enum! {
    /// ARP all targets
    ArpAllTargets: u32 {
        #[default]
        Any = 0 => "any",
        All = 1 => "all",
    }
}

named_enum! {
    /// Primary reselect policy
    PrimaryReselect: u8 {
        #[default]
        Always = 0 => "always",
        Better = 1 => "better",
        Failure = 2 => "failure",
    }
}

named_enum! {
    /// Fail-over MAC policy
    FailOverMac: u8 {
        #[default]
        None = 0 => "none",
        Active = 1 => "active",
        Follow = 2 => "follow",
    }
}

named_enum! {
    /// 802.3ad aggregation selection logic
    AdSelect: u8 {
        #[default]
        Stable = 0 => "stable",
        Bandwidth = 1 => "bandwidth",
        Count = 2 => "count",
    }
}

named_enum! {
    /// Wake-on-LAN mode bits
    WolMode: u32 {
        #[default]
        Phy = 1 => "phy",
        Unicast = 2 => "unicast",
        Multicast = 4 => "multicast",
        Broadcast = 8 => "broadcast",
        Arp = 16 => "arp",
        Magic = 32 => "magic",
        MagicSecure = 64 => "magicsecure",
        Filter = 128 => "filter",
    }
}

// =============================================================================
// Operators
// =============================================================================

named_enum! {
    /// Operator kind
    Operator: u8 {
        #[default]
        Dhcp4 = 0 => "dhcp4",
        Dhcp6 = 1 => "dhcp6",
        Vip = 2 => "vip",
    }
}

// =============================================================================
// nftables
// =============================================================================

named_enum! {
    /// Chain type
    ChainType: u8 {
        #[default]
        Filter = 0 => "filter",
        Route = 1 => "route",
        Nat = 2 => "nat",
    }
}

named_enum! {
    /// Netfilter hook
    ChainHook: u32 {
        Prerouting = 0 => "prerouting",
        #[default]
        Input = 1 => "input",
        Forward = 2 => "forward",
        Output = 3 => "output",
        Postrouting = 4 => "postrouting",
    }
}

/// Chain priority; renders relative to the nearest well-known priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainPriority(pub i32);

impl ChainPriority {
    pub const RAW: ChainPriority = ChainPriority(-300);
    pub const MANGLE: ChainPriority = ChainPriority(-150);
    pub const DSTNAT: ChainPriority = ChainPriority(-100);
    pub const FILTER: ChainPriority = ChainPriority(0);
    pub const SECURITY: ChainPriority = ChainPriority(50);
    pub const SRCNAT: ChainPriority = ChainPriority(100);

    const NAMED: [(&'static str, i32); 6] = [
        ("raw", -300),
        ("mangle", -150),
        ("dstnat", -100),
        ("filter", 0),
        ("security", 50),
        ("srcnat", 100),
    ];

    pub fn offset(self, delta: i32) -> ChainPriority {
        ChainPriority(self.0 + delta)
    }
}

impl fmt::Display for ChainPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (name, base) = Self::NAMED
            .iter()
            .min_by_key(|(_, base)| (self.0 - base).abs())
            .copied()
            .unwrap_or(("filter", 0));

        match self.0 - base {
            0 => write!(f, "{}", name),
            d if d > 0 => write!(f, "{} + {}", name, d),
            d => write!(f, "{} - {}", name, -d),
        }
    }
}

named_enum! {
    /// Rule verdict (NF_DROP / NF_ACCEPT)
    Verdict: i32 {
        Drop = 0 => "drop",
        #[default]
        Accept = 1 => "accept",
    }
}

named_enum! {
    /// Comparison operator for interface name matches
    MatchOperator: u8 {
        #[default]
        Equal = 0 => "equal",
        NotEqual = 1 => "not-equal",
    }
}

named_enum! {
    /// Layer 4 protocol
    Protocol: u8 {
        Icmp = 1 => "icmp",
        #[default]
        Tcp = 6 => "tcp",
        Udp = 17 => "udp",
        Icmpv6 = 58 => "icmpv6",
    }
}

named_enum! {
    /// Conntrack state bits
    ConntrackState: u32 {
        Invalid = 1 => "invalid",
        Established = 2 => "established",
        Related = 4 => "related",
        #[default]
        New = 8 => "new",
    }
}

named_enum! {
    /// Default action of the ingress firewall
    DefaultAction: u8 {
        #[default]
        Accept = 0 => "accept",
        Block = 1 => "block",
    }
}

// =============================================================================
// Hardware Addresses
// =============================================================================

/// Link-layer address, rendered as colon-separated hex
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct HardwareAddr(pub Vec<u8>);

impl HardwareAddr {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for HardwareAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|b| format!("{:02x}", b)).collect();
        write!(f, "{}", parts.join(":"))
    }
}

impl FromStr for HardwareAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Ok(HardwareAddr::default());
        }

        s.split(|c| c == ':' || c == '-')
            .map(|part| {
                u8::from_str_radix(part, 16)
                    .map_err(|_| Error::AddressParse(format!("invalid hardware address {:?}", s)))
            })
            .collect::<Result<Vec<u8>>>()
            .map(HardwareAddr)
    }
}

impl Serialize for HardwareAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for HardwareAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_layer_order() {
        assert!(ConfigLayer::Default < ConfigLayer::Platform);
        assert!(ConfigLayer::Platform < ConfigLayer::Operator);
        assert!(ConfigLayer::Operator < ConfigLayer::Cmdline);
        assert!(ConfigLayer::Cmdline < ConfigLayer::Configuration);
        assert_eq!(ConfigLayer::Configuration.value(), 4);
    }

    #[test]
    fn test_named_enum_round_trip() {
        assert_eq!("802.3ad".parse::<BondMode>().unwrap(), BondMode::Ieee8023ad);
        assert_eq!(BondMode::from_value(1), Some(BondMode::ActiveBackup));
        assert_eq!(Scope::Host.value(), 254);
        assert!("bogus".parse::<Scope>().is_err());
    }

    #[test]
    fn test_chain_priority_display() {
        assert_eq!(ChainPriority::MANGLE.offset(10).to_string(), "mangle + 10");
        assert_eq!(ChainPriority::DSTNAT.offset(-10).to_string(), "dstnat - 10");
        assert_eq!(ChainPriority::SECURITY.to_string(), "security");
    }

    #[test]
    fn test_hardware_addr() {
        let addr: HardwareAddr = "00:11:22:aa:bb:cc".parse().unwrap();
        assert_eq!(addr.0, vec![0x00, 0x11, 0x22, 0xaa, 0xbb, 0xcc]);
        assert_eq!(addr.to_string(), "00:11:22:aa:bb:cc");
    }

    #[test]
    fn test_flags_display() {
        let flags = LinkFlags::UP | LinkFlags::BROADCAST | LinkFlags::MULTICAST;
        assert!(flags.contains(LinkFlags::UP));
        assert_eq!(flags.to_string(), "UP,BROADCAST,MULTICAST");
    }
}
