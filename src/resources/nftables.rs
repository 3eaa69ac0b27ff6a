//! nftables chain resources
//!
//! A chain is a declarative list of rules; the adapter compiles each rule
//! into nftables expressions and anonymous sets.

use super::nethelpers::{
    ChainHook, ChainPriority, ChainType, ConntrackState, MatchOperator, Protocol, Verdict,
};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

/// Declarative chain (id = chain name)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NfTablesChain {
    #[serde(rename = "type")]
    pub chain_type: ChainType,
    pub hook: ChainHook,
    pub priority: ChainPriority,
    pub policy: Verdict,
    pub rules: Vec<NfTablesRule>,
}

/// Single rule: every present match must hold, then actions apply in order
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NfTablesRule {
    pub match_oif_name: Option<NfTablesIfNameMatch>,
    pub match_iif_name: Option<NfTablesIfNameMatch>,
    pub match_mark: Option<NfTablesMark>,
    pub match_conntrack_state: Option<NfTablesConntrackStateMatch>,
    pub match_source_address: Option<NfTablesAddressMatch>,
    pub match_destination_address: Option<NfTablesAddressMatch>,
    pub match_layer4: Option<NfTablesLayer4Match>,
    pub match_limit: Option<NfTablesLimitMatch>,
    pub clamp_mss: Option<NfTablesClampMss>,
    pub set_mark: Option<NfTablesMark>,
    pub anon_counter: bool,
    pub verdict: Option<Verdict>,
}

/// Interface name match
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NfTablesIfNameMatch {
    pub interface_names: Vec<String>,
    pub operator: MatchOperator,
}

/// Address match with include/exclude subnets
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NfTablesAddressMatch {
    pub include_subnets: Vec<IpNetwork>,
    pub exclude_subnets: Vec<IpNetwork>,
    pub invert: bool,
}

/// Inclusive port range
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct PortRange {
    pub lo: u16,
    pub hi: u16,
}

/// Port match
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NfTablesPortMatch {
    pub ranges: Vec<PortRange>,
}

/// ICMP type match
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NfTablesIcmpTypeMatch {
    pub types: Vec<u8>,
}

/// Layer 4 match
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NfTablesLayer4Match {
    pub protocol: Protocol,
    pub match_source_port: Option<NfTablesPortMatch>,
    pub match_destination_port: Option<NfTablesPortMatch>,
    pub match_icmp_type: Option<NfTablesIcmpTypeMatch>,
}

/// Conntrack state match
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NfTablesConntrackStateMatch {
    pub states: Vec<ConntrackState>,
}

/// Packet rate limit
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NfTablesLimitMatch {
    pub packet_rate_per_second: u64,
}

/// Mark match (`mark & mask ^ xor == value`) or set (`mark = mark & mask ^ xor`)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NfTablesMark {
    pub mask: u32,
    pub xor: u32,
    pub value: u32,
}

/// Clamp TCP MSS to fit the MTU
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NfTablesClampMss {
    pub mtu: u16,
}
