//! Ethernet (ethtool) resources

use super::nethelpers::{Duplex, Port, WolMode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Ring sizes; unset fields are left alone
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EthernetRings {
    pub rx: Option<u32>,
    pub rx_mini: Option<u32>,
    pub rx_jumbo: Option<u32>,
    pub tx: Option<u32>,
    pub rx_buf_len: Option<u32>,
    pub cqe_size: Option<u32>,
    pub tx_push: Option<bool>,
    pub rx_push: Option<bool>,
}

/// Channel counts; unset fields are left alone
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EthernetChannels {
    pub rx: Option<u32>,
    pub tx: Option<u32>,
    pub other: Option<u32>,
    pub combined: Option<u32>,
}

/// Desired ethtool settings (id = link name)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EthernetSpec {
    pub rings: EthernetRings,
    pub features: BTreeMap<String, bool>,
    pub channels: EthernetChannels,
    pub wake_on_lan: Option<Vec<WolMode>>,
}

/// Current ring sizes with hardware maximums
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EthernetRingsStatus {
    pub rx_max: Option<u32>,
    pub rx_mini_max: Option<u32>,
    pub rx_jumbo_max: Option<u32>,
    pub tx_max: Option<u32>,
    pub current: EthernetRings,
}

/// Current channel counts with hardware maximums
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EthernetChannelsStatus {
    pub rx_max: Option<u32>,
    pub tx_max: Option<u32>,
    pub other_max: Option<u32>,
    pub combined_max: Option<u32>,
    pub current: EthernetChannels,
}

/// Observed ethtool state (id = link name)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EthernetStatus {
    pub link_state: Option<bool>,
    pub speed_mbit: Option<u32>,
    pub port: Port,
    pub duplex: Duplex,
    pub rings: Option<EthernetRingsStatus>,
    pub features: BTreeMap<String, bool>,
    pub channels: Option<EthernetChannelsStatus>,
    pub wake_on_lan: Option<Vec<WolMode>>,
}
