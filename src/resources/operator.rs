//! Operator resources

use super::nethelpers::{ConfigLayer, Operator};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// DHCPv4 parameters
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Dhcp4OperatorSpec {
    pub route_metric: u32,
    pub skip_hostname_request: bool,
}

/// DHCPv6 parameters
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Dhcp6OperatorSpec {
    pub duid: String,
    pub route_metric: u32,
    pub skip_hostname_request: bool,
}

/// Shared IP parameters
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VipOperatorSpec {
    pub ip: Option<IpAddr>,
    pub gratuitous_arp: bool,
}

/// Request to run an operator on a link
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OperatorSpec {
    pub operator: Operator,
    pub link_name: String,
    pub require_up: bool,
    pub dhcp4: Dhcp4OperatorSpec,
    pub dhcp6: Dhcp6OperatorSpec,
    pub vip: VipOperatorSpec,
    pub config_layer: ConfigLayer,
}

impl OperatorSpec {
    pub fn id(&self) -> String {
        operator_id(self.operator, &self.link_name)
    }
}

/// Operator id: `{operator}/{link}`
pub fn operator_id(operator: Operator, link_name: &str) -> String {
    format!("{}/{}", operator, link_name)
}
