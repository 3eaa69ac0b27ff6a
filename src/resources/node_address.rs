//! Node address resources

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

/// Stable single address of the node
pub const NODE_ADDRESS_DEFAULT_ID: &str = "default";
/// Addresses on links which are up
pub const NODE_ADDRESS_CURRENT_ID: &str = "current";
/// Every address ever observed; never shrinks
pub const NODE_ADDRESS_ACCUMULATIVE_ID: &str = "accumulative";

/// Filter excluding pod and service networks
pub const FILTER_NO_K8S: &str = "no-k8s";

/// Sorted set of node addresses
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeAddress {
    pub addresses: Vec<IpNetwork>,
}

impl NodeAddress {
    pub fn ips(&self) -> Vec<std::net::IpAddr> {
        self.addresses.iter().map(|a| a.ip()).collect()
    }
}

/// Include/exclude subnets applied to the base node addresses (id = filter name)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeAddressFilter {
    pub include_subnets: Vec<IpNetwork>,
    pub exclude_subnets: Vec<IpNetwork>,
}

impl NodeAddressFilter {
    /// Empty include list admits everything not excluded
    pub fn admits(&self, address: &IpNetwork) -> bool {
        let ip = address.ip();

        let included = self.include_subnets.is_empty()
            || self.include_subnets.iter().any(|net| net.contains(ip));

        included && !self.exclude_subnets.iter().any(|net| net.contains(ip))
    }
}

/// Id of a filtered node address: `{base}-{filter}`
pub fn filtered_node_address_id(base: &str, filter: &str) -> String {
    format!("{}-{}", base, filter)
}
