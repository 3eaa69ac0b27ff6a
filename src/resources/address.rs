//! Address resources

use super::nethelpers::{AddressFlags, ConfigLayer, Family, Scope};
use ipnetwork::{IpNetwork, Ipv4Network};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};

/// Placeholder network used by `Default` impls (`0.0.0.0/32`)
pub fn unspecified_network() -> IpNetwork {
    IpNetwork::V4(Ipv4Network::from(Ipv4Addr::UNSPECIFIED))
}

/// Address to install on a link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AddressSpec {
    pub address: IpNetwork,
    pub link_name: String,
    pub family: Family,
    pub scope: Scope,
    pub flags: AddressFlags,
    pub announce_with_arp: bool,
    pub config_layer: ConfigLayer,
}

impl Default for AddressSpec {
    fn default() -> Self {
        Self {
            address: unspecified_network(),
            link_name: String::new(),
            family: Family::Unspec,
            scope: Scope::Global,
            flags: AddressFlags::default(),
            announce_with_arp: false,
            config_layer: ConfigLayer::Default,
        }
    }
}

impl AddressSpec {
    /// Static permanent address on a link, family derived from the prefix
    pub fn permanent(link_name: &str, address: IpNetwork, layer: ConfigLayer) -> Self {
        Self {
            address,
            link_name: link_name.to_string(),
            family: Family::of(&address.ip()),
            scope: Scope::Global,
            flags: AddressFlags::PERMANENT,
            announce_with_arp: false,
            config_layer: layer,
        }
    }

    pub fn id(&self) -> String {
        address_id(&self.link_name, &self.address)
    }
}

/// Observed kernel address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AddressStatus {
    pub address: IpNetwork,
    pub local: Option<IpAddr>,
    pub broadcast: Option<IpAddr>,
    pub anycast: Option<IpAddr>,
    pub multicast: Option<IpAddr>,
    pub link_index: u32,
    pub link_name: String,
    pub family: Family,
    pub scope: Scope,
    pub flags: AddressFlags,
}

impl Default for AddressStatus {
    fn default() -> Self {
        Self {
            address: unspecified_network(),
            local: None,
            broadcast: None,
            anycast: None,
            multicast: None,
            link_index: 0,
            link_name: String::new(),
            family: Family::Unspec,
            scope: Scope::Global,
            flags: AddressFlags::default(),
        }
    }
}

/// Address id: `{link-name}/{ip}/{prefix-bits}`
pub fn address_id(link_name: &str, address: &IpNetwork) -> String {
    format!("{}/{}/{}", link_name, address.ip(), address.prefix())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_id() {
        let spec = AddressSpec::permanent(
            "eth0",
            "10.0.0.35/32".parse().unwrap(),
            ConfigLayer::Configuration,
        );

        assert_eq!(spec.id(), "eth0/10.0.0.35/32");
        assert_eq!(spec.family, Family::Inet4);
        assert!(spec.flags.contains(AddressFlags::PERMANENT));
    }

    #[test]
    fn test_address_spec_yaml() {
        let spec = AddressSpec::permanent(
            "eth0",
            "2001:db8::1/64".parse().unwrap(),
            ConfigLayer::Platform,
        );

        let yaml = serde_yaml::to_string(&spec).unwrap();
        assert!(yaml.contains("2001:db8::1/64"));
        assert!(yaml.contains("family: inet6"));

        let decoded: AddressSpec = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(decoded, spec);
    }
}
