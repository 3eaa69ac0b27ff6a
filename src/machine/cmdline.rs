//! Kernel Command Line
//!
//! Parses the networking parameters of the kernel command line:
//! `ip=`, `bond=`, `vlan=`, `node.hostname=` and
//! `node.network.interface.ignore=`.

use crate::error::{Error, Result};
use crate::resources::nethelpers::{
    BondMode, BondXmitHashPolicy, ConfigLayer, HardwareAddr, LacpRate, LinkType, VlanProtocol,
};
use crate::resources::{
    BondMasterSpec, BondSlave, LinkSpec, VlanSpec, KIND_BOND, KIND_VLAN,
};
use ipnetwork::IpNetwork;
use std::net::IpAddr;

pub const KERNEL_PARAM_IP: &str = "ip";
pub const KERNEL_PARAM_BOND: &str = "bond";
pub const KERNEL_PARAM_VLAN: &str = "vlan";
pub const KERNEL_PARAM_HOSTNAME: &str = "node.hostname";
pub const KERNEL_PARAM_IGNORE_INTERFACE: &str = "node.network.interface.ignore";

const DEFAULT_BOND_NAME: &str = "bond0";
const DEFAULT_BOND_SLAVES: [&str; 2] = ["eth0", "eth1"];

// =============================================================================
// Cmdline
// =============================================================================

/// Kernel command line as ordered `key[=value]` parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cmdline {
    params: Vec<(String, Option<String>)>,
}

impl Cmdline {
    pub fn parse(line: &str) -> Self {
        let params = line
            .split_whitespace()
            .map(|token| match token.split_once('=') {
                Some((key, value)) => (key.to_string(), Some(value.trim_matches('"').to_string())),
                None => (token.to_string(), None),
            })
            .collect();

        Self { params }
    }

    /// First value of the parameter
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.as_deref())
    }

    /// Every value of a repeated parameter
    pub fn get_all(&self, key: &str) -> Vec<&str> {
        self.params
            .iter()
            .filter(|(k, _)| k == key)
            .filter_map(|(_, v)| v.as_deref())
            .collect()
    }
}

/// Link as seen by the cmdline parser
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdlineLink {
    pub name: String,
    pub hardware_addr: HardwareAddr,
    pub link_type: LinkType,
    pub physical: bool,
}

/// Networking settings derived from the kernel command line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdlineNetworking {
    pub address: Option<IpNetwork>,
    pub gateway: Option<IpAddr>,
    pub hostname: String,
    pub link_name: String,
    pub dhcp: bool,
    pub dns_addresses: Vec<IpAddr>,
    pub ntp_addresses: Vec<IpAddr>,
    pub ignore_interfaces: Vec<String>,
    /// Bond and VLAN links requested by `bond=` and `vlan=`
    pub net_links: Vec<LinkSpec>,
}

fn parse_failure(field: &str, detail: impl ToString) -> Error {
    Error::CmdlineParse {
        field: field.to_string(),
        detail: detail.to_string(),
    }
}

// =============================================================================
// Parsing
// =============================================================================

/// Parse the networking parameters
///
/// `links` is used to pick a default interface and to resolve `enx<mac>`
/// device names.
pub fn parse_cmdline_network(cmdline: &Cmdline, links: &[CmdlineLink]) -> Result<CmdlineNetworking> {
    let mut settings = CmdlineNetworking::default();

    if let Some(hostname) = cmdline.get(KERNEL_PARAM_HOSTNAME) {
        settings.hostname = hostname.to_string();
    }

    settings.ignore_interfaces = cmdline
        .get_all(KERNEL_PARAM_IGNORE_INTERFACE)
        .into_iter()
        .map(str::to_string)
        .collect();

    if let Some(ip) = cmdline.get(KERNEL_PARAM_IP) {
        parse_ip(ip, links, &mut settings)?;
    }

    if let Some(bond) = cmdline.get(KERNEL_PARAM_BOND) {
        settings.net_links.extend(parse_bond(bond)?);
    }

    if let Some(vlan) = cmdline.get(KERNEL_PARAM_VLAN) {
        settings.net_links.push(parse_vlan(vlan)?);
    }

    Ok(settings)
}

fn parse_ip(value: &str, links: &[CmdlineLink], settings: &mut CmdlineNetworking) -> Result<()> {
    let fields = split_fields(value);

    // bare `ip=dhcp`: DHCP on the first non-loopback link
    if fields.len() == 1 && fields[0] == "dhcp" {
        settings.dhcp = true;
        settings.link_name = first_link(links).unwrap_or_default();

        return Ok(());
    }

    // `ip=<device>:dhcp`
    if fields.len() == 2 && fields[1] == "dhcp" {
        settings.dhcp = true;
        settings.link_name = resolve_link_name(&fields[0], links);

        return Ok(());
    }

    let mut address: Option<IpAddr> = None;
    let mut prefix: Option<u8> = None;

    for (i, field) in fields.iter().enumerate() {
        if field.is_empty() {
            continue;
        }

        match i {
            0 => {
                address = Some(field.parse().map_err(|e| parse_failure("address", e))?);
            }
            2 => {
                settings.gateway = Some(field.parse().map_err(|e| parse_failure("gateway", e))?);
            }
            3 => {
                prefix = Some(parse_netmask(field)?);
            }
            4 => {
                settings.hostname = field.clone();
            }
            5 => {
                settings.link_name = resolve_link_name(field, links);
            }
            6 => match field.as_str() {
                "dhcp" | "on" | "any" | "dhcp6" => settings.dhcp = true,
                _ => {}
            },
            7 | 8 => {
                settings.dns_addresses.push(
                    field
                        .parse()
                        .map_err(|e| parse_failure(if i == 7 { "dns0" } else { "dns1" }, e))?,
                );
            }
            9 => {
                settings
                    .ntp_addresses
                    .push(field.parse().map_err(|e| parse_failure("ntp0", e))?);
            }
            _ => {}
        }
    }

    if let Some(ip) = address {
        let bits = prefix.unwrap_or(match ip {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        });

        settings.address = Some(IpNetwork::new(ip, bits).map_err(|e| parse_failure("netmask", e))?);
    }

    if settings.link_name.is_empty() && (settings.address.is_some() || settings.dhcp) {
        settings.link_name = first_link(links).unwrap_or_default();
    }

    Ok(())
}

/// Split on ':' outside of `[...]`, dropping the brackets
fn split_fields(value: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;

    for c in value.chars() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ':' if depth == 0 => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }

    fields.push(current);

    fields
}

/// Dotted netmask or prefix length
fn parse_netmask(field: &str) -> Result<u8> {
    if let Ok(mask) = field.parse::<IpAddr>() {
        let bits = match mask {
            IpAddr::V4(m) => u32::from(m).leading_ones() as u8,
            IpAddr::V6(m) => u128::from(m).leading_ones() as u8,
        };

        let total = match mask {
            IpAddr::V4(m) => u32::from(m).count_ones() as u8,
            IpAddr::V6(m) => u128::from(m).count_ones() as u8,
        };

        if bits != total {
            return Err(parse_failure("netmask", format!("non-contiguous mask {}", field)));
        }

        return Ok(bits);
    }

    field
        .parse::<u8>()
        .map_err(|e| parse_failure("netmask", e))
}

fn first_link(links: &[CmdlineLink]) -> Option<String> {
    let mut names: Vec<&CmdlineLink> = links
        .iter()
        .filter(|l| l.link_type != LinkType::Loopback && l.name != "lo")
        .collect();

    names.sort_by(|a, b| a.name.cmp(&b.name));

    names.first().map(|l| l.name.clone())
}

/// `enx<mac>` names resolve to the link with that hardware address
fn resolve_link_name(name: &str, links: &[CmdlineLink]) -> String {
    if let Some(mac) = name.strip_prefix("enx") {
        if let Some(link) = links.iter().find(|l| {
            l.hardware_addr
                .0
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect::<String>()
                == mac.to_lowercase()
        }) {
            return link.name.clone();
        }
    }

    name.to_string()
}

/// `bond=<name>[:<slaves>[:<options>[:<mtu>]]]`
fn parse_bond(value: &str) -> Result<Vec<LinkSpec>> {
    let fields: Vec<&str> = value.split(':').collect();

    let name = fields
        .first()
        .filter(|n| !n.is_empty())
        .copied()
        .unwrap_or(DEFAULT_BOND_NAME)
        .to_string();

    let slaves: Vec<String> = match fields.get(1).filter(|s| !s.is_empty()) {
        Some(s) => s.split(',').map(str::to_string).collect(),
        None => DEFAULT_BOND_SLAVES.iter().map(|s| s.to_string()).collect(),
    };

    let mut bond_master = BondMasterSpec {
        use_carrier: true,
        ..Default::default()
    };

    if let Some(options) = fields.get(2).filter(|s| !s.is_empty()) {
        for option in options.split(',') {
            let (key, val) = option
                .split_once('=')
                .ok_or_else(|| parse_failure("bond", format!("malformed option {:?}", option)))?;

            apply_bond_option(&mut bond_master, key, val)?;
        }
    }

    let mtu = match fields.get(3).filter(|s| !s.is_empty()) {
        Some(m) => m.parse::<u32>().map_err(|e| parse_failure("bond mtu", e))?,
        None => 0,
    };

    let mut links = vec![LinkSpec {
        name: name.clone(),
        logical: true,
        up: true,
        mtu,
        kind: KIND_BOND.to_string(),
        link_type: LinkType::Ether,
        bond_master,
        config_layer: ConfigLayer::Cmdline,
        ..Default::default()
    }];

    for (index, slave) in slaves.iter().enumerate() {
        links.push(LinkSpec {
            name: slave.clone(),
            up: true,
            bond_slave: BondSlave {
                master_name: name.clone(),
                slave_index: index as u32,
            },
            config_layer: ConfigLayer::Cmdline,
            ..Default::default()
        });
    }

    Ok(links)
}

fn apply_bond_option(spec: &mut BondMasterSpec, key: &str, value: &str) -> Result<()> {
    let number = |v: &str| {
        v.parse::<u32>()
            .map_err(|e| parse_failure("bond", format!("{}: {}", key, e)))
    };

    match key {
        "mode" => spec.mode = value.parse::<BondMode>().map_err(|e| parse_failure("bond", e))?,
        "xmit_hash_policy" => {
            spec.hash_policy = value
                .parse::<BondXmitHashPolicy>()
                .map_err(|e| parse_failure("bond", e))?
        }
        "lacp_rate" => spec.lacp_rate = value.parse::<LacpRate>().map_err(|e| parse_failure("bond", e))?,
        "miimon" => spec.miimon = number(value)?,
        "updelay" => spec.up_delay = number(value)?,
        "downdelay" => spec.down_delay = number(value)?,
        "arp_interval" => spec.arp_interval = number(value)?,
        "min_links" => spec.min_links = number(value)?,
        "resend_igmp" => spec.resend_igmp = number(value)?,
        "lp_interval" => spec.lp_interval = number(value)?,
        "packets_per_slave" => spec.packets_per_slave = number(value)?,
        "use_carrier" => spec.use_carrier = value == "1",
        other => {
            return Err(parse_failure("bond", format!("unknown option {:?}", other)));
        }
    }

    Ok(())
}

/// `vlan=<name>:<parent>` where the name ends in `.<vid>`
fn parse_vlan(value: &str) -> Result<LinkSpec> {
    let (name, parent) = value
        .split_once(':')
        .ok_or_else(|| parse_failure("vlan", format!("malformed value {:?}", value)))?;

    let vid = name
        .rsplit_once('.')
        .and_then(|(_, vid)| vid.parse::<u16>().ok())
        .ok_or_else(|| parse_failure("vlan", format!("no VLAN id in {:?}", name)))?;

    Ok(LinkSpec {
        name: name.to_string(),
        logical: true,
        up: true,
        kind: KIND_VLAN.to_string(),
        link_type: LinkType::Ether,
        parent_name: parent.to_string(),
        vlan: VlanSpec {
            vid,
            protocol: VlanProtocol::Ieee8021q,
        },
        config_layer: ConfigLayer::Cmdline,
        ..Default::default()
    })
}
