//! Link Config Controller
//!
//! Desired links per source:
//!
//! - default: `lo` up, and every unconfigured physical link up
//! - cmdline: the `ip=` link up, plus `bond=` and `vlan=` links
//! - configuration: device MTU, dummy, bond, VLAN and wireguard links,
//!   and the `kubespan` mesh link when enabled
//!
//! Ignored interfaces produce no specs at any layer.

use super::{
    cmdline_networking, configured_devices, ignored_interfaces, machine_config, pass_done,
    write_layered,
};
use crate::adapters::link_data::fill_bond_defaults;
use crate::error::Result;
use crate::machine::{BondConfig, Cmdline, Device, WireguardConfig};
use crate::persist::{load_or_generate_key, KUBESPAN_KEY_FILE};
use crate::resources::{
    vlan_link_name, BondMasterSpec, BondSlave, ConfigLayer, Kind, LinkSpec, LinkStatus, LinkType,
    Namespace, VlanProtocol, VlanSpec, WireguardPeer, WireguardSpec, KIND_BOND, KIND_DUMMY,
    KIND_VLAN, KIND_WIREGUARD, KUBESPAN_LINK_NAME,
};
use crate::runtime::{Controller, ControllerRuntime, Input, Output, Resource};
use async_trait::async_trait;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Listen port of the mesh link
pub const KUBESPAN_PORT: u16 = 51820;
/// Firewall mark of mesh traffic
pub const KUBESPAN_FIREWALL_MARK: u32 = 0x20;
/// MTU of the mesh link
pub const KUBESPAN_LINK_MTU: u32 = 1420;

/// Publishes per-source `LinkSpec`s
pub struct LinkConfigController {
    cmdline: Arc<Cmdline>,
    state_dir: PathBuf,
}

// =============================================================================
// Translation
// =============================================================================

fn bond_master(bond: &BondConfig, links: &[Resource<LinkStatus>]) -> BondMasterSpec {
    let primary_index = links
        .iter()
        .find(|l| !bond.primary.is_empty() && l.id() == bond.primary)
        .map(|l| l.spec.index)
        .unwrap_or_default();

    let mut spec = BondMasterSpec {
        mode: bond.mode,
        hash_policy: bond.xmit_hash_policy,
        lacp_rate: bond.lacp_rate,
        arp_validate: bond.arp_validate,
        arp_all_targets: bond.arp_all_targets,
        arp_ip_targets: bond.arp_ip_target.clone(),
        primary_index,
        primary_reselect: bond.primary_reselect,
        fail_over_mac: bond.fail_over_mac,
        ad_select: bond.ad_select,
        miimon: bond.miimon,
        up_delay: bond.up_delay,
        down_delay: bond.down_delay,
        arp_interval: bond.arp_interval,
        resend_igmp: bond.resend_igmp,
        min_links: bond.min_links,
        lp_interval: bond.lp_interval,
        packets_per_slave: bond.packets_per_slave,
        num_peer_notif: bond.num_peer_notif,
        tlb_dynamic_lb: bond.tlb_dynamic_lb,
        all_slaves_active: bond.all_slaves_active,
        use_carrier: bond.use_carrier.unwrap_or(true),
        ad_actor_sys_prio: bond.ad_actor_sys_prio,
        ad_user_port_key: bond.ad_user_port_key,
    };

    fill_bond_defaults(&mut spec);
    spec
}

fn wireguard_spec(config: &WireguardConfig) -> WireguardSpec {
    let mut spec = WireguardSpec {
        private_key: config.private_key.clone(),
        listen_port: config.listen_port,
        firewall_mark: config.firewall_mark,
        peers: config
            .peers
            .iter()
            .map(|p| WireguardPeer {
                public_key: p.public_key.clone(),
                endpoint: p.endpoint.clone(),
                persistent_keepalive_interval: Duration::from_secs(
                    p.persistent_keepalive_interval,
                ),
                allowed_ips: p.allowed_ips.clone(),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    };

    spec.sort();
    spec
}

/// Links described by a single configured device
pub(crate) fn device_links(device: &Device, links: &[Resource<LinkStatus>]) -> Vec<LinkSpec> {
    let layer = ConfigLayer::Configuration;

    let mut link = LinkSpec {
        name: device.interface.clone(),
        up: true,
        mtu: device.mtu,
        config_layer: layer,
        ..Default::default()
    };

    let mut specs = Vec::new();

    if device.dummy {
        link.logical = true;
        link.kind = KIND_DUMMY.to_string();
        link.link_type = LinkType::Ether;
    }

    if let Some(bond) = &device.bond {
        link.logical = true;
        link.kind = KIND_BOND.to_string();
        link.link_type = LinkType::Ether;
        link.bond_master = bond_master(bond, links);

        for (index, slave) in bond.interfaces.iter().enumerate() {
            specs.push(LinkSpec {
                name: slave.clone(),
                up: true,
                bond_slave: BondSlave {
                    master_name: device.interface.clone(),
                    slave_index: index as u32,
                },
                config_layer: layer,
                ..Default::default()
            });
        }
    }

    if let Some(wireguard) = &device.wireguard {
        link.logical = true;
        link.kind = KIND_WIREGUARD.to_string();
        link.link_type = LinkType::None;
        link.wireguard = wireguard_spec(wireguard);
    }

    for vlan in &device.vlans {
        specs.push(LinkSpec {
            name: vlan_link_name(&device.interface, vlan.vlan_id),
            logical: true,
            up: true,
            mtu: vlan.mtu,
            kind: KIND_VLAN.to_string(),
            link_type: LinkType::Ether,
            parent_name: device.interface.clone(),
            vlan: VlanSpec {
                vid: vlan.vlan_id,
                protocol: VlanProtocol::Ieee8021q,
            },
            config_layer: layer,
            ..Default::default()
        });
    }

    specs.insert(0, link);
    specs
}

fn kubespan_link(private_key: String) -> LinkSpec {
    LinkSpec {
        name: KUBESPAN_LINK_NAME.to_string(),
        logical: true,
        up: true,
        mtu: KUBESPAN_LINK_MTU,
        kind: KIND_WIREGUARD.to_string(),
        link_type: LinkType::None,
        wireguard: WireguardSpec {
            private_key,
            listen_port: KUBESPAN_PORT,
            firewall_mark: KUBESPAN_FIREWALL_MARK,
            ..Default::default()
        },
        config_layer: ConfigLayer::Configuration,
        ..Default::default()
    }
}

// =============================================================================
// Controller
// =============================================================================

impl LinkConfigController {
    pub fn new(cmdline: Arc<Cmdline>, state_dir: PathBuf) -> Self {
        Self { cmdline, state_dir }
    }

    pub(crate) fn reconcile(&self, rt: &mut ControllerRuntime) -> Result<()> {
        rt.start_tracking_outputs();

        let links = rt.list::<LinkStatus>(Namespace::Network);
        let devices = configured_devices(rt);
        let cmdline = cmdline_networking(rt, &self.cmdline);
        let ignored = ignored_interfaces(&devices, &cmdline);

        let mut specs = vec![LinkSpec::up("lo", ConfigLayer::Default)];

        if !cmdline.link_name.is_empty() {
            specs.push(LinkSpec::up(&cmdline.link_name, ConfigLayer::Cmdline));
        }

        specs.extend(cmdline.net_links.iter().cloned());

        for device in devices.iter().filter(|d| !d.ignore) {
            specs.extend(device_links(device, &links));
        }

        let kubespan = machine_config(rt)
            .map(|c| c.network().kubespan.enabled)
            .unwrap_or_default();

        if kubespan {
            let path = self.state_dir.join(KUBESPAN_KEY_FILE);

            match load_or_generate_key(&path) {
                Ok(key) => specs.push(kubespan_link(key)),
                Err(e) => warn!(error = %e, "skipping kubespan link"),
            }
        }

        specs.retain(|s| !ignored.contains(&s.name));

        let configured: BTreeSet<String> = specs.iter().map(|s| s.name.clone()).collect();

        for link in &links {
            if link.spec.physical()
                && !configured.contains(link.id())
                && !ignored.contains(link.id())
            {
                specs.push(LinkSpec::up(link.id(), ConfigLayer::Default));
            }
        }

        // several sources at one layer may describe the same link
        let mut merged: BTreeMap<(ConfigLayer, String), LinkSpec> = BTreeMap::new();

        for spec in specs {
            match merged.entry((spec.config_layer, spec.name.clone())) {
                Entry::Occupied(mut entry) => entry.get_mut().merge(&spec),
                Entry::Vacant(entry) => {
                    entry.insert(spec);
                }
            }
        }

        for ((_, name), spec) in merged {
            write_layered(rt, &name, spec)?;
        }

        rt.cleanup_outputs::<LinkSpec>(Namespace::Config)
    }
}

#[async_trait]
impl Controller for LinkConfigController {
    fn name(&self) -> String {
        "LinkConfigController".to_string()
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak(Namespace::Machine, Kind::MachineConfig),
            Input::weak(Namespace::Network, Kind::DeviceConfigSpec),
            Input::weak(Namespace::Network, Kind::LinkStatus),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::shared(Kind::LinkSpec)]
    }

    async fn run(&mut self, rt: &mut ControllerRuntime) -> Result<()> {
        while rt.event().await {
            self.reconcile(rt)?;
            pass_done(rt);
        }

        Ok(())
    }
}
