//! Operator Config Controller
//!
//! Decides which operators run on which links:
//!
//! - DHCPv4/DHCPv6 on devices with `dhcp: true`, DHCPv4 on DHCP VLANs
//! - shared IPs for device and VLAN VIPs
//! - DHCPv4 on the cmdline `ip=...:dhcp` link
//! - DHCPv4 on every physical link nothing else configures

use super::{
    cmdline_networking, configured_devices, ignored_interfaces, pass_done, write_layered,
};
use crate::error::Result;
use crate::machine::{Cmdline, VipConfig};
use crate::resources::{
    vlan_link_name, ConfigLayer, Dhcp4OperatorSpec, Dhcp6OperatorSpec, Kind, LinkStatus,
    Namespace, Operator, OperatorSpec, VipOperatorSpec, DEFAULT_ROUTE_METRIC,
};
use crate::runtime::{Controller, ControllerRuntime, Input, Output};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::warn;

/// Publishes per-source `OperatorSpec`s
pub struct OperatorConfigController {
    cmdline: Arc<Cmdline>,
}

fn dhcp4(link: &str, route_metric: u32, layer: ConfigLayer) -> OperatorSpec {
    OperatorSpec {
        operator: Operator::Dhcp4,
        link_name: link.to_string(),
        require_up: true,
        dhcp4: Dhcp4OperatorSpec {
            route_metric,
            ..Default::default()
        },
        config_layer: layer,
        ..Default::default()
    }
}

fn vip(link: &str, config: &VipConfig) -> Option<OperatorSpec> {
    let Some(ip) = config.ip else {
        warn!(link, "ignoring shared IP without an address");
        return None;
    };

    Some(OperatorSpec {
        operator: Operator::Vip,
        link_name: link.to_string(),
        require_up: true,
        vip: VipOperatorSpec {
            ip: Some(ip),
            gratuitous_arp: true,
        },
        config_layer: ConfigLayer::Configuration,
        ..Default::default()
    })
}

impl OperatorConfigController {
    pub fn new(cmdline: Arc<Cmdline>) -> Self {
        Self { cmdline }
    }

    pub(crate) fn reconcile(&self, rt: &mut ControllerRuntime) -> Result<()> {
        rt.start_tracking_outputs();

        let devices = configured_devices(rt);
        let cmdline = cmdline_networking(rt, &self.cmdline);
        let ignored = ignored_interfaces(&devices, &cmdline);

        let mut configured = BTreeSet::new();
        let mut specs = Vec::new();

        if !cmdline.link_name.is_empty() {
            configured.insert(cmdline.link_name.clone());

            if cmdline.dhcp && !ignored.contains(&cmdline.link_name) {
                specs.push(dhcp4(&cmdline.link_name, DEFAULT_ROUTE_METRIC, ConfigLayer::Cmdline));
            }
        }

        for device in &devices {
            configured.insert(device.interface.clone());

            if device.ignore || ignored.contains(&device.interface) {
                continue;
            }

            if let Some(bond) = &device.bond {
                configured.extend(bond.interfaces.iter().cloned());
            }

            let route_metric = match device.dhcp_route_metric() {
                0 => DEFAULT_ROUTE_METRIC,
                metric => metric,
            };

            if device.dhcp && device.dhcp_ipv4() {
                specs.push(dhcp4(&device.interface, route_metric, ConfigLayer::Configuration));
            }

            if device.dhcp && device.dhcp_ipv6() {
                specs.push(OperatorSpec {
                    operator: Operator::Dhcp6,
                    link_name: device.interface.clone(),
                    require_up: true,
                    dhcp6: Dhcp6OperatorSpec {
                        route_metric,
                        duid: device
                            .dhcp_options
                            .as_ref()
                            .map(|o| o.duid_v6.clone())
                            .unwrap_or_default(),
                        ..Default::default()
                    },
                    config_layer: ConfigLayer::Configuration,
                    ..Default::default()
                });
            }

            if let Some(config) = &device.vip {
                specs.extend(vip(&device.interface, config));
            }

            for vlan in &device.vlans {
                let link = vlan_link_name(&device.interface, vlan.vlan_id);

                if vlan.dhcp {
                    specs.push(dhcp4(&link, DEFAULT_ROUTE_METRIC, ConfigLayer::Configuration));
                }

                if let Some(config) = &vlan.vip {
                    specs.extend(vip(&link, config));
                }
            }
        }

        for link in rt.list::<LinkStatus>(Namespace::Network) {
            if link.spec.physical()
                && !configured.contains(link.id())
                && !ignored.contains(link.id())
            {
                specs.push(dhcp4(link.id(), DEFAULT_ROUTE_METRIC, ConfigLayer::Default));
            }
        }

        for spec in specs {
            write_layered(rt, &spec.id(), spec)?;
        }

        rt.cleanup_outputs::<OperatorSpec>(Namespace::Config)
    }
}

#[async_trait]
impl Controller for OperatorConfigController {
    fn name(&self) -> String {
        "OperatorConfigController".to_string()
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak(Namespace::Network, Kind::DeviceConfigSpec),
            Input::weak(Namespace::Network, Kind::LinkStatus),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::shared(Kind::OperatorSpec)]
    }

    async fn run(&mut self, rt: &mut ControllerRuntime) -> Result<()> {
        while rt.event().await {
            self.reconcile(rt)?;
            pass_done(rt);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::testutil;
    use crate::machine::{Device, DhcpOptions, VlanConfig};
    use crate::resources::{device_config_id, DeviceConfigSpec, LinkType};
    use crate::runtime::State;

    fn physical(state: &State, name: &str) {
        state
            .create(
                "LinkStatusController",
                Namespace::Network,
                name,
                LinkStatus {
                    link_type: LinkType::Ether,
                    ..Default::default()
                },
            )
            .unwrap();
    }

    fn ids(state: &State) -> Vec<String> {
        state
            .list::<OperatorSpec>(Namespace::Config)
            .into_iter()
            .map(|r| r.metadata.id)
            .collect()
    }

    #[test]
    fn test_unconfigured_links_get_dhcp() {
        let controller = OperatorConfigController::new(Arc::new(Cmdline::default()));
        let (state, mut rt) = testutil::runtime(&controller);

        physical(&state, "eth0");
        physical(&state, "eth1");

        controller.reconcile(&mut rt).unwrap();

        assert_eq!(ids(&state), vec!["default/dhcp4/eth0", "default/dhcp4/eth1"]);
    }

    #[test]
    fn test_configured_devices() {
        let controller = OperatorConfigController::new(Arc::new(Cmdline::default()));
        let (state, mut rt) = testutil::runtime(&controller);

        physical(&state, "eth0");
        physical(&state, "eth1");

        let device = Device {
            interface: "eth0".into(),
            dhcp: true,
            dhcp_options: Some(DhcpOptions {
                route_metric: 512,
                ipv6: Some(true),
                ..Default::default()
            }),
            vip: Some(VipConfig {
                ip: Some("10.0.0.100".parse().unwrap()),
            }),
            vlans: vec![VlanConfig {
                vlan_id: 20,
                dhcp: true,
                ..Default::default()
            }],
            ..Default::default()
        };

        state
            .create(
                "DeviceConfigController",
                Namespace::Network,
                &device_config_id("eth0", 0, None),
                DeviceConfigSpec { device },
            )
            .unwrap();
        state
            .create(
                "DeviceConfigController",
                Namespace::Network,
                &device_config_id("eth1", 1, None),
                DeviceConfigSpec {
                    device: Device {
                        interface: "eth1".into(),
                        ignore: true,
                        ..Default::default()
                    },
                },
            )
            .unwrap();

        controller.reconcile(&mut rt).unwrap();

        assert_eq!(
            ids(&state),
            vec![
                "configuration/dhcp4/eth0",
                "configuration/dhcp4/eth0.20",
                "configuration/dhcp6/eth0",
                "configuration/vip/eth0",
            ]
        );

        let dhcp4 = state
            .get::<OperatorSpec>(Namespace::Config, "configuration/dhcp4/eth0")
            .unwrap();
        assert_eq!(dhcp4.spec.dhcp4.route_metric, 512);
    }

    #[test]
    fn test_cmdline_dhcp() {
        let controller = OperatorConfigController::new(Arc::new(Cmdline::parse("ip=eth1:dhcp")));
        let (state, mut rt) = testutil::runtime(&controller);

        physical(&state, "eth0");
        physical(&state, "eth1");

        controller.reconcile(&mut rt).unwrap();

        assert_eq!(ids(&state), vec!["cmdline/dhcp4/eth1", "default/dhcp4/eth0"]);
    }
}
