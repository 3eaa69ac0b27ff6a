//! Address Config Controller
//!
//! Loopback defaults, the cmdline `ip=` address and machine-configured
//! device and VLAN addresses, each at its own config layer.

use super::{
    cmdline_networking, configured_devices, ignored_interfaces, pass_done, write_layered,
};
use crate::error::Result;
use crate::machine::Cmdline;
use crate::resources::{
    vlan_link_name, AddressSpec, ConfigLayer, Kind, Namespace, Scope,
};
use crate::runtime::{Controller, ControllerRuntime, Input, Output};
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

/// Publishes per-source `AddressSpec`s
pub struct AddressConfigController {
    cmdline: Arc<Cmdline>,
}

fn loopback_defaults() -> Vec<AddressSpec> {
    [
        (IpAddr::V4(Ipv4Addr::LOCALHOST), 8),
        (IpAddr::V6(Ipv6Addr::LOCALHOST), 128),
    ]
    .into_iter()
    .filter_map(|(ip, bits)| IpNetwork::new(ip, bits).ok())
    .map(|net| host_scoped(AddressSpec::permanent("lo", net, ConfigLayer::Default)))
    .collect()
}

/// Loopback addresses never leave the host
fn host_scoped(mut spec: AddressSpec) -> AddressSpec {
    if spec.address.ip().is_loopback() {
        spec.scope = Scope::Host;
    }

    spec
}

impl AddressConfigController {
    pub fn new(cmdline: Arc<Cmdline>) -> Self {
        Self { cmdline }
    }

    pub(crate) fn reconcile(&self, rt: &mut ControllerRuntime) -> Result<()> {
        rt.start_tracking_outputs();

        let mut specs = loopback_defaults();

        let devices = configured_devices(rt);
        let cmdline = cmdline_networking(rt, &self.cmdline);
        let ignored = ignored_interfaces(&devices, &cmdline);

        if let Some(address) = cmdline.address {
            if !cmdline.link_name.is_empty() && !ignored.contains(&cmdline.link_name) {
                specs.push(AddressSpec::permanent(
                    &cmdline.link_name,
                    address,
                    ConfigLayer::Cmdline,
                ));
            }
        }

        for device in devices.iter().filter(|d| !d.ignore) {
            for address in &device.addresses {
                specs.push(host_scoped(AddressSpec::permanent(
                    &device.interface,
                    *address,
                    ConfigLayer::Configuration,
                )));
            }

            for vlan in &device.vlans {
                let link = vlan_link_name(&device.interface, vlan.vlan_id);

                for address in &vlan.addresses {
                    specs.push(AddressSpec::permanent(
                        &link,
                        *address,
                        ConfigLayer::Configuration,
                    ));
                }
            }
        }

        for spec in specs {
            write_layered(rt, &spec.id(), spec)?;
        }

        rt.cleanup_outputs::<AddressSpec>(Namespace::Config)
    }
}

#[async_trait]
impl Controller for AddressConfigController {
    fn name(&self) -> String {
        "AddressConfigController".to_string()
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak(Namespace::Network, Kind::DeviceConfigSpec),
            Input::weak(Namespace::Network, Kind::LinkStatus),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::shared(Kind::AddressSpec)]
    }

    async fn run(&mut self, rt: &mut ControllerRuntime) -> Result<()> {
        while rt.event().await {
            self.reconcile(rt)?;
            pass_done(rt);
        }

        Ok(())
    }
}
