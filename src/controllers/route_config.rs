//! Route Config Controller
//!
//! The cmdline gateway and machine-configured device and VLAN routes.

use super::{
    cmdline_networking, configured_devices, ignored_interfaces, pass_done, write_layered,
};
use crate::error::Result;
use crate::machine::{Cmdline, RouteConfig};
use crate::resources::{
    vlan_link_name, ConfigLayer, Kind, Namespace, RouteProtocol, RouteSpec, RouteType,
    RoutingTable, DEFAULT_ROUTE_METRIC,
};
use crate::runtime::{Controller, ControllerRuntime, Input, Output};
use async_trait::async_trait;
use std::sync::Arc;

/// Publishes per-source `RouteSpec`s
pub struct RouteConfigController {
    cmdline: Arc<Cmdline>,
}

/// Translate a configured route for `link`
pub(crate) fn route_spec(link: &str, route: &RouteConfig, layer: ConfigLayer) -> RouteSpec {
    let mut spec = RouteSpec {
        destination: route.network,
        gateway: route.gateway,
        source: route.source,
        out_link_name: link.to_string(),
        table: RoutingTable::MAIN,
        priority: if route.metric == 0 {
            DEFAULT_ROUTE_METRIC
        } else {
            route.metric
        },
        route_type: RouteType::Unicast,
        protocol: RouteProtocol::Static,
        mtu: route.mtu,
        config_layer: layer,
        ..Default::default()
    };

    spec.normalize();
    spec
}

impl RouteConfigController {
    pub fn new(cmdline: Arc<Cmdline>) -> Self {
        Self { cmdline }
    }

    pub(crate) fn reconcile(&self, rt: &mut ControllerRuntime) -> Result<()> {
        rt.start_tracking_outputs();

        let devices = configured_devices(rt);
        let cmdline = cmdline_networking(rt, &self.cmdline);
        let ignored = ignored_interfaces(&devices, &cmdline);

        let mut specs = Vec::new();

        if let Some(gateway) = cmdline.gateway {
            if !cmdline.link_name.is_empty() && !ignored.contains(&cmdline.link_name) {
                specs.push(route_spec(
                    &cmdline.link_name,
                    &RouteConfig {
                        gateway: Some(gateway),
                        ..Default::default()
                    },
                    ConfigLayer::Cmdline,
                ));
            }
        }

        for device in devices.iter().filter(|d| !d.ignore) {
            for route in &device.routes {
                specs.push(route_spec(&device.interface, route, ConfigLayer::Configuration));
            }

            for vlan in &device.vlans {
                let link = vlan_link_name(&device.interface, vlan.vlan_id);

                for route in &vlan.routes {
                    specs.push(route_spec(&link, route, ConfigLayer::Configuration));
                }
            }
        }

        for spec in specs {
            write_layered(rt, &spec.id(), spec)?;
        }

        rt.cleanup_outputs::<RouteSpec>(Namespace::Config)
    }
}

#[async_trait]
impl Controller for RouteConfigController {
    fn name(&self) -> String {
        "RouteConfigController".to_string()
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak(Namespace::Network, Kind::DeviceConfigSpec),
            Input::weak(Namespace::Network, Kind::LinkStatus),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::shared(Kind::RouteSpec)]
    }

    async fn run(&mut self, rt: &mut ControllerRuntime) -> Result<()> {
        while rt.event().await {
            self.reconcile(rt)?;
            pass_done(rt);
        }

        Ok(())
    }
}
