//! Hostname Config Controller
//!
//! A default hostname derived from the node's first address, the cmdline
//! hostname and the machine-configured hostname.

use super::{cmdline_networking, machine_config, pass_done, write_layered};
use crate::error::Result;
use crate::machine::Cmdline;
use crate::resources::{
    ConfigLayer, HostnameSpec, Kind, Namespace, NodeAddress, HOSTNAME_ID,
    NODE_ADDRESS_DEFAULT_ID,
};
use crate::runtime::{Controller, ControllerRuntime, Input, Output};
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::warn;

/// Publishes per-source `HostnameSpec`s
pub struct HostnameConfigController {
    cmdline: Arc<Cmdline>,
}

/// `node-10-0-0-5` for `10.0.0.5`
pub(crate) fn default_hostname(ip: &IpAddr) -> String {
    format!("node-{}", ip.to_string().replace(['.', ':'], "-"))
}

impl HostnameConfigController {
    pub fn new(cmdline: Arc<Cmdline>) -> Self {
        Self { cmdline }
    }

    pub(crate) fn reconcile(&self, rt: &mut ControllerRuntime) -> Result<()> {
        rt.start_tracking_outputs();

        let mut specs = Vec::new();

        if let Some(address) = rt
            .get::<NodeAddress>(Namespace::Network, NODE_ADDRESS_DEFAULT_ID)
            .and_then(|r| r.spec.addresses.first().copied())
        {
            specs.push(HostnameSpec {
                hostname: default_hostname(&address.ip()),
                domainname: String::new(),
                config_layer: ConfigLayer::Default,
            });
        }

        let cmdline = cmdline_networking(rt, &self.cmdline);
        let configured = machine_config(rt)
            .map(|c| c.network().hostname.clone())
            .unwrap_or_default();

        for (name, layer) in [
            (cmdline.hostname, ConfigLayer::Cmdline),
            (configured, ConfigLayer::Configuration),
        ] {
            if name.is_empty() {
                continue;
            }

            match HostnameSpec::parse_fqdn(&name, layer) {
                Ok(spec) => specs.push(spec),
                Err(e) => warn!(%layer, hostname = %name, error = %e, "ignoring hostname"),
            }
        }

        for spec in specs {
            write_layered(rt, HOSTNAME_ID, spec)?;
        }

        rt.cleanup_outputs::<HostnameSpec>(Namespace::Config)
    }
}

#[async_trait]
impl Controller for HostnameConfigController {
    fn name(&self) -> String {
        "HostnameConfigController".to_string()
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak(Namespace::Machine, Kind::MachineConfig),
            Input::weak(Namespace::Network, Kind::NodeAddress).with_id(NODE_ADDRESS_DEFAULT_ID),
            Input::weak(Namespace::Network, Kind::LinkStatus),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::shared(Kind::HostnameSpec)]
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
    use crate::machine::{MachineConfig, MACHINE_CONFIG_ID};

    #[test]
    fn test_default_hostname() {
        assert_eq!(default_hostname(&"10.0.0.5".parse().unwrap()), "node-10-0-0-5");
        assert_eq!(default_hostname(&"2001:db8::5".parse().unwrap()), "node-2001-db8--5");
    }

    #[test]
    fn test_layers() {
        let controller =
            HostnameConfigController::new(Arc::new(Cmdline::parse("node.hostname=cmd.example.org")));
        let (state, mut rt) = testutil::runtime(&controller);

        state
            .create(
                "NodeAddressController",
                Namespace::Network,
                NODE_ADDRESS_DEFAULT_ID,
                NodeAddress {
                    addresses: vec!["172.20.0.2/24".parse().unwrap()],
                },
            )
            .unwrap();
        state
            .create(
                "test",
                Namespace::Machine,
                MACHINE_CONFIG_ID,
                MachineConfig::from_yaml("machine:\n  network:\n    hostname: foo.example.com\n")
                    .unwrap(),
            )
            .unwrap();

        controller.reconcile(&mut rt).unwrap();

        let default = state
            .get::<HostnameSpec>(Namespace::Config, "default/hostname")
            .unwrap();
        assert_eq!(default.spec.hostname, "node-172-20-0-2");

        let cmdline = state
            .get::<HostnameSpec>(Namespace::Config, "cmdline/hostname")
            .unwrap();
        assert_eq!(cmdline.spec.fqdn(), "cmd.example.org");

        let configured = state
            .get::<HostnameSpec>(Namespace::Config, "configuration/hostname")
            .unwrap();
        assert_eq!(configured.spec.hostname, "foo");
        assert_eq!(configured.spec.domainname, "example.com");

        state
            .destroy::<MachineConfig>("test", Namespace::Machine, MACHINE_CONFIG_ID)
            .unwrap();
        controller.reconcile(&mut rt).unwrap();

        assert_eq!(state.list::<HostnameSpec>(Namespace::Config).len(), 2);
    }
}
