//! Resolver Config Controller
//!
//! Public resolvers as defaults, cmdline DNS servers and machine-configured
//! nameservers with search domains.

use super::{cmdline_networking, machine_config, pass_done, write_layered};
use crate::error::Result;
use crate::machine::Cmdline;
use crate::resources::{ConfigLayer, Kind, Namespace, ResolverSpec, RESOLVER_ID};
use crate::runtime::{Controller, ControllerRuntime, Input, Output};
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

/// Resolvers used when nothing else is configured
pub const DEFAULT_DNS_SERVERS: [IpAddr; 4] = [
    IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
    IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
    IpAddr::V6(Ipv6Addr::new(0x2606, 0x4700, 0x4700, 0, 0, 0, 0, 0x1111)),
    IpAddr::V6(Ipv6Addr::new(0x2001, 0x4860, 0x4860, 0, 0, 0, 0, 0x8888)),
];

/// Publishes per-source `ResolverSpec`s
pub struct ResolverConfigController {
    cmdline: Arc<Cmdline>,
}

impl ResolverConfigController {
    pub fn new(cmdline: Arc<Cmdline>) -> Self {
        Self { cmdline }
    }

    pub(crate) fn reconcile(&self, rt: &mut ControllerRuntime) -> Result<()> {
        rt.start_tracking_outputs();

        let mut specs = vec![ResolverSpec {
            dns_servers: DEFAULT_DNS_SERVERS.to_vec(),
            search_domains: Vec::new(),
            config_layer: ConfigLayer::Default,
        }];

        let cmdline = cmdline_networking(rt, &self.cmdline);

        if !cmdline.dns_addresses.is_empty() {
            specs.push(ResolverSpec {
                dns_servers: cmdline.dns_addresses,
                search_domains: Vec::new(),
                config_layer: ConfigLayer::Cmdline,
            });
        }

        if let Some(config) = machine_config(rt) {
            let network = config.network();

            if !network.nameservers.is_empty() || !network.search_domains.is_empty() {
                specs.push(ResolverSpec {
                    dns_servers: network.nameservers.clone(),
                    search_domains: network.search_domains.clone(),
                    config_layer: ConfigLayer::Configuration,
                });
            }
        }

        for spec in specs {
            write_layered(rt, RESOLVER_ID, spec)?;
        }

        rt.cleanup_outputs::<ResolverSpec>(Namespace::Config)
    }
}

#[async_trait]
impl Controller for ResolverConfigController {
    fn name(&self) -> String {
        "ResolverConfigController".to_string()
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak(Namespace::Machine, Kind::MachineConfig),
            Input::weak(Namespace::Network, Kind::LinkStatus),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::shared(Kind::ResolverSpec)]
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
    fn test_defaults() {
        let controller = ResolverConfigController::new(Arc::new(Cmdline::default()));
        let (state, mut rt) = testutil::runtime(&controller);

        controller.reconcile(&mut rt).unwrap();

        let specs = state.list::<ResolverSpec>(Namespace::Config);
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].metadata.id, "default/resolvers");
        assert_eq!(specs[0].spec.dns_servers.len(), 4);
        assert_eq!(specs[0].spec.dns_servers[0], "1.1.1.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_cmdline_and_configuration() {
        let cmdline = Cmdline::parse("ip=172.20.0.2::172.20.0.1:255.255.255.0::eth1::10.0.0.1:10.0.0.2");
        let controller = ResolverConfigController::new(Arc::new(cmdline));
        let (state, mut rt) = testutil::runtime(&controller);

        state
            .create(
                "test",
                Namespace::Machine,
                MACHINE_CONFIG_ID,
                MachineConfig::from_yaml(
                    "machine:\n  network:\n    nameservers: [2.2.2.2]\n    searchDomains: [corp.example]\n",
                )
                .unwrap(),
            )
            .unwrap();

        controller.reconcile(&mut rt).unwrap();

        let cmdline = state
            .get::<ResolverSpec>(Namespace::Config, "cmdline/resolvers")
            .unwrap();
        assert_eq!(
            cmdline.spec.dns_servers,
            vec![
                "10.0.0.1".parse::<IpAddr>().unwrap(),
                "10.0.0.2".parse::<IpAddr>().unwrap()
            ]
        );

        let configured = state
            .get::<ResolverSpec>(Namespace::Config, "configuration/resolvers")
            .unwrap();
        assert_eq!(configured.spec.search_domains, vec!["corp.example"]);
    }
}
