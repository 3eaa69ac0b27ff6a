//! Host DNS Config Controller
//!
//! Derives the host DNS forwarder configuration from machine features.

use super::{machine_config, pass_done};
use crate::error::Result;
use crate::resources::{
    HostDnsConfig, Kind, Namespace, HOST_DNS_CONFIG_ID, HOST_DNS_LISTEN_ADDRESS,
    HOST_DNS_SERVICE_ADDRESS,
};
use crate::runtime::{Controller, ControllerRuntime, Input, Output};
use async_trait::async_trait;

/// Publishes `HostDnsConfig`
#[derive(Debug, Default)]
pub struct HostDnsConfigController;

impl HostDnsConfigController {
    pub fn new() -> Self {
        Self
    }

    pub(crate) fn reconcile(&self, rt: &mut ControllerRuntime) -> Result<()> {
        let features = machine_config(rt)
            .map(|c| c.machine.features.host_dns)
            .unwrap_or_default();

        let config = HostDnsConfig {
            enabled: features.enabled,
            listen_addresses: vec![HOST_DNS_LISTEN_ADDRESS],
            service_host_dns_address: (features.enabled && features.forward_kube_dns_to_host)
                .then_some(HOST_DNS_SERVICE_ADDRESS),
            resolve_member_names: features.resolve_member_names,
        };

        rt.modify::<HostDnsConfig, _>(Namespace::Network, HOST_DNS_CONFIG_ID, |current| {
            *current = config;
            Ok(())
        })
    }
}

#[async_trait]
impl Controller for HostDnsConfigController {
    fn name(&self) -> String {
        "HostDnsConfigController".to_string()
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::weak(Namespace::Machine, Kind::MachineConfig)]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive(Kind::HostDnsConfig)]
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
    fn test_forwarding_needs_enabled() {
        let controller = HostDnsConfigController::new();
        let (state, mut rt) = testutil::runtime(&controller);

        controller.reconcile(&mut rt).unwrap();

        let config = state
            .get::<HostDnsConfig>(Namespace::Network, HOST_DNS_CONFIG_ID)
            .unwrap();
        assert!(!config.spec.enabled);
        assert_eq!(config.spec.service_host_dns_address, None);

        state
            .create(
                "test",
                Namespace::Machine,
                MACHINE_CONFIG_ID,
                MachineConfig::from_yaml(
                    "machine:\n  features:\n    hostDNS:\n      enabled: true\n      forwardKubeDNSToHost: true\n",
                )
                .unwrap(),
            )
            .unwrap();

        controller.reconcile(&mut rt).unwrap();

        let config = state
            .get::<HostDnsConfig>(Namespace::Network, HOST_DNS_CONFIG_ID)
            .unwrap();
        assert!(config.spec.enabled);
        assert_eq!(config.spec.listen_addresses, vec![HOST_DNS_LISTEN_ADDRESS]);
        assert_eq!(config.spec.service_host_dns_address, Some(HOST_DNS_SERVICE_ADDRESS));
    }
}
