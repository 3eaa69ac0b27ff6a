//! Status Controller
//!
//! Folds node addresses, routes, hostname, rendered files and probes into
//! the aggregate `NetworkStatus` readiness bits.

use super::pass_done;
use crate::error::Result;
use crate::metrics::metrics;
use crate::resources::{
    EtcFileStatus, HostnameStatus, Kind, Namespace, NetworkStatus, NodeAddress, ProbeStatus,
    RouteStatus, ETC_HOSTS, ETC_RESOLV_CONF, HOSTNAME_ID, NETWORK_STATUS_ID,
    NODE_ADDRESS_CURRENT_ID,
};
use crate::runtime::{Controller, ControllerRuntime, Input, Output};
use async_trait::async_trait;
use tracing::info;

/// Publishes `NetworkStatus(status)`
#[derive(Debug, Default)]
pub struct StatusController {
    container_mode: bool,
}

impl StatusController {
    pub fn new(container_mode: bool) -> Self {
        Self { container_mode }
    }

    pub(crate) fn compute(&self, rt: &ControllerRuntime) -> NetworkStatus {
        let address_ready = rt
            .get::<NodeAddress>(Namespace::Network, NODE_ADDRESS_CURRENT_ID)
            .map_or(false, |r| !r.spec.addresses.is_empty());

        let probes = rt.list::<ProbeStatus>(Namespace::Network);
        let connectivity_ready = if probes.is_empty() {
            rt.list::<RouteStatus>(Namespace::Network)
                .iter()
                .any(|r| r.spec.is_default())
        } else {
            probes.iter().all(|p| p.spec.success)
        };

        let hostname_ready = rt
            .get::<HostnameStatus>(Namespace::Network, HOSTNAME_ID)
            .is_some();

        let written = |id: &str| rt.get::<EtcFileStatus>(Namespace::Network, id).is_some();
        let etc_files_ready = written(ETC_HOSTS) && (self.container_mode || written(ETC_RESOLV_CONF));

        NetworkStatus {
            address_ready,
            connectivity_ready,
            hostname_ready,
            etc_files_ready,
        }
    }

    pub(crate) fn reconcile(&self, rt: &mut ControllerRuntime) -> Result<()> {
        let status = self.compute(rt);

        let m = metrics();
        m.set_ready("address", status.address_ready);
        m.set_ready("connectivity", status.connectivity_ready);
        m.set_ready("hostname", status.hostname_ready);
        m.set_ready("etcfiles", status.etc_files_ready);

        let ready = status.ready();
        let changed = rt.modify_with_result::<NetworkStatus, _, _>(
            Namespace::Network,
            NETWORK_STATUS_ID,
            |current| {
                let changed = *current != status;
                *current = status;
                Ok(changed)
            },
        )?;

        if changed {
            info!(ready, "network status changed");
        }

        Ok(())
    }
}

#[async_trait]
impl Controller for StatusController {
    fn name(&self) -> String {
        "StatusController".to_string()
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak(Namespace::Network, Kind::NodeAddress).with_id(NODE_ADDRESS_CURRENT_ID),
            Input::weak(Namespace::Network, Kind::RouteStatus),
            Input::weak(Namespace::Network, Kind::HostnameStatus),
            Input::weak(Namespace::Network, Kind::EtcFileStatus),
            Input::weak(Namespace::Network, Kind::ProbeStatus),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive(Kind::NetworkStatus)]
    }

    async fn run(&mut self, rt: &mut ControllerRuntime) -> Result<()> {
        while rt.event().await {
            self.reconcile(rt)?;
            pass_done(rt);
        }

        Ok(())
    }
}
