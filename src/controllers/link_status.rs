//! Link Status Controller
//!
//! Mirrors every kernel link into a `LinkStatus` resource named after the
//! link, copying VLAN and bond settings and reading wireguard and ethtool
//! state on the side.

use super::{pass_done, watch_kernel, KernelHandle};
use crate::adapters::{KernelLink, LinkData};
use crate::error::Result;
use crate::resources::{Kind, LinkStatus, Namespace, KIND_WIREGUARD};
use crate::runtime::{Controller, ControllerRuntime, Input, Output};
use async_trait::async_trait;
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Publishes `LinkStatus` for every kernel link
pub struct LinkStatusController {
    kernel: KernelHandle,
}

impl LinkStatusController {
    pub fn new(kernel: KernelHandle) -> Self {
        Self { kernel }
    }

    async fn status(&self, link: &KernelLink) -> LinkStatus {
        let mut status = LinkStatus {
            index: link.index,
            link_type: link.link_type,
            link_index: link.parent_index,
            flags: link.flags,
            hardware_addr: link.hardware_addr.clone(),
            permanent_addr: link.permanent_addr.clone(),
            broadcast_addr: link.broadcast_addr.clone(),
            mtu: link.mtu,
            master_index: link.master_index,
            oper_state: link.oper_state,
            kind: link.kind().to_string(),
            slave_kind: link
                .info
                .as_ref()
                .map(|i| i.slave_kind.clone())
                .unwrap_or_default(),
            alias: link.alias.clone(),
            bus_path: link.bus_path.clone(),
            pci_id: link.pci_id.clone(),
            driver: link.driver.clone(),
            ..Default::default()
        };

        if let Some(info) = &link.info {
            match &info.data {
                LinkData::Vlan(vlan) => status.vlan = vlan.clone(),
                LinkData::Bond(bond) => status.bond_master = bond.clone(),
                LinkData::None => {}
            }

            if info.kind == KIND_WIREGUARD {
                match self.kernel.wireguard_device(&link.name).await {
                    Ok(device) => status.wireguard = device.to_spec(true),
                    Err(e) => warn!(link = %link.name, error = %e, "failed to read wireguard device"),
                }
            }
        }

        match self.kernel.link_state(&link.name).await {
            Ok(state) => {
                status.link_state = state.link_up;
                status.speed_mbit = state.speed_mbit.unwrap_or_default();
                status.port = state.port;
                status.duplex = state.duplex;
            }
            // virtual links have no ethtool support
            Err(e) if e.is_not_found() || e.is_unsupported() => {
                debug!(link = %link.name, "no ethtool link state");
            }
            Err(e) => warn!(link = %link.name, error = %e, "failed to query ethtool link state"),
        }

        status
    }

    pub(crate) async fn reconcile(&self, rt: &mut ControllerRuntime) -> Result<()> {
        let mut to_delete: BTreeSet<String> = rt
            .list::<LinkStatus>(Namespace::Network)
            .into_iter()
            .map(|r| r.metadata.id)
            .collect();

        for link in self.kernel.list_links().await? {
            let status = self.status(&link).await;

            rt.modify::<LinkStatus, _>(Namespace::Network, &link.name, |s| {
                *s = status;
                Ok(())
            })?;

            to_delete.remove(&link.name);
        }

        for id in to_delete {
            rt.destroy::<LinkStatus>(Namespace::Network, &id)?;
            debug!(link = %id, "link status removed");
        }

        Ok(())
    }
}

#[async_trait]
impl Controller for LinkStatusController {
    fn name(&self) -> String {
        "LinkStatusController".to_string()
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::weak(Namespace::Network, Kind::LinkRefresh)]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive(Kind::LinkStatus)]
    }

    async fn run(&mut self, rt: &mut ControllerRuntime) -> Result<()> {
        let _watch = watch_kernel(
            rt,
            vec![self.kernel.watch_links(), self.kernel.watch_ethtool()],
        );

        while rt.event().await {
            self.reconcile(rt).await?;
            pass_done(rt);
        }

        Ok(())
    }
}
