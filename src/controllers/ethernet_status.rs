//! Ethernet Status Controller
//!
//! Reads ethtool state of physical links. Each capability is optional:
//! drivers which do not support a query leave the field empty.

use super::{pass_done, watch_kernel, KernelHandle};
use crate::error::Result;
use crate::resources::{EthernetStatus, Kind, LinkType, Namespace};
use crate::runtime::{Controller, ControllerRuntime, Input, Output};
use async_trait::async_trait;
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Publishes `EthernetStatus` for physical links
pub struct EthernetStatusController {
    kernel: KernelHandle,
}

/// Unsupported and missing capabilities are expected; anything else is logged
fn optional<T>(link: &str, what: &str, result: Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) if e.is_unsupported() || e.is_not_found() => None,
        Err(e) => {
            warn!(link, error = %e, "failed to query ethtool {}", what);
            None
        }
    }
}

impl EthernetStatusController {
    pub fn new(kernel: KernelHandle) -> Self {
        Self { kernel }
    }

    async fn status(&self, name: &str) -> Result<Option<EthernetStatus>> {
        let state = match self.kernel.link_state(name).await {
            Ok(state) => state,
            Err(e) if e.is_not_found() || e.is_unsupported() => return Ok(None),
            Err(e) => return Err(e),
        };

        Ok(Some(EthernetStatus {
            link_state: Some(state.link_up),
            speed_mbit: state.speed_mbit,
            port: state.port,
            duplex: state.duplex,
            rings: optional(name, "rings", self.kernel.rings(name).await),
            features: optional(name, "features", self.kernel.features(name).await)
                .unwrap_or_default(),
            channels: optional(name, "channels", self.kernel.channels(name).await),
            wake_on_lan: optional(name, "wake-on-lan", self.kernel.wake_on_lan(name).await),
        }))
    }

    pub(crate) async fn reconcile(&self, rt: &mut ControllerRuntime) -> Result<()> {
        let mut to_delete: BTreeSet<String> = rt
            .list::<EthernetStatus>(Namespace::Network)
            .into_iter()
            .map(|r| r.metadata.id)
            .collect();

        for link in self.kernel.list_links().await? {
            if !link.kind().is_empty() || link.link_type != LinkType::Ether {
                continue;
            }

            let status = match self.status(&link.name).await {
                Ok(Some(status)) => status,
                Ok(None) => continue,
                Err(e) => {
                    warn!(link = %link.name, error = %e, "failed to read ethtool state");
                    continue;
                }
            };

            rt.modify::<EthernetStatus, _>(Namespace::Network, &link.name, |s| {
                *s = status;
                Ok(())
            })?;

            to_delete.remove(&link.name);
        }

        for id in to_delete {
            rt.destroy::<EthernetStatus>(Namespace::Network, &id)?;
            debug!(link = %id, "ethernet status removed");
        }

        Ok(())
    }
}

#[async_trait]
impl Controller for EthernetStatusController {
    fn name(&self) -> String {
        "EthernetStatusController".to_string()
    }

    fn inputs(&self) -> Vec<Input> {
        Vec::new()
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive(Kind::EthernetStatus)]
    }

    async fn run(&mut self, rt: &mut ControllerRuntime) -> Result<()> {
        let _watch = watch_kernel(
            rt,
            vec![self.kernel.watch_ethtool(), self.kernel.watch_links()],
        );

        while rt.event().await {
            self.reconcile(rt).await?;
            pass_done(rt);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::InventoryEthtool;
    use crate::adapters::{InventoryLink, MemoryKernel};
    use crate::controllers::testutil;
    use crate::resources::{EthernetRings, EthernetRingsStatus, WolMode};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_capabilities_optional() {
        let kernel = Arc::new(MemoryKernel::new().with_link(InventoryLink {
            name: "eth0".into(),
            hardware_addr: "00:11:22:33:44:55".parse().unwrap(),
            ethtool: Some(InventoryEthtool {
                speed_mbit: Some(10000),
                rings: Some(EthernetRingsStatus {
                    rx_max: Some(4096),
                    current: EthernetRings {
                        rx: Some(256),
                        ..Default::default()
                    },
                    ..Default::default()
                }),
                features: Some(BTreeMap::from([("tx-checksumming".to_string(), true)])),
                wake_on_lan: Some(vec![WolMode::Magic]),
                ..Default::default()
            }),
            ..Default::default()
        }));

        let controller = EthernetStatusController::new(kernel.clone());
        let (state, mut rt) = testutil::runtime(&controller);

        controller.reconcile(&mut rt).await.unwrap();

        let status = state.get::<EthernetStatus>(Namespace::Network, "eth0").unwrap();
        assert_eq!(status.spec.speed_mbit, Some(10000));
        assert_eq!(status.spec.rings.unwrap().current.rx, Some(256));
        assert_eq!(status.spec.features.get("tx-checksumming"), Some(&true));
        assert_eq!(status.spec.channels, None);
        assert_eq!(status.spec.wake_on_lan, Some(vec![WolMode::Magic]));

        // loopback is not physical
        assert!(state.get::<EthernetStatus>(Namespace::Network, "lo").is_none());
    }
}
