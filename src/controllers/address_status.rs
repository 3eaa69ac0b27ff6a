//! Address Status Controller

use super::{pass_done, watch_kernel, KernelHandle};
use crate::adapters::KernelAddress;
use crate::error::Result;
use crate::resources::{address_id, AddressStatus, Kind, Namespace};
use crate::runtime::{Controller, ControllerRuntime, Input, Output};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Publishes `AddressStatus` for every kernel address, id `{link}/{ip}/{bits}`
pub struct AddressStatusController {
    kernel: KernelHandle,
}

impl AddressStatusController {
    pub fn new(kernel: KernelHandle) -> Self {
        Self { kernel }
    }

    pub(crate) async fn reconcile(&self, rt: &mut ControllerRuntime) -> Result<()> {
        let mut to_delete: BTreeSet<String> = rt
            .list::<AddressStatus>(Namespace::Network)
            .into_iter()
            .map(|r| r.metadata.id)
            .collect();

        let names: HashMap<u32, String> = self
            .kernel
            .list_links()
            .await?
            .into_iter()
            .map(|l| (l.index, l.name))
            .collect();

        for address in self.kernel.list_addresses().await? {
            // address of a link that vanished between the two dumps
            let Some(link_name) = names.get(&address.index) else {
                continue;
            };

            let id = address_id(link_name, &address.prefix);
            let status = status(&address, link_name);

            rt.modify::<AddressStatus, _>(Namespace::Network, &id, |s| {
                *s = status;
                Ok(())
            })?;

            to_delete.remove(&id);
        }

        for id in to_delete {
            rt.destroy::<AddressStatus>(Namespace::Network, &id)?;
            debug!(address = %id, "address status removed");
        }

        Ok(())
    }
}

fn status(address: &KernelAddress, link_name: &str) -> AddressStatus {
    AddressStatus {
        address: address.prefix,
        local: address.local,
        broadcast: address.broadcast,
        anycast: address.anycast,
        multicast: address.multicast,
        link_index: address.index,
        link_name: link_name.to_string(),
        family: address.family,
        scope: address.scope,
        flags: address.flags,
    }
}

#[async_trait]
impl Controller for AddressStatusController {
    fn name(&self) -> String {
        "AddressStatusController".to_string()
    }

    fn inputs(&self) -> Vec<Input> {
        Vec::new()
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive(Kind::AddressStatus)]
    }

    async fn run(&mut self, rt: &mut ControllerRuntime) -> Result<()> {
        let _watch = watch_kernel(
            rt,
            vec![self.kernel.watch_addresses(), self.kernel.watch_links()],
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
    use crate::adapters::AddressBackend;
    use crate::controllers::testutil;
    use crate::resources::{AddressFlags, Family, Scope};

    #[tokio::test]
    async fn test_addresses_published() {
        let kernel = testutil::kernel();
        let controller = AddressStatusController::new(kernel.clone());
        let (state, mut rt) = testutil::runtime(&controller);

        kernel
            .add_address(KernelAddress::new(
                2,
                "10.0.0.5/24".parse().unwrap(),
                Scope::Global,
                AddressFlags::PERMANENT,
            ))
            .await
            .unwrap();
        kernel
            .add_address(KernelAddress::new(
                1,
                "127.0.0.1/8".parse().unwrap(),
                Scope::Host,
                AddressFlags::PERMANENT,
            ))
            .await
            .unwrap();

        controller.reconcile(&mut rt).await.unwrap();

        let status = state
            .get::<AddressStatus>(Namespace::Network, "eth0/10.0.0.5/24")
            .unwrap();
        assert_eq!(status.spec.family, Family::Inet4);
        assert_eq!(status.spec.broadcast, Some("10.0.0.255".parse().unwrap()));
        assert_eq!(status.spec.link_index, 2);

        assert!(state
            .get::<AddressStatus>(Namespace::Network, "lo/127.0.0.1/8")
            .is_some());

        kernel
            .delete_address(2, "10.0.0.5/24".parse().unwrap())
            .await
            .unwrap();
        controller.reconcile(&mut rt).await.unwrap();

        assert!(state
            .get::<AddressStatus>(Namespace::Network, "eth0/10.0.0.5/24")
            .is_none());
        assert_eq!(state.list::<AddressStatus>(Namespace::Network).len(), 1);
    }
}
