//! Address Spec Controller
//!
//! Installs merged `AddressSpec`s on their links and removes them again on
//! teardown. The controller holds a finalizer on every running spec so the
//! merge layer cannot drop a spec before the kernel address is gone.

use super::{collect_errors, pass_done, resolve_link_index, watch_kernel, KernelHandle};
use crate::adapters::{KernelAddress, KernelLink};
use crate::error::{Result, ResultExt};
use crate::resources::{AddressFlags, AddressSpec, Kind, Namespace};
use crate::runtime::{Controller, ControllerRuntime, Input, Output, Phase};
use async_trait::async_trait;
use tracing::{debug, info};

/// Pushes `AddressSpec` into the kernel
pub struct AddressSpecController {
    kernel: KernelHandle,
}

impl AddressSpecController {
    pub fn new(kernel: KernelHandle) -> Self {
        Self { kernel }
    }

    pub(crate) async fn reconcile(&self, rt: &mut ControllerRuntime) -> Result<()> {
        let links = self.kernel.list_links().await?;
        let addresses = self.kernel.list_addresses().await?;

        let mut errors = Vec::new();

        for spec in rt.list::<AddressSpec>(Namespace::Network) {
            match spec.phase() {
                Phase::Running => {
                    if !spec.has_finalizer(rt.name()) {
                        rt.add_finalizer::<AddressSpec>(Namespace::Network, spec.id())?;
                    }

                    if let Err(e) = self.sync(&links, &addresses, &spec.spec).await {
                        errors.push(e.context(format!("address {}", spec.id())));
                    }
                }
                Phase::TearingDown => {
                    if let Err(e) = self.remove(&links, &spec.spec).await {
                        errors.push(e.context(format!("address {}", spec.id())));
                        continue;
                    }

                    rt.remove_finalizer::<AddressSpec>(Namespace::Network, spec.id())?;
                }
            }
        }

        collect_errors(errors)
    }

    async fn sync(
        &self,
        links: &[KernelLink],
        addresses: &[KernelAddress],
        spec: &AddressSpec,
    ) -> Result<()> {
        // the link may not exist yet; the link watch brings us back
        let Some(index) = resolve_link_index(links, &spec.link_name) else {
            debug!(link = %spec.link_name, address = %spec.address, "link not found, skipping address");
            return Ok(());
        };

        if let Some(existing) = addresses
            .iter()
            .find(|a| a.index == index && a.prefix == spec.address)
        {
            if address_matches(existing, spec) {
                return Ok(());
            }

            self.kernel
                .delete_address(index, spec.address)
                .await
                .context("replace address")?;

            debug!(link = %spec.link_name, address = %spec.address, "removed address with stale attributes");
        }

        let address = KernelAddress::new(index, spec.address, spec.scope, spec.flags);

        match self.kernel.add_address(address).await {
            Ok(()) => {
                info!(link = %spec.link_name, address = %spec.address, "assigned address");
                Ok(())
            }
            Err(e) if e.is_exists() => Ok(()),
            Err(e) => Err(e.context("add address")),
        }
    }

    async fn remove(&self, links: &[KernelLink], spec: &AddressSpec) -> Result<()> {
        let Some(index) = resolve_link_index(links, &spec.link_name) else {
            return Ok(());
        };

        match self.kernel.delete_address(index, spec.address).await {
            Ok(()) => {
                info!(link = %spec.link_name, address = %spec.address, "removed address");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.context("delete address")),
        }
    }
}

/// Scope and flags match; duplicate address detection may still be running
fn address_matches(existing: &KernelAddress, spec: &AddressSpec) -> bool {
    let mut flags = existing.flags;
    flags.remove(AddressFlags::TENTATIVE);

    existing.scope == spec.scope && flags == spec.flags
}

#[async_trait]
impl Controller for AddressSpecController {
    fn name(&self) -> String {
        "AddressSpecController".to_string()
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::strong(Namespace::Network, Kind::AddressSpec)]
    }

    fn outputs(&self) -> Vec<Output> {
        Vec::new()
    }

    async fn run(&mut self, rt: &mut ControllerRuntime) -> Result<()> {
        let _watch = watch_kernel(
            rt,
            vec![self.kernel.watch_links(), self.kernel.watch_addresses()],
        );

        while rt.event().await {
            self.reconcile(rt).await?;
            pass_done(rt);
        }

        Ok(())
    }
}
