//! Link Alias Spec Controller
//!
//! Sets the kernel alias (`ifalias`) of physical links from `LinkAliasSpec`
//! and reports the applied alias as `LinkAliasStatus`. Addresses and routes
//! may then name a link by its alias.

use super::{pass_done, watch_kernel, KernelHandle};
use crate::error::{Result, ResultExt};
use crate::resources::{Kind, LinkAliasSpec, LinkAliasStatus, LinkType, Namespace};
use crate::runtime::{Controller, ControllerRuntime, Input, Output};
use async_trait::async_trait;
use tracing::{debug, info};

/// Pushes `LinkAliasSpec` into the kernel
pub struct LinkAliasSpecController {
    kernel: KernelHandle,
}

impl LinkAliasSpecController {
    pub fn new(kernel: KernelHandle) -> Self {
        Self { kernel }
    }

    pub(crate) async fn reconcile(&self, rt: &mut ControllerRuntime) -> Result<()> {
        let links = self.kernel.list_links().await?;

        rt.start_tracking_outputs();

        for spec in rt.list::<LinkAliasSpec>(Namespace::Network) {
            if spec.metadata.is_tearing_down() {
                continue;
            }

            let Some(link) = links
                .iter()
                .find(|l| l.name == spec.id() && l.kind().is_empty() && l.link_type == LinkType::Ether)
            else {
                debug!(link = %spec.id(), "physical link not found, skipping alias");
                continue;
            };

            if link.alias != spec.spec.alias {
                self.kernel
                    .set_link_alias(link.index, &spec.spec.alias)
                    .await
                    .context(format!("set alias of {}", link.name))?;

                info!(link = %link.name, alias = %spec.spec.alias, "set link alias");
            }

            let alias = spec.spec.alias.clone();
            rt.modify::<LinkAliasStatus, _>(Namespace::Network, &link.name, |status| {
                status.alias = alias;
                Ok(())
            })?;
        }

        rt.cleanup_outputs::<LinkAliasStatus>(Namespace::Network)
    }
}

#[async_trait]
impl Controller for LinkAliasSpecController {
    fn name(&self) -> String {
        "LinkAliasSpecController".to_string()
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::weak(Namespace::Network, Kind::LinkAliasSpec)]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive(Kind::LinkAliasStatus)]
    }

    async fn run(&mut self, rt: &mut ControllerRuntime) -> Result<()> {
        let _watch = watch_kernel(rt, vec![self.kernel.watch_links()]);

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
    use crate::adapters::LinkBackend;
    use crate::controllers::testutil;

    #[tokio::test]
    async fn test_alias_applied() {
        let kernel = testutil::kernel();
        let controller = LinkAliasSpecController::new(kernel.clone());
        let (state, mut rt) = testutil::runtime(&controller);

        for (link, alias) in [("eth1", "uplink"), ("lo", "loopback")] {
            state
                .create(
                    "LinkAliasConfigController",
                    Namespace::Network,
                    link,
                    LinkAliasSpec {
                        alias: alias.into(),
                    },
                )
                .unwrap();
        }

        controller.reconcile(&mut rt).await.unwrap();

        let links = kernel.list_links().await.unwrap();
        let eth1 = links.iter().find(|l| l.name == "eth1").unwrap();
        assert_eq!(eth1.alias, "uplink");

        // loopback is not physical
        let lo = links.iter().find(|l| l.name == "lo").unwrap();
        assert_eq!(lo.alias, "");

        let status = state
            .get::<LinkAliasStatus>(Namespace::Network, "eth1")
            .unwrap();
        assert_eq!(status.spec.alias, "uplink");
        assert!(state
            .get::<LinkAliasStatus>(Namespace::Network, "lo")
            .is_none());
    }
}
