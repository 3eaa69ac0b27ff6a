//! Route Status Controller

use super::{pass_done, watch_kernel, KernelHandle};
use crate::adapters::KernelRoute;
use crate::error::Result;
use crate::resources::{route_id, Kind, Namespace, RouteStatus};
use crate::runtime::{Controller, ControllerRuntime, Input, Output};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Publishes `RouteStatus` for every kernel route
pub struct RouteStatusController {
    kernel: KernelHandle,
}

impl RouteStatusController {
    pub fn new(kernel: KernelHandle) -> Self {
        Self { kernel }
    }

    pub(crate) async fn reconcile(&self, rt: &mut ControllerRuntime) -> Result<()> {
        let mut to_delete: BTreeSet<String> = rt
            .list::<RouteStatus>(Namespace::Network)
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

        for route in self.kernel.list_routes().await? {
            let out_link_name = names.get(&route.out_index).cloned().unwrap_or_default();

            let id = route_id(
                route.table,
                route.family,
                route.destination.as_ref(),
                route.gateway.as_ref(),
                route.priority,
                &out_link_name,
            );
            let status = status(&route, out_link_name);

            rt.modify::<RouteStatus, _>(Namespace::Network, &id, |s| {
                *s = status;
                Ok(())
            })?;

            to_delete.remove(&id);
        }

        for id in to_delete {
            rt.destroy::<RouteStatus>(Namespace::Network, &id)?;
            debug!(route = %id, "route status removed");
        }

        Ok(())
    }
}

fn status(route: &KernelRoute, out_link_name: String) -> RouteStatus {
    RouteStatus {
        family: route.family,
        destination: route.destination,
        source: route.source,
        gateway: route.gateway,
        out_link_index: route.out_index,
        out_link_name,
        table: route.table,
        priority: route.priority,
        scope: route.scope,
        route_type: route.route_type,
        flags: route.flags,
        protocol: route.protocol,
        mtu: route.mtu,
    }
}

#[async_trait]
impl Controller for RouteStatusController {
    fn name(&self) -> String {
        "RouteStatusController".to_string()
    }

    fn inputs(&self) -> Vec<Input> {
        Vec::new()
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive(Kind::RouteStatus)]
    }

    async fn run(&mut self, rt: &mut ControllerRuntime) -> Result<()> {
        let _watch = watch_kernel(
            rt,
            vec![self.kernel.watch_routes(), self.kernel.watch_links()],
        );

        while rt.event().await {
            self.reconcile(rt).await?;
            pass_done(rt);
        }

        Ok(())
    }
}
