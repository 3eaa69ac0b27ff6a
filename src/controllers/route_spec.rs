//! Route Spec Controller
//!
//! Installs merged `RouteSpec`s. Routes are keyed by family, destination,
//! gateway, table and priority; a kernel route with the same key but other
//! attributes is replaced.

use super::{collect_errors, pass_done, resolve_link_index, watch_kernel, KernelHandle};
use crate::adapters::{KernelLink, KernelRoute};
use crate::error::{Result, ResultExt};
use crate::resources::{Kind, Namespace, RouteSpec};
use crate::runtime::{Controller, ControllerRuntime, Input, Output, Phase};
use async_trait::async_trait;
use tracing::{debug, info};

/// Pushes `RouteSpec` into the kernel
pub struct RouteSpecController {
    kernel: KernelHandle,
}

impl RouteSpecController {
    pub fn new(kernel: KernelHandle) -> Self {
        Self { kernel }
    }

    pub(crate) async fn reconcile(&self, rt: &mut ControllerRuntime) -> Result<()> {
        let links = self.kernel.list_links().await?;
        let mut routes = self.kernel.list_routes().await?;

        let mut errors = Vec::new();

        for spec in rt.list::<RouteSpec>(Namespace::Network) {
            match spec.phase() {
                Phase::Running => {
                    if !spec.has_finalizer(rt.name()) {
                        rt.add_finalizer::<RouteSpec>(Namespace::Network, spec.id())?;
                    }

                    if let Err(e) = self.sync(&links, &mut routes, &spec.spec).await {
                        errors.push(e.context(format!("route {}", spec.id())));
                    }
                }
                Phase::TearingDown => {
                    if let Err(e) = self.remove(&links, &spec.spec).await {
                        errors.push(e.context(format!("route {}", spec.id())));
                        continue;
                    }

                    rt.remove_finalizer::<RouteSpec>(Namespace::Network, spec.id())?;
                }
            }
        }

        collect_errors(errors)
    }

    async fn sync(
        &self,
        links: &[KernelLink],
        routes: &mut Vec<KernelRoute>,
        spec: &RouteSpec,
    ) -> Result<()> {
        let Some(desired) = kernel_route(links, spec) else {
            debug!(link = %spec.out_link_name, "out link not found, skipping route");
            return Ok(());
        };

        if let Some(pos) = routes.iter().position(|r| r.same_key(&desired)) {
            if routes[pos] == desired {
                return Ok(());
            }

            self.kernel
                .delete_route(&routes[pos])
                .await
                .context("replace route")?;
            routes.remove(pos);

            debug!(route = %spec.id(), "removed route with stale attributes");
        }

        match self.kernel.add_route(desired.clone()).await {
            Ok(()) => {
                info!(
                    destination = %display_destination(spec),
                    gateway = ?spec.gateway,
                    link = %spec.out_link_name,
                    table = %spec.table,
                    "created route"
                );
                routes.push(desired);
                Ok(())
            }
            Err(e) if e.is_exists() => Ok(()),
            Err(e) => Err(e.context("add route")),
        }
    }

    async fn remove(&self, links: &[KernelLink], spec: &RouteSpec) -> Result<()> {
        let route = kernel_route(links, spec).unwrap_or_else(|| route_from_spec(spec, 0));

        match self.kernel.delete_route(&route).await {
            Ok(()) => {
                info!(route = %spec.id(), "removed route");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.context("delete route")),
        }
    }
}

fn display_destination(spec: &RouteSpec) -> String {
    spec.destination
        .map(|d| d.to_string())
        .unwrap_or_else(|| "default".to_string())
}

/// Kernel form of the spec; `None` while the out link is missing
fn kernel_route(links: &[KernelLink], spec: &RouteSpec) -> Option<KernelRoute> {
    let out_index = if spec.out_link_name.is_empty() {
        0
    } else {
        resolve_link_index(links, &spec.out_link_name)?
    };

    Some(route_from_spec(spec, out_index))
}

fn route_from_spec(spec: &RouteSpec, out_index: u32) -> KernelRoute {
    KernelRoute {
        family: spec.family,
        destination: spec.destination,
        source: spec.source,
        gateway: spec.gateway,
        out_index,
        table: spec.table,
        priority: spec.priority,
        protocol: spec.protocol,
        scope: spec.scope,
        route_type: spec.route_type,
        flags: spec.flags,
        mtu: spec.mtu,
    }
}

#[async_trait]
impl Controller for RouteSpecController {
    fn name(&self) -> String {
        "RouteSpecController".to_string()
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::strong(Namespace::Network, Kind::RouteSpec)]
    }

    fn outputs(&self) -> Vec<Output> {
        Vec::new()
    }

    async fn run(&mut self, rt: &mut ControllerRuntime) -> Result<()> {
        let _watch = watch_kernel(
            rt,
            vec![self.kernel.watch_links(), self.kernel.watch_routes()],
        );

        while rt.event().await {
            self.reconcile(rt).await?;
            pass_done(rt);
        }

        Ok(())
    }
}
