//! Layer Merge Controllers
//!
//! One generic controller per resource kind folds the layered specs of the
//! `config` namespace into final specs in the `network` namespace. The
//! per-kind policy decides how layers combine; the controller owns the
//! output lifecycle.
//!
//! An output whose teardown is still blocked by finalizers is held back:
//! it is neither destroyed nor re-created until every finalizer holder has
//! released it, so the spec controllers always observe a clean
//! teardown/create sequence.

use super::pass_done;
use crate::error::{Error, Result};
use crate::metrics::metrics;
use crate::resources::{
    AddressSpec, ConfigLayer, Family, HostnameSpec, Layered, LinkSpec, Namespace, OperatorSpec,
    ProbeSpec, ResolverSpec, ResourceSpec, RouteSpec, TimeServerSpec, HOSTNAME_ID, RESOLVER_ID,
    TIME_SERVER_ID,
};
use crate::runtime::{Controller, ControllerRuntime, Input, Output};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::net::IpAddr;
use tracing::{debug, warn};

/// Merge policy: layered inputs to `output id -> merged spec`
pub type MergePolicy<T> = fn(Vec<T>) -> BTreeMap<String, T>;

/// Generic merge controller for a layered kind
pub struct MergeController<T> {
    name: &'static str,
    policy: MergePolicy<T>,
    _kind: PhantomData<fn() -> T>,
}

impl<T: ResourceSpec + Layered> MergeController<T> {
    pub fn new(name: &'static str, policy: MergePolicy<T>) -> Self {
        Self {
            name,
            policy,
            _kind: PhantomData,
        }
    }

    pub(crate) fn reconcile(&self, rt: &mut ControllerRuntime) -> Result<()> {
        let inputs: Vec<T> = rt
            .list::<T>(Namespace::Config)
            .into_iter()
            .filter(|r| !r.metadata.is_tearing_down())
            .map(|r| r.spec)
            .collect();

        let mut merged = (self.policy)(inputs);

        let owned: Vec<_> = rt
            .list::<T>(Namespace::Network)
            .into_iter()
            .filter(|r| r.metadata.owner == rt.name())
            .collect();

        for output in owned {
            let id = output.id();

            if merged.contains_key(id) && !output.metadata.is_tearing_down() {
                continue;
            }

            if rt.teardown_and_destroy::<T>(Namespace::Network, id)? {
                debug!(controller = %rt.name(), id, "merged output removed");
            } else {
                // wait for the finalizers before re-creating
                merged.remove(id);
            }
        }

        let mut conflicts = 0;

        for (id, spec) in merged {
            match rt.modify::<T, _>(Namespace::Network, &id, |current| {
                *current = spec;
                Ok(())
            }) {
                Ok(()) => {}
                Err(e) if e.is_phase_conflict() => {
                    warn!(controller = %rt.name(), id = %id, "merged output is tearing down");
                    conflicts += 1;
                }
                Err(e) => return Err(e),
            }
        }

        if conflicts > 0 {
            metrics().merge_conflicts(rt.name(), conflicts);
            return Err(Error::Conflicts(conflicts));
        }

        Ok(())
    }
}

#[async_trait]
impl<T: ResourceSpec + Layered> Controller for MergeController<T> {
    fn name(&self) -> String {
        self.name.to_string()
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak(Namespace::Config, T::KIND),
            Input::destroy_ready(Namespace::Network, T::KIND),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::shared(T::KIND)]
    }

    async fn run(&mut self, rt: &mut ControllerRuntime) -> Result<()> {
        while rt.event().await {
            self.reconcile(rt)?;
            pass_done(rt);
        }

        Ok(())
    }
}

// =============================================================================
// Instances
// =============================================================================

pub fn address_merge() -> MergeController<AddressSpec> {
    MergeController::new("AddressMergeController", merge_addresses)
}

pub fn link_merge() -> MergeController<LinkSpec> {
    MergeController::new("LinkMergeController", merge_links)
}

pub fn route_merge() -> MergeController<RouteSpec> {
    MergeController::new("RouteMergeController", merge_routes)
}

pub fn hostname_merge() -> MergeController<HostnameSpec> {
    MergeController::new("HostnameMergeController", merge_hostnames)
}

pub fn resolver_merge() -> MergeController<ResolverSpec> {
    MergeController::new("ResolverMergeController", merge_resolvers)
}

pub fn timeserver_merge() -> MergeController<TimeServerSpec> {
    MergeController::new("TimeServerMergeController", merge_timeservers)
}

pub fn operator_merge() -> MergeController<OperatorSpec> {
    MergeController::new("OperatorMergeController", merge_operators)
}

pub fn probe_merge() -> MergeController<ProbeSpec> {
    MergeController::new("ProbeMergeController", merge_probes)
}

// =============================================================================
// Policies
// =============================================================================

/// Highest layer wins per output id
fn highest_layer<T: Layered>(inputs: Vec<T>, id: impl Fn(&T) -> String) -> BTreeMap<String, T> {
    let mut merged: BTreeMap<String, T> = BTreeMap::new();

    for spec in inputs {
        let id = id(&spec);

        match merged.get(&id) {
            Some(existing) if existing.layer() >= spec.layer() => {}
            _ => {
                merged.insert(id, spec);
            }
        }
    }

    merged
}

pub fn merge_addresses(inputs: Vec<AddressSpec>) -> BTreeMap<String, AddressSpec> {
    highest_layer(inputs, AddressSpec::id)
}

pub fn merge_routes(inputs: Vec<RouteSpec>) -> BTreeMap<String, RouteSpec> {
    highest_layer(inputs, RouteSpec::id)
}

pub fn merge_operators(inputs: Vec<OperatorSpec>) -> BTreeMap<String, OperatorSpec> {
    highest_layer(inputs, OperatorSpec::id)
}

/// Fold every layer of a link name, lowest layer first
pub fn merge_links(mut inputs: Vec<LinkSpec>) -> BTreeMap<String, LinkSpec> {
    inputs.sort_by(|a, b| (&a.name, a.config_layer).cmp(&(&b.name, b.config_layer)));

    let mut merged: BTreeMap<String, LinkSpec> = BTreeMap::new();

    for spec in inputs {
        match merged.get_mut(&spec.name) {
            Some(existing) => existing.merge(&spec),
            None => {
                merged.insert(spec.name.clone(), spec);
            }
        }
    }

    merged
}

/// Later layer replaces the hostname
pub fn merge_hostnames(mut inputs: Vec<HostnameSpec>) -> BTreeMap<String, HostnameSpec> {
    inputs.sort_by_key(|s| s.config_layer);

    inputs
        .pop()
        .map(|spec| BTreeMap::from([(HOSTNAME_ID.to_string(), spec)]))
        .unwrap_or_default()
}

/// Same layer appends, a higher layer replaces
pub fn merge_timeservers(mut inputs: Vec<TimeServerSpec>) -> BTreeMap<String, TimeServerSpec> {
    inputs.sort_by_key(|s| s.config_layer);

    let mut merged: Option<TimeServerSpec> = None;

    for spec in inputs {
        merged = Some(match merged {
            Some(mut current) if current.config_layer == spec.config_layer => {
                current.ntp_servers.extend(spec.ntp_servers);
                current
            }
            _ => spec,
        });
    }

    merged
        .map(|spec| BTreeMap::from([(TIME_SERVER_ID.to_string(), spec)]))
        .unwrap_or_default()
}

/// Resolver layering
///
/// Same layer appends. The machine configuration replaces the server list;
/// other layers replace it but keep the servers of a family the new layer
/// does not provide. Search domains of later layers come first.
pub fn merge_resolvers(mut inputs: Vec<ResolverSpec>) -> BTreeMap<String, ResolverSpec> {
    inputs.sort_by_key(|s| s.config_layer);

    // fold each layer on its own first
    let mut layers: Vec<ResolverSpec> = Vec::new();
    for spec in inputs {
        match layers.last_mut() {
            Some(layer) if layer.config_layer == spec.config_layer => {
                layer.dns_servers.extend(spec.dns_servers);
                layer.search_domains.extend(spec.search_domains);
            }
            _ => layers.push(spec),
        }
    }

    let mut merged: Option<ResolverSpec> = None;

    for layer in layers {
        let mut next = match merged {
            None => layer,
            Some(current) => {
                let dns_servers = if layer.config_layer == ConfigLayer::Configuration {
                    layer.dns_servers
                } else {
                    keep_missing_families(&current.dns_servers, layer.dns_servers)
                };

                let mut search_domains = layer.search_domains;
                search_domains.extend(current.search_domains);

                ResolverSpec {
                    dns_servers,
                    search_domains,
                    config_layer: layer.config_layer,
                }
            }
        };

        dedup(&mut next.dns_servers);
        dedup(&mut next.search_domains);

        merged = Some(next);
    }

    merged
        .map(|spec| BTreeMap::from([(RESOLVER_ID.to_string(), spec)]))
        .unwrap_or_default()
}

fn keep_missing_families(previous: &[IpAddr], mut next: Vec<IpAddr>) -> Vec<IpAddr> {
    for family in [Family::Inet4, Family::Inet6] {
        if next.iter().any(|a| Family::of(a) == family) {
            continue;
        }

        next.extend(previous.iter().filter(|a| Family::of(a) == family));
    }

    next
}

fn dedup<T: PartialEq + Clone>(items: &mut Vec<T>) {
    let mut seen: Vec<T> = Vec::with_capacity(items.len());
    items.retain(|item| {
        if seen.contains(item) {
            false
        } else {
            seen.push(item.clone());
            true
        }
    });
}

/// Probe ids derive from content; a later layer overwrites
pub fn merge_probes(mut inputs: Vec<ProbeSpec>) -> BTreeMap<String, ProbeSpec> {
    inputs.sort_by_key(|s| s.config_layer);

    inputs.into_iter().map(|spec| (spec.id(), spec)).collect()
}
