//! Node Address Controllers
//!
//! Derives the node's own addresses from the observed address table:
//!
//! - `default`: the lowest address of the alphabetically first link; sticky
//!   while it stays on the host
//! - `current`: addresses on links that are up
//! - `accumulative`: every address ever seen, never shrinking
//!
//! Each `NodeAddressFilter` adds `{base}-{filter}` variants of `current` and
//! `accumulative`.

use super::{machine_config, pass_done};
use crate::error::Result;
use crate::resources::{
    filtered_node_address_id, AddressStatus, Kind, LinkStatus, Namespace, NodeAddress,
    NodeAddressFilter, Scope, FILTER_NO_K8S, NODE_ADDRESS_ACCUMULATIVE_ID,
    NODE_ADDRESS_CURRENT_ID, NODE_ADDRESS_DEFAULT_ID,
};
use crate::runtime::{Controller, ControllerRuntime, Input, Output};
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use std::collections::BTreeSet;
use std::net::IpAddr;

// =============================================================================
// NodeAddressController
// =============================================================================

/// Publishes `NodeAddress` resources
#[derive(Debug, Default)]
pub struct NodeAddressController;

fn link_local_unicast(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

/// Addresses that identify the node
fn node_candidate(status: &AddressStatus) -> bool {
    let ip = status.address.ip();

    status.scope.value() < Scope::Link.value()
        && !ip.is_loopback()
        && !ip.is_multicast()
        && !link_local_unicast(&ip)
}

fn sorted_unique(mut addresses: Vec<IpNetwork>) -> Vec<IpNetwork> {
    addresses.sort_by_key(|a| (a.ip(), a.prefix()));
    addresses.dedup();
    addresses
}

/// Merge `observed` into a sorted list, one entry per IP
fn accumulate(existing: &mut Vec<IpNetwork>, observed: &[IpNetwork]) {
    for address in observed {
        if let Err(pos) = existing.binary_search_by_key(&address.ip(), |a| a.ip()) {
            existing.insert(pos, *address);
        }
    }
}

fn filtered(addresses: &[IpNetwork], filter: &NodeAddressFilter) -> Vec<IpNetwork> {
    addresses
        .iter()
        .filter(|a| filter.admits(a))
        .copied()
        .collect()
}

impl NodeAddressController {
    pub fn new() -> Self {
        Self
    }

    fn set_current(rt: &mut ControllerRuntime, id: &str, addresses: Vec<IpNetwork>) -> Result<()> {
        rt.modify::<NodeAddress, _>(Namespace::Network, id, |spec| {
            spec.addresses = addresses;
            Ok(())
        })
    }

    fn set_accumulative(rt: &mut ControllerRuntime, id: &str, addresses: &[IpNetwork]) -> Result<()> {
        rt.modify::<NodeAddress, _>(Namespace::Network, id, |spec| {
            accumulate(&mut spec.addresses, addresses);
            Ok(())
        })
    }

    pub(crate) fn reconcile(&self, rt: &mut ControllerRuntime) -> Result<()> {
        rt.start_tracking_outputs();

        // physical links count as up only with carrier
        let links_up: BTreeSet<u32> = rt
            .list::<LinkStatus>(Namespace::Network)
            .into_iter()
            .filter(|l| l.spec.is_up() && (!l.spec.physical() || l.spec.link_state))
            .map(|l| l.spec.index)
            .collect();

        let mut default: Option<(String, IpNetwork)> = None;
        let mut current = Vec::new();
        let mut accumulative = Vec::new();

        for status in rt.list::<AddressStatus>(Namespace::Network) {
            let status = status.spec;

            if !node_candidate(&status) {
                continue;
            }

            let address = status.address;

            let better = match &default {
                None => true,
                Some((link, best)) => {
                    status.link_name < *link
                        || (status.link_name == *link && address.ip() < best.ip())
                }
            };

            if better {
                default = Some((status.link_name.clone(), address));
            }

            if links_up.contains(&status.link_index) {
                current.push(address);
            }

            accumulative.push(address);
        }

        let current = sorted_unique(current);

        if let Some((_, address)) = default {
            rt.modify::<NodeAddress, _>(Namespace::Network, NODE_ADDRESS_DEFAULT_ID, |spec| {
                // keep the recorded default while it is still on the host
                if spec.addresses.first().is_some_and(|a| current.contains(a)) {
                    return Ok(());
                }

                spec.addresses = vec![address];
                Ok(())
            })?;
        }

        Self::set_current(rt, NODE_ADDRESS_CURRENT_ID, current.clone())?;
        Self::set_accumulative(rt, NODE_ADDRESS_ACCUMULATIVE_ID, &accumulative)?;

        for filter in rt.list::<NodeAddressFilter>(Namespace::Network) {
            let name = &filter.metadata.id;

            Self::set_current(
                rt,
                &filtered_node_address_id(NODE_ADDRESS_CURRENT_ID, name),
                filtered(&current, &filter.spec),
            )?;
            Self::set_accumulative(
                rt,
                &filtered_node_address_id(NODE_ADDRESS_ACCUMULATIVE_ID, name),
                &filtered(&accumulative, &filter.spec),
            )?;
        }

        rt.cleanup_outputs::<NodeAddress>(Namespace::Network)
    }
}

#[async_trait]
impl Controller for NodeAddressController {
    fn name(&self) -> String {
        "NodeAddressController".to_string()
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak(Namespace::Network, Kind::LinkStatus),
            Input::weak(Namespace::Network, Kind::AddressStatus),
            Input::weak(Namespace::Network, Kind::NodeAddressFilter),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive(Kind::NodeAddress)]
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
// NodeAddressFilterController
// =============================================================================

/// Publishes the `no-k8s` filter from the cluster CIDRs
#[derive(Debug, Default)]
pub struct NodeAddressFilterController;

impl NodeAddressFilterController {
    pub fn new() -> Self {
        Self
    }

    pub(crate) fn reconcile(&self, rt: &mut ControllerRuntime) -> Result<()> {
        rt.start_tracking_outputs();

        let cidrs = machine_config(rt)
            .map(|c| c.cluster_cidrs())
            .unwrap_or_default();

        if !cidrs.is_empty() {
            rt.modify::<NodeAddressFilter, _>(Namespace::Network, FILTER_NO_K8S, |filter| {
                filter.include_subnets = Vec::new();
                filter.exclude_subnets = cidrs;
                Ok(())
            })?;
        }

        rt.cleanup_outputs::<NodeAddressFilter>(Namespace::Network)
    }
}

#[async_trait]
impl Controller for NodeAddressFilterController {
    fn name(&self) -> String {
        "NodeAddressFilterController".to_string()
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::weak(Namespace::Machine, Kind::MachineConfig)]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive(Kind::NodeAddressFilter)]
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
    use crate::resources::{address_id, LinkType, OperState};
    use crate::runtime::State;

    fn link(state: &State, name: &str, index: u32, up: bool) {
        state
            .create(
                "LinkStatusController",
                Namespace::Network,
                name,
                LinkStatus {
                    index,
                    link_type: LinkType::Ether,
                    oper_state: if up { OperState::Up } else { OperState::Down },
                    link_state: up,
                    ..Default::default()
                },
            )
            .unwrap();
    }

    fn address(state: &State, link: &str, index: u32, net: &str, scope: Scope) {
        let address: IpNetwork = net.parse().unwrap();

        state
            .create(
                "AddressStatusController",
                Namespace::Network,
                &address_id(link, &address),
                AddressStatus {
                    address,
                    link_index: index,
                    link_name: link.to_string(),
                    scope,
                    ..Default::default()
                },
            )
            .unwrap();
    }

    fn addresses(state: &State, id: &str) -> Vec<String> {
        state
            .get::<NodeAddress>(Namespace::Network, id)
            .map(|r| r.spec.addresses.iter().map(|a| a.to_string()).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_node_addresses() {
        let controller = NodeAddressController::new();
        let (state, mut rt) = testutil::runtime(&controller);

        link(&state, "eth0", 2, true);
        link(&state, "eth1", 3, false);

        address(&state, "lo", 1, "127.0.0.1/8", Scope::Host);
        address(&state, "eth0", 2, "172.20.0.5/24", Scope::Global);
        address(&state, "eth0", 2, "172.20.0.2/24", Scope::Global);
        address(&state, "eth0", 2, "fe80::1/64", Scope::Link);
        address(&state, "eth1", 3, "10.5.0.2/24", Scope::Global);

        controller.reconcile(&mut rt).unwrap();

        assert_eq!(addresses(&state, NODE_ADDRESS_DEFAULT_ID), vec!["172.20.0.2/24"]);
        assert_eq!(
            addresses(&state, NODE_ADDRESS_CURRENT_ID),
            vec!["172.20.0.2/24", "172.20.0.5/24"]
        );
        assert_eq!(
            addresses(&state, NODE_ADDRESS_ACCUMULATIVE_ID),
            vec!["10.5.0.2/24", "172.20.0.2/24", "172.20.0.5/24"]
        );

        // the accumulative set never shrinks
        state
            .destroy::<AddressStatus>(
                "AddressStatusController",
                Namespace::Network,
                &address_id("eth1", &"10.5.0.2/24".parse().unwrap()),
            )
            .unwrap();
        controller.reconcile(&mut rt).unwrap();

        assert_eq!(addresses(&state, NODE_ADDRESS_ACCUMULATIVE_ID).len(), 3);
    }

    #[test]
    fn test_default_is_sticky() {
        let controller = NodeAddressController::new();
        let (state, mut rt) = testutil::runtime(&controller);

        link(&state, "eth0", 2, true);
        address(&state, "eth0", 2, "172.20.0.5/24", Scope::Global);

        controller.reconcile(&mut rt).unwrap();
        assert_eq!(addresses(&state, NODE_ADDRESS_DEFAULT_ID), vec!["172.20.0.5/24"]);

        address(&state, "eth0", 2, "172.20.0.2/24", Scope::Global);
        controller.reconcile(&mut rt).unwrap();
        assert_eq!(addresses(&state, NODE_ADDRESS_DEFAULT_ID), vec!["172.20.0.5/24"]);

        state
            .destroy::<AddressStatus>(
                "AddressStatusController",
                Namespace::Network,
                &address_id("eth0", &"172.20.0.5/24".parse().unwrap()),
            )
            .unwrap();
        controller.reconcile(&mut rt).unwrap();
        assert_eq!(addresses(&state, NODE_ADDRESS_DEFAULT_ID), vec!["172.20.0.2/24"]);
    }

    #[test]
    fn test_filtered_variants() {
        let controller = NodeAddressController::new();
        let (state, mut rt) = testutil::runtime(&controller);

        link(&state, "eth0", 2, true);
        link(&state, "cni0", 4, true);
        address(&state, "eth0", 2, "172.20.0.2/24", Scope::Global);
        address(&state, "cni0", 4, "10.244.0.1/24", Scope::Global);

        state
            .create(
                "NodeAddressFilterController",
                Namespace::Network,
                FILTER_NO_K8S,
                NodeAddressFilter {
                    include_subnets: vec![],
                    exclude_subnets: vec!["10.244.0.0/16".parse().unwrap()],
                },
            )
            .unwrap();

        controller.reconcile(&mut rt).unwrap();

        assert_eq!(addresses(&state, "current-no-k8s"), vec!["172.20.0.2/24"]);
        assert_eq!(addresses(&state, "accumulative-no-k8s"), vec!["172.20.0.2/24"]);
        assert_eq!(addresses(&state, NODE_ADDRESS_CURRENT_ID).len(), 2);

        state
            .destroy::<NodeAddressFilter>("NodeAddressFilterController", Namespace::Network, FILTER_NO_K8S)
            .unwrap();
        controller.reconcile(&mut rt).unwrap();

        assert!(state
            .get::<NodeAddress>(Namespace::Network, "current-no-k8s")
            .is_none());
    }

    #[test]
    fn test_no_k8s_filter() {
        let controller = NodeAddressFilterController::new();
        let (state, mut rt) = testutil::runtime(&controller);

        controller.reconcile(&mut rt).unwrap();
        assert!(state.list::<NodeAddressFilter>(Namespace::Network).is_empty());

        state
            .create(
                "test",
                Namespace::Machine,
                MACHINE_CONFIG_ID,
                MachineConfig::from_yaml(
                    "cluster:\n  network:\n    podSubnets: [10.244.0.0/16]\n    serviceSubnets: [10.96.0.0/12]\n",
                )
                .unwrap(),
            )
            .unwrap();
        controller.reconcile(&mut rt).unwrap();

        let filter = state
            .get::<NodeAddressFilter>(Namespace::Network, FILTER_NO_K8S)
            .unwrap();
        assert_eq!(filter.spec.exclude_subnets.len(), 2);
        assert!(!filter.spec.admits(&"10.96.0.10/32".parse().unwrap()));
    }
}
