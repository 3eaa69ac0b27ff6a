//! Network Controllers
//!
//! Every reconciliation loop of the engine, grouped the way the data flows:
//!
//! - status controllers observe the kernel and publish `*Status` resources
//! - config controllers turn machine configuration, the kernel cmdline and
//!   platform data into layered `*Spec` resources in the `config` namespace
//! - merge controllers fold the layers into final specs in `network`
//! - spec controllers push final specs into the kernel
//! - the operator, probe, DNS, etc-file and status controllers run the
//!   long-lived tasks and derived outputs around them

pub mod address_config;
pub mod address_spec;
pub mod address_status;
pub mod device_config;
pub mod dns_resolve_cache;
pub mod etcfile;
pub mod ethernet_config;
pub mod ethernet_spec;
pub mod ethernet_status;
pub mod hostdns_config;
pub mod hostname_config;
pub mod hostname_spec;
pub mod link_alias_config;
pub mod link_alias_spec;
pub mod link_config;
pub mod link_spec;
pub mod link_status;
pub mod merge;
pub mod nftables_chain;
pub mod nftables_chain_config;
pub mod node_address;
pub mod operator;
pub mod operator_config;
pub mod platform_config;
pub mod probe;
pub mod probe_config;
pub mod resolver_config;
pub mod resolver_spec;
pub mod route_config;
pub mod route_spec;
pub mod route_status;
pub mod status;
pub mod timeserver_config;
pub mod timeserver_spec;

pub use operator::{DefaultOperatorFactory, NetworkOperator, OperatorFactory, OperatorOutputs};

use crate::adapters::{Kernel, KernelEvent, KernelLink};
use crate::dns::DnsConfig;
use crate::error::{Error, Result};
use crate::machine::{
    parse_cmdline_network, Cmdline, CmdlineLink, CmdlineNetworking, Device, MachineConfig,
    MACHINE_CONFIG_ID,
};
use crate::metrics::metrics;
use crate::persist::PlatformCache;
use crate::resources::{
    layered_id, DeviceConfigSpec, Layered, LinkStatus, Namespace, ResourceSpec,
};
use crate::runtime::{ControllerRuntime, Engine, RateLimitedTrigger, DEFAULT_WATCH_WINDOW};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::DropGuard;
use tracing::warn;

/// Shared handle to the kernel ports
pub type KernelHandle = Arc<dyn Kernel>;

// =============================================================================
// Controller Dependencies
// =============================================================================

/// Everything the controllers need from outside the store
#[derive(Clone)]
pub struct ControllerDeps {
    pub kernel: KernelHandle,
    pub cmdline: Arc<Cmdline>,
    /// State volume: platform cache and wireguard key
    pub state_dir: PathBuf,
    /// Target directory of rendered hosts/resolv.conf
    pub etc_dir: PathBuf,
    /// Running inside a container: no hostname syscalls, no resolv.conf
    pub container_mode: bool,
    /// Name of the inet nftables table
    pub nft_table: String,
    pub operators: Arc<dyn OperatorFactory>,
    pub dns: DnsConfig,
}

impl ControllerDeps {
    pub fn new(kernel: KernelHandle) -> Self {
        Self {
            kernel,
            cmdline: Arc::new(Cmdline::default()),
            state_dir: PathBuf::from("/state"),
            etc_dir: PathBuf::from("/system/etc"),
            container_mode: false,
            nft_table: "node-netd".to_string(),
            operators: Arc::new(DefaultOperatorFactory),
            dns: DnsConfig::default(),
        }
    }
}

/// Register the full controller graph
pub fn register_all(engine: &mut Engine, deps: &ControllerDeps) -> Result<()> {
    let kernel = &deps.kernel;
    let cmdline = &deps.cmdline;
    let cache = Arc::new(PlatformCache::new(&deps.state_dir));

    // kernel observers
    engine.register(Box::new(link_status::LinkStatusController::new(kernel.clone())))?;
    engine.register(Box::new(address_status::AddressStatusController::new(kernel.clone())))?;
    engine.register(Box::new(route_status::RouteStatusController::new(kernel.clone())))?;
    engine.register(Box::new(ethernet_status::EthernetStatusController::new(kernel.clone())))?;

    // configuration sources
    engine.register(Box::new(device_config::DeviceConfigController::new()))?;
    engine.register(Box::new(address_config::AddressConfigController::new(cmdline.clone())))?;
    engine.register(Box::new(route_config::RouteConfigController::new(cmdline.clone())))?;
    engine.register(Box::new(link_config::LinkConfigController::new(
        cmdline.clone(),
        deps.state_dir.clone(),
    )))?;
    engine.register(Box::new(hostname_config::HostnameConfigController::new(cmdline.clone())))?;
    engine.register(Box::new(resolver_config::ResolverConfigController::new(cmdline.clone())))?;
    engine.register(Box::new(timeserver_config::TimeServerConfigController::new(
        cmdline.clone(),
    )))?;
    engine.register(Box::new(operator_config::OperatorConfigController::new(cmdline.clone())))?;
    engine.register(Box::new(ethernet_config::EthernetConfigController::new()))?;
    engine.register(Box::new(link_alias_config::LinkAliasConfigController::new()))?;
    engine.register(Box::new(probe_config::ProbeConfigController::new()))?;
    engine.register(Box::new(hostdns_config::HostDnsConfigController::new()))?;
    engine.register(Box::new(platform_config::PlatformConfigLoadController::new(cache.clone())))?;
    engine.register(Box::new(platform_config::PlatformConfigStoreController::new(cache)))?;
    engine.register(Box::new(platform_config::PlatformConfigApplyController::new()))?;
    engine.register(Box::new(nftables_chain_config::NfTablesChainConfigController::new()))?;

    // layer merges
    engine.register(Box::new(merge::address_merge()))?;
    engine.register(Box::new(merge::link_merge()))?;
    engine.register(Box::new(merge::route_merge()))?;
    engine.register(Box::new(merge::hostname_merge()))?;
    engine.register(Box::new(merge::resolver_merge()))?;
    engine.register(Box::new(merge::timeserver_merge()))?;
    engine.register(Box::new(merge::operator_merge()))?;
    engine.register(Box::new(merge::probe_merge()))?;

    // kernel writers
    engine.register(Box::new(link_spec::LinkSpecController::new(kernel.clone())))?;
    engine.register(Box::new(address_spec::AddressSpecController::new(kernel.clone())))?;
    engine.register(Box::new(route_spec::RouteSpecController::new(kernel.clone())))?;
    engine.register(Box::new(hostname_spec::HostnameSpecController::new(
        kernel.clone(),
        deps.container_mode,
    )))?;
    engine.register(Box::new(resolver_spec::ResolverSpecController::new()))?;
    engine.register(Box::new(timeserver_spec::TimeServerSpecController::new()))?;
    engine.register(Box::new(ethernet_spec::EthernetSpecController::new(kernel.clone())))?;
    engine.register(Box::new(link_alias_spec::LinkAliasSpecController::new(kernel.clone())))?;
    engine.register(Box::new(nftables_chain::NfTablesChainController::new(
        kernel.clone(),
        deps.nft_table.clone(),
    )))?;

    // derived outputs and long-lived tasks
    engine.register(Box::new(node_address::NodeAddressController::new()))?;
    engine.register(Box::new(node_address::NodeAddressFilterController::new()))?;
    engine.register(Box::new(operator::OperatorSpecController::new(deps.operators.clone())))?;
    engine.register(Box::new(probe::ProbeController::new()))?;
    engine.register(Box::new(dns_resolve_cache::DnsResolveCacheController::new(
        deps.dns.clone(),
    )))?;
    engine.register(Box::new(etcfile::EtcFileController::new(deps.container_mode)))?;
    engine.register(Box::new(etcfile::EtcFileWriterController::new(deps.etc_dir.clone())))?;
    engine.register(Box::new(status::StatusController::new(deps.container_mode)))?;

    Ok(())
}

// =============================================================================
// Shared Helpers
// =============================================================================

/// Book-keeping after a successful reconciliation pass
pub(crate) fn pass_done(rt: &mut ControllerRuntime) {
    metrics().controller_run(rt.name());
    rt.reset_restart_backoff();
}

/// Wake the controller on kernel notifications until the guard drops
pub(crate) fn watch_kernel(
    rt: &ControllerRuntime,
    streams: Vec<broadcast::Receiver<KernelEvent>>,
) -> DropGuard {
    let token = rt.cancel_token().child_token();
    let trigger = RateLimitedTrigger::new(rt.trigger(), DEFAULT_WATCH_WINDOW);

    for rx in streams {
        trigger.forward(rx, token.clone());
    }

    token.drop_guard()
}

/// Active machine configuration, if any
pub(crate) fn machine_config(rt: &ControllerRuntime) -> Option<MachineConfig> {
    rt.get::<MachineConfig>(Namespace::Machine, MACHINE_CONFIG_ID)
        .map(|r| r.spec)
}

/// Observed links in the shape the cmdline parser wants
pub(crate) fn cmdline_links(rt: &ControllerRuntime) -> Vec<CmdlineLink> {
    rt.list::<LinkStatus>(Namespace::Network)
        .into_iter()
        .map(|r| CmdlineLink {
            physical: r.spec.physical(),
            hardware_addr: r.spec.hardware_addr.clone(),
            link_type: r.spec.link_type,
            name: r.metadata.id,
        })
        .collect()
}

/// Cmdline networking; a malformed cmdline is logged and ignored
pub(crate) fn cmdline_networking(rt: &ControllerRuntime, cmdline: &Cmdline) -> CmdlineNetworking {
    match parse_cmdline_network(cmdline, &cmdline_links(rt)) {
        Ok(settings) => settings,
        Err(e) => {
            warn!(controller = %rt.name(), error = %e, "ignoring kernel cmdline networking");
            CmdlineNetworking::default()
        }
    }
}

/// Devices after selector resolution, in id order
pub(crate) fn configured_devices(rt: &ControllerRuntime) -> Vec<Device> {
    rt.list::<DeviceConfigSpec>(Namespace::Network)
        .into_iter()
        .filter(|r| !r.metadata.is_tearing_down())
        .map(|r| r.spec.device)
        .collect()
}

/// Interfaces excluded from configuration by the machine config or the cmdline
pub(crate) fn ignored_interfaces(devices: &[Device], cmdline: &CmdlineNetworking) -> BTreeSet<String> {
    devices
        .iter()
        .filter(|d| d.ignore)
        .map(|d| d.interface.clone())
        .chain(cmdline.ignore_interfaces.iter().cloned())
        .collect()
}

/// Write a per-source spec to the config namespace as `{layer}/{id}`
pub(crate) fn write_layered<T>(rt: &mut ControllerRuntime, id: &str, spec: T) -> Result<()>
where
    T: ResourceSpec + Layered,
{
    let id = layered_id(spec.layer(), id);

    rt.modify::<T, _>(Namespace::Config, &id, |current| {
        *current = spec;
        Ok(())
    })
}

/// Collapse per-object failures of a pass into the first error
pub(crate) fn collect_errors(errors: Vec<Error>) -> Result<()> {
    let mut errors = errors.into_iter();

    match errors.next() {
        None => Ok(()),
        Some(first) => match errors.count() {
            0 => Err(first),
            more => Err(first.context(format!("{} more failure(s)", more))),
        },
    }
}

/// Link index by name, falling back to the link alias
pub(crate) fn resolve_link_index(links: &[KernelLink], name: &str) -> Option<u32> {
    if name.is_empty() {
        return None;
    }

    links
        .iter()
        .find(|l| l.name == name)
        .or_else(|| links.iter().find(|l| l.alias == name))
        .map(|l| l.index)
}

#[cfg(test)]
pub(crate) mod testutil {
    use crate::adapters::MemoryKernel;
    use crate::runtime::{Controller, ControllerRuntime, State};
    use std::sync::Arc;

    /// Store plus a runtime for the controller under test
    pub fn runtime(controller: &dyn Controller) -> (Arc<State>, ControllerRuntime) {
        let state = Arc::new(State::new());
        let rt = ControllerRuntime::for_controller(controller, state.clone());
        (state, rt)
    }

    /// Kernel with lo plus eth0 and eth1
    pub fn kernel() -> Arc<MemoryKernel> {
        Arc::new(
            MemoryKernel::new()
                .with_physical_link("eth0", "00:11:22:33:44:55")
                .with_physical_link("eth1", "00:11:22:33:44:66"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{AddressBackend, MemoryKernel};
    use crate::resources::{AddressSpec, AddressStatus, ConfigLayer, Scope};
    use crate::runtime::{RuntimeConfig, State};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..300 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[test]
    fn test_resolve_link_index_by_alias() {
        let links = vec![
            KernelLink {
                index: 2,
                name: "eth0".into(),
                alias: "uplink".into(),
                ..Default::default()
            },
            KernelLink {
                index: 3,
                name: "eth1".into(),
                ..Default::default()
            },
        ];

        assert_eq!(resolve_link_index(&links, "eth1"), Some(3));
        assert_eq!(resolve_link_index(&links, "uplink"), Some(2));
        assert_eq!(resolve_link_index(&links, "eth9"), None);
        assert_eq!(resolve_link_index(&links, ""), None);
    }

    #[tokio::test]
    async fn test_register_all_outputs_are_consistent() {
        let state = Arc::new(State::new());
        let mut engine = Engine::new(state, RuntimeConfig::default());
        let deps = ControllerDeps::new(Arc::new(MemoryKernel::new()));

        register_all(&mut engine, &deps).unwrap();
    }

    #[tokio::test]
    async fn test_static_address_merge_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = testutil::kernel();
        let state = Arc::new(State::new());
        let mut engine = Engine::new(
            state.clone(),
            RuntimeConfig {
                backoff_initial: Duration::from_millis(10),
                ..Default::default()
            },
        );

        let mut deps = ControllerDeps::new(kernel.clone());
        deps.state_dir = dir.path().join("state");
        deps.etc_dir = dir.path().join("etc");
        register_all(&mut engine, &deps).unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(engine.run(cancel.clone()));

        let eth0 = |address: &str, layer| AddressSpec::permanent("eth0", address.parse().unwrap(), layer);
        let mut host_scoped = eth0("10.0.0.1/8", ConfigLayer::Configuration);
        host_scoped.scope = Scope::Host;

        let inputs = [
            (
                "lo/127.0.0.1/8",
                AddressSpec::permanent("lo", "127.0.0.1/8".parse().unwrap(), ConfigLayer::Default),
            ),
            ("dhcp/eth0/10.0.0.1/8", eth0("10.0.0.1/8", ConfigLayer::Operator)),
            ("static/eth0/10.0.0.35/32", eth0("10.0.0.35/32", ConfigLayer::Configuration)),
            ("override/eth0/10.0.0.1/8", host_scoped.clone()),
        ];
        for (id, spec) in inputs {
            state.create("test", Namespace::Config, id, spec).unwrap();
        }

        let status = |id: &str| state.get::<AddressStatus>(Namespace::Network, id);

        assert!(
            eventually(|| {
                status("eth0/10.0.0.35/32").is_some()
                    && status("lo/127.0.0.1/8").is_some()
                    && status("eth0/10.0.0.1/8").map(|s| s.spec.scope) == Some(Scope::Host)
            })
            .await
        );

        let merged = state
            .get::<AddressSpec>(Namespace::Network, "eth0/10.0.0.1/8")
            .unwrap();
        assert_eq!(merged.spec, host_scoped);
        assert_eq!(
            state
                .get::<AddressSpec>(Namespace::Network, "eth0/10.0.0.35/32")
                .unwrap()
                .spec
                .config_layer,
            ConfigLayer::Configuration
        );

        let installed = kernel.list_addresses().await.unwrap();
        let mut eth0_addresses: Vec<_> = installed
            .iter()
            .filter(|a| a.index != 1)
            .map(|a| (a.prefix.to_string(), a.scope))
            .collect();
        eth0_addresses.sort();
        assert_eq!(
            eth0_addresses,
            vec![
                ("10.0.0.1/8".to_string(), Scope::Host),
                ("10.0.0.35/32".to_string(), Scope::Global),
            ]
        );

        state
            .destroy::<AddressSpec>("test", Namespace::Config, "static/eth0/10.0.0.35/32")
            .unwrap();

        assert!(eventually(|| status("eth0/10.0.0.35/32").is_none()).await);
        assert!(status("eth0/10.0.0.1/8").is_some());
        assert!(status("lo/127.0.0.1/8").is_some());
        assert!(state
            .get::<AddressSpec>(Namespace::Network, "eth0/10.0.0.35/32")
            .is_none());

        let installed = kernel.list_addresses().await.unwrap();
        assert!(installed.iter().any(|a| a.prefix.to_string() == "10.0.0.1/8"));
        assert!(!installed.iter().any(|a| a.prefix.to_string() == "10.0.0.35/32"));

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
