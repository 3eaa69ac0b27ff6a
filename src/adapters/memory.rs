//! In-Memory Kernel
//!
//! A simulated kernel implementing every adapter port. It keeps links,
//! addresses, routes, ethtool settings, wireguard devices and nftables
//! tables in a single locked state and publishes watcher notifications the
//! same way the netlink multicast groups do.
//!
//! The binary seeds it from a host inventory file; tests build it with the
//! `with_*` helpers and count writes to check idempotence.

use super::kernel::{
    AddressBackend, EthtoolBackend, EthtoolLinkState, HostBackend, KernelAddress, KernelEvent,
    KernelLink, KernelRoute, LinkBackend, LinkInfo, LinkRequest, NfTablesBackend, RouteBackend,
    WireguardBackend,
};
use super::link_data::LinkData;
use super::nftables::{NfBatch, NfChainState, NfOp, NfTableRef};
use super::wireguard::{apply_patch, public_key, WireguardDevice, WireguardPatch};
use crate::error::{Error, Result, ResultExt};
use crate::resources::nethelpers::{
    Duplex, HardwareAddr, LinkFlags, LinkType, OperState, Port, WolMode,
};
use crate::resources::{
    EthernetChannels, EthernetChannelsStatus, EthernetRings, EthernetRingsStatus, KIND_BOND,
    KIND_WIREGUARD,
};
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, info};

const LOOPBACK_MTU: u32 = 65536;
const DEFAULT_MTU: u32 = 1500;

// =============================================================================
// Host Inventory
// =============================================================================

/// Ethtool capabilities of an inventory link
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InventoryEthtool {
    pub speed_mbit: Option<u32>,
    pub port: Port,
    pub duplex: Duplex,
    pub rings: Option<EthernetRingsStatus>,
    pub features: Option<BTreeMap<String, bool>>,
    pub channels: Option<EthernetChannelsStatus>,
    pub wake_on_lan: Option<Vec<WolMode>>,
}

/// Physical link present at boot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InventoryLink {
    pub name: String,
    pub hardware_addr: HardwareAddr,
    pub permanent_addr: HardwareAddr,
    pub mtu: Option<u32>,
    pub driver: String,
    pub bus_path: String,
    pub pci_id: String,
    /// Cable plugged in; links without carrier stay operationally down
    pub carrier: Option<bool>,
    pub ethtool: Option<InventoryEthtool>,
}

/// Host description used to seed the simulated kernel
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostInventory {
    pub hostname: String,
    pub links: Vec<InventoryLink>,
}

impl HostInventory {
    pub fn from_yaml(data: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(data)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(Error::from)
            .context(format!("reading inventory {}", path.display()))?;

        Self::from_yaml(&data)
    }
}

// =============================================================================
// Kernel State
// =============================================================================

#[derive(Debug, Clone, Default)]
struct EthtoolState {
    link: EthtoolLinkState,
    rings: Option<EthernetRingsStatus>,
    features: Option<BTreeMap<String, bool>>,
    channels: Option<EthernetChannelsStatus>,
    wake_on_lan: Option<Vec<WolMode>>,
}

#[derive(Debug, Default)]
struct KernelState {
    next_index: u32,
    links: BTreeMap<u32, KernelLink>,
    carrier: HashMap<u32, bool>,
    addresses: Vec<KernelAddress>,
    routes: Vec<KernelRoute>,
    ethtool: HashMap<String, EthtoolState>,
    wireguard: HashMap<String, WireguardDevice>,
    nftables: BTreeMap<NfTableRef, Vec<NfChainState>>,
    hostname: String,
    domainname: String,
}

impl KernelState {
    fn link(&self, index: u32, op: &str) -> Result<&KernelLink> {
        self.links
            .get(&index)
            .ok_or_else(|| Error::KernelNotFound { op: op.to_string() })
    }

    fn link_mut(&mut self, index: u32, op: &str) -> Result<&mut KernelLink> {
        self.links
            .get_mut(&index)
            .ok_or_else(|| Error::KernelNotFound { op: op.to_string() })
    }

    fn by_name(&self, name: &str) -> Option<&KernelLink> {
        self.links.values().find(|l| l.name == name)
    }

    fn refresh_oper_state(&mut self, index: u32) {
        let carrier = self.carrier.get(&index).copied();

        if let Some(link) = self.links.get_mut(&index) {
            link.oper_state = match (link.is_up(), carrier) {
                (false, _) => OperState::Down,
                (true, Some(true)) => OperState::Up,
                (true, Some(false)) => OperState::LowerLayerDown,
                // loopback and virtual links without a lower layer
                (true, None) => OperState::Unknown,
            };

            if link.oper_state == OperState::Up || link.oper_state == OperState::Unknown {
                link.flags.insert(LinkFlags::RUNNING);
            } else {
                link.flags.remove(LinkFlags::RUNNING);
            }
        }
    }
}

// =============================================================================
// MemoryKernel
// =============================================================================

/// Simulated kernel backing every adapter port
pub struct MemoryKernel {
    state: Mutex<KernelState>,
    link_events: broadcast::Sender<KernelEvent>,
    address_events: broadcast::Sender<KernelEvent>,
    route_events: broadcast::Sender<KernelEvent>,
    ethtool_events: broadcast::Sender<KernelEvent>,
    writes: AtomicU64,
}

impl Default for MemoryKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKernel {
    /// Kernel with only the loopback link (index 1, down)
    pub fn new() -> Self {
        let mut state = KernelState {
            next_index: 2,
            ..Default::default()
        };

        state.links.insert(
            1,
            KernelLink {
                index: 1,
                name: "lo".into(),
                link_type: LinkType::Loopback,
                flags: LinkFlags::LOOPBACK,
                mtu: LOOPBACK_MTU,
                oper_state: OperState::Down,
                ..Default::default()
            },
        );

        let channel = || broadcast::channel(256).0;

        Self {
            state: Mutex::new(state),
            link_events: channel(),
            address_events: channel(),
            route_events: channel(),
            ethtool_events: channel(),
            writes: AtomicU64::new(0),
        }
    }

    pub fn from_inventory(inventory: &HostInventory) -> Self {
        let kernel = Self::new();

        {
            let mut state = kernel.state.lock();
            state.hostname = inventory.hostname.clone();
        }

        for link in &inventory.links {
            kernel.add_inventory_link(link);
        }

        info!(links = inventory.links.len(), "seeded simulated kernel from inventory");

        kernel
    }

    /// Add a physical ethernet link with carrier
    pub fn with_physical_link(self, name: &str, hardware_addr: &str) -> Self {
        let addr: HardwareAddr = hardware_addr.parse().unwrap_or_default();

        self.add_inventory_link(&InventoryLink {
            name: name.to_string(),
            hardware_addr: addr.clone(),
            permanent_addr: addr,
            driver: "virtio_net".into(),
            carrier: Some(true),
            ethtool: Some(InventoryEthtool::default()),
            ..Default::default()
        });

        self
    }

    /// Add a physical link described by an inventory entry
    pub fn with_link(self, link: InventoryLink) -> Self {
        self.add_inventory_link(&link);
        self
    }

    fn add_inventory_link(&self, link: &InventoryLink) {
        let mut state = self.state.lock();

        let index = state.next_index;
        state.next_index += 1;

        state.links.insert(
            index,
            KernelLink {
                index,
                name: link.name.clone(),
                link_type: LinkType::Ether,
                flags: LinkFlags::BROADCAST | LinkFlags::MULTICAST,
                mtu: link.mtu.unwrap_or(DEFAULT_MTU),
                hardware_addr: link.hardware_addr.clone(),
                permanent_addr: if link.permanent_addr.is_empty() {
                    link.hardware_addr.clone()
                } else {
                    link.permanent_addr.clone()
                },
                broadcast_addr: HardwareAddr(vec![0xff; 6]),
                oper_state: OperState::Down,
                bus_path: link.bus_path.clone(),
                pci_id: link.pci_id.clone(),
                driver: link.driver.clone(),
                ..Default::default()
            },
        );
        state.carrier.insert(index, link.carrier.unwrap_or(true));

        if let Some(ethtool) = &link.ethtool {
            state.ethtool.insert(
                link.name.clone(),
                EthtoolState {
                    link: EthtoolLinkState {
                        link_up: false,
                        speed_mbit: ethtool.speed_mbit,
                        port: ethtool.port,
                        duplex: ethtool.duplex,
                    },
                    rings: ethtool.rings.clone(),
                    features: ethtool.features.clone(),
                    channels: ethtool.channels.clone(),
                    wake_on_lan: ethtool.wake_on_lan.clone(),
                },
            );
        }
    }

    /// Number of mutating calls served so far
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn hostname(&self) -> (String, String) {
        let state = self.state.lock();
        (state.hostname.clone(), state.domainname.clone())
    }

    /// Plug or unplug the cable of a link
    pub fn set_carrier(&self, name: &str, carrier: bool) {
        {
            let mut state = self.state.lock();

            let Some(index) = state.by_name(name).map(|l| l.index) else {
                return;
            };

            state.carrier.insert(index, carrier);
            state.refresh_oper_state(index);

            if let Some(ethtool) = state.ethtool.get_mut(name) {
                ethtool.link.link_up = carrier;
            }
        }

        self.notify(&self.link_events, KernelEvent::Link);
    }

    fn write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }

    fn notify(&self, tx: &broadcast::Sender<KernelEvent>, event: KernelEvent) {
        let _ = tx.send(event);
    }
}

// =============================================================================
// Links
// =============================================================================

#[async_trait]
impl LinkBackend for MemoryKernel {
    async fn list_links(&self) -> Result<Vec<KernelLink>> {
        Ok(self.state.lock().links.values().cloned().collect())
    }

    async fn create_link(&self, request: LinkRequest) -> Result<u32> {
        self.write();

        let index = {
            let mut state = self.state.lock();
            let op = format!("create link {}", request.name);

            if state.by_name(&request.name).is_some() {
                return Err(Error::KernelExists { op });
            }

            let mut hardware_addr = HardwareAddr::default();

            if request.parent_index != 0 {
                hardware_addr = state.link(request.parent_index, &op)?.hardware_addr.clone();
            } else if request.kind != KIND_WIREGUARD {
                let n = state.next_index as u8;
                hardware_addr = HardwareAddr(vec![0x02, 0x00, 0x00, 0x00, 0x00, n]);
            }

            let index = state.next_index;
            state.next_index += 1;

            let mut flags = LinkFlags::default();
            if request.kind == KIND_WIREGUARD {
                flags.insert(LinkFlags::POINTTOPOINT | LinkFlags::NOARP);
            } else {
                flags.insert(LinkFlags::BROADCAST | LinkFlags::MULTICAST);
            }

            if request.kind == KIND_BOND {
                flags.insert(LinkFlags::MASTER);
            }

            state.links.insert(
                index,
                KernelLink {
                    index,
                    name: request.name.clone(),
                    link_type: request.link_type,
                    flags,
                    mtu: if request.mtu != 0 { request.mtu } else { DEFAULT_MTU },
                    parent_index: request.parent_index,
                    hardware_addr,
                    oper_state: OperState::Down,
                    info: Some(LinkInfo {
                        kind: request.kind.clone(),
                        data: request.data.reported(),
                        slave_kind: String::new(),
                    }),
                    ..Default::default()
                },
            );

            if request.kind == KIND_WIREGUARD {
                state
                    .wireguard
                    .insert(request.name.clone(), WireguardDevice::default());
            }

            index
        };

        debug!(link = %request.name, kind = %request.kind, index, "created link");
        self.notify(&self.link_events, KernelEvent::Link);

        Ok(index)
    }

    async fn delete_link(&self, index: u32) -> Result<()> {
        self.write();

        {
            let mut state = self.state.lock();
            let link = state.link(index, "delete link")?.clone();

            // lower devices take their stacked links with them
            let children: Vec<u32> = state
                .links
                .values()
                .filter(|l| l.parent_index == index)
                .map(|l| l.index)
                .collect();

            for removed in std::iter::once(index).chain(children) {
                if let Some(l) = state.links.remove(&removed) {
                    state.wireguard.remove(&l.name);
                    state.ethtool.remove(&l.name);
                }

                state.carrier.remove(&removed);
                state.addresses.retain(|a| a.index != removed);
                state.routes.retain(|r| r.out_index != removed);

                for slave in state.links.values_mut() {
                    if slave.master_index == removed {
                        slave.master_index = 0;
                        slave.flags.remove(LinkFlags::SLAVE);
                        if let Some(info) = slave.info.as_mut() {
                            info.slave_kind.clear();
                        }
                    }
                }
            }

            debug!(link = %link.name, index, "deleted link");
        }

        self.notify(&self.link_events, KernelEvent::Link);
        self.notify(&self.address_events, KernelEvent::Address);
        self.notify(&self.route_events, KernelEvent::Route);

        Ok(())
    }

    async fn set_link_up(&self, index: u32, up: bool) -> Result<()> {
        self.write();

        {
            let mut state = self.state.lock();
            let link = state.link_mut(index, "set link up")?;

            if up {
                link.flags.insert(LinkFlags::UP);
            } else {
                link.flags.remove(LinkFlags::UP);
            }

            let name = link.name.clone();
            state.refresh_oper_state(index);

            let carrier = state.carrier.get(&index).copied().unwrap_or(false);
            if let Some(ethtool) = state.ethtool.get_mut(&name) {
                ethtool.link.link_up = up && carrier;
            }
        }

        self.notify(&self.link_events, KernelEvent::Link);

        Ok(())
    }

    async fn set_link_mtu(&self, index: u32, mtu: u32) -> Result<()> {
        self.write();
        self.state.lock().link_mut(index, "set link mtu")?.mtu = mtu;
        self.notify(&self.link_events, KernelEvent::Link);

        Ok(())
    }

    async fn set_link_master(&self, index: u32, master_index: u32) -> Result<()> {
        self.write();

        {
            let mut state = self.state.lock();

            let slave_kind = if master_index == 0 {
                String::new()
            } else {
                state.link(master_index, "set link master")?.kind().to_string()
            };

            let link = state.link_mut(index, "set link master")?;
            link.master_index = master_index;

            if master_index == 0 {
                link.flags.remove(LinkFlags::SLAVE);
            } else {
                link.flags.insert(LinkFlags::SLAVE);
            }

            link.info.get_or_insert_with(LinkInfo::default).slave_kind = slave_kind;
        }

        self.notify(&self.link_events, KernelEvent::Link);

        Ok(())
    }

    async fn set_link_alias(&self, index: u32, alias: &str) -> Result<()> {
        self.write();
        self.state.lock().link_mut(index, "set link alias")?.alias = alias.to_string();
        self.notify(&self.link_events, KernelEvent::Link);

        Ok(())
    }

    async fn set_link_data(&self, index: u32, data: LinkData) -> Result<()> {
        self.write();

        {
            let mut state = self.state.lock();
            let has_slaves = state.links.values().any(|l| l.master_index == index);
            let link = state.link_mut(index, "set link data")?;

            let Some(info) = link.info.as_mut() else {
                return Err(Error::KernelUnsupported {
                    op: format!("set link data {}", link.name),
                });
            };

            let data = data.reported();

            match (&info.data, &data) {
                // bond mode changes are refused while the bond is up or enslaving
                (LinkData::Bond(current), LinkData::Bond(desired)) => {
                    if current.mode != desired.mode
                        && (link.flags.contains(LinkFlags::UP) || has_slaves)
                    {
                        return Err(Error::KernelBusy {
                            op: format!("set bond mode {}", link.name),
                        });
                    }
                }
                (LinkData::Vlan(current), LinkData::Vlan(desired)) if current != desired => {
                    return Err(Error::KernelUnsupported {
                        op: format!("change vlan {}", link.name),
                    });
                }
                _ => {}
            }

            info.data = data;
        }

        self.notify(&self.link_events, KernelEvent::Link);

        Ok(())
    }

    fn watch_links(&self) -> broadcast::Receiver<KernelEvent> {
        self.link_events.subscribe()
    }
}

// =============================================================================
// Addresses
// =============================================================================

#[async_trait]
impl AddressBackend for MemoryKernel {
    async fn list_addresses(&self) -> Result<Vec<KernelAddress>> {
        Ok(self.state.lock().addresses.clone())
    }

    async fn add_address(&self, address: KernelAddress) -> Result<()> {
        self.write();

        {
            let mut state = self.state.lock();
            let op = format!("add address {}", address.prefix);

            state.link(address.index, &op)?;

            if state
                .addresses
                .iter()
                .any(|a| a.index == address.index && a.prefix == address.prefix)
            {
                return Err(Error::KernelExists { op });
            }

            state.addresses.push(address);
        }

        self.notify(&self.address_events, KernelEvent::Address);

        Ok(())
    }

    async fn delete_address(&self, index: u32, prefix: IpNetwork) -> Result<()> {
        self.write();

        {
            let mut state = self.state.lock();
            let before = state.addresses.len();

            state
                .addresses
                .retain(|a| !(a.index == index && a.prefix == prefix));

            if state.addresses.len() == before {
                return Err(Error::KernelNotFound {
                    op: format!("delete address {}", prefix),
                });
            }
        }

        self.notify(&self.address_events, KernelEvent::Address);

        Ok(())
    }

    fn watch_addresses(&self) -> broadcast::Receiver<KernelEvent> {
        self.address_events.subscribe()
    }
}

// =============================================================================
// Routes
// =============================================================================

#[async_trait]
impl RouteBackend for MemoryKernel {
    async fn list_routes(&self) -> Result<Vec<KernelRoute>> {
        Ok(self.state.lock().routes.clone())
    }

    async fn add_route(&self, route: KernelRoute) -> Result<()> {
        self.write();

        {
            let mut state = self.state.lock();
            let op = format!(
                "add route {}",
                route
                    .destination
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "default".into())
            );

            if route.out_index != 0 {
                state.link(route.out_index, &op)?;
            }

            if state.routes.iter().any(|r| r.same_key(&route)) {
                return Err(Error::KernelExists { op });
            }

            state.routes.push(route);
        }

        self.notify(&self.route_events, KernelEvent::Route);

        Ok(())
    }

    async fn delete_route(&self, route: &KernelRoute) -> Result<()> {
        self.write();

        {
            let mut state = self.state.lock();
            let before = state.routes.len();

            state.routes.retain(|r| !r.same_key(route));

            if state.routes.len() == before {
                return Err(Error::KernelNotFound {
                    op: "delete route".into(),
                });
            }
        }

        self.notify(&self.route_events, KernelEvent::Route);

        Ok(())
    }

    fn watch_routes(&self) -> broadcast::Receiver<KernelEvent> {
        self.route_events.subscribe()
    }
}

// =============================================================================
// Ethtool
// =============================================================================

fn unsupported(op: &str, name: &str) -> Error {
    Error::KernelUnsupported {
        op: format!("{} {}", op, name),
    }
}

impl MemoryKernel {
    fn with_ethtool<R>(
        &self,
        op: &str,
        name: &str,
        f: impl FnOnce(&mut EthtoolState) -> Result<R>,
    ) -> Result<R> {
        let mut state = self.state.lock();

        let ethtool = state.ethtool.get_mut(name).ok_or_else(|| Error::KernelNotFound {
            op: format!("{} {}", op, name),
        })?;

        f(ethtool)
    }
}

#[async_trait]
impl EthtoolBackend for MemoryKernel {
    async fn link_state(&self, name: &str) -> Result<EthtoolLinkState> {
        self.with_ethtool("link state", name, |e| Ok(e.link.clone()))
    }

    async fn rings(&self, name: &str) -> Result<EthernetRingsStatus> {
        self.with_ethtool("rings", name, |e| {
            e.rings.clone().ok_or_else(|| unsupported("rings", name))
        })
    }

    async fn set_rings(&self, name: &str, rings: &EthernetRings) -> Result<()> {
        self.write();
        self.with_ethtool("set rings", name, |e| {
            let status = e.rings.as_mut().ok_or_else(|| unsupported("set rings", name))?;

            let set = |current: &mut Option<u32>, desired: Option<u32>, max: Option<u32>| {
                if let Some(value) = desired {
                    *current = Some(max.map_or(value, |m| value.min(m)));
                }
            };

            set(&mut status.current.rx, rings.rx, status.rx_max);
            set(&mut status.current.rx_mini, rings.rx_mini, status.rx_mini_max);
            set(&mut status.current.rx_jumbo, rings.rx_jumbo, status.rx_jumbo_max);
            set(&mut status.current.tx, rings.tx, status.tx_max);
            set(&mut status.current.rx_buf_len, rings.rx_buf_len, None);
            set(&mut status.current.cqe_size, rings.cqe_size, None);

            if rings.tx_push.is_some() {
                status.current.tx_push = rings.tx_push;
            }

            if rings.rx_push.is_some() {
                status.current.rx_push = rings.rx_push;
            }

            Ok(())
        })?;
        self.notify(&self.ethtool_events, KernelEvent::Ethtool);

        Ok(())
    }

    async fn features(&self, name: &str) -> Result<BTreeMap<String, bool>> {
        self.with_ethtool("features", name, |e| {
            e.features.clone().ok_or_else(|| unsupported("features", name))
        })
    }

    async fn set_features(&self, name: &str, features: &BTreeMap<String, bool>) -> Result<()> {
        self.write();
        self.with_ethtool("set features", name, |e| {
            let current = e
                .features
                .as_mut()
                .ok_or_else(|| unsupported("set features", name))?;

            for (feature, on) in features {
                match current.get_mut(feature) {
                    Some(value) => *value = *on,
                    None => return Err(unsupported(&format!("feature {}", feature), name)),
                }
            }

            Ok(())
        })?;
        self.notify(&self.ethtool_events, KernelEvent::Ethtool);

        Ok(())
    }

    async fn channels(&self, name: &str) -> Result<EthernetChannelsStatus> {
        self.with_ethtool("channels", name, |e| {
            e.channels.clone().ok_or_else(|| unsupported("channels", name))
        })
    }

    async fn set_channels(&self, name: &str, channels: &EthernetChannels) -> Result<()> {
        self.write();
        self.with_ethtool("set channels", name, |e| {
            let status = e
                .channels
                .as_mut()
                .ok_or_else(|| unsupported("set channels", name))?;

            for (current, desired, max) in [
                (&mut status.current.rx, channels.rx, status.rx_max),
                (&mut status.current.tx, channels.tx, status.tx_max),
                (&mut status.current.other, channels.other, status.other_max),
                (&mut status.current.combined, channels.combined, status.combined_max),
            ] {
                if let Some(value) = desired {
                    if max.map_or(false, |m| value > m) {
                        return Err(Error::Kernel {
                            op: format!("set channels {}", name),
                            reason: "value exceeds hardware maximum".into(),
                        });
                    }

                    *current = Some(value);
                }
            }

            Ok(())
        })?;
        self.notify(&self.ethtool_events, KernelEvent::Ethtool);

        Ok(())
    }

    async fn wake_on_lan(&self, name: &str) -> Result<Vec<WolMode>> {
        self.with_ethtool("wake-on-lan", name, |e| {
            e.wake_on_lan
                .clone()
                .ok_or_else(|| unsupported("wake-on-lan", name))
        })
    }

    async fn set_wake_on_lan(&self, name: &str, modes: &[WolMode]) -> Result<()> {
        self.write();
        self.with_ethtool("set wake-on-lan", name, |e| {
            let current = e
                .wake_on_lan
                .as_mut()
                .ok_or_else(|| unsupported("set wake-on-lan", name))?;

            *current = modes.to_vec();

            Ok(())
        })?;
        self.notify(&self.ethtool_events, KernelEvent::Ethtool);

        Ok(())
    }

    fn watch_ethtool(&self) -> broadcast::Receiver<KernelEvent> {
        self.ethtool_events.subscribe()
    }
}

// =============================================================================
// Wireguard
// =============================================================================

#[async_trait]
impl WireguardBackend for MemoryKernel {
    async fn wireguard_device(&self, name: &str) -> Result<WireguardDevice> {
        self.state
            .lock()
            .wireguard
            .get(name)
            .cloned()
            .ok_or_else(|| Error::KernelNotFound {
                op: format!("wireguard device {}", name),
            })
    }

    async fn configure_wireguard(&self, name: &str, patch: WireguardPatch) -> Result<()> {
        self.write();

        let public_key = patch
            .private_key
            .as_deref()
            .map(public_key)
            .transpose()?;

        let mut state = self.state.lock();

        let device = state
            .wireguard
            .get_mut(name)
            .ok_or_else(|| Error::KernelNotFound {
                op: format!("configure wireguard {}", name),
            })?;

        apply_patch(device, &patch);

        if let Some(public_key) = public_key {
            device.public_key = public_key;
        }

        Ok(())
    }
}

// =============================================================================
// nftables
// =============================================================================

#[async_trait]
impl NfTablesBackend for MemoryKernel {
    async fn list_tables(&self) -> Result<Vec<NfTableRef>> {
        Ok(self.state.lock().nftables.keys().cloned().collect())
    }

    async fn list_chains(&self, table: &NfTableRef) -> Result<Vec<NfChainState>> {
        self.state
            .lock()
            .nftables
            .get(table)
            .cloned()
            .ok_or_else(|| Error::KernelNotFound {
                op: format!("list chains {}", table.name),
            })
    }

    async fn apply(&self, batch: NfBatch) -> Result<()> {
        self.write();

        let mut state = self.state.lock();

        // all or nothing
        let mut tables = state.nftables.clone();

        for op in batch.ops {
            match op {
                NfOp::AddTable(table) => {
                    tables.entry(table).or_default();
                }
                NfOp::DeleteTable(table) => {
                    tables.remove(&table).ok_or_else(|| Error::KernelNotFound {
                        op: format!("delete table {}", table.name),
                    })?;
                }
                NfOp::AddChain { table, chain } => {
                    let chains = tables.get_mut(&table).ok_or_else(|| Error::KernelNotFound {
                        op: format!("add chain {} to {}", chain.name, table.name),
                    })?;

                    if !chains.iter().any(|c| c.chain.name == chain.name) {
                        chains.push(NfChainState {
                            chain,
                            rules: Vec::new(),
                            sets: Vec::new(),
                        });
                    }
                }
                NfOp::DeleteChain { table, chain } => {
                    let chains = tables.get_mut(&table).ok_or_else(|| Error::KernelNotFound {
                        op: format!("delete chain {} from {}", chain, table.name),
                    })?;

                    let before = chains.len();
                    chains.retain(|c| c.chain.name != chain);

                    if chains.len() == before {
                        return Err(Error::KernelNotFound {
                            op: format!("delete chain {}", chain),
                        });
                    }
                }
                NfOp::AddSet { table, chain, set } => {
                    chain_mut(&mut tables, &table, &chain)?.sets.push(set);
                }
                NfOp::AddRule {
                    table,
                    chain,
                    exprs,
                } => {
                    chain_mut(&mut tables, &table, &chain)?.rules.push(exprs);
                }
            }
        }

        state.nftables = tables;

        Ok(())
    }
}

fn chain_mut<'a>(
    tables: &'a mut BTreeMap<NfTableRef, Vec<NfChainState>>,
    table: &NfTableRef,
    chain: &str,
) -> Result<&'a mut NfChainState> {
    tables
        .get_mut(table)
        .and_then(|chains| chains.iter_mut().find(|c| c.chain.name == chain))
        .ok_or_else(|| Error::KernelNotFound {
            op: format!("chain {} in {}", chain, table.name),
        })
}

// =============================================================================
// Host
// =============================================================================

#[async_trait]
impl HostBackend for MemoryKernel {
    async fn set_hostname(&self, hostname: &str) -> Result<()> {
        self.write();
        self.state.lock().hostname = hostname.to_string();
        Ok(())
    }

    async fn set_domainname(&self, domainname: &str) -> Result<()> {
        self.write();
        self.state.lock().domainname = domainname.to_string();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::nftables::{NfChainDef, NfFamily};
    use crate::resources::nethelpers::{
        AddressFlags, BondMode, ChainPriority, ChainType, Family, Scope, Verdict,
    };
    use crate::resources::{BondMasterSpec, VlanSpec, KIND_VLAN};
    use assert_matches::assert_matches;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    #[tokio::test]
    async fn test_loopback_present() {
        let kernel = MemoryKernel::new();
        let links = kernel.list_links().await.unwrap();

        assert_eq!(links.len(), 1);
        assert_eq!(links[0].name, "lo");
        assert_eq!(links[0].link_type, LinkType::Loopback);
    }

    #[tokio::test]
    async fn test_delete_link_cascades() {
        let kernel = MemoryKernel::new().with_physical_link("eth0", "00:11:22:33:44:55");
        let eth0 = 2;

        let vlan = kernel
            .create_link(LinkRequest {
                name: "eth0.25".into(),
                kind: KIND_VLAN.into(),
                parent_index: eth0,
                ..Default::default()
            })
            .await
            .unwrap();

        let prefix: IpNetwork = "10.0.0.2/24".parse().unwrap();
        kernel
            .add_address(KernelAddress::new(vlan, prefix, Scope::Global, AddressFlags::PERMANENT))
            .await
            .unwrap();
        kernel
            .add_route(KernelRoute {
                family: Family::Inet4,
                out_index: vlan,
                gateway: Some("10.0.0.1".parse().unwrap()),
                ..Default::default()
            })
            .await
            .unwrap();

        kernel.delete_link(eth0).await.unwrap();

        assert_eq!(kernel.list_links().await.unwrap().len(), 1);
        assert!(kernel.list_addresses().await.unwrap().is_empty());
        assert!(kernel.list_routes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_link_data_rules() {
        let kernel = MemoryKernel::new().with_physical_link("eth0", "00:11:22:33:44:55");

        let vlan = kernel
            .create_link(LinkRequest {
                name: "eth0.25".into(),
                kind: KIND_VLAN.into(),
                parent_index: 2,
                data: LinkData::Vlan(VlanSpec {
                    vid: 25,
                    ..Default::default()
                }),
                ..Default::default()
            })
            .await
            .unwrap();

        let err = kernel
            .set_link_data(
                vlan,
                LinkData::Vlan(VlanSpec {
                    vid: 26,
                    ..Default::default()
                }),
            )
            .await
            .unwrap_err();
        assert_matches!(err, Error::KernelUnsupported { .. });

        let bond = kernel
            .create_link(LinkRequest {
                name: "bond0".into(),
                kind: KIND_BOND.into(),
                data: LinkData::Bond(BondMasterSpec {
                    mode: BondMode::ActiveBackup,
                    packets_per_slave: 5,
                    ..Default::default()
                }),
                ..Default::default()
            })
            .await
            .unwrap();

        let links = kernel.list_links().await.unwrap();
        let bond0 = links.iter().find(|l| l.index == bond).unwrap();
        let reported = bond0.info.as_ref().unwrap().data.bond().unwrap();
        // packets per slave only exists in round-robin mode
        assert_eq!(reported.packets_per_slave, 0);

        kernel.set_link_up(bond, true).await.unwrap();
        let err = kernel
            .set_link_data(
                bond,
                LinkData::Bond(BondMasterSpec {
                    mode: BondMode::Ieee8023ad,
                    ..Default::default()
                }),
            )
            .await
            .unwrap_err();
        assert_matches!(err, Error::KernelBusy { .. });
    }

    #[tokio::test]
    async fn test_duplicate_address() {
        let kernel = MemoryKernel::new();
        let prefix: IpNetwork = "127.0.0.1/8".parse().unwrap();
        let address = KernelAddress::new(1, prefix, Scope::Host, AddressFlags::PERMANENT);

        kernel.add_address(address.clone()).await.unwrap();
        let err = kernel.add_address(address).await.unwrap_err();
        assert_matches!(err, Error::KernelExists { .. });

        let err = kernel
            .delete_address(1, "127.0.0.2/8".parse().unwrap())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_link_up_tracks_carrier() {
        let kernel = MemoryKernel::new().with_physical_link("eth0", "00:11:22:33:44:55");

        kernel.set_link_up(2, true).await.unwrap();
        let link = kernel.list_links().await.unwrap().remove(1);
        assert_eq!(link.oper_state, OperState::Up);

        kernel.set_carrier("eth0", false);
        let link = kernel.list_links().await.unwrap().remove(1);
        assert_eq!(link.oper_state, OperState::LowerLayerDown);
        assert!(!kernel.link_state("eth0").await.unwrap().link_up);
    }

    #[tokio::test]
    async fn test_ethtool_unsupported() {
        let kernel = MemoryKernel::new().with_physical_link("eth0", "00:11:22:33:44:55");

        let err = kernel.rings("eth0").await.unwrap_err();
        assert!(err.is_unsupported());

        let err = kernel.rings("eth9").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_nftables_batch_is_atomic() {
        let kernel = MemoryKernel::new();
        let table = NfTableRef::new(NfFamily::Inet, "node-netd");

        let mut batch = NfBatch::default();
        batch.push(NfOp::AddTable(table.clone()));
        batch.push(NfOp::AddChain {
            table: table.clone(),
            chain: NfChainDef {
                name: "ingress".into(),
                chain_type: ChainType::Filter,
                hook: None,
                priority: ChainPriority::FILTER,
                policy: Verdict::Accept,
            },
        });
        kernel.apply(batch).await.unwrap();

        let mut batch = NfBatch::default();
        batch.push(NfOp::DeleteChain {
            table: table.clone(),
            chain: "ingress".into(),
        });
        batch.push(NfOp::DeleteChain {
            table: table.clone(),
            chain: "missing".into(),
        });
        assert!(kernel.apply(batch).await.is_err());

        assert_eq!(kernel.list_chains(&table).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_wireguard_public_key_derived() {
        let kernel = MemoryKernel::new();
        kernel
            .create_link(LinkRequest {
                name: "wg0".into(),
                kind: KIND_WIREGUARD.into(),
                link_type: LinkType::None,
                ..Default::default()
            })
            .await
            .unwrap();

        let private_key = STANDARD.encode([7u8; 32]);
        kernel
            .configure_wireguard(
                "wg0",
                WireguardPatch {
                    private_key: Some(private_key.clone()),
                    listen_port: Some(51820),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let device = kernel.wireguard_device("wg0").await.unwrap();
        assert_eq!(device.private_key, private_key);
        assert_eq!(device.public_key, public_key(&private_key).unwrap());
        assert_eq!(device.listen_port, 51820);
    }

    #[test]
    fn test_inventory_yaml() {
        let inventory = HostInventory::from_yaml(
            r#"
hostname: node-1
links:
  - name: eth0
    hardwareAddr: "00:11:22:33:44:55"
    driver: virtio_net
    busPath: "0000:00:03.0"
  - name: eth1
    hardwareAddr: "00:11:22:33:44:56"
    carrier: false
"#,
        )
        .unwrap();

        let kernel = MemoryKernel::from_inventory(&inventory);
        assert_eq!(kernel.hostname().0, "node-1");
        assert_eq!(kernel.state.lock().links.len(), 3);
    }
}
