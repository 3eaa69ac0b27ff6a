//! rtnetlink links
//!
//! Bond and VLAN settings travel as `IFLA_INFO_DATA` through the typed
//! `InfoBond` / `InfoVlan` attributes. Bond attributes the current mode does
//! not carry are never sent; the kernel rejects them.

use super::{netlink_error, LinuxKernel};
use crate::adapters::kernel::{KernelEvent, KernelLink, LinkBackend, LinkInfo, LinkRequest};
use crate::adapters::link_data::LinkData;
use crate::error::{Error, Result};
use crate::resources::nethelpers::{
    AdSelect, ArpAllTargets, ArpValidate, BondMode, BondXmitHashPolicy, FailOverMac,
    HardwareAddr, LacpRate, LinkFlags, LinkType, OperState, PrimaryReselect, VlanProtocol,
};
use crate::resources::{
    BondMasterSpec, VlanSpec, KIND_BOND, KIND_BRIDGE, KIND_DUMMY, KIND_TUN, KIND_VLAN,
    KIND_WIREGUARD,
};
use async_trait::async_trait;
use futures::TryStreamExt;
use netlink_packet_route::link::nlas::{Info, InfoBond, InfoData, InfoKind, InfoVlan, Nla};
use netlink_packet_route::LinkMessage;
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::broadcast;
use tracing::debug;

// =============================================================================
// Kind-Specific Data
// =============================================================================

fn kind_name(kind: &InfoKind) -> String {
    match kind {
        InfoKind::Vlan => KIND_VLAN.to_string(),
        InfoKind::Bond => KIND_BOND.to_string(),
        InfoKind::Wireguard => KIND_WIREGUARD.to_string(),
        InfoKind::Bridge => KIND_BRIDGE.to_string(),
        InfoKind::Dummy => KIND_DUMMY.to_string(),
        InfoKind::Tun => KIND_TUN.to_string(),
        InfoKind::Other(name) => name.clone(),
        other => format!("{:?}", other).to_lowercase(),
    }
}

fn info_kind(kind: &str) -> InfoKind {
    match kind {
        KIND_VLAN => InfoKind::Vlan,
        KIND_BOND => InfoKind::Bond,
        KIND_WIREGUARD => InfoKind::Wireguard,
        KIND_BRIDGE => InfoKind::Bridge,
        KIND_DUMMY => InfoKind::Dummy,
        KIND_TUN => InfoKind::Tun,
        other => InfoKind::Other(other.to_string()),
    }
}

pub(super) fn vlan_info(vlan: &VlanSpec) -> Vec<InfoVlan> {
    vec![
        InfoVlan::Id(vlan.vid),
        InfoVlan::Protocol(vlan.protocol.value()),
    ]
}

pub(super) fn vlan_from_info(attrs: &[InfoVlan]) -> VlanSpec {
    let mut vlan = VlanSpec::default();

    for attr in attrs {
        match attr {
            InfoVlan::Id(vid) => vlan.vid = *vid,
            InfoVlan::Protocol(proto) => {
                vlan.protocol = VlanProtocol::from_value(*proto).unwrap_or_default()
            }
            _ => {}
        }
    }

    vlan
}

/// Bond attributes to send for a normalized spec
pub(super) fn bond_info(bond: &BondMasterSpec) -> Vec<InfoBond> {
    let mode = bond.mode;
    let lacp = mode == BondMode::Ieee8023ad;
    let load_balancing = matches!(mode, BondMode::Alb | BondMode::Tlb);

    let mut attrs = vec![
        InfoBond::Mode(mode.value()),
        InfoBond::XmitHashPolicy(bond.hash_policy.value()),
        InfoBond::MiiMon(bond.miimon),
        InfoBond::UseCarrier(bond.use_carrier as u8),
        InfoBond::PrimaryReselect(bond.primary_reselect.value()),
        InfoBond::FailOverMac(bond.fail_over_mac.value()),
        InfoBond::ResendIgmp(bond.resend_igmp),
        InfoBond::NumPeerNotif(bond.num_peer_notif),
        InfoBond::AllPortsActive(bond.all_slaves_active),
        InfoBond::MinLinks(bond.min_links),
        InfoBond::LpInterval(bond.lp_interval),
        InfoBond::AdSelect(bond.ad_select.value()),
    ];

    if bond.miimon != 0 {
        attrs.push(InfoBond::UpDelay(bond.up_delay));
        attrs.push(InfoBond::DownDelay(bond.down_delay));
    }

    if lacp {
        attrs.push(InfoBond::AdLacpRate(bond.lacp_rate.value()));
        attrs.push(InfoBond::AdActorSysPrio(bond.ad_actor_sys_prio));
        attrs.push(InfoBond::AdUserPortKey(bond.ad_user_port_key));
    }

    if !lacp && !load_balancing {
        attrs.push(InfoBond::ArpInterval(bond.arp_interval));
        attrs.push(InfoBond::ArpValidate(bond.arp_validate.value()));
        attrs.push(InfoBond::ArpAllTargets(bond.arp_all_targets.value()));

        if !bond.arp_ip_targets.is_empty() {
            attrs.push(InfoBond::ArpIpTarget(bond.arp_ip_targets.clone()));
        }
    }

    if bond.primary_index != 0
        && matches!(mode, BondMode::ActiveBackup | BondMode::Alb | BondMode::Tlb)
    {
        attrs.push(InfoBond::Primary(bond.primary_index));
    }

    if mode == BondMode::RoundRobin {
        attrs.push(InfoBond::PacketsPerPort(bond.packets_per_slave));
    }

    if load_balancing {
        attrs.push(InfoBond::TlbDynamicLb(bond.tlb_dynamic_lb));
    }

    attrs
}

pub(super) fn bond_from_info(attrs: &[InfoBond]) -> BondMasterSpec {
    let mut bond = BondMasterSpec::default();

    for attr in attrs {
        match attr {
            InfoBond::Mode(v) => bond.mode = BondMode::from_value(*v).unwrap_or_default(),
            InfoBond::XmitHashPolicy(v) => {
                bond.hash_policy = BondXmitHashPolicy::from_value(*v).unwrap_or_default()
            }
            InfoBond::AdLacpRate(v) => bond.lacp_rate = LacpRate::from_value(*v).unwrap_or_default(),
            InfoBond::ArpValidate(v) => {
                bond.arp_validate = ArpValidate::from_value(*v).unwrap_or_default()
            }
            InfoBond::ArpAllTargets(v) => {
                bond.arp_all_targets = ArpAllTargets::from_value(*v).unwrap_or_default()
            }
            InfoBond::ArpIpTarget(targets) => bond.arp_ip_targets = targets.clone(),
            InfoBond::Primary(v) => bond.primary_index = *v,
            InfoBond::PrimaryReselect(v) => {
                bond.primary_reselect = PrimaryReselect::from_value(*v).unwrap_or_default()
            }
            InfoBond::FailOverMac(v) => {
                bond.fail_over_mac = FailOverMac::from_value(*v).unwrap_or_default()
            }
            InfoBond::AdSelect(v) => bond.ad_select = AdSelect::from_value(*v).unwrap_or_default(),
            InfoBond::MiiMon(v) => bond.miimon = *v,
            InfoBond::UpDelay(v) => bond.up_delay = *v,
            InfoBond::DownDelay(v) => bond.down_delay = *v,
            InfoBond::ArpInterval(v) => bond.arp_interval = *v,
            InfoBond::ResendIgmp(v) => bond.resend_igmp = *v,
            InfoBond::MinLinks(v) => bond.min_links = *v,
            InfoBond::LpInterval(v) => bond.lp_interval = *v,
            InfoBond::PacketsPerPort(v) => bond.packets_per_slave = *v,
            InfoBond::NumPeerNotif(v) => bond.num_peer_notif = *v,
            InfoBond::TlbDynamicLb(v) => bond.tlb_dynamic_lb = *v,
            InfoBond::AllPortsActive(v) => bond.all_slaves_active = *v,
            InfoBond::UseCarrier(v) => bond.use_carrier = *v != 0,
            InfoBond::AdActorSysPrio(v) => bond.ad_actor_sys_prio = *v,
            InfoBond::AdUserPortKey(v) => bond.ad_user_port_key = *v,
            _ => {}
        }
    }

    bond
}

fn info_data(data: &LinkData) -> Option<InfoData> {
    match data {
        LinkData::None => None,
        LinkData::Vlan(vlan) => Some(InfoData::Vlan(vlan_info(vlan))),
        LinkData::Bond(bond) => Some(InfoData::Bond(bond_info(bond))),
    }
}

fn decode_info(attrs: &[Info]) -> LinkInfo {
    let mut info = LinkInfo::default();

    for attr in attrs {
        match attr {
            Info::Kind(kind) => info.kind = kind_name(kind),
            Info::Data(InfoData::Vlan(vlan)) => info.data = LinkData::Vlan(vlan_from_info(vlan)),
            Info::Data(InfoData::Bond(bond)) => {
                info.data = LinkData::Bond(bond_from_info(bond)).reported()
            }
            _ => {}
        }
    }

    info
}

/// Decode RTM_NEWLINK; sysfs details and slave kinds are filled in later
pub(super) fn decode_link(message: &LinkMessage) -> KernelLink {
    let mut link = KernelLink {
        index: message.header.index,
        link_type: LinkType::from_value(message.header.link_layer_type).unwrap_or_default(),
        flags: LinkFlags(message.header.flags),
        ..Default::default()
    };

    for nla in &message.nlas {
        match nla {
            Nla::IfName(name) => link.name = name.clone(),
            Nla::Mtu(mtu) => link.mtu = *mtu,
            Nla::Master(index) => link.master_index = *index,
            Nla::Link(index) => link.parent_index = *index,
            Nla::Address(addr) => link.hardware_addr = HardwareAddr(addr.clone()),
            Nla::PermAddress(addr) => link.permanent_addr = HardwareAddr(addr.clone()),
            Nla::Broadcast(addr) => link.broadcast_addr = HardwareAddr(addr.clone()),
            Nla::OperState(state) => {
                link.oper_state = OperState::from_value(u8::from(state.clone())).unwrap_or_default()
            }
            Nla::IfAlias(alias) => link.alias = alias.clone(),
            Nla::Info(info) => link.info = Some(decode_info(info)),
            _ => {}
        }
    }

    link
}

/// Slaves report the kind of their master
fn fill_slave_kinds(links: &mut [KernelLink]) {
    let kinds: HashMap<u32, String> = links
        .iter()
        .filter(|l| !l.kind().is_empty())
        .map(|l| (l.index, l.kind().to_string()))
        .collect();

    for link in links.iter_mut().filter(|l| l.master_index != 0) {
        if let Some(kind) = kinds.get(&link.master_index) {
            link.info.get_or_insert_with(LinkInfo::default).slave_kind = kind.clone();
        }
    }
}

// =============================================================================
// sysfs
// =============================================================================

#[derive(Debug, Default, PartialEq, Eq)]
pub(super) struct DeviceInfo {
    pub bus_path: String,
    pub pci_id: String,
    pub driver: String,
}

fn link_target(path: &Path) -> String {
    std::fs::read_link(path)
        .ok()
        .and_then(|target| target.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_default()
}

fn pci_part(path: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(path).ok()?;
    let id = raw.trim().trim_start_matches("0x");

    (!id.is_empty()).then(|| id.to_uppercase())
}

/// Bus path, PCI id and driver of the device behind a link
pub(super) fn device_info(sysfs: &Path, name: &str) -> DeviceInfo {
    let device = sysfs.join("class/net").join(name).join("device");

    let pci_id = match (pci_part(&device.join("vendor")), pci_part(&device.join("device"))) {
        (Some(vendor), Some(product)) => format!("{}:{}", vendor, product),
        _ => String::new(),
    };

    DeviceInfo {
        bus_path: link_target(&device),
        pci_id,
        driver: link_target(&device.join("driver")),
    }
}

// =============================================================================
// Port
// =============================================================================

impl LinuxKernel {
    async fn link_index(&self, name: &str) -> Result<u32> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();

        match links.try_next().await {
            Ok(Some(message)) => Ok(message.header.index),
            Ok(None) => Err(Error::KernelNotFound {
                op: format!("get link {}", name),
            }),
            Err(e) => Err(netlink_error(format!("get link {}", name), e)),
        }
    }
}

#[async_trait]
impl LinkBackend for LinuxKernel {
    async fn list_links(&self) -> Result<Vec<KernelLink>> {
        let mut stream = self.handle.link().get().execute();
        let mut links = Vec::new();

        while let Some(message) = stream
            .try_next()
            .await
            .map_err(|e| netlink_error("list links", e))?
        {
            links.push(decode_link(&message));
        }

        fill_slave_kinds(&mut links);

        let sysfs = self.sysfs.clone();
        let names: Vec<String> = links.iter().map(|l| l.name.clone()).collect();
        let devices = tokio::task::spawn_blocking(move || {
            names
                .iter()
                .map(|name| device_info(&sysfs, name))
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| Error::Internal(format!("sysfs reader failed: {}", e)))?;

        for (link, device) in links.iter_mut().zip(devices) {
            link.bus_path = device.bus_path;
            link.pci_id = device.pci_id;
            link.driver = device.driver;
        }

        Ok(links)
    }

    async fn create_link(&self, request: LinkRequest) -> Result<u32> {
        let op = format!("create link {}", request.name);

        let mut add = self.handle.link().add();
        let message = add.message_mut();
        message.nlas.push(Nla::IfName(request.name.clone()));

        if request.mtu != 0 {
            message.nlas.push(Nla::Mtu(request.mtu));
        }

        if request.parent_index != 0 {
            message.nlas.push(Nla::Link(request.parent_index));
        }

        let mut info = vec![Info::Kind(info_kind(&request.kind))];
        if let Some(data) = info_data(&request.data) {
            info.push(Info::Data(data));
        }
        message.nlas.push(Nla::Info(info));

        add.execute().await.map_err(|e| netlink_error(&op, e))?;

        let index = self.link_index(&request.name).await?;
        debug!(link = %request.name, index, kind = %request.kind, "link created");

        Ok(index)
    }

    async fn delete_link(&self, index: u32) -> Result<()> {
        self.handle
            .link()
            .del(index)
            .execute()
            .await
            .map_err(|e| netlink_error(format!("delete link {}", index), e))
    }

    async fn set_link_up(&self, index: u32, up: bool) -> Result<()> {
        let set = self.handle.link().set(index);
        let set = if up { set.up() } else { set.down() };

        set.execute()
            .await
            .map_err(|e| netlink_error(format!("set link {} up={}", index, up), e))
    }

    async fn set_link_mtu(&self, index: u32, mtu: u32) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .mtu(mtu)
            .execute()
            .await
            .map_err(|e| netlink_error(format!("set link {} mtu", index), e))
    }

    async fn set_link_master(&self, index: u32, master_index: u32) -> Result<()> {
        let set = self.handle.link().set(index);
        let set = if master_index == 0 {
            set.nomaster()
        } else {
            set.master(master_index)
        };

        set.execute()
            .await
            .map_err(|e| netlink_error(format!("set link {} master", index), e))
    }

    async fn set_link_alias(&self, index: u32, alias: &str) -> Result<()> {
        let mut set = self.handle.link().set(index);
        set.message_mut().nlas.push(Nla::IfAlias(alias.to_string()));

        set.execute()
            .await
            .map_err(|e| netlink_error(format!("set link {} alias", index), e))
    }

    async fn set_link_data(&self, index: u32, data: LinkData) -> Result<()> {
        let op = format!("set link {} data", index);

        let (kind, data) = match &data {
            LinkData::Vlan(_) => (InfoKind::Vlan, info_data(&data)),
            LinkData::Bond(_) => (InfoKind::Bond, info_data(&data)),
            LinkData::None => return Ok(()),
        };

        let mut info = vec![Info::Kind(kind)];
        if let Some(data) = data {
            info.push(Info::Data(data));
        }

        let mut set = self.handle.link().set(index);
        set.message_mut().nlas.push(Nla::Info(info));

        set.execute().await.map_err(|e| netlink_error(&op, e))
    }

    fn watch_links(&self) -> broadcast::Receiver<KernelEvent> {
        self.watchers.links.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::link_data::normalize_bond;
    use std::net::Ipv4Addr;

    fn has(attrs: &[InfoBond], wanted: &InfoBond) -> bool {
        attrs.iter().any(|a| a == wanted)
    }

    #[test]
    fn test_bond_attributes_follow_mode() {
        let lacp = normalize_bond(&BondMasterSpec {
            mode: BondMode::Ieee8023ad,
            lacp_rate: LacpRate::Fast,
            arp_interval: 100,
            ..Default::default()
        });

        let attrs = bond_info(&lacp);
        assert!(has(&attrs, &InfoBond::Mode(4)));
        assert!(has(&attrs, &InfoBond::AdLacpRate(1)));
        assert!(has(&attrs, &InfoBond::AdActorSysPrio(65535)));
        assert!(!attrs.iter().any(|a| matches!(a, InfoBond::ArpInterval(_))));
        assert!(!attrs.iter().any(|a| matches!(a, InfoBond::PacketsPerPort(_))));

        let backup = normalize_bond(&BondMasterSpec {
            mode: BondMode::ActiveBackup,
            primary_index: 3,
            arp_interval: 200,
            arp_ip_targets: vec![Ipv4Addr::new(10, 0, 0, 1)],
            ..Default::default()
        });

        let attrs = bond_info(&backup);
        assert!(has(&attrs, &InfoBond::Primary(3)));
        assert!(has(&attrs, &InfoBond::ArpInterval(200)));
        assert!(has(&attrs, &InfoBond::ArpIpTarget(vec![Ipv4Addr::new(10, 0, 0, 1)])));
        assert!(!attrs.iter().any(|a| matches!(a, InfoBond::AdLacpRate(_))));
        assert!(!attrs.iter().any(|a| matches!(a, InfoBond::UpDelay(_))));
    }

    #[test]
    fn test_bond_decodes_to_desired() {
        let desired = normalize_bond(&BondMasterSpec {
            mode: BondMode::Ieee8023ad,
            hash_policy: BondXmitHashPolicy::Layer34,
            lacp_rate: LacpRate::Fast,
            miimon: 100,
            up_delay: 200,
            down_delay: 200,
            min_links: 1,
            ..Default::default()
        });

        let decoded = LinkData::Bond(bond_from_info(&bond_info(&desired))).reported();

        assert_eq!(decoded, LinkData::Bond(desired));
    }

    #[test]
    fn test_vlan_info() {
        let vlan = VlanSpec {
            vid: 42,
            protocol: VlanProtocol::Ieee8021ad,
        };

        let attrs = vlan_info(&vlan);
        assert_eq!(attrs, vec![InfoVlan::Id(42), InfoVlan::Protocol(0x88a8)]);
        assert_eq!(vlan_from_info(&attrs), vlan);
    }

    #[test]
    fn test_decode_link_message() {
        let mut message = LinkMessage::default();
        message.header.index = 7;
        message.header.link_layer_type = 1;
        message.header.flags = 0x1 | 0x1000;
        message.nlas = vec![
            Nla::IfName("bond0.10".into()),
            Nla::Mtu(9000),
            Nla::Link(6),
            Nla::Address(vec![0x02, 0, 0, 0, 0, 0x07]),
            Nla::IfAlias("uplink".into()),
            Nla::Info(vec![
                Info::Kind(InfoKind::Vlan),
                Info::Data(InfoData::Vlan(vec![InfoVlan::Id(10), InfoVlan::Protocol(0x8100)])),
            ]),
        ];

        let link = decode_link(&message);

        assert_eq!(link.index, 7);
        assert_eq!(link.name, "bond0.10");
        assert_eq!(link.link_type, LinkType::Ether);
        assert!(link.is_up());
        assert_eq!(link.mtu, 9000);
        assert_eq!(link.parent_index, 6);
        assert_eq!(link.alias, "uplink");
        assert_eq!(link.hardware_addr.to_string(), "02:00:00:00:00:07");
        assert_eq!(link.kind(), KIND_VLAN);
        assert_eq!(
            link.info.unwrap().data.vlan().map(|v| v.vid),
            Some(10)
        );
    }

    #[test]
    fn test_slave_kind_from_master() {
        let mut links = vec![
            KernelLink {
                index: 4,
                name: "bond0".into(),
                info: Some(LinkInfo {
                    kind: KIND_BOND.into(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            KernelLink {
                index: 2,
                name: "eth0".into(),
                master_index: 4,
                ..Default::default()
            },
        ];

        fill_slave_kinds(&mut links);

        assert_eq!(links[1].info.as_ref().unwrap().slave_kind, KIND_BOND);
        assert_eq!(links[1].kind(), "");
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(kind_name(&info_kind(KIND_WIREGUARD)), KIND_WIREGUARD);
        assert_eq!(kind_name(&info_kind("macvlan2")), "macvlan2");
    }

    #[test]
    fn test_device_info_from_sysfs() {
        let root = tempfile::tempdir().unwrap();
        let pci = root.path().join("devices/pci0000:00/0000:00:03.0");
        let driver = root.path().join("bus/pci/drivers/virtio-pci");
        std::fs::create_dir_all(&pci).unwrap();
        std::fs::create_dir_all(&driver).unwrap();
        std::fs::write(pci.join("vendor"), "0x1af4\n").unwrap();
        std::fs::write(pci.join("device"), "0x1000\n").unwrap();
        std::os::unix::fs::symlink(&driver, pci.join("driver")).unwrap();

        let net = root.path().join("class/net/eth0");
        std::fs::create_dir_all(&net).unwrap();
        std::os::unix::fs::symlink(&pci, net.join("device")).unwrap();

        let info = device_info(root.path(), "eth0");
        assert_eq!(info.bus_path, "0000:00:03.0");
        assert_eq!(info.pci_id, "1AF4:1000");
        assert_eq!(info.driver, "virtio-pci");

        assert_eq!(device_info(root.path(), "lo"), DeviceInfo::default());
    }
}
