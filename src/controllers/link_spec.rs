//! Link Spec Controller
//!
//! Creates, reconfigures and deletes links from merged `LinkSpec`s.
//!
//! Physical links are only ever brought up or down, get their MTU set and
//! are enslaved; they are never created or deleted. Logical links are
//! created on demand and replaced when their kind, type or VLAN settings
//! change, since the kernel cannot change those in place.
//!
//! Bond settings which the kernel refuses on a running bond are applied by
//! bringing the bond down and releasing its slaves first; the slaves are
//! enslaved again later in the same pass because specs are processed with
//! every bond immediately followed by its slaves.

use super::{collect_errors, pass_done, watch_kernel, KernelHandle};
use crate::adapters::link_data::{normalize_bond, LinkData};
use crate::adapters::wireguard::diff;
use crate::adapters::{KernelLink, LinkRequest};
use crate::error::{Error, Result, ResultExt};
use crate::resources::{
    Kind, LinkFlags, LinkRefresh, LinkSpec, Namespace, KIND_BOND, KIND_VLAN, KIND_WIREGUARD,
};
use crate::runtime::{Controller, ControllerRuntime, Input, Output, Phase, Resource};
use async_trait::async_trait;
use tracing::{debug, info};

/// Pushes `LinkSpec` into the kernel
pub struct LinkSpecController {
    kernel: KernelHandle,
}

/// Processing order: each bond is followed by its slaves in slave order
fn sort_key(spec: &LinkSpec) -> (&str, u32, &str) {
    if spec.bond_slave.master_name.is_empty() {
        (spec.name.as_str(), 0, "")
    } else {
        (
            spec.bond_slave.master_name.as_str(),
            spec.bond_slave.slave_index,
            spec.name.as_str(),
        )
    }
}

pub fn sort_link_specs(specs: &mut [Resource<LinkSpec>]) {
    specs.sort_by(|a, b| sort_key(&a.spec).cmp(&sort_key(&b.spec)));
}

fn find_link<'a>(links: &'a [KernelLink], name: &str) -> Option<&'a KernelLink> {
    if name.is_empty() {
        return None;
    }

    links.iter().find(|l| l.name == name)
}

impl LinkSpecController {
    pub fn new(kernel: KernelHandle) -> Self {
        Self { kernel }
    }

    pub(crate) async fn reconcile(&self, rt: &mut ControllerRuntime) -> Result<()> {
        let mut specs = rt.list::<LinkSpec>(Namespace::Network);
        sort_link_specs(&mut specs);

        for spec in &specs {
            if spec.phase() == Phase::Running && !spec.has_finalizer(rt.name()) {
                rt.add_finalizer::<LinkSpec>(Namespace::Network, spec.id())?;
            }
        }

        let mut links = self.kernel.list_links().await?;
        let mut errors = Vec::new();

        for spec in specs {
            match spec.phase() {
                Phase::Running => {
                    if let Err(e) = self.sync(rt, &mut links, &spec.spec).await {
                        errors.push(e.context(format!("link {}", spec.spec.name)));
                    }
                }
                Phase::TearingDown => {
                    if let Err(e) = self.remove(&mut links, &spec.spec).await {
                        errors.push(e.context(format!("link {}", spec.spec.name)));
                        continue;
                    }

                    rt.remove_finalizer::<LinkSpec>(Namespace::Network, spec.id())?;
                }
            }
        }

        collect_errors(errors)
    }

    async fn remove(&self, links: &mut Vec<KernelLink>, spec: &LinkSpec) -> Result<()> {
        // physical links stay as they are
        if !spec.logical {
            return Ok(());
        }

        let Some(index) = find_link(links, &spec.name).map(|l| l.index) else {
            return Ok(());
        };

        match self.kernel.delete_link(index).await {
            Ok(()) => info!(link = %spec.name, "deleted link"),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.context("delete link")),
        }

        *links = self.kernel.list_links().await?;

        Ok(())
    }

    async fn sync(
        &self,
        rt: &mut ControllerRuntime,
        links: &mut Vec<KernelLink>,
        spec: &LinkSpec,
    ) -> Result<()> {
        let mut existing = find_link(links, &spec.name).cloned();

        if spec.logical {
            if let Some(link) = &existing {
                if let Some(reason) = replace_reason(links, link, spec) {
                    info!(link = %spec.name, reason, "replacing logical link");

                    self.kernel
                        .delete_link(link.index)
                        .await
                        .context("delete link for replacement")?;

                    *links = self.kernel.list_links().await?;
                    existing = None;
                }
            }

            if existing.is_none() {
                let Some(request) = create_request(links, spec)? else {
                    debug!(link = %spec.name, parent = %spec.parent_name, "parent link not found, skipping");
                    return Ok(());
                };

                self.kernel
                    .create_link(request)
                    .await
                    .context("create link")?;

                info!(link = %spec.name, kind = %spec.kind, "created new link");

                *links = self.kernel.list_links().await?;
                existing = find_link(links, &spec.name).cloned();
            }
        }

        // physical links which have not appeared yet
        let Some(mut existing) = existing else {
            debug!(link = %spec.name, "link not found, skipping");
            return Ok(());
        };

        if spec.logical && spec.kind == KIND_BOND {
            self.sync_bond(links, &mut existing, spec).await?;
        }

        if spec.logical && spec.kind == KIND_WIREGUARD {
            self.sync_wireguard(rt, spec).await?;
        }

        if existing.is_up() != spec.up {
            self.kernel
                .set_link_up(existing.index, spec.up)
                .await
                .context("set link up/down")?;

            debug!(link = %spec.name, up = spec.up, "brought link up/down");
        }

        if spec.mtu != 0 && existing.mtu != spec.mtu {
            self.kernel
                .set_link_mtu(existing.index, spec.mtu)
                .await
                .context("set link mtu")?;

            info!(link = %spec.name, mtu = spec.mtu, "changed MTU for the link");
        }

        let master = &spec.bond_slave.master_name;
        let master_index = find_link(links, master).map(|l| l.index).unwrap_or(0);

        if existing.master_index != master_index {
            self.kernel
                .set_link_up(existing.index, false)
                .await
                .context("bring link down before enslaving")?;

            self.kernel
                .set_link_master(existing.index, master_index)
                .await
                .context("set link master")?;

            info!(link = %spec.name, master = %master, "enslaved/unslaved link");
        }

        Ok(())
    }

    async fn sync_bond(
        &self,
        links: &mut Vec<KernelLink>,
        existing: &mut KernelLink,
        spec: &LinkSpec,
    ) -> Result<()> {
        let current = existing
            .info
            .as_ref()
            .and_then(|info| info.data.bond())
            .cloned()
            .unwrap_or_default();
        let desired = normalize_bond(&spec.bond_master);

        if current == desired {
            return Ok(());
        }

        debug!(link = %spec.name, old = ?current, new = ?desired, "updating bond settings");

        if existing.is_up() {
            self.kernel
                .set_link_up(existing.index, false)
                .await
                .context("bring bond down")?;
            existing.flags.remove(LinkFlags::UP);
        }

        for slave in links.iter().filter(|l| l.master_index == existing.index) {
            self.kernel
                .set_link_master(slave.index, 0)
                .await
                .context("release bond slave")?;
        }

        self.kernel
            .set_link_data(existing.index, LinkData::Bond(desired.clone()))
            .await
            .context("update bond settings")?;

        *links = self.kernel.list_links().await?;

        info!(link = %spec.name, mode = %desired.mode, "updated bond settings");

        Ok(())
    }

    async fn sync_wireguard(&self, rt: &mut ControllerRuntime, spec: &LinkSpec) -> Result<()> {
        let device = self
            .kernel
            .wireguard_device(&spec.name)
            .await
            .context("read wireguard device")?;

        let existing = device.to_spec(false);
        let mut desired = spec.wireguard.clone();
        desired.sort();

        let patch = diff(&existing, &desired)?;
        if patch.is_empty() {
            return Ok(());
        }

        self.kernel
            .configure_wireguard(&spec.name, patch)
            .await
            .context("configure wireguard device")?;

        info!(link = %spec.name, peers = desired.peers.len(), "reconfigured wireguard link");

        // wireguard changes produce no link notifications
        rt.modify::<LinkRefresh, _>(Namespace::Network, &spec.name, |refresh| {
            refresh.bump();
            Ok(())
        })
    }
}

/// Why an existing logical link has to be re-created, if it has to
fn replace_reason(links: &[KernelLink], link: &KernelLink, spec: &LinkSpec) -> Option<&'static str> {
    if link.kind() != spec.kind || link.link_type != spec.link_type {
        return Some("kind or type changed");
    }

    if spec.kind == KIND_VLAN {
        let vlan = link.info.as_ref().and_then(|i| i.data.vlan());
        let parent_index = find_link(links, &spec.parent_name).map(|l| l.index);

        if vlan != Some(&spec.vlan) || parent_index != Some(link.parent_index) {
            return Some("vlan settings changed");
        }
    }

    None
}

/// Kernel request for a new logical link; `None` while the parent is missing
fn create_request(links: &[KernelLink], spec: &LinkSpec) -> Result<Option<LinkRequest>> {
    let mut request = LinkRequest {
        name: spec.name.clone(),
        kind: spec.kind.clone(),
        link_type: spec.link_type,
        mtu: spec.mtu,
        ..Default::default()
    };

    match spec.kind.as_str() {
        KIND_VLAN => {
            let Some(parent) = find_link(links, &spec.parent_name) else {
                return Ok(None);
            };

            request.parent_index = parent.index;
            request.data = LinkData::Vlan(spec.vlan.clone());
        }
        KIND_BOND => {
            request.data = LinkData::Bond(normalize_bond(&spec.bond_master));
        }
        "" => {
            return Err(Error::Configuration(format!(
                "logical link {} has no kind",
                spec.name
            )))
        }
        _ => {}
    }

    Ok(Some(request))
}

#[async_trait]
impl Controller for LinkSpecController {
    fn name(&self) -> String {
        "LinkSpecController".to_string()
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::strong(Namespace::Network, Kind::LinkSpec)]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive(Kind::LinkRefresh)]
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
    use crate::adapters::{LinkBackend, WireguardBackend};
    use crate::controllers::testutil;
    use crate::resources::{
        BondMasterSpec, BondMode, BondSlave, ConfigLayer, LinkType, VlanSpec, WireguardPeer,
        WireguardSpec,
    };
    use crate::runtime::State;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    const OWNER: &str = "LinkMergeController";

    fn put(state: &State, spec: LinkSpec) {
        let name = spec.name.clone();
        if state.get::<LinkSpec>(Namespace::Network, &name).is_some() {
            state
                .modify::<LinkSpec, _>(OWNER, Namespace::Network, &name, |s| {
                    *s = spec;
                    Ok(())
                })
                .unwrap();
        } else {
            state.create(OWNER, Namespace::Network, &name, spec).unwrap();
        }
    }

    async fn link(kernel: &dyn LinkBackend, name: &str) -> Option<KernelLink> {
        kernel
            .list_links()
            .await
            .unwrap()
            .into_iter()
            .find(|l| l.name == name)
    }

    fn vlan(vid: u16) -> LinkSpec {
        LinkSpec {
            name: "eth0.25".into(),
            logical: true,
            up: true,
            kind: KIND_VLAN.into(),
            parent_name: "eth0".into(),
            vlan: VlanSpec {
                vid,
                ..Default::default()
            },
            config_layer: ConfigLayer::Configuration,
            ..Default::default()
        }
    }

    #[test]
    fn test_bond_slaves_sorted_after_master() {
        let slave = |name: &str, index| LinkSpec {
            name: name.into(),
            bond_slave: BondSlave {
                master_name: "bond0".into(),
                slave_index: index,
            },
            ..Default::default()
        };

        let mut specs = vec![
            slave("eth1", 1),
            LinkSpec::up("dummy0", ConfigLayer::Default),
            slave("eth0", 0),
            LinkSpec::up("bond0", ConfigLayer::Default),
            LinkSpec::up("abc", ConfigLayer::Default),
        ];
        specs.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));

        let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["abc", "bond0", "eth0", "eth1", "dummy0"]);
    }

    #[tokio::test]
    async fn test_physical_link_up_and_mtu() {
        let kernel = testutil::kernel();
        let controller = LinkSpecController::new(kernel.clone());
        let (state, mut rt) = testutil::runtime(&controller);

        put(
            &state,
            LinkSpec {
                mtu: 9000,
                ..LinkSpec::up("eth0", ConfigLayer::Configuration)
            },
        );
        put(&state, LinkSpec::up("eth5", ConfigLayer::Default));

        controller.reconcile(&mut rt).await.unwrap();

        let eth0 = link(kernel.as_ref(), "eth0").await.unwrap();
        assert!(eth0.is_up());
        assert_eq!(eth0.mtu, 9000);

        // physical links are never created
        assert!(link(kernel.as_ref(), "eth5").await.is_none());

        let writes = kernel.writes();
        controller.reconcile(&mut rt).await.unwrap();
        assert_eq!(kernel.writes(), writes);
    }

    #[tokio::test]
    async fn test_vlan_created_and_replaced() {
        let kernel = testutil::kernel();
        let controller = LinkSpecController::new(kernel.clone());
        let (state, mut rt) = testutil::runtime(&controller);

        put(&state, vlan(25));
        controller.reconcile(&mut rt).await.unwrap();

        let created = link(kernel.as_ref(), "eth0.25").await.unwrap();
        assert_eq!(created.kind(), KIND_VLAN);
        assert_eq!(created.parent_index, 2);
        assert!(created.is_up());

        put(&state, vlan(26));
        controller.reconcile(&mut rt).await.unwrap();

        let replaced = link(kernel.as_ref(), "eth0.25").await.unwrap();
        assert_ne!(replaced.index, created.index);
        let data = &replaced.info.as_ref().unwrap().data;
        assert_eq!(data.vlan().unwrap().vid, 26);

        state
            .teardown::<LinkSpec>(OWNER, Namespace::Network, "eth0.25")
            .unwrap();
        controller.reconcile(&mut rt).await.unwrap();

        assert!(link(kernel.as_ref(), "eth0.25").await.is_none());
        let spec = state.get::<LinkSpec>(Namespace::Network, "eth0.25").unwrap();
        assert!(spec.metadata.finalizers.is_empty());
    }

    #[tokio::test]
    async fn test_vlan_waits_for_parent() {
        let kernel = testutil::kernel();
        let controller = LinkSpecController::new(kernel.clone());
        let (state, mut rt) = testutil::runtime(&controller);

        put(
            &state,
            LinkSpec {
                parent_name: "eth9".into(),
                ..vlan(25)
            },
        );
        controller.reconcile(&mut rt).await.unwrap();

        assert!(link(kernel.as_ref(), "eth0.25").await.is_none());
    }

    #[tokio::test]
    async fn test_bond_mode_change_reenslaves() {
        let kernel = testutil::kernel();
        let controller = LinkSpecController::new(kernel.clone());
        let (state, mut rt) = testutil::runtime(&controller);

        let bond = |mode| LinkSpec {
            name: "bond0".into(),
            logical: true,
            up: true,
            kind: KIND_BOND.into(),
            bond_master: BondMasterSpec {
                mode,
                miimon: 100,
                ..Default::default()
            },
            config_layer: ConfigLayer::Configuration,
            ..Default::default()
        };
        let slave = |name: &str, index| LinkSpec {
            bond_slave: BondSlave {
                master_name: "bond0".into(),
                slave_index: index,
            },
            ..LinkSpec::up(name, ConfigLayer::Configuration)
        };

        put(&state, bond(BondMode::Ieee8023ad));
        put(&state, slave("eth0", 0));
        put(&state, slave("eth1", 1));

        for _ in 0..2 {
            controller.reconcile(&mut rt).await.unwrap();
        }

        let bond0 = link(kernel.as_ref(), "bond0").await.unwrap();
        let data = &bond0.info.as_ref().unwrap().data;
        assert_eq!(data.bond().unwrap().mode, BondMode::Ieee8023ad);

        for name in ["eth0", "eth1"] {
            let slave = link(kernel.as_ref(), name).await.unwrap();
            assert_eq!(slave.master_index, bond0.index);
            assert!(slave.is_up());
        }

        put(&state, bond(BondMode::ActiveBackup));

        for _ in 0..2 {
            controller.reconcile(&mut rt).await.unwrap();
        }

        let bond0 = link(kernel.as_ref(), "bond0").await.unwrap();
        let data = &bond0.info.as_ref().unwrap().data;
        assert_eq!(data.bond().unwrap().mode, BondMode::ActiveBackup);
        assert!(bond0.is_up());

        for name in ["eth0", "eth1"] {
            let slave = link(kernel.as_ref(), name).await.unwrap();
            assert_eq!(slave.master_index, bond0.index);
            assert!(slave.is_up());
        }

        let writes = kernel.writes();
        controller.reconcile(&mut rt).await.unwrap();
        assert_eq!(kernel.writes(), writes);
    }

    #[tokio::test]
    async fn test_wireguard_configured_once() {
        let kernel = testutil::kernel();
        let controller = LinkSpecController::new(kernel.clone());
        let (state, mut rt) = testutil::runtime(&controller);

        let private_key = STANDARD.encode([1u8; 32]);
        let peer_key = STANDARD.encode([2u8; 32]);

        put(
            &state,
            LinkSpec {
                name: "wg0".into(),
                logical: true,
                up: true,
                kind: KIND_WIREGUARD.into(),
                link_type: LinkType::None,
                wireguard: WireguardSpec {
                    private_key,
                    listen_port: 51820,
                    peers: vec![WireguardPeer {
                        public_key: peer_key.clone(),
                        endpoint: "192.0.2.1:51820".into(),
                        allowed_ips: vec!["10.10.0.0/16".parse().unwrap()],
                        ..Default::default()
                    }],
                    ..Default::default()
                },
                config_layer: ConfigLayer::Configuration,
                ..Default::default()
            },
        );

        controller.reconcile(&mut rt).await.unwrap();

        let device = kernel.wireguard_device("wg0").await.unwrap();
        assert_eq!(device.listen_port, 51820);
        assert_eq!(device.peers.len(), 1);
        assert_eq!(device.peers[0].public_key, peer_key);

        let refresh = state
            .get::<LinkRefresh>(Namespace::Network, "wg0")
            .unwrap();
        assert_eq!(refresh.spec.generation, 1);
        assert!(state
            .get::<LinkRefresh>(Namespace::Network, KIND_WIREGUARD)
            .is_none());

        controller.reconcile(&mut rt).await.unwrap();

        let refresh = state
            .get::<LinkRefresh>(Namespace::Network, "wg0")
            .unwrap();
        assert_eq!(refresh.spec.generation, 1);
    }
}
