//! Link Alias Config Controller
//!
//! Resolves machine-configured alias selectors against physical links. An
//! alias applies only when its selector matches exactly one link; a link
//! keeps the first alias that claims it.

use super::device_config::selector_matches;
use super::{machine_config, pass_done};
use crate::error::Result;
use crate::machine::LinkAliasConfig;
use crate::resources::{Kind, LinkAliasSpec, LinkStatus, Namespace};
use crate::runtime::{Controller, ControllerRuntime, Input, Output, Resource};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::warn;

/// Publishes `LinkAliasSpec` per aliased link
#[derive(Debug, Default)]
pub struct LinkAliasConfigController;

fn matching_links<'a>(
    alias: &LinkAliasConfig,
    links: &'a [Resource<LinkStatus>],
) -> Result<Vec<&'a str>> {
    let mut matched = Vec::new();

    for link in links.iter().filter(|l| l.spec.physical()) {
        if selector_matches(&alias.selector, &link.spec)? {
            matched.push(link.id());
        }
    }

    Ok(matched)
}

impl LinkAliasConfigController {
    pub fn new() -> Self {
        Self
    }

    pub(crate) fn reconcile(&self, rt: &mut ControllerRuntime) -> Result<()> {
        rt.start_tracking_outputs();

        let links = rt.list::<LinkStatus>(Namespace::Network);
        let mut aliases: BTreeMap<String, String> = BTreeMap::new();

        if let Some(config) = machine_config(rt) {
            for alias in &config.network().link_aliases {
                let matched = match matching_links(alias, &links) {
                    Ok(matched) => matched,
                    Err(e) => {
                        warn!(alias = %alias.name, error = %e, "skipping link alias");
                        continue;
                    }
                };

                match matched.as_slice() {
                    [] => {}
                    [link] => {
                        if let Some(existing) = aliases.get(*link) {
                            warn!(link, alias = %alias.name, %existing, "link already aliased");
                            continue;
                        }

                        aliases.insert(link.to_string(), alias.name.clone());
                    }
                    many => {
                        warn!(alias = %alias.name, links = ?many, "link alias selector matches several links");
                    }
                }
            }
        }

        for (link, alias) in aliases {
            rt.modify::<LinkAliasSpec, _>(Namespace::Network, &link, |spec| {
                spec.alias = alias;
                Ok(())
            })?;
        }

        rt.cleanup_outputs::<LinkAliasSpec>(Namespace::Network)
    }
}

#[async_trait]
impl Controller for LinkAliasConfigController {
    fn name(&self) -> String {
        "LinkAliasConfigController".to_string()
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak(Namespace::Machine, Kind::MachineConfig),
            Input::weak(Namespace::Network, Kind::LinkStatus),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive(Kind::LinkAliasSpec)]
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
    use crate::resources::LinkType;

    #[test]
    fn test_single_match_only() {
        let controller = LinkAliasConfigController::new();
        let (state, mut rt) = testutil::runtime(&controller);

        for (name, mac, driver) in [
            ("eth0", "00:11:22:33:44:55", "virtio_net"),
            ("eth1", "00:11:22:33:44:66", "e1000"),
            ("eth2", "00:11:22:33:44:77", "e1000"),
        ] {
            state
                .create(
                    "LinkStatusController",
                    Namespace::Network,
                    name,
                    LinkStatus {
                        link_type: LinkType::Ether,
                        hardware_addr: mac.parse().unwrap(),
                        driver: driver.into(),
                        ..Default::default()
                    },
                )
                .unwrap();
        }

        state
            .create(
                "test",
                Namespace::Machine,
                MACHINE_CONFIG_ID,
                MachineConfig::from_yaml(
                    r#"
machine:
  network:
    linkAliases:
      - name: uplink
        selector:
          driver: virtio*
      - name: storage
        selector:
          driver: e1000
"#,
                )
                .unwrap(),
            )
            .unwrap();

        controller.reconcile(&mut rt).unwrap();

        let specs = state.list::<LinkAliasSpec>(Namespace::Network);
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].metadata.id, "eth0");
        assert_eq!(specs[0].spec.alias, "uplink");
    }
}
