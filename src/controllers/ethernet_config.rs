//! Ethernet Config Controller
//!
//! Copies machine-configured ethtool settings into `EthernetSpec`s keyed by
//! link name. There is a single source, so no layering is involved.

use super::{machine_config, pass_done};
use crate::error::Result;
use crate::resources::{EthernetSpec, Kind, Namespace};
use crate::runtime::{Controller, ControllerRuntime, Input, Output};
use async_trait::async_trait;

/// Publishes `EthernetSpec` per configured link
#[derive(Debug, Default)]
pub struct EthernetConfigController;

impl EthernetConfigController {
    pub fn new() -> Self {
        Self
    }

    pub(crate) fn reconcile(&self, rt: &mut ControllerRuntime) -> Result<()> {
        rt.start_tracking_outputs();

        if let Some(config) = machine_config(rt) {
            for ethernet in &config.network().ethernet {
                let spec = EthernetSpec {
                    rings: ethernet.rings.clone(),
                    features: ethernet.features.clone(),
                    channels: ethernet.channels.clone(),
                    wake_on_lan: ethernet.wake_on_lan.clone(),
                };

                rt.modify::<EthernetSpec, _>(Namespace::Network, &ethernet.name, |current| {
                    *current = spec;
                    Ok(())
                })?;
            }
        }

        rt.cleanup_outputs::<EthernetSpec>(Namespace::Network)
    }
}

#[async_trait]
impl Controller for EthernetConfigController {
    fn name(&self) -> String {
        "EthernetConfigController".to_string()
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::weak(Namespace::Machine, Kind::MachineConfig)]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive(Kind::EthernetSpec)]
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

    #[test]
    fn test_ethernet_settings() {
        let controller = EthernetConfigController::new();
        let (state, mut rt) = testutil::runtime(&controller);

        state
            .create(
                "test",
                Namespace::Machine,
                MACHINE_CONFIG_ID,
                MachineConfig::from_yaml(
                    r#"
machine:
  network:
    ethernet:
      - name: eth0
        rings:
          rx: 4096
        features:
          tx-checksumming: false
"#,
                )
                .unwrap(),
            )
            .unwrap();

        controller.reconcile(&mut rt).unwrap();

        let spec = state.get::<EthernetSpec>(Namespace::Network, "eth0").unwrap();
        assert_eq!(spec.spec.rings.rx, Some(4096));
        assert_eq!(spec.spec.features.get("tx-checksumming"), Some(&false));

        state
            .destroy::<MachineConfig>("test", Namespace::Machine, MACHINE_CONFIG_ID)
            .unwrap();
        controller.reconcile(&mut rt).unwrap();

        assert!(state.list::<EthernetSpec>(Namespace::Network).is_empty());
    }
}
