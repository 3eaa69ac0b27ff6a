//! Device Config Controller
//!
//! Splits the machine configuration into one `DeviceConfigSpec` per
//! interface. Devices addressed by a selector are expanded against the
//! observed links; bond selectors are resolved into the bond's interface
//! list. Downstream config controllers only ever see concrete link names.

use super::{machine_config, pass_done};
use crate::error::{Error, Result};
use crate::machine::{Device, DeviceSelector};
use crate::resources::{device_config_id, DeviceConfigSpec, Kind, LinkStatus, Namespace};
use crate::runtime::{Controller, ControllerRuntime, Input, Output, Resource};
use async_trait::async_trait;
use glob::Pattern;
use tracing::{debug, warn};

// =============================================================================
// Selectors
// =============================================================================

fn glob_matches(field: &str, pattern: &str, value: &str) -> Result<bool> {
    if pattern.is_empty() {
        return Ok(true);
    }

    let pattern = Pattern::new(pattern)
        .map_err(|e| Error::Selector(format!("{} pattern {:?}: {}", field, pattern, e)))?;

    Ok(pattern.matches(value))
}

/// Every set field of the selector matches the link
pub(crate) fn selector_matches(selector: &DeviceSelector, link: &LinkStatus) -> Result<bool> {
    if *selector == DeviceSelector::default() {
        return Err(Error::Selector("empty device selector".to_string()));
    }

    if let Some(physical) = selector.physical {
        if link.physical() != physical {
            return Ok(false);
        }
    }

    Ok(glob_matches(
        "hardwareAddr",
        &selector.hardware_addr,
        &link.hardware_addr.to_string(),
    )? && glob_matches(
        "permanentAddr",
        &selector.permanent_addr,
        &link.permanent_addr.to_string(),
    )? && glob_matches("pciID", &selector.pci_id, &link.pci_id)?
        && glob_matches("driver", &selector.kernel_driver, &link.driver)?
        && glob_matches("busPath", &selector.bus_path, &link.bus_path)?)
}

/// Names of links matched by any of the selectors, excluding `exclude`
fn bond_interfaces(
    selectors: &[DeviceSelector],
    links: &[Resource<LinkStatus>],
    exclude: &str,
) -> Result<Vec<String>> {
    let mut interfaces = Vec::new();

    for link in links {
        if link.id() == exclude {
            continue;
        }

        for selector in selectors {
            if selector_matches(selector, &link.spec)? {
                interfaces.push(link.id().to_string());
                break;
            }
        }
    }

    Ok(interfaces)
}

/// Resolve bond selectors into concrete interfaces in place
fn resolve_bond(device: &mut Device, links: &[Resource<LinkStatus>]) -> Result<()> {
    let interface = device.interface.clone();

    if let Some(bond) = device.bond.as_mut() {
        if !bond.device_selectors.is_empty() {
            if !bond.interfaces.is_empty() {
                return Err(Error::Selector(
                    "bond interfaces and device selectors are mutually exclusive".to_string(),
                ));
            }

            bond.interfaces = bond_interfaces(&bond.device_selectors, links, &interface)?;
        }
    }

    Ok(())
}

/// Per-interface expansions of a single configured device
pub(crate) fn expand_device(
    device_index: usize,
    device: &Device,
    links: &[Resource<LinkStatus>],
) -> Result<Vec<(String, Device)>> {
    let mut expanded = Vec::new();

    match &device.device_selector {
        None => {
            let mut device = device.clone();
            resolve_bond(&mut device, links)?;

            expanded.push((device_config_id(&device.interface, device_index, None), device));
        }
        Some(selector) => {
            let mut match_index = 0;

            for link in links {
                if !selector_matches(selector, &link.spec)? {
                    continue;
                }

                let mut device = device.clone();
                device.interface = link.id().to_string();
                device.device_selector = None;
                resolve_bond(&mut device, links)?;

                expanded.push((
                    device_config_id(&device.interface, device_index, Some(match_index)),
                    device,
                ));
                match_index += 1;
            }
        }
    }

    Ok(expanded)
}

// =============================================================================
// Controller
// =============================================================================

/// Publishes `DeviceConfigSpec` per configured interface
#[derive(Debug, Default)]
pub struct DeviceConfigController;

impl DeviceConfigController {
    pub fn new() -> Self {
        Self
    }

    pub(crate) fn reconcile(&self, rt: &mut ControllerRuntime) -> Result<()> {
        rt.start_tracking_outputs();

        if let Some(config) = machine_config(rt) {
            let links = rt.list::<LinkStatus>(Namespace::Network);

            for (index, device) in config.devices().iter().enumerate() {
                let expanded = match expand_device(index, device, &links) {
                    Ok(expanded) => expanded,
                    Err(e) => {
                        warn!(interface = %device.interface, error = %e, "skipping device configuration");
                        continue;
                    }
                };

                if expanded.is_empty() {
                    debug!(device = index, "device selector matched no links");
                }

                for (id, device) in expanded {
                    rt.modify::<DeviceConfigSpec, _>(Namespace::Network, &id, |spec| {
                        spec.device = device;
                        Ok(())
                    })?;
                }
            }
        }

        rt.cleanup_outputs::<DeviceConfigSpec>(Namespace::Network)
    }
}

#[async_trait]
impl Controller for DeviceConfigController {
    fn name(&self) -> String {
        "DeviceConfigController".to_string()
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak(Namespace::Machine, Kind::MachineConfig),
            Input::weak(Namespace::Network, Kind::LinkStatus),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive(Kind::DeviceConfigSpec)]
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
    use crate::runtime::State;
    use assert_matches::assert_matches;

    fn link(state: &State, name: &str, permanent: &str) {
        state
            .create(
                "LinkStatusController",
                Namespace::Network,
                name,
                LinkStatus {
                    link_type: LinkType::Ether,
                    hardware_addr: permanent.parse().unwrap(),
                    permanent_addr: permanent.parse().unwrap(),
                    ..Default::default()
                },
            )
            .unwrap();
    }

    fn machine(state: &State, yaml: &str) {
        state
            .create(
                "test",
                Namespace::Machine,
                MACHINE_CONFIG_ID,
                MachineConfig::from_yaml(yaml).unwrap(),
            )
            .unwrap();
    }

    #[test]
    fn test_bond_selectors_exclude_bond() {
        let controller = DeviceConfigController::new();
        let (state, mut rt) = testutil::runtime(&controller);

        link(&state, "bond0", "00:11:22:33:44:55");
        link(&state, "eth3", "00:11:22:33:44:56");
        link(&state, "eth4", "01:11:22:33:44:57");
        link(&state, "eth5", "01:11:22:33:44:58");
        link(&state, "eth6", "02:11:22:33:44:59");

        machine(
            &state,
            r#"
machine:
  network:
    interfaces:
      - interface: bond0
        bond:
          mode: active-backup
          deviceSelectors:
            - permanentAddr: "00:*"
            - permanentAddr: "01:*"
"#,
        );

        controller.reconcile(&mut rt).unwrap();

        let spec = state
            .get::<DeviceConfigSpec>(Namespace::Network, "bond0/000")
            .unwrap();
        assert_eq!(
            spec.spec.device.bond.unwrap().interfaces,
            vec!["eth3", "eth4", "eth5"]
        );
    }

    #[test]
    fn test_selector_expands_per_link() {
        let controller = DeviceConfigController::new();
        let (state, mut rt) = testutil::runtime(&controller);

        link(&state, "eth0", "00:11:22:33:44:55");
        link(&state, "eth1", "00:11:22:33:44:66");
        link(&state, "eth2", "aa:11:22:33:44:77");

        machine(
            &state,
            r#"
machine:
  network:
    interfaces:
      - interface: lo
        addresses: [127.0.0.2/8]
      - deviceSelector:
          hardwareAddr: "00:11:*"
        mtu: 9000
"#,
        );

        controller.reconcile(&mut rt).unwrap();

        let ids: Vec<String> = state
            .list::<DeviceConfigSpec>(Namespace::Network)
            .into_iter()
            .map(|r| r.metadata.id)
            .collect();
        assert_eq!(ids, vec!["eth0/001/000", "eth1/001/001", "lo/000"]);

        let eth1 = state
            .get::<DeviceConfigSpec>(Namespace::Network, "eth1/001/001")
            .unwrap();
        assert_eq!(eth1.spec.device.interface, "eth1");
        assert_eq!(eth1.spec.device.mtu, 9000);
    }

    #[test]
    fn test_removed_config_cleaned_up() {
        let controller = DeviceConfigController::new();
        let (state, mut rt) = testutil::runtime(&controller);

        machine(
            &state,
            r#"
machine:
  network:
    interfaces:
      - interface: eth0
        dhcp: true
"#,
        );

        controller.reconcile(&mut rt).unwrap();
        assert!(state
            .get::<DeviceConfigSpec>(Namespace::Network, "eth0/000")
            .is_some());

        state
            .destroy::<MachineConfig>("test", Namespace::Machine, MACHINE_CONFIG_ID)
            .unwrap();
        controller.reconcile(&mut rt).unwrap();

        assert!(state.list::<DeviceConfigSpec>(Namespace::Network).is_empty());
    }

    #[test]
    fn test_selector_errors() {
        let status = LinkStatus::default();

        assert_matches!(
            selector_matches(&DeviceSelector::default(), &status),
            Err(Error::Selector(_))
        );
        assert_matches!(
            selector_matches(
                &DeviceSelector {
                    bus_path: "[".into(),
                    ..Default::default()
                },
                &status
            ),
            Err(Error::Selector(_))
        );
        assert_matches!(
            selector_matches(
                &DeviceSelector {
                    physical: Some(false),
                    ..Default::default()
                },
                &LinkStatus {
                    kind: "bond".into(),
                    ..Default::default()
                }
            ),
            Ok(true)
        );
    }
}
