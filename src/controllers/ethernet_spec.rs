//! Ethernet Spec Controller
//!
//! Applies ring sizes, offload features, channel counts and wake-on-LAN
//! modes from `EthernetSpec` (id: link name). Only the settings a spec
//! names are touched; drivers which do not support a setting are logged
//! and skipped.

use super::{collect_errors, pass_done, watch_kernel, KernelHandle};
use crate::error::{Result, ResultExt};
use crate::resources::{EthernetChannels, EthernetRings, EthernetSpec, Kind, Namespace};
use crate::runtime::{Controller, ControllerRuntime, Input, Output};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Pushes `EthernetSpec` through ethtool
pub struct EthernetSpecController {
    kernel: KernelHandle,
}

fn differs<T: PartialEq>(want: &Option<T>, have: &Option<T>) -> bool {
    want.is_some() && want != have
}

fn rings_differ(want: &EthernetRings, have: &EthernetRings) -> bool {
    differs(&want.rx, &have.rx)
        || differs(&want.rx_mini, &have.rx_mini)
        || differs(&want.rx_jumbo, &have.rx_jumbo)
        || differs(&want.tx, &have.tx)
        || differs(&want.rx_buf_len, &have.rx_buf_len)
        || differs(&want.cqe_size, &have.cqe_size)
        || differs(&want.tx_push, &have.tx_push)
        || differs(&want.rx_push, &have.rx_push)
}

fn channels_differ(want: &EthernetChannels, have: &EthernetChannels) -> bool {
    differs(&want.rx, &have.rx)
        || differs(&want.tx, &have.tx)
        || differs(&want.other, &have.other)
        || differs(&want.combined, &have.combined)
}

fn features_differ(want: &BTreeMap<String, bool>, have: &BTreeMap<String, bool>) -> bool {
    want.iter().any(|(name, on)| have.get(name) != Some(on))
}

/// Unsupported settings are not an error of the pass
fn soft<T>(link: &str, what: &str, result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_unsupported() => {
            warn!(link, "{} not supported by the driver", what);
            Ok(None)
        }
        Err(e) => Err(e.context(format!("{} of {}", what, link))),
    }
}

impl EthernetSpecController {
    pub fn new(kernel: KernelHandle) -> Self {
        Self { kernel }
    }

    pub(crate) async fn reconcile(&self, rt: &mut ControllerRuntime) -> Result<()> {
        let links = self.kernel.list_links().await?;
        let mut errors = Vec::new();

        for spec in rt.list::<EthernetSpec>(Namespace::Network) {
            let name = spec.id();

            if spec.metadata.is_tearing_down() {
                continue;
            }

            if !links.iter().any(|l| l.name == name) {
                debug!(link = %name, "link not found, skipping ethernet settings");
                continue;
            }

            if let Err(e) = self.apply(name, &spec.spec).await {
                errors.push(e);
            }
        }

        collect_errors(errors)
    }

    async fn apply(&self, link: &str, spec: &EthernetSpec) -> Result<()> {
        let kernel = &self.kernel;

        if spec.rings != EthernetRings::default() {
            if let Some(current) = soft(link, "rings", kernel.rings(link).await)? {
                if rings_differ(&spec.rings, &current.current) {
                    soft(link, "rings", kernel.set_rings(link, &spec.rings).await)?;
                    info!(link, "updated ring settings");
                }
            }
        }

        if !spec.features.is_empty() {
            if let Some(current) = soft(link, "features", kernel.features(link).await)? {
                if features_differ(&spec.features, &current) {
                    soft(link, "features", kernel.set_features(link, &spec.features).await)?;
                    info!(link, "updated offload features");
                }
            }
        }

        if spec.channels != EthernetChannels::default() {
            if let Some(current) = soft(link, "channels", kernel.channels(link).await)? {
                if channels_differ(&spec.channels, &current.current) {
                    soft(link, "channels", kernel.set_channels(link, &spec.channels).await)?;
                    info!(link, "updated channel settings");
                }
            }
        }

        if let Some(modes) = &spec.wake_on_lan {
            let current = soft(link, "wake-on-lan", kernel.wake_on_lan(link).await)?;

            if current.is_some() && current.as_ref() != Some(modes) {
                kernel
                    .set_wake_on_lan(link, modes)
                    .await
                    .context(format!("set wake-on-lan of {}", link))?;
                info!(link, modes = ?modes, "updated wake-on-lan");
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Controller for EthernetSpecController {
    fn name(&self) -> String {
        "EthernetSpecController".to_string()
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::weak(Namespace::Network, Kind::EthernetSpec)]
    }

    fn outputs(&self) -> Vec<Output> {
        Vec::new()
    }

    async fn run(&mut self, rt: &mut ControllerRuntime) -> Result<()> {
        // a link showing up needs its settings
        let _watch = watch_kernel(rt, vec![self.kernel.watch_links()]);

        while rt.event().await {
            self.reconcile(rt).await?;
            pass_done(rt);
        }

        Ok(())
    }
}
