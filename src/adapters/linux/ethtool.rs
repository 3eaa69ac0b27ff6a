//! ethtool generic netlink
//!
//! Rings, features and link modes are read over the ethtool family; carrier
//! comes from sysfs. The family binding has no write or channel and
//! wake-on-lan requests, so those report `KernelUnsupported` and the
//! controllers skip them.

use super::LinuxKernel;
use crate::adapters::kernel::{EthtoolBackend, EthtoolLinkState, KernelEvent};
use crate::error::{Error, Result};
use crate::resources::nethelpers::{Duplex, WolMode};
use crate::resources::{
    EthernetChannels, EthernetChannelsStatus, EthernetRings, EthernetRingsStatus,
};
use ::ethtool::{
    EthtoolAttr, EthtoolError, EthtoolFeatureAttr, EthtoolLinkModeAttr, EthtoolLinkModeDuplex,
    EthtoolRingAttr,
};
use async_trait::async_trait;
use futures::TryStreamExt;
use std::collections::BTreeMap;
use tokio::sync::broadcast;

/// Speed reported while the link is down
const SPEED_UNKNOWN: u32 = u32::MAX;

fn ethtool_error(op: &str, name: &str, err: EthtoolError) -> Error {
    let op = format!("{} {}", op, name);

    match err {
        EthtoolError::NetlinkError(message) => match message.to_io().raw_os_error() {
            Some(errno) => Error::from_errno(op, errno),
            None => Error::Kernel {
                op,
                reason: message.to_string(),
            },
        },
        other => Error::Kernel {
            op,
            reason: other.to_string(),
        },
    }
}

fn unsupported(op: &str, name: &str) -> Error {
    Error::KernelUnsupported {
        op: format!("{} {}", op, name),
    }
}

pub(super) fn apply_ring_attr(status: &mut EthernetRingsStatus, attr: &EthtoolRingAttr) {
    match attr {
        EthtoolRingAttr::RxMax(v) => status.rx_max = Some(*v),
        EthtoolRingAttr::RxMiniMax(v) => status.rx_mini_max = Some(*v),
        EthtoolRingAttr::RxJumboMax(v) => status.rx_jumbo_max = Some(*v),
        EthtoolRingAttr::TxMax(v) => status.tx_max = Some(*v),
        EthtoolRingAttr::Rx(v) => status.current.rx = Some(*v),
        EthtoolRingAttr::RxMini(v) => status.current.rx_mini = Some(*v),
        EthtoolRingAttr::RxJumbo(v) => status.current.rx_jumbo = Some(*v),
        EthtoolRingAttr::Tx(v) => status.current.tx = Some(*v),
        _ => {}
    }
}

pub(super) fn apply_link_mode_attr(state: &mut EthtoolLinkState, attr: &EthtoolLinkModeAttr) {
    match attr {
        EthtoolLinkModeAttr::Speed(speed) if *speed != SPEED_UNKNOWN => {
            state.speed_mbit = Some(*speed)
        }
        EthtoolLinkModeAttr::Duplex(duplex) => {
            state.duplex = match duplex {
                EthtoolLinkModeDuplex::Half => Duplex::Half,
                EthtoolLinkModeDuplex::Full => Duplex::Full,
                _ => Duplex::Unknown,
            }
        }
        _ => {}
    }
}

impl LinuxKernel {
    async fn carrier(&self, name: &str) -> bool {
        let path = self.sysfs.join("class/net").join(name).join("carrier");

        tokio::fs::read_to_string(path)
            .await
            .map_or(false, |raw| raw.trim() == "1")
    }
}

#[async_trait]
impl EthtoolBackend for LinuxKernel {
    async fn link_state(&self, name: &str) -> Result<EthtoolLinkState> {
        let mut state = EthtoolLinkState {
            link_up: self.carrier(name).await,
            ..Default::default()
        };

        let mut handle = self.ethtool.clone();
        let mut stream = handle.link_mode().get(Some(name)).execute().await;

        while let Some(message) = stream
            .try_next()
            .await
            .map_err(|e| ethtool_error("link modes", name, e))?
        {
            for attr in &message.payload.nlas {
                if let EthtoolAttr::LinkMode(mode) = attr {
                    apply_link_mode_attr(&mut state, mode);
                }
            }
        }

        Ok(state)
    }

    async fn rings(&self, name: &str) -> Result<EthernetRingsStatus> {
        let mut status = EthernetRingsStatus::default();

        let mut handle = self.ethtool.clone();
        let mut stream = handle.ring().get(Some(name)).execute().await;

        while let Some(message) = stream
            .try_next()
            .await
            .map_err(|e| ethtool_error("rings", name, e))?
        {
            for attr in &message.payload.nlas {
                if let EthtoolAttr::Ring(ring) = attr {
                    apply_ring_attr(&mut status, ring);
                }
            }
        }

        Ok(status)
    }

    async fn set_rings(&self, name: &str, _rings: &EthernetRings) -> Result<()> {
        Err(unsupported("set rings", name))
    }

    async fn features(&self, name: &str) -> Result<BTreeMap<String, bool>> {
        let mut features = BTreeMap::new();

        let mut handle = self.ethtool.clone();
        let mut stream = handle.feature().get(Some(name)).execute().await;

        while let Some(message) = stream
            .try_next()
            .await
            .map_err(|e| ethtool_error("features", name, e))?
        {
            for attr in &message.payload.nlas {
                if let EthtoolAttr::Feature(EthtoolFeatureAttr::Active(bits)) = attr {
                    features.extend(bits.iter().map(|bit| (bit.name.clone(), bit.value)));
                }
            }
        }

        Ok(features)
    }

    async fn set_features(&self, name: &str, _features: &BTreeMap<String, bool>) -> Result<()> {
        Err(unsupported("set features", name))
    }

    async fn channels(&self, name: &str) -> Result<EthernetChannelsStatus> {
        Err(unsupported("channels", name))
    }

    async fn set_channels(&self, name: &str, _channels: &EthernetChannels) -> Result<()> {
        Err(unsupported("set channels", name))
    }

    async fn wake_on_lan(&self, name: &str) -> Result<Vec<WolMode>> {
        Err(unsupported("wake-on-lan", name))
    }

    async fn set_wake_on_lan(&self, name: &str, _modes: &[WolMode]) -> Result<()> {
        Err(unsupported("set wake-on-lan", name))
    }

    fn watch_ethtool(&self) -> broadcast::Receiver<KernelEvent> {
        self.watchers.ethtool.subscribe()
    }
}
