//! Wireguard Device State
//!
//! Observed device state and the minimal configuration patch moving a
//! device to a desired [`WireguardSpec`].

use crate::error::{Error, Result};
use crate::resources::{WireguardPeer, WireguardSpec};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::cmp::Ordering;
use x25519_dalek::{PublicKey, StaticSecret};

/// Length of curve25519 keys
pub const KEY_LEN: usize = 32;

/// Device state as reported by wgctrl
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WireguardDevice {
    pub private_key: String,
    pub public_key: String,
    pub listen_port: u16,
    pub firewall_mark: u32,
    pub peers: Vec<WireguardPeer>,
}

impl WireguardDevice {
    /// Spec view of the device; statuses expose the public key only
    pub fn to_spec(&self, is_status: bool) -> WireguardSpec {
        let mut spec = WireguardSpec {
            listen_port: self.listen_port,
            firewall_mark: self.firewall_mark,
            peers: self.peers.clone(),
            ..Default::default()
        };

        if is_status {
            spec.public_key = self.public_key.clone();
        } else {
            spec.private_key = self.private_key.clone();
        }

        spec.sort();
        spec
    }
}

/// Peer change inside a [`WireguardPatch`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerPatch {
    /// Add the peer or replace it, allowed IPs included
    Upsert(WireguardPeer),
    /// Remove the peer with this public key
    Remove(String),
}

/// Minimal device reconfiguration
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WireguardPatch {
    pub private_key: Option<String>,
    pub listen_port: Option<u16>,
    pub firewall_mark: Option<u32>,
    pub peers: Vec<PeerPatch>,
}

impl WireguardPatch {
    pub fn is_empty(&self) -> bool {
        *self == WireguardPatch::default()
    }
}

/// Decode a base64 curve25519 key
pub fn parse_key(key: &str) -> Result<[u8; KEY_LEN]> {
    let bytes = STANDARD
        .decode(key.trim())
        .map_err(|e| Error::KeyMaterial(format!("invalid wireguard key: {}", e)))?;

    bytes
        .try_into()
        .map_err(|_| Error::KeyMaterial(format!("wireguard key must be {} bytes", KEY_LEN)))
}

/// Public key of a base64 private key
pub fn public_key(private_key: &str) -> Result<String> {
    let secret = StaticSecret::from(parse_key(private_key)?);

    Ok(STANDARD.encode(PublicKey::from(&secret).as_bytes()))
}

/// Compute the patch moving `existing` to `desired`
///
/// Both specs must be sorted. A desired listen port of 0 leaves the port
/// alone.
pub fn diff(existing: &WireguardSpec, desired: &WireguardSpec) -> Result<WireguardPatch> {
    let mut patch = WireguardPatch::default();

    if existing.private_key != desired.private_key {
        parse_key(&desired.private_key)?;
        patch.private_key = Some(desired.private_key.clone());
    }

    if desired.listen_port != 0 && existing.listen_port != desired.listen_port {
        patch.listen_port = Some(desired.listen_port);
    }

    if existing.firewall_mark != desired.firewall_mark {
        patch.firewall_mark = Some(desired.firewall_mark);
    }

    let upsert = |peer: &WireguardPeer| -> Result<PeerPatch> {
        parse_key(&peer.public_key)?;

        if !peer.preshared_key.is_empty() {
            parse_key(&peer.preshared_key)?;
        }

        Ok(PeerPatch::Upsert(peer.clone()))
    };

    let (mut l, mut r) = (0, 0);

    while l < existing.peers.len() || r < desired.peers.len() {
        let left = existing.peers.get(l);
        let right = desired.peers.get(r);

        match (left, right) {
            (None, Some(right)) => {
                patch.peers.push(upsert(right)?);
                r += 1;
            }
            (Some(left), None) => {
                patch.peers.push(PeerPatch::Remove(left.public_key.clone()));
                l += 1;
            }
            (Some(left), Some(right)) => match left.public_key.cmp(&right.public_key) {
                Ordering::Greater => {
                    patch.peers.push(upsert(right)?);
                    r += 1;
                }
                Ordering::Less => {
                    patch.peers.push(PeerPatch::Remove(left.public_key.clone()));
                    l += 1;
                }
                Ordering::Equal => {
                    if left != right {
                        patch.peers.push(upsert(right)?);
                    }

                    l += 1;
                    r += 1;
                }
            },
            (None, None) => break,
        }
    }

    Ok(patch)
}

/// Apply a patch to device state; used by the simulated kernel
pub fn apply_patch(device: &mut WireguardDevice, patch: &WireguardPatch) {
    if let Some(key) = &patch.private_key {
        device.private_key = key.clone();
    }

    if let Some(port) = patch.listen_port {
        device.listen_port = port;
    }

    if let Some(mark) = patch.firewall_mark {
        device.firewall_mark = mark;
    }

    for peer in &patch.peers {
        match peer {
            PeerPatch::Upsert(peer) => {
                match device
                    .peers
                    .iter_mut()
                    .find(|p| p.public_key == peer.public_key)
                {
                    Some(existing) => *existing = peer.clone(),
                    None => device.peers.push(peer.clone()),
                }
            }
            PeerPatch::Remove(key) => device.peers.retain(|p| &p.public_key != key),
        }
    }

    device.peers.sort_by(|a, b| a.public_key.cmp(&b.public_key));
}
