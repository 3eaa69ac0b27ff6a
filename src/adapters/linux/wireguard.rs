//! wgctrl devices

use super::{io_error, LinuxKernel};
use crate::adapters::kernel::WireguardBackend;
use crate::adapters::wireguard::{PeerPatch, WireguardDevice, WireguardPatch};
use crate::error::{Error, Result};
use crate::resources::WireguardPeer;
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;
use tracing::debug;
use wireguard_control::{
    Backend, Device, DeviceUpdate, InterfaceName, Key, PeerConfig, PeerConfigBuilder,
};

fn interface(name: &str) -> Result<InterfaceName> {
    name.parse()
        .map_err(|e| Error::Configuration(format!("invalid wireguard interface {:?}: {}", name, e)))
}

fn key(encoded: &str) -> Result<Key> {
    Key::from_base64(encoded.trim())
        .map_err(|_| Error::KeyMaterial(format!("invalid wireguard key {:?}", encoded)))
}

fn endpoint(endpoint: &str) -> Result<SocketAddr> {
    endpoint
        .to_socket_addrs()
        .map_err(|e| Error::AddressParse(format!("endpoint {:?}: {}", endpoint, e)))?
        .next()
        .ok_or_else(|| Error::AddressParse(format!("endpoint {:?} did not resolve", endpoint)))
}

pub(super) fn peer_from_config(config: &PeerConfig) -> WireguardPeer {
    WireguardPeer {
        public_key: config.public_key.to_base64(),
        preshared_key: config
            .preshared_key
            .as_ref()
            .map(Key::to_base64)
            .unwrap_or_default(),
        endpoint: config.endpoint.map(|e| e.to_string()).unwrap_or_default(),
        persistent_keepalive_interval: Duration::from_secs(
            config.persistent_keepalive_interval.unwrap_or(0) as u64,
        ),
        allowed_ips: config
            .allowed_ips
            .iter()
            .filter_map(|ip| IpNetwork::new(ip.address, ip.cidr).ok())
            .collect(),
    }
}

pub(super) fn peer_builder(peer: &WireguardPeer) -> Result<PeerConfigBuilder> {
    let mut builder = PeerConfigBuilder::new(&key(&peer.public_key)?).replace_allowed_ips();

    if !peer.preshared_key.is_empty() {
        builder = builder.set_preshared_key(key(&peer.preshared_key)?);
    }

    if !peer.endpoint.is_empty() {
        builder = builder.set_endpoint(endpoint(&peer.endpoint)?);
    }

    let keepalive = peer.persistent_keepalive_interval.as_secs();
    if keepalive != 0 {
        builder = builder.set_persistent_keepalive_interval(keepalive.min(u16::MAX as u64) as u16);
    }

    for ip in &peer.allowed_ips {
        builder = builder.add_allowed_ip(ip.ip(), ip.prefix());
    }

    Ok(builder)
}

fn update_for(patch: &WireguardPatch) -> Result<DeviceUpdate> {
    let mut update = DeviceUpdate::new();

    if let Some(private_key) = &patch.private_key {
        update = update.set_private_key(key(private_key)?);
    }

    if let Some(port) = patch.listen_port {
        update = update.set_listen_port(port);
    }

    if let Some(mark) = patch.firewall_mark {
        update = update.set_fwmark(mark);
    }

    for peer in &patch.peers {
        update = match peer {
            PeerPatch::Upsert(peer) => update.add_peer(peer_builder(peer)?),
            PeerPatch::Remove(public_key) => update.remove_peer_by_key(&key(public_key)?),
        };
    }

    Ok(update)
}

fn read_device(name: &str) -> Result<WireguardDevice> {
    let device = Device::get(&interface(name)?, Backend::Kernel)
        .map_err(|e| io_error(format!("get wireguard device {}", name), e))?;

    Ok(WireguardDevice {
        private_key: device
            .private_key
            .as_ref()
            .map(Key::to_base64)
            .unwrap_or_default(),
        public_key: device
            .public_key
            .as_ref()
            .map(Key::to_base64)
            .unwrap_or_default(),
        listen_port: device.listen_port.unwrap_or(0),
        firewall_mark: device.fwmark.unwrap_or(0),
        peers: device
            .peers
            .iter()
            .map(|peer| peer_from_config(&peer.config))
            .collect(),
    })
}

fn configure_device(name: &str, patch: &WireguardPatch) -> Result<()> {
    let iface = interface(name)?;

    update_for(patch)?
        .apply(&iface, Backend::Kernel)
        .map_err(|e| io_error(format!("configure wireguard device {}", name), e))
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("wgctrl worker failed: {}", e)))?
}

#[async_trait]
impl WireguardBackend for LinuxKernel {
    async fn wireguard_device(&self, name: &str) -> Result<WireguardDevice> {
        let name = name.to_string();
        blocking(move || read_device(&name)).await
    }

    async fn configure_wireguard(&self, name: &str, patch: WireguardPatch) -> Result<()> {
        let peers = patch.peers.len();
        let owned = name.to_string();

        blocking(move || configure_device(&owned, &patch)).await?;

        debug!(link = %name, peers, "wireguard device configured");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::wireguard::public_key;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    fn encoded(fill: u8) -> String {
        STANDARD.encode([fill; 32])
    }

    #[test]
    fn test_peer_builder_accepts_peer() {
        let peer = WireguardPeer {
            public_key: public_key(&encoded(7)).unwrap(),
            preshared_key: encoded(9),
            endpoint: "192.0.2.1:51820".into(),
            persistent_keepalive_interval: Duration::from_secs(25),
            allowed_ips: vec!["10.1.0.0/16".parse().unwrap()],
        };

        assert!(peer_builder(&peer).is_ok());
        assert_eq!(endpoint(&peer.endpoint).unwrap().port(), 51820);
    }

    #[test]
    fn test_bad_key_is_key_material_error() {
        let patch = WireguardPatch {
            peers: vec![PeerPatch::Remove("not a key".into())],
            ..Default::default()
        };

        assert!(matches!(update_for(&patch), Err(Error::KeyMaterial(_))));
    }

    #[test]
    fn test_interface_name_rejected() {
        assert!(matches!(
            interface("this-name-is-far-too-long"),
            Err(Error::Configuration(_))
        ));
        assert!(interface("wg0").is_ok());
    }
}
