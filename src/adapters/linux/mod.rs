//! Linux Kernel Backend
//!
//! Kernel ports on a live host. Links, addresses and routes go over
//! rtnetlink, ethtool settings over the ethtool generic netlink family,
//! wireguard devices over wgctrl and nftables through `nft` JSON batches.
//! A second rtnetlink socket joined to the link, address and route
//! multicast groups feeds the watcher channels.

mod address;
mod ethtool;
mod link;
mod nftables;
mod route;
mod wireguard;

use super::kernel::{HostBackend, KernelEvent};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use netlink_packet_core::NetlinkPayload;
use netlink_packet_route::RtnlMessage;
use netlink_sys::{AsyncSocket, SocketAddr};
use rtnetlink::Handle;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use self::nftables::NftCache;

// rtnetlink multicast groups (RTMGRP_*)
const RTMGRP_LINK: u32 = 0x1;
const RTMGRP_IPV4_IFADDR: u32 = 0x10;
const RTMGRP_IPV4_ROUTE: u32 = 0x40;
const RTMGRP_IPV6_IFADDR: u32 = 0x100;
const RTMGRP_IPV6_ROUTE: u32 = 0x400;

const EVENT_BUFFER: usize = 256;

// =============================================================================
// Watchers
// =============================================================================

#[derive(Clone)]
struct Watchers {
    links: broadcast::Sender<KernelEvent>,
    addresses: broadcast::Sender<KernelEvent>,
    routes: broadcast::Sender<KernelEvent>,
    ethtool: broadcast::Sender<KernelEvent>,
}

impl Watchers {
    fn new() -> Self {
        let channel = || broadcast::channel(EVENT_BUFFER).0;

        Self {
            links: channel(),
            addresses: channel(),
            routes: channel(),
            ethtool: channel(),
        }
    }

    fn dispatch(&self, event: KernelEvent) {
        let tx = match event {
            KernelEvent::Link => {
                // carrier and speed changes arrive as RTM_NEWLINK
                let _ = self.ethtool.send(KernelEvent::Ethtool);
                &self.links
            }
            KernelEvent::Address => &self.addresses,
            KernelEvent::Route => &self.routes,
            KernelEvent::Ethtool => &self.ethtool,
        };

        let _ = tx.send(event);
    }
}

/// Watcher channel a multicast notification belongs to
fn event_for(message: &RtnlMessage) -> Option<KernelEvent> {
    match message {
        RtnlMessage::NewLink(_) | RtnlMessage::DelLink(_) => Some(KernelEvent::Link),
        RtnlMessage::NewAddress(_) | RtnlMessage::DelAddress(_) => Some(KernelEvent::Address),
        RtnlMessage::NewRoute(_) | RtnlMessage::DelRoute(_) => Some(KernelEvent::Route),
        _ => None,
    }
}

fn spawn_watcher(watchers: Watchers) -> Result<()> {
    let (mut connection, handle, mut messages) = rtnetlink::new_connection()?;

    let groups = RTMGRP_LINK
        | RTMGRP_IPV4_IFADDR
        | RTMGRP_IPV4_ROUTE
        | RTMGRP_IPV6_IFADDR
        | RTMGRP_IPV6_ROUTE;

    connection
        .socket_mut()
        .socket_mut()
        .bind(&SocketAddr::new(0, groups))?;

    tokio::spawn(connection);

    tokio::spawn(async move {
        // the connection stays up while a handle is alive
        let _handle = handle;

        while let Some((message, _)) = messages.next().await {
            if let NetlinkPayload::InnerMessage(inner) = &message.payload {
                if let Some(event) = event_for(inner) {
                    watchers.dispatch(event);
                }
            }
        }

        warn!("rtnetlink multicast socket closed, kernel watchers stopped");
    });

    Ok(())
}

// =============================================================================
// Backend
// =============================================================================

/// Kernel ports backed by the running Linux kernel
pub struct LinuxKernel {
    handle: Handle,
    ethtool: ::ethtool::EthtoolHandle,
    nft: NftCache,
    sysfs: PathBuf,
    procfs: PathBuf,
    watchers: Watchers,
}

impl LinuxKernel {
    /// Open the netlink sockets; must be called inside a tokio runtime
    pub fn new() -> Result<Self> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);

        let (connection, ethtool, _) = ::ethtool::new_connection()?;
        tokio::spawn(connection);

        let watchers = Watchers::new();
        spawn_watcher(watchers.clone())?;

        info!("connected to the kernel over netlink");

        Ok(Self {
            handle,
            ethtool,
            nft: NftCache::default(),
            sysfs: PathBuf::from("/sys"),
            procfs: PathBuf::from("/proc"),
            watchers,
        })
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Classify an rtnetlink failure by its errno
fn netlink_error(op: impl Into<String>, err: rtnetlink::Error) -> Error {
    let op = op.into();

    match err {
        rtnetlink::Error::NetlinkError(message) => match message.to_io().raw_os_error() {
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

fn io_error(op: impl Into<String>, err: std::io::Error) -> Error {
    let op = op.into();

    match err.raw_os_error() {
        Some(errno) => Error::from_errno(op, errno),
        None => Error::Kernel {
            op,
            reason: err.to_string(),
        },
    }
}

/// Address from an `IFA_*` / `RTA_*` payload
fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

fn ip_to_bytes(ip: IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

// =============================================================================
// Host Identity
// =============================================================================

#[async_trait]
impl HostBackend for LinuxKernel {
    async fn set_hostname(&self, hostname: &str) -> Result<()> {
        nix::unistd::sethostname(hostname)
            .map_err(|errno| Error::from_errno("set hostname", errno as i32))?;

        debug!(hostname, "hostname set");
        Ok(())
    }

    async fn set_domainname(&self, domainname: &str) -> Result<()> {
        let path = self.procfs.join("sys/kernel/domainname");

        tokio::fs::write(&path, domainname)
            .await
            .map_err(|e| io_error("set domainname", e))?;

        debug!(domainname, "domainname set");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netlink_packet_route::{AddressMessage, LinkMessage, RouteMessage};

    #[test]
    fn test_event_classification() {
        assert_eq!(
            event_for(&RtnlMessage::NewLink(LinkMessage::default())),
            Some(KernelEvent::Link)
        );
        assert_eq!(
            event_for(&RtnlMessage::DelAddress(AddressMessage::default())),
            Some(KernelEvent::Address)
        );
        assert_eq!(
            event_for(&RtnlMessage::NewRoute(RouteMessage::default())),
            Some(KernelEvent::Route)
        );
    }

    #[test]
    fn test_link_event_wakes_ethtool_watchers() {
        let watchers = Watchers::new();
        let mut links = watchers.links.subscribe();
        let mut ethtool = watchers.ethtool.subscribe();
        let mut routes = watchers.routes.subscribe();

        watchers.dispatch(KernelEvent::Link);

        assert_eq!(links.try_recv().unwrap(), KernelEvent::Link);
        assert_eq!(ethtool.try_recv().unwrap(), KernelEvent::Ethtool);
        assert!(routes.try_recv().is_err());
    }

    #[test]
    fn test_ip_bytes() {
        let v4: IpAddr = "10.0.0.35".parse().unwrap();
        let v6: IpAddr = "2001:db8::1".parse().unwrap();

        assert_eq!(ip_from_bytes(&ip_to_bytes(v4)), Some(v4));
        assert_eq!(ip_from_bytes(&ip_to_bytes(v6)), Some(v6));
        assert_eq!(ip_from_bytes(&[1, 2, 3]), None);
    }
}
