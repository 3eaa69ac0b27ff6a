//! rtnetlink routes

use super::{ip_from_bytes, ip_to_bytes, netlink_error, LinuxKernel};
use crate::adapters::kernel::{KernelEvent, KernelRoute, RouteBackend};
use crate::error::Result;
use crate::resources::nethelpers::{
    Family, RouteFlags, RouteProtocol, RouteType, RoutingTable, Scope,
};
use async_trait::async_trait;
use futures::TryStreamExt;
use ipnetwork::IpNetwork;
use netlink_packet_route::nlas::route::Nla;
use netlink_packet_route::RouteMessage;
use rtnetlink::IpVersion;
use tokio::sync::broadcast;
use tracing::debug;

/// `RTAX_MTU` inside `RTA_METRICS`
const RTAX_MTU: u16 = 2;

/// Route flags the engine tracks; link-down and offload bits are dropped
const TRACKED_FLAGS: u32 = 0x100 | 0x200 | 0x400 | 0x800;

/// MTU from a raw `RTA_METRICS` payload
pub(super) fn metrics_mtu(raw: &[u8]) -> u32 {
    let mut rest = raw;

    while rest.len() >= 4 {
        let len = u16::from_ne_bytes([rest[0], rest[1]]) as usize;
        let kind = u16::from_ne_bytes([rest[2], rest[3]]);

        if len < 4 || len > rest.len() {
            break;
        }

        if kind == RTAX_MTU && len >= 8 {
            return u32::from_ne_bytes([rest[4], rest[5], rest[6], rest[7]]);
        }

        // attributes are 4-byte aligned
        let aligned = (len + 3) & !3;
        rest = &rest[aligned.min(rest.len())..];
    }

    0
}

pub(super) fn mtu_metrics(mtu: u32) -> Vec<u8> {
    let mut raw = Vec::with_capacity(8);
    raw.extend_from_slice(&8u16.to_ne_bytes());
    raw.extend_from_slice(&RTAX_MTU.to_ne_bytes());
    raw.extend_from_slice(&mtu.to_ne_bytes());
    raw
}

pub(super) fn decode_route(message: &RouteMessage) -> Option<KernelRoute> {
    let header = &message.header;

    let mut route = KernelRoute {
        family: Family::from_value(header.address_family)?,
        table: RoutingTable(header.table as u32),
        protocol: RouteProtocol::from_value(header.protocol).unwrap_or(RouteProtocol::Unspec),
        scope: Scope::from_value(header.scope).unwrap_or_default(),
        route_type: RouteType::from_value(header.kind).unwrap_or(RouteType::Unspec),
        flags: RouteFlags(header.flags.bits() & TRACKED_FLAGS),
        ..Default::default()
    };

    let mut destination = None;

    for nla in &message.nlas {
        match nla {
            Nla::Destination(bytes) => destination = ip_from_bytes(bytes),
            Nla::PrefSource(bytes) => route.source = ip_from_bytes(bytes),
            Nla::Gateway(bytes) => route.gateway = ip_from_bytes(bytes),
            Nla::Oif(index) => route.out_index = *index,
            Nla::Priority(priority) => route.priority = *priority,
            Nla::Table(table) => route.table = RoutingTable(*table),
            Nla::Metrics(raw) => route.mtu = metrics_mtu(raw),
            _ => {}
        }
    }

    route.destination = destination
        .and_then(|ip| IpNetwork::new(ip, header.destination_prefix_length).ok());

    Some(route)
}

pub(super) fn encode_route(route: &KernelRoute) -> RouteMessage {
    let mut message = RouteMessage::default();

    message.header.address_family = route.family.value();
    message.header.protocol = route.protocol.value();
    message.header.scope = route.scope.value();
    message.header.kind = route.route_type.value();
    // ids above 255 only fit RTA_TABLE
    message.header.table = u8::try_from(route.table.0).unwrap_or(0);

    if let Some(destination) = route.destination {
        message.header.destination_prefix_length = destination.prefix();
        message
            .nlas
            .push(Nla::Destination(ip_to_bytes(destination.ip())));
    }

    if let Some(gateway) = route.gateway {
        message.nlas.push(Nla::Gateway(ip_to_bytes(gateway)));
    }

    if let Some(source) = route.source {
        message.nlas.push(Nla::PrefSource(ip_to_bytes(source)));
    }

    if route.out_index != 0 {
        message.nlas.push(Nla::Oif(route.out_index));
    }

    if route.priority != 0 {
        message.nlas.push(Nla::Priority(route.priority));
    }

    message.nlas.push(Nla::Table(route.table.0));

    if route.mtu != 0 {
        message.nlas.push(Nla::Metrics(mtu_metrics(route.mtu)));
    }

    message
}

impl LinuxKernel {
    async fn routes_of(&self, version: IpVersion, routes: &mut Vec<KernelRoute>) -> Result<()> {
        let mut stream = self.handle.route().get(version).execute();

        while let Some(message) = stream
            .try_next()
            .await
            .map_err(|e| netlink_error("list routes", e))?
        {
            routes.extend(decode_route(&message));
        }

        Ok(())
    }
}

#[async_trait]
impl RouteBackend for LinuxKernel {
    async fn list_routes(&self) -> Result<Vec<KernelRoute>> {
        let mut routes = Vec::new();

        self.routes_of(IpVersion::V4, &mut routes).await?;
        self.routes_of(IpVersion::V6, &mut routes).await?;

        Ok(routes)
    }

    async fn add_route(&self, route: KernelRoute) -> Result<()> {
        let mut add = self.handle.route().add();
        *add.message_mut() = encode_route(&route);

        add.execute()
            .await
            .map_err(|e| netlink_error("add route", e))?;

        debug!(destination = ?route.destination, gateway = ?route.gateway, "route added");
        Ok(())
    }

    async fn delete_route(&self, route: &KernelRoute) -> Result<()> {
        self.handle
            .route()
            .del(encode_route(route))
            .execute()
            .await
            .map_err(|e| netlink_error("delete route", e))
    }

    fn watch_routes(&self) -> broadcast::Receiver<KernelEvent> {
        self.watchers.routes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_route() -> KernelRoute {
        KernelRoute {
            family: Family::Inet4,
            destination: None,
            gateway: Some("10.0.0.1".parse().unwrap()),
            out_index: 2,
            table: RoutingTable::MAIN,
            priority: 1024,
            protocol: RouteProtocol::Static,
            scope: Scope::Global,
            route_type: RouteType::Unicast,
            mtu: 1400,
            ..Default::default()
        }
    }

    #[test]
    fn test_route_message_matches_route() {
        let route = default_route();
        let message = encode_route(&route);

        assert_eq!(message.header.table, 254);
        assert_eq!(message.header.destination_prefix_length, 0);
        assert!(message.nlas.contains(&Nla::Oif(2)));
        assert!(message.nlas.contains(&Nla::Priority(1024)));

        assert_eq!(decode_route(&message), Some(route));
    }

    #[test]
    fn test_large_table_id_uses_attribute() {
        let route = KernelRoute {
            family: Family::Inet6,
            destination: Some("2001:db8::/32".parse().unwrap()),
            table: RoutingTable(1000),
            ..Default::default()
        };

        let message = encode_route(&route);
        assert_eq!(message.header.table, 0);
        assert_eq!(message.header.destination_prefix_length, 32);

        let decoded = decode_route(&message).unwrap();
        assert_eq!(decoded.table, RoutingTable(1000));
        assert_eq!(decoded.destination, route.destination);
    }

    #[test]
    fn test_metrics_mtu() {
        assert_eq!(metrics_mtu(&mtu_metrics(9000)), 9000);

        // RTAX_ADVMSS before RTAX_MTU
        let mut raw = Vec::new();
        raw.extend_from_slice(&8u16.to_ne_bytes());
        raw.extend_from_slice(&8u16.to_ne_bytes());
        raw.extend_from_slice(&1460u32.to_ne_bytes());
        raw.extend(mtu_metrics(1500));
        assert_eq!(metrics_mtu(&raw), 1500);

        assert_eq!(metrics_mtu(&[1, 0]), 0);
    }
}
