//! rtnetlink addresses

use super::{ip_from_bytes, netlink_error, LinuxKernel};
use crate::adapters::kernel::{AddressBackend, KernelAddress, KernelEvent};
use crate::error::{Error, Result};
use crate::resources::nethelpers::{AddressFlags, Family, Scope};
use async_trait::async_trait;
use futures::TryStreamExt;
use ipnetwork::IpNetwork;
use netlink_packet_route::nlas::address::Nla;
use netlink_packet_route::AddressMessage;
use tokio::sync::broadcast;
use tracing::debug;

/// Decode RTM_NEWADDR; `IFA_LOCAL` wins over the peer in `IFA_ADDRESS`
pub(super) fn decode_address(message: &AddressMessage) -> Option<KernelAddress> {
    let header = &message.header;
    let family = Family::from_value(header.family)?;

    let mut address = None;
    let mut local = None;
    let mut broadcast = None;
    let mut anycast = None;
    let mut multicast = None;
    let mut flags = header.flags as u32;

    for nla in &message.nlas {
        match nla {
            Nla::Address(bytes) => address = ip_from_bytes(bytes),
            Nla::Local(bytes) => local = ip_from_bytes(bytes),
            Nla::Broadcast(bytes) => broadcast = ip_from_bytes(bytes),
            Nla::Anycast(bytes) => anycast = ip_from_bytes(bytes),
            Nla::Multicast(bytes) => multicast = ip_from_bytes(bytes),
            Nla::Flags(value) => flags = *value,
            _ => {}
        }
    }

    let ip = local.or(address)?;
    let prefix = IpNetwork::new(ip, header.prefix_len).ok()?;

    Some(KernelAddress {
        index: header.index,
        family,
        prefix,
        local: Some(ip),
        broadcast,
        anycast,
        multicast,
        scope: Scope::from_value(header.scope).unwrap_or_default(),
        flags: AddressFlags(flags),
    })
}

impl LinuxKernel {
    async fn address_messages(&self) -> Result<Vec<AddressMessage>> {
        let mut stream = self.handle.address().get().execute();
        let mut messages = Vec::new();

        while let Some(message) = stream
            .try_next()
            .await
            .map_err(|e| netlink_error("list addresses", e))?
        {
            messages.push(message);
        }

        Ok(messages)
    }
}

#[async_trait]
impl AddressBackend for LinuxKernel {
    async fn list_addresses(&self) -> Result<Vec<KernelAddress>> {
        Ok(self
            .address_messages()
            .await?
            .iter()
            .filter_map(decode_address)
            .collect())
    }

    async fn add_address(&self, address: KernelAddress) -> Result<()> {
        let op = format!("add address {} to {}", address.prefix, address.index);

        let mut add = self.handle.address().add(
            address.index,
            address.prefix.ip(),
            address.prefix.prefix(),
        );

        let message = add.message_mut();
        message.header.scope = address.scope.value();
        // the header holds the low 8 bits, IFA_FLAGS the full set
        message.header.flags = (address.flags.0 & 0xff) as u8;
        message.nlas.push(Nla::Flags(address.flags.0));

        add.execute().await.map_err(|e| netlink_error(&op, e))?;

        debug!(address = %address.prefix, index = address.index, "address added");
        Ok(())
    }

    async fn delete_address(&self, index: u32, prefix: IpNetwork) -> Result<()> {
        let op = format!("delete address {} from {}", prefix, index);

        let message = self
            .address_messages()
            .await?
            .into_iter()
            .find(|m| {
                decode_address(m).map_or(false, |a| a.index == index && a.prefix == prefix)
            })
            .ok_or_else(|| Error::KernelNotFound { op: op.clone() })?;

        self.handle
            .address()
            .del(message)
            .execute()
            .await
            .map_err(|e| netlink_error(&op, e))
    }

    fn watch_addresses(&self) -> broadcast::Receiver<KernelEvent> {
        self.watchers.addresses.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(family: u8, prefix_len: u8, nlas: Vec<Nla>) -> AddressMessage {
        let mut message = AddressMessage::default();
        message.header.family = family;
        message.header.prefix_len = prefix_len;
        message.header.index = 2;
        message.header.scope = 253;
        message.header.flags = 0x80;
        message.nlas = nlas;
        message
    }

    #[test]
    fn test_decode_ipv4_address() {
        let decoded = decode_address(&message(
            2,
            24,
            vec![
                Nla::Address(vec![10, 5, 0, 7]),
                Nla::Local(vec![10, 5, 0, 7]),
                Nla::Broadcast(vec![10, 5, 0, 255]),
            ],
        ))
        .unwrap();

        assert_eq!(decoded.index, 2);
        assert_eq!(decoded.family, Family::Inet4);
        assert_eq!(decoded.prefix, "10.5.0.7/24".parse::<IpNetwork>().unwrap());
        assert_eq!(decoded.broadcast, Some("10.5.0.255".parse().unwrap()));
        assert_eq!(decoded.scope, Scope::Link);
        assert!(decoded.flags.contains(AddressFlags::PERMANENT));
    }

    #[test]
    fn test_decode_point_to_point_prefers_local() {
        let decoded = decode_address(&message(
            2,
            32,
            vec![
                Nla::Address(vec![192, 0, 2, 1]),
                Nla::Local(vec![192, 0, 2, 2]),
                Nla::Flags(0x80 | 0x200),
            ],
        ))
        .unwrap();

        assert_eq!(decoded.prefix.ip(), "192.0.2.2".parse::<std::net::IpAddr>().unwrap());
        assert!(decoded.flags.contains(AddressFlags::NOPREFIXROUTE));
    }

    #[test]
    fn test_decode_ipv6_without_local() {
        let ip: std::net::Ipv6Addr = "2001:db8::5".parse().unwrap();
        let decoded =
            decode_address(&message(10, 64, vec![Nla::Address(ip.octets().to_vec())])).unwrap();

        assert_eq!(decoded.family, Family::Inet6);
        assert_eq!(decoded.prefix.to_string(), "2001:db8::5/64");
        assert_eq!(decoded.broadcast, None);
    }

    #[test]
    fn test_decode_rejects_unknown_family() {
        assert!(decode_address(&message(17, 0, Vec::new())).is_none());
        assert!(decode_address(&message(2, 24, Vec::new())).is_none());
    }
}
