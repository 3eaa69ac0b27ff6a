//! Route resources

use super::nethelpers::{
    ConfigLayer, Family, RouteFlags, RouteProtocol, RouteType, RoutingTable, Scope,
};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Default metric for routes installed from static configuration
pub const DEFAULT_ROUTE_METRIC: u32 = 1024;

/// Desired route
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouteSpec {
    pub family: Family,
    /// `None` is the default route
    pub destination: Option<IpNetwork>,
    pub source: Option<IpAddr>,
    pub gateway: Option<IpAddr>,
    pub out_link_name: String,
    pub table: RoutingTable,
    pub priority: u32,
    pub scope: Scope,
    #[serde(rename = "type")]
    pub route_type: RouteType,
    pub flags: RouteFlags,
    pub protocol: RouteProtocol,
    pub mtu: u32,
    pub config_layer: ConfigLayer,
}

impl RouteSpec {
    pub fn id(&self) -> String {
        route_id(
            self.table,
            self.family,
            self.destination.as_ref(),
            self.gateway.as_ref(),
            self.priority,
            &self.out_link_name,
        )
    }

    /// Fill in family and scope from the destination and gateway
    pub fn normalize(&mut self) {
        if let Some(dst) = self.destination {
            if dst.prefix() == 0 {
                self.destination = None;
            }
        }

        if self.family == Family::Unspec {
            self.family = self
                .gateway
                .as_ref()
                .map(Family::of)
                .or_else(|| self.destination.map(|d| Family::of(&d.ip())))
                .or_else(|| self.source.as_ref().map(Family::of))
                .unwrap_or(Family::Inet4);
        }

        if self.gateway.is_none() && self.scope == Scope::Global && self.destination.is_some() {
            self.scope = Scope::Link;
        }
    }
}

/// Observed kernel route
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouteStatus {
    pub family: Family,
    pub destination: Option<IpNetwork>,
    pub source: Option<IpAddr>,
    pub gateway: Option<IpAddr>,
    pub out_link_index: u32,
    pub out_link_name: String,
    pub table: RoutingTable,
    pub priority: u32,
    pub scope: Scope,
    #[serde(rename = "type")]
    pub route_type: RouteType,
    pub flags: RouteFlags,
    pub protocol: RouteProtocol,
    pub mtu: u32,
}

impl RouteStatus {
    pub fn is_default(&self) -> bool {
        self.destination.is_none()
    }
}

/// Route id: `{table}/{family}/{dst or ""}/{gateway or ""}/{priority}/{out-link or ""}`
pub fn route_id(
    table: RoutingTable,
    family: Family,
    destination: Option<&IpNetwork>,
    gateway: Option<&IpAddr>,
    priority: u32,
    out_link_name: &str,
) -> String {
    format!(
        "{}/{}/{}/{}/{}/{}",
        table,
        family,
        destination.map(|d| d.to_string()).unwrap_or_default(),
        gateway.map(|g| g.to_string()).unwrap_or_default(),
        priority,
        out_link_name
    )
}
