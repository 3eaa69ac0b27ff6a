//! Network Resources
//!
//! Typed resource specs held by the state store. Every resource is addressed
//! by `(namespace, kind, id)`; the store keeps the specs behind the [`Spec`]
//! sum type and hands out typed views through [`ResourceSpec`].

pub mod address;
pub mod device_config;
pub mod dns;
pub mod etcfile;
pub mod ethernet;
pub mod hostname;
pub mod link;
pub mod nethelpers;
pub mod nftables;
pub mod node_address;
pub mod operator;
pub mod platform;
pub mod probe;
pub mod resolver;
pub mod route;
pub mod status;
pub mod timeserver;

pub use address::*;
pub use device_config::*;
pub use dns::*;
pub use etcfile::*;
pub use ethernet::*;
pub use hostname::*;
pub use link::*;
pub use nethelpers::*;
pub use nftables::*;
pub use node_address::*;
pub use operator::*;
pub use platform::*;
pub use probe::*;
pub use resolver::*;
pub use route::*;
pub use status::*;
pub use timeserver::*;

pub use crate::machine::MachineConfig;

use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Namespaces
// =============================================================================

/// Store namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    /// Final merged specs and observed statuses
    Network,
    /// Per-source layered specs awaiting merge
    Config,
    /// Machine configuration documents
    Machine,
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Namespace::Network => write!(f, "network"),
            Namespace::Config => write!(f, "config"),
            Namespace::Machine => write!(f, "machine"),
        }
    }
}

// =============================================================================
// Kinds
// =============================================================================

/// Typed view over the [`Spec`] sum type
pub trait ResourceSpec:
    Clone + PartialEq + fmt::Debug + Default + Send + Sync + 'static
{
    const KIND: Kind;

    fn into_spec(self) -> Spec;

    fn from_spec(spec: &Spec) -> Option<&Self>;

    fn from_spec_mut(spec: &mut Spec) -> Option<&mut Self>;
}

/// Specs produced per configuration source and merged later
pub trait Layered {
    fn layer(&self) -> ConfigLayer;
}

macro_rules! resource_kinds {
    ($($kind:ident),+ $(,)?) => {
        /// Resource kind discriminant
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum Kind {
            $($kind),+
        }

        impl Kind {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Kind::$kind => stringify!($kind)),+
                }
            }
        }

        /// Any resource body
        #[derive(Debug, Clone, PartialEq)]
        pub enum Spec {
            $($kind($kind)),+
        }

        impl Spec {
            pub fn kind(&self) -> Kind {
                match self {
                    $(Spec::$kind(_) => Kind::$kind),+
                }
            }
        }

        $(
            impl ResourceSpec for $kind {
                const KIND: Kind = Kind::$kind;

                fn into_spec(self) -> Spec {
                    Spec::$kind(self)
                }

                fn from_spec(spec: &Spec) -> Option<&Self> {
                    match spec {
                        Spec::$kind(inner) => Some(inner),
                        #[allow(unreachable_patterns)]
                        _ => None,
                    }
                }

                fn from_spec_mut(spec: &mut Spec) -> Option<&mut Self> {
                    match spec {
                        Spec::$kind(inner) => Some(inner),
                        #[allow(unreachable_patterns)]
                        _ => None,
                    }
                }
            }
        )+
    };
}

resource_kinds!(
    AddressSpec,
    AddressStatus,
    LinkSpec,
    LinkStatus,
    LinkRefresh,
    LinkAliasSpec,
    LinkAliasStatus,
    RouteSpec,
    RouteStatus,
    HostnameSpec,
    HostnameStatus,
    ResolverSpec,
    ResolverStatus,
    TimeServerSpec,
    TimeServerStatus,
    NodeAddress,
    NodeAddressFilter,
    OperatorSpec,
    DeviceConfigSpec,
    NfTablesChain,
    ProbeSpec,
    ProbeStatus,
    HostDnsConfig,
    DnsResolveCache,
    DnsUpstream,
    PlatformConfig,
    NetworkStatus,
    EtcFileSpec,
    EtcFileStatus,
    EthernetSpec,
    EthernetStatus,
    MachineConfig,
);

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Identifiers
// =============================================================================

/// Id of a per-source spec in the config namespace: `{layer}/{kind-id}`
pub fn layered_id(layer: ConfigLayer, id: &str) -> String {
    format!("{}/{}", layer, id)
}

/// Id of an operator-produced spec: `{operator}/{link}/{kind-id}`
pub fn operator_prefixed_id(operator: Operator, link: &str, id: &str) -> String {
    format!("{}/{}/{}", operator, link, id)
}

macro_rules! impl_layered {
    ($($ty:ident),+ $(,)?) => {
        $(
            impl Layered for $ty {
                fn layer(&self) -> ConfigLayer {
                    self.config_layer
                }
            }
        )+
    };
}

impl_layered!(
    AddressSpec,
    LinkSpec,
    RouteSpec,
    HostnameSpec,
    ResolverSpec,
    TimeServerSpec,
    OperatorSpec,
    ProbeSpec,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_views() {
        let spec = HostnameSpec {
            hostname: "foo".into(),
            ..Default::default()
        }
        .into_spec();

        assert_eq!(spec.kind(), Kind::HostnameSpec);
        assert_eq!(
            HostnameSpec::from_spec(&spec).map(|s| s.hostname.as_str()),
            Some("foo")
        );
        assert!(ResolverSpec::from_spec(&spec).is_none());
    }

    #[test]
    fn test_layered_id() {
        assert_eq!(
            layered_id(ConfigLayer::Configuration, "eth0/10.0.0.1/8"),
            "configuration/eth0/10.0.0.1/8"
        );
        assert_eq!(
            operator_prefixed_id(Operator::Dhcp4, "eth0", "addresses/eth0/10.0.0.5/24"),
            "dhcp4/eth0/addresses/eth0/10.0.0.5/24"
        );
    }
}
