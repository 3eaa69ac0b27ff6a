//! Hostname resources

use super::nethelpers::ConfigLayer;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Well-known id of the final hostname spec and status
pub const HOSTNAME_ID: &str = "hostname";

const MAX_LABEL_LEN: usize = 63;
const MAX_FQDN_LEN: usize = 253;

/// Desired hostname and domain
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostnameSpec {
    pub hostname: String,
    pub domainname: String,
    pub config_layer: ConfigLayer,
}

impl HostnameSpec {
    /// `hostname[.domain]`
    pub fn fqdn(&self) -> String {
        fqdn(&self.hostname, &self.domainname)
    }

    /// Split a fully qualified name on the first dot
    pub fn parse_fqdn(name: &str, layer: ConfigLayer) -> Result<Self> {
        let name = name.trim_end_matches('.');

        if name.is_empty() {
            return Err(Error::Configuration("empty hostname".into()));
        }

        if name.len() > MAX_FQDN_LEN {
            return Err(Error::Configuration(format!(
                "fqdn is too long: {}",
                name.len()
            )));
        }

        let (hostname, domainname) = match name.split_once('.') {
            Some((host, domain)) => (host, domain),
            None => (name, ""),
        };

        if hostname.len() > MAX_LABEL_LEN {
            return Err(Error::Configuration(format!(
                "hostname label is too long: {}",
                hostname.len()
            )));
        }

        Ok(Self {
            hostname: hostname.to_string(),
            domainname: domainname.to_string(),
            config_layer: layer,
        })
    }
}

/// Applied hostname and domain
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostnameStatus {
    pub hostname: String,
    pub domainname: String,
}

impl HostnameStatus {
    pub fn fqdn(&self) -> String {
        fqdn(&self.hostname, &self.domainname)
    }
}

fn fqdn(hostname: &str, domainname: &str) -> String {
    if domainname.is_empty() {
        hostname.to_string()
    } else {
        format!("{}.{}", hostname, domainname)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fqdn() {
        let spec = HostnameSpec::parse_fqdn("foo.example.com", ConfigLayer::Cmdline).unwrap();
        assert_eq!(spec.hostname, "foo");
        assert_eq!(spec.domainname, "example.com");
        assert_eq!(spec.fqdn(), "foo.example.com");

        let spec = HostnameSpec::parse_fqdn("master1", ConfigLayer::Cmdline).unwrap();
        assert_eq!(spec.fqdn(), "master1");
    }

    #[test]
    fn test_parse_fqdn_rejects_long_label() {
        let long = "a".repeat(64);
        assert!(HostnameSpec::parse_fqdn(&long, ConfigLayer::Default).is_err());
        assert!(HostnameSpec::parse_fqdn("", ConfigLayer::Default).is_err());
    }
}
