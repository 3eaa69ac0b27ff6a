//! Etc File Controllers
//!
//! `EtcFileController` renders `hosts`, `resolv.conf` and the pod-visible
//! `pod-resolv.conf` from the node's hostname, default address and resolver
//! status. `EtcFileWriterController` writes every rendered file atomically
//! below the etc directory and records the spec version it wrote.

use super::{machine_config, pass_done};
use crate::error::{Result, ResultExt};
use crate::machine::{ExtraHost, MachineConfig};
use crate::persist::write_atomic;
use crate::resources::{
    EtcFileSpec, EtcFileStatus, HostDnsConfig, HostnameStatus, Kind, Namespace, NodeAddress,
    ResolverStatus, ETC_HOSTS, ETC_POD_RESOLV_CONF, ETC_RESOLV_CONF, HOSTNAME_ID,
    HOST_DNS_CONFIG_ID, HOST_DNS_LISTEN_ADDRESS, NODE_ADDRESS_DEFAULT_ID, RESOLVER_ID,
};
use crate::runtime::{Controller, ControllerRuntime, Input, Output};
use async_trait::async_trait;
use std::fmt::Write as _;
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{debug, info};

/// Nameservers honoured by the libc resolver
pub const MAX_NAMESERVERS: usize = 3;

const ETC_FILE_MODE: u32 = 0o644;

// =============================================================================
// Rendering
// =============================================================================

/// `resolv.conf` body: nameservers, then an optional search line
pub fn render_resolv_conf(servers: &[IpAddr], search: &[String]) -> String {
    let mut out = String::new();

    for server in servers.iter().take(MAX_NAMESERVERS) {
        let _ = writeln!(out, "nameserver {}", server);
    }

    if !search.is_empty() {
        let _ = write!(out, "\nsearch {}\n", search.join(" "));
    }

    out
}

/// `hosts` body with the address column padded to the widest address
pub fn render_hosts(address: IpAddr, hostname: &HostnameStatus, extra: &[ExtraHost]) -> String {
    let node_names = if hostname.domainname.is_empty() {
        hostname.hostname.clone()
    } else {
        format!("{} {}", hostname.fqdn(), hostname.hostname)
    };

    let mut rows: Vec<(String, String)> = vec![
        ("127.0.0.1".into(), "localhost".into()),
        (address.to_string(), node_names),
        ("::1".into(), "localhost ip6-localhost ip6-loopback".into()),
        ("ff02::1".into(), "ip6-allnodes".into()),
        ("ff02::2".into(), "ip6-allrouters".into()),
    ];

    rows.extend(
        extra
            .iter()
            .map(|host| (host.ip.to_string(), host.aliases.join(" "))),
    );

    let width = rows.iter().map(|(ip, _)| ip.len()).max().unwrap_or(0);

    rows.iter().fold(String::new(), |mut out, (ip, names)| {
        let _ = writeln!(out, "{:<width$} {}", ip, names, width = width);
        out
    })
}

fn search_domains(
    config: Option<&MachineConfig>,
    hostname: Option<&HostnameStatus>,
    resolvers: &ResolverStatus,
) -> Vec<String> {
    let disabled = config.map_or(false, |c| c.network().disable_search_domain);
    let mut domains = Vec::new();

    if let Some(hostname) = hostname.filter(|h| !disabled && !h.domainname.is_empty()) {
        domains.push(hostname.domainname.clone());
    }

    for domain in &resolvers.search_domains {
        if !domains.contains(domain) {
            domains.push(domain.clone());
        }
    }

    domains
}

// =============================================================================
// EtcFileController
// =============================================================================

/// Renders `EtcFileSpec`s
#[derive(Debug, Default)]
pub struct EtcFileController {
    container_mode: bool,
}

impl EtcFileController {
    pub fn new(container_mode: bool) -> Self {
        Self { container_mode }
    }

    fn publish(rt: &mut ControllerRuntime, id: &str, contents: String) -> Result<()> {
        rt.modify::<EtcFileSpec, _>(Namespace::Network, id, |spec| {
            spec.contents = contents.into_bytes();
            spec.mode = ETC_FILE_MODE;
            Ok(())
        })
    }

    pub(crate) fn reconcile(&self, rt: &mut ControllerRuntime) -> Result<()> {
        let config = machine_config(rt);

        let hostname = rt
            .get::<HostnameStatus>(Namespace::Network, HOSTNAME_ID)
            .filter(|r| !r.metadata.is_tearing_down())
            .map(|r| r.spec);
        let address = rt
            .get::<NodeAddress>(Namespace::Network, NODE_ADDRESS_DEFAULT_ID)
            .filter(|r| !r.metadata.is_tearing_down())
            .and_then(|r| r.spec.addresses.first().map(|a| a.ip()));
        let resolvers = rt
            .get::<ResolverStatus>(Namespace::Network, RESOLVER_ID)
            .filter(|r| !r.metadata.is_tearing_down())
            .map(|r| r.spec);
        let host_dns = rt
            .get::<HostDnsConfig>(Namespace::Network, HOST_DNS_CONFIG_ID)
            .filter(|r| !r.metadata.is_tearing_down())
            .map(|r| r.spec)
            .filter(|c| c.enabled);

        rt.start_tracking_outputs();

        if let (Some(hostname), Some(address)) = (&hostname, address) {
            let extra = config
                .as_ref()
                .map(|c| c.network().extra_host_entries.clone())
                .unwrap_or_default();

            Self::publish(rt, ETC_HOSTS, render_hosts(address, hostname, &extra))?;
        }

        if let Some(resolvers) = &resolvers {
            let search = search_domains(config.as_ref(), hostname.as_ref(), resolvers);

            if !self.container_mode {
                let servers = match &host_dns {
                    Some(_) => vec![HOST_DNS_LISTEN_ADDRESS.ip()],
                    None => resolvers.dns_servers.clone(),
                };

                Self::publish(rt, ETC_RESOLV_CONF, render_resolv_conf(&servers, &search))?;
            }

            let pod_servers = match host_dns.as_ref().and_then(|c| c.service_host_dns_address) {
                Some(service) => vec![service],
                None => resolvers.dns_servers.clone(),
            };

            Self::publish(rt, ETC_POD_RESOLV_CONF, render_resolv_conf(&pod_servers, &search))?;
        }

        rt.cleanup_outputs::<EtcFileSpec>(Namespace::Network)
    }
}

#[async_trait]
impl Controller for EtcFileController {
    fn name(&self) -> String {
        "EtcFileController".to_string()
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak(Namespace::Machine, Kind::MachineConfig),
            Input::weak(Namespace::Network, Kind::NodeAddress).with_id(NODE_ADDRESS_DEFAULT_ID),
            Input::weak(Namespace::Network, Kind::HostnameStatus),
            Input::weak(Namespace::Network, Kind::ResolverStatus),
            Input::weak(Namespace::Network, Kind::HostDnsConfig),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive(Kind::EtcFileSpec)]
    }

    async fn run(&mut self, rt: &mut ControllerRuntime) -> Result<()> {
        while rt.event().await {
            self.reconcile(rt)?;
            pass_done(rt);
        }

        Ok(())
    }
}

// =============================================================================
// EtcFileWriterController
// =============================================================================

/// Writes rendered files and publishes `EtcFileStatus`
#[derive(Debug)]
pub struct EtcFileWriterController {
    etc_dir: PathBuf,
}

impl EtcFileWriterController {
    pub fn new(etc_dir: PathBuf) -> Self {
        Self { etc_dir }
    }

    pub(crate) fn reconcile(&self, rt: &mut ControllerRuntime) -> Result<()> {
        rt.start_tracking_outputs();

        for file in rt.list::<EtcFileSpec>(Namespace::Network) {
            if file.metadata.is_tearing_down() {
                continue;
            }

            let id = file.metadata.id.as_str();
            let version = file.metadata.version;

            let written = rt
                .get::<EtcFileStatus>(Namespace::Network, id)
                .map_or(false, |s| s.spec.spec_version == version);

            if written {
                // keep the status alive through cleanup
                rt.modify::<EtcFileStatus, _>(Namespace::Network, id, |_| Ok(()))?;
                continue;
            }

            let path = self.etc_dir.join(id);
            write_atomic(&path, &file.spec.contents, file.spec.mode)
                .context(format!("writing {}", path.display()))?;

            info!(file = %path.display(), version, "etc file written");

            rt.modify::<EtcFileStatus, _>(Namespace::Network, id, |status| {
                status.spec_version = version;
                Ok(())
            })?;
        }

        rt.cleanup_outputs::<EtcFileStatus>(Namespace::Network)?;

        debug!(dir = %self.etc_dir.display(), "etc files in sync");

        Ok(())
    }
}

#[async_trait]
impl Controller for EtcFileWriterController {
    fn name(&self) -> String {
        "EtcFileWriterController".to_string()
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::weak(Namespace::Network, Kind::EtcFileSpec)]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive(Kind::EtcFileStatus)]
    }

    async fn run(&mut self, rt: &mut ControllerRuntime) -> Result<()> {
        while rt.event().await {
            self.reconcile(rt)?;
            pass_done(rt);
        }

        Ok(())
    }
}
