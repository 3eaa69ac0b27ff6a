//! DNS Resolve Cache Controller
//!
//! Runs the host DNS forwarder while host DNS is enabled and the resolver
//! status is known. The forwarder's upstream list follows the resolver
//! status; each upstream is mirrored as a `DnsUpstream` resource.

use super::pass_done;
use crate::dns::{DnsConfig, DnsServer, Transport, Upstreams};
use crate::error::Result;
use crate::resources::{
    DnsCacheState, DnsResolveCache, DnsUpstream, HostDnsConfig, Kind, Namespace, ResolverStatus,
    HOST_DNS_CONFIG_ID, RESOLVER_ID,
};
use crate::runtime::{Controller, ControllerRuntime, Input, Output};
use async_trait::async_trait;
use std::net::SocketAddr;
use tracing::{debug, info};

const DNS_PORT: u16 = 53;

/// Manages the forwarder and its status resources
pub struct DnsResolveCacheController {
    config: DnsConfig,
    upstreams: Upstreams,
    listen: Vec<SocketAddr>,
    servers: Vec<DnsServer>,
}

impl DnsResolveCacheController {
    pub fn new(config: DnsConfig) -> Self {
        Self {
            config,
            upstreams: Upstreams::new(),
            listen: Vec::new(),
            servers: Vec::new(),
        }
    }

    /// Bound addresses of the running forwarder
    pub fn local_addrs(&self) -> Vec<(Transport, SocketAddr)> {
        self.servers
            .iter()
            .flat_map(|s| s.local_addrs().iter().map(move |a| (s.transport(), *a)))
            .collect()
    }

    fn listen_addresses(config: &HostDnsConfig) -> Vec<SocketAddr> {
        let mut listen = config.listen_addresses.clone();

        if let Some(ip) = config.service_host_dns_address {
            listen.push(SocketAddr::new(ip, DNS_PORT));
        }

        listen
    }

    async fn stop_servers(&mut self) {
        for server in self.servers.drain(..) {
            server.stop().await;
        }

        self.listen.clear();
    }

    async fn disable(&mut self, rt: &mut ControllerRuntime) -> Result<()> {
        if !self.servers.is_empty() {
            info!("host dns disabled, stopping forwarder");
        }

        self.stop_servers().await;
        self.upstreams.set(Vec::new());

        for cache in rt.list::<DnsResolveCache>(Namespace::Network) {
            rt.teardown_and_destroy::<DnsResolveCache>(Namespace::Network, &cache.metadata.id)?;
        }

        for upstream in rt.list::<DnsUpstream>(Namespace::Network) {
            rt.teardown_and_destroy::<DnsUpstream>(Namespace::Network, &upstream.metadata.id)?;
        }

        Ok(())
    }

    pub(crate) async fn reconcile(&mut self, rt: &mut ControllerRuntime) -> Result<()> {
        let config = rt
            .get::<HostDnsConfig>(Namespace::Network, HOST_DNS_CONFIG_ID)
            .filter(|r| !r.metadata.is_tearing_down())
            .map(|r| r.spec)
            .filter(|c| c.enabled);

        let resolvers = rt
            .get::<ResolverStatus>(Namespace::Network, RESOLVER_ID)
            .filter(|r| !r.metadata.is_tearing_down())
            .map(|r| r.spec);

        let (Some(config), Some(resolvers)) = (config, resolvers) else {
            return self.disable(rt).await;
        };

        let listen = Self::listen_addresses(&config);

        // never forward to ourselves
        let upstreams: Vec<SocketAddr> = resolvers
            .dns_servers
            .iter()
            .map(|ip| SocketAddr::new(*ip, DNS_PORT))
            .filter(|addr| !listen.contains(addr))
            .collect();

        if self.upstreams.set(upstreams.clone()) {
            debug!(upstreams = ?upstreams, "dns upstreams updated");
        }

        if self.servers.is_empty() || self.listen != listen {
            self.stop_servers().await;

            for transport in Transport::ALL {
                rt.modify::<DnsResolveCache, _>(Namespace::Network, transport.as_str(), |cache| {
                    cache.status = DnsCacheState::Starting;
                    Ok(())
                })?;

                let server = DnsServer::start(
                    transport,
                    &listen,
                    self.upstreams.clone(),
                    self.config.clone(),
                )
                .await?;

                self.servers.push(server);
            }

            self.listen = listen;
        }

        for transport in Transport::ALL {
            rt.modify::<DnsResolveCache, _>(Namespace::Network, transport.as_str(), |cache| {
                cache.status = DnsCacheState::Running;
                Ok(())
            })?;
        }

        rt.start_tracking_outputs();

        for addr in upstreams {
            rt.modify::<DnsUpstream, _>(Namespace::Network, &addr.ip().to_string(), |upstream| {
                upstream.addr = Some(addr);
                Ok(())
            })?;
        }

        rt.cleanup_outputs::<DnsUpstream>(Namespace::Network)
    }
}

#[async_trait]
impl Controller for DnsResolveCacheController {
    fn name(&self) -> String {
        "DnsResolveCacheController".to_string()
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak(Namespace::Network, Kind::HostDnsConfig).with_id(HOST_DNS_CONFIG_ID),
            Input::weak(Namespace::Network, Kind::ResolverStatus).with_id(RESOLVER_ID),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![
            Output::exclusive(Kind::DnsResolveCache),
            Output::exclusive(Kind::DnsUpstream),
        ]
    }

    async fn run(&mut self, rt: &mut ControllerRuntime) -> Result<()> {
        let result = loop {
            if !rt.event().await {
                break Ok(());
            }

            if let Err(e) = self.reconcile(rt).await {
                break Err(e);
            }

            pass_done(rt);
        };

        self.stop_servers().await;

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::testutil;
    use crate::runtime::State;

    fn host_dns(state: &State, enabled: bool) {
        state
            .modify::<HostDnsConfig, _>(
                "HostDnsConfigController",
                Namespace::Network,
                HOST_DNS_CONFIG_ID,
                |config| {
                    config.enabled = enabled;
                    config.listen_addresses = vec!["127.0.0.1:0".parse().unwrap()];
                    Ok(())
                },
            )
            .unwrap();
    }

    fn resolvers(state: &State, servers: &[&str]) {
        state
            .modify::<ResolverStatus, _>("ResolverSpecController", Namespace::Network, RESOLVER_ID, |status| {
                status.dns_servers = servers.iter().map(|s| s.parse().unwrap()).collect();
                Ok(())
            })
            .unwrap();
    }

    fn upstream_ids(state: &State) -> Vec<String> {
        state
            .list::<DnsUpstream>(Namespace::Network)
            .into_iter()
            .map(|r| r.metadata.id)
            .collect()
    }

    #[tokio::test]
    async fn test_forwarder_lifecycle() {
        let mut controller = DnsResolveCacheController::new(DnsConfig::default());
        let (state, mut rt) = testutil::runtime(&controller);

        host_dns(&state, true);
        controller.reconcile(&mut rt).await.unwrap();
        assert!(controller.local_addrs().is_empty());

        resolvers(&state, &["1.1.1.1", "8.8.8.8"]);
        controller.reconcile(&mut rt).await.unwrap();

        let caches = state.list::<DnsResolveCache>(Namespace::Network);
        assert_eq!(caches.len(), 2);
        assert!(caches.iter().all(|c| c.spec.status == DnsCacheState::Running));
        assert_eq!(controller.local_addrs().len(), 2);
        assert_eq!(upstream_ids(&state), vec!["1.1.1.1", "8.8.8.8"]);

        resolvers(&state, &["8.8.8.8"]);
        controller.reconcile(&mut rt).await.unwrap();
        assert_eq!(upstream_ids(&state), vec!["8.8.8.8"]);
        assert_eq!(controller.upstreams.get(), vec!["8.8.8.8:53".parse().unwrap()]);

        host_dns(&state, false);
        controller.reconcile(&mut rt).await.unwrap();

        assert!(controller.local_addrs().is_empty());
        assert!(state.list::<DnsResolveCache>(Namespace::Network).is_empty());
        assert!(upstream_ids(&state).is_empty());
    }

    #[test]
    fn test_listen_addresses_include_service_address() {
        let config = HostDnsConfig {
            enabled: true,
            listen_addresses: vec!["127.0.0.53:53".parse().unwrap()],
            service_host_dns_address: Some("169.254.116.108".parse().unwrap()),
            resolve_member_names: false,
        };

        assert_eq!(
            DnsResolveCacheController::listen_addresses(&config),
            vec![
                "127.0.0.53:53".parse::<SocketAddr>().unwrap(),
                "169.254.116.108:53".parse().unwrap(),
            ]
        );
    }

    #[tokio::test]
    async fn test_listen_address_not_used_as_upstream() {
        let mut controller = DnsResolveCacheController::new(DnsConfig::default());
        let (state, mut rt) = testutil::runtime(&controller);

        host_dns(&state, true);
        resolvers(&state, &["127.0.0.1", "1.1.1.1"]);
        controller.reconcile(&mut rt).await.unwrap();

        // 127.0.0.1:0 is the listen address, 127.0.0.1:53 is still an upstream
        assert_eq!(upstream_ids(&state), vec!["1.1.1.1", "127.0.0.1"]);

        controller.stop_servers().await;
    }
}
