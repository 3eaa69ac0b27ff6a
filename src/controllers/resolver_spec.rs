//! Resolver Spec Controller

use super::pass_done;
use crate::error::Result;
use crate::resources::{Kind, Namespace, ResolverSpec, ResolverStatus, RESOLVER_ID};
use crate::runtime::{Controller, ControllerRuntime, Input, Output};
use async_trait::async_trait;
use tracing::info;

/// Publishes the merged resolvers as `ResolverStatus`
///
/// The resolvers only reach the host through the rendered resolv.conf and
/// the DNS forwarder, both of which watch the status.
pub struct ResolverSpecController;

impl ResolverSpecController {
    pub fn new() -> Self {
        Self
    }

    pub(crate) fn reconcile(&self, rt: &mut ControllerRuntime) -> Result<()> {
        rt.start_tracking_outputs();

        for spec in rt.list::<ResolverSpec>(Namespace::Network) {
            if spec.metadata.is_tearing_down() {
                continue;
            }

            let status = ResolverStatus {
                dns_servers: spec.spec.dns_servers,
                search_domains: spec.spec.search_domains,
            };

            info!(servers = ?status.dns_servers, domains = ?status.search_domains, "setting resolvers");

            rt.modify::<ResolverStatus, _>(Namespace::Network, RESOLVER_ID, |s| {
                *s = status;
                Ok(())
            })?;
        }

        rt.cleanup_outputs::<ResolverStatus>(Namespace::Network)
    }
}

impl Default for ResolverSpecController {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Controller for ResolverSpecController {
    fn name(&self) -> String {
        "ResolverSpecController".to_string()
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::weak(Namespace::Network, Kind::ResolverSpec)]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive(Kind::ResolverStatus)]
    }

    async fn run(&mut self, rt: &mut ControllerRuntime) -> Result<()> {
        while rt.event().await {
            self.reconcile(rt)?;
            pass_done(rt);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::testutil;
    use crate::resources::ConfigLayer;

    #[test]
    fn test_status_follows_spec() {
        let controller = ResolverSpecController::new();
        let (state, mut rt) = testutil::runtime(&controller);

        state
            .create(
                "ResolverMergeController",
                Namespace::Network,
                RESOLVER_ID,
                ResolverSpec {
                    dns_servers: vec!["1.1.1.1".parse().unwrap()],
                    search_domains: vec!["example.org".into()],
                    config_layer: ConfigLayer::Default,
                },
            )
            .unwrap();

        controller.reconcile(&mut rt).unwrap();

        let status = state
            .get::<ResolverStatus>(Namespace::Network, RESOLVER_ID)
            .unwrap();
        assert_eq!(status.spec.dns_servers, vec!["1.1.1.1".parse::<std::net::IpAddr>().unwrap()]);
        assert_eq!(status.spec.search_domains, vec!["example.org"]);

        state
            .destroy::<ResolverSpec>("ResolverMergeController", Namespace::Network, RESOLVER_ID)
            .unwrap();
        controller.reconcile(&mut rt).unwrap();

        assert!(state
            .get::<ResolverStatus>(Namespace::Network, RESOLVER_ID)
            .is_none());
    }
}
