//! Time Server Spec Controller

use super::pass_done;
use crate::error::Result;
use crate::resources::{Kind, Namespace, TimeServerSpec, TimeServerStatus, TIME_SERVER_ID};
use crate::runtime::{Controller, ControllerRuntime, Input, Output};
use async_trait::async_trait;
use tracing::info;

/// Publishes the merged NTP servers as `TimeServerStatus`
pub struct TimeServerSpecController;

impl TimeServerSpecController {
    pub fn new() -> Self {
        Self
    }

    pub(crate) fn reconcile(&self, rt: &mut ControllerRuntime) -> Result<()> {
        rt.start_tracking_outputs();

        for spec in rt.list::<TimeServerSpec>(Namespace::Network) {
            if spec.metadata.is_tearing_down() {
                continue;
            }

            let servers = spec.spec.ntp_servers;
            info!(servers = ?servers, "setting time servers");

            rt.modify::<TimeServerStatus, _>(Namespace::Network, TIME_SERVER_ID, |status| {
                status.ntp_servers = servers;
                Ok(())
            })?;
        }

        rt.cleanup_outputs::<TimeServerStatus>(Namespace::Network)
    }
}

impl Default for TimeServerSpecController {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Controller for TimeServerSpecController {
    fn name(&self) -> String {
        "TimeServerSpecController".to_string()
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::weak(Namespace::Network, Kind::TimeServerSpec)]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive(Kind::TimeServerStatus)]
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
        let controller = TimeServerSpecController::new();
        let (state, mut rt) = testutil::runtime(&controller);

        state
            .create(
                "TimeServerMergeController",
                Namespace::Network,
                TIME_SERVER_ID,
                TimeServerSpec {
                    ntp_servers: vec!["time.cloudflare.com".into()],
                    config_layer: ConfigLayer::Default,
                },
            )
            .unwrap();

        controller.reconcile(&mut rt).unwrap();

        let status = state
            .get::<TimeServerStatus>(Namespace::Network, TIME_SERVER_ID)
            .unwrap();
        assert_eq!(status.spec.ntp_servers, vec!["time.cloudflare.com"]);
    }
}
