//! Probe Config Controller

use super::{machine_config, pass_done, write_layered};
use crate::error::Result;
use crate::machine::ProbeConfig;
use crate::resources::{ConfigLayer, Kind, Namespace, ProbeSpec, TcpProbeSpec};
use crate::runtime::{Controller, ControllerRuntime, Input, Output};
use async_trait::async_trait;
use std::time::Duration;

pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Publishes machine-configured `ProbeSpec`s
#[derive(Debug, Default)]
pub struct ProbeConfigController;

fn probe_spec(config: &ProbeConfig) -> ProbeSpec {
    let seconds = |value: u64, default: Duration| match value {
        0 => default,
        secs => Duration::from_secs(secs),
    };

    ProbeSpec {
        interval: seconds(config.interval, DEFAULT_PROBE_INTERVAL),
        failure_threshold: config.failure_threshold,
        tcp: TcpProbeSpec {
            endpoint: config.endpoint.clone(),
            timeout: seconds(config.timeout, DEFAULT_PROBE_TIMEOUT),
        },
        config_layer: ConfigLayer::Configuration,
    }
}

impl ProbeConfigController {
    pub fn new() -> Self {
        Self
    }

    pub(crate) fn reconcile(&self, rt: &mut ControllerRuntime) -> Result<()> {
        rt.start_tracking_outputs();

        if let Some(config) = machine_config(rt) {
            for probe in config.network().probes.iter().filter(|p| !p.endpoint.is_empty()) {
                let spec = probe_spec(probe);
                write_layered(rt, &spec.id(), spec)?;
            }
        }

        rt.cleanup_outputs::<ProbeSpec>(Namespace::Config)
    }
}

#[async_trait]
impl Controller for ProbeConfigController {
    fn name(&self) -> String {
        "ProbeConfigController".to_string()
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::weak(Namespace::Machine, Kind::MachineConfig)]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::shared(Kind::ProbeSpec)]
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
    use crate::machine::{MachineConfig, MACHINE_CONFIG_ID};

    #[test]
    fn test_probe_defaults() {
        let controller = ProbeConfigController::new();
        let (state, mut rt) = testutil::runtime(&controller);

        state
            .create(
                "test",
                Namespace::Machine,
                MACHINE_CONFIG_ID,
                MachineConfig::from_yaml(
                    r#"
machine:
  network:
    probes:
      - endpoint: proxy.example.com:3128
        interval: 5
        failureThreshold: 3
"#,
                )
                .unwrap(),
            )
            .unwrap();

        controller.reconcile(&mut rt).unwrap();

        let probe = state
            .get::<ProbeSpec>(Namespace::Config, "configuration/tcp:proxy.example.com:3128")
            .unwrap();
        assert_eq!(probe.spec.interval, Duration::from_secs(5));
        assert_eq!(probe.spec.tcp.timeout, DEFAULT_PROBE_TIMEOUT);
        assert_eq!(probe.spec.failure_threshold, 3);
    }
}
