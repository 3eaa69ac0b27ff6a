//! Time Server Config Controller

use super::{cmdline_networking, machine_config, pass_done, write_layered};
use crate::error::Result;
use crate::machine::Cmdline;
use crate::resources::{ConfigLayer, Kind, Namespace, TimeServerSpec, TIME_SERVER_ID};
use crate::runtime::{Controller, ControllerRuntime, Input, Output};
use async_trait::async_trait;
use std::sync::Arc;

/// NTP server used when nothing else is configured
pub const DEFAULT_TIME_SERVER: &str = "time.cloudflare.com";

/// Publishes per-source `TimeServerSpec`s
pub struct TimeServerConfigController {
    cmdline: Arc<Cmdline>,
}

impl TimeServerConfigController {
    pub fn new(cmdline: Arc<Cmdline>) -> Self {
        Self { cmdline }
    }

    pub(crate) fn reconcile(&self, rt: &mut ControllerRuntime) -> Result<()> {
        rt.start_tracking_outputs();

        let mut specs = vec![TimeServerSpec {
            ntp_servers: vec![DEFAULT_TIME_SERVER.to_string()],
            config_layer: ConfigLayer::Default,
        }];

        let cmdline = cmdline_networking(rt, &self.cmdline);

        if !cmdline.ntp_addresses.is_empty() {
            specs.push(TimeServerSpec {
                ntp_servers: cmdline.ntp_addresses.iter().map(|a| a.to_string()).collect(),
                config_layer: ConfigLayer::Cmdline,
            });
        }

        if let Some(config) = machine_config(rt) {
            let time = &config.machine.time;

            if !time.disabled && !time.servers.is_empty() {
                specs.push(TimeServerSpec {
                    ntp_servers: time.servers.clone(),
                    config_layer: ConfigLayer::Configuration,
                });
            }
        }

        for spec in specs {
            write_layered(rt, TIME_SERVER_ID, spec)?;
        }

        rt.cleanup_outputs::<TimeServerSpec>(Namespace::Config)
    }
}

#[async_trait]
impl Controller for TimeServerConfigController {
    fn name(&self) -> String {
        "TimeServerConfigController".to_string()
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak(Namespace::Machine, Kind::MachineConfig),
            Input::weak(Namespace::Network, Kind::LinkStatus),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::shared(Kind::TimeServerSpec)]
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
    fn test_sources() {
        let cmdline =
            Cmdline::parse("ip=172.20.0.2::172.20.0.1:255.255.255.0::eth1::10.0.0.1:10.0.0.2:10.0.0.1");
        let controller = TimeServerConfigController::new(Arc::new(cmdline));
        let (state, mut rt) = testutil::runtime(&controller);

        state
            .create(
                "test",
                Namespace::Machine,
                MACHINE_CONFIG_ID,
                MachineConfig::from_yaml("machine:\n  time:\n    servers: [pool.ntp.org]\n").unwrap(),
            )
            .unwrap();

        controller.reconcile(&mut rt).unwrap();

        let ids: Vec<(String, Vec<String>)> = state
            .list::<TimeServerSpec>(Namespace::Config)
            .into_iter()
            .map(|r| (r.metadata.id, r.spec.ntp_servers))
            .collect();

        assert_eq!(
            ids,
            vec![
                ("cmdline/timeservers".to_string(), vec!["10.0.0.1".to_string()]),
                ("configuration/timeservers".to_string(), vec!["pool.ntp.org".to_string()]),
                ("default/timeservers".to_string(), vec![DEFAULT_TIME_SERVER.to_string()]),
            ]
        );
    }
}
