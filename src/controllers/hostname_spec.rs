//! Hostname Spec Controller
//!
//! Applies the merged hostname to the host and publishes `HostnameStatus`.
//! In container mode the host identity belongs to the container runtime:
//! the status is still published, but no syscalls are made.

use super::{pass_done, KernelHandle};
use crate::error::{Result, ResultExt};
use crate::resources::{HostnameSpec, HostnameStatus, Kind, Namespace, HOSTNAME_ID};
use crate::runtime::{Controller, ControllerRuntime, Input, Output};
use async_trait::async_trait;
use tracing::info;

/// Pushes `HostnameSpec` to the host
pub struct HostnameSpecController {
    kernel: KernelHandle,
    container_mode: bool,
}

impl HostnameSpecController {
    pub fn new(kernel: KernelHandle, container_mode: bool) -> Self {
        Self {
            kernel,
            container_mode,
        }
    }

    pub(crate) async fn reconcile(&self, rt: &mut ControllerRuntime) -> Result<()> {
        rt.start_tracking_outputs();

        if let Some(spec) = rt
            .get::<HostnameSpec>(Namespace::Network, HOSTNAME_ID)
            .filter(|r| !r.metadata.is_tearing_down())
        {
            let desired = HostnameStatus {
                hostname: spec.spec.hostname.clone(),
                domainname: spec.spec.domainname.clone(),
            };

            let applied = rt
                .get::<HostnameStatus>(Namespace::Network, HOSTNAME_ID)
                .map(|r| r.spec);

            if applied.as_ref() != Some(&desired) && !self.container_mode {
                self.kernel
                    .set_hostname(&desired.hostname)
                    .await
                    .context("set hostname")?;
                self.kernel
                    .set_domainname(&desired.domainname)
                    .await
                    .context("set domainname")?;

                info!(fqdn = %desired.fqdn(), "hostname set");
            }

            rt.modify::<HostnameStatus, _>(Namespace::Network, HOSTNAME_ID, |status| {
                *status = desired;
                Ok(())
            })?;
        }

        rt.cleanup_outputs::<HostnameStatus>(Namespace::Network)
    }
}

#[async_trait]
impl Controller for HostnameSpecController {
    fn name(&self) -> String {
        "HostnameSpecController".to_string()
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::weak(Namespace::Network, Kind::HostnameSpec)]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive(Kind::HostnameStatus)]
    }

    async fn run(&mut self, rt: &mut ControllerRuntime) -> Result<()> {
        while rt.event().await {
            self.reconcile(rt).await?;
            pass_done(rt);
        }

        Ok(())
    }
}
