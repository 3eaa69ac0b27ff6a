//! Controller Engine
//!
//! Runs every registered controller in its own task. A dispatcher task
//! fans store events out to the controllers whose inputs match; each
//! controller sees a single coalesced wake-up channel.
//!
//! Failure policy:
//! - `Ok(())` from `run`: the controller is rescheduled on its next event
//! - `Err(_)`: logged, counted and restarted after exponential backoff
//! - panic: caught, counted and restarted like an error

use super::controller::{restart_backoff, Controller, ControllerRuntime, Input, OutputKind};
use super::state::State;
use super::trigger::{EventTrigger, DEFAULT_WATCH_WINDOW};
use crate::error::{Error, Result};
use crate::metrics::metrics;
use crate::resources::Kind;
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Runtime tunables
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Coalescing window for kernel watchers
    pub watch_window: Duration,
    /// First restart delay after a controller failure
    pub backoff_initial: Duration,
    /// Restart delay ceiling
    pub backoff_max: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            watch_window: DEFAULT_WATCH_WINDOW,
            backoff_initial: Duration::from_millis(100),
            backoff_max: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Controller engine
pub struct Engine {
    state: Arc<State>,
    config: RuntimeConfig,
    controllers: Vec<Box<dyn Controller>>,
    exclusive: HashMap<Kind, String>,
    shared: HashSet<Kind>,
}

impl Engine {
    pub fn new(state: Arc<State>, config: RuntimeConfig) -> Self {
        Self {
            state,
            config,
            controllers: Vec::new(),
            exclusive: HashMap::new(),
            shared: HashSet::new(),
        }
    }

    pub fn state(&self) -> &Arc<State> {
        &self.state
    }

    /// Register a controller, validating its declared outputs
    pub fn register(&mut self, controller: Box<dyn Controller>) -> Result<()> {
        let name = controller.name();

        if self.controllers.iter().any(|c| c.name() == name) {
            return Err(Error::Configuration(format!(
                "controller {} is already registered",
                name
            )));
        }

        for output in controller.outputs() {
            match output.output_kind {
                OutputKind::Exclusive => {
                    if let Some(owner) = self.exclusive.get(&output.kind) {
                        return Err(Error::Configuration(format!(
                            "{} is already an exclusive output of {}",
                            output.kind, owner
                        )));
                    }

                    if self.shared.contains(&output.kind) {
                        return Err(Error::Configuration(format!(
                            "{} is already a shared output",
                            output.kind
                        )));
                    }
                }
                OutputKind::Shared => {
                    if let Some(owner) = self.exclusive.get(&output.kind) {
                        return Err(Error::Configuration(format!(
                            "{} is an exclusive output of {}",
                            output.kind, owner
                        )));
                    }
                }
            }
        }

        for output in controller.outputs() {
            match output.output_kind {
                OutputKind::Exclusive => {
                    self.exclusive.insert(output.kind, name.clone());
                }
                OutputKind::Shared => {
                    self.shared.insert(output.kind);
                }
            }
        }

        debug!(controller = %name, "registered controller");
        self.controllers.push(controller);

        Ok(())
    }

    /// Run all controllers until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let events = self.state.subscribe();

        let mut subscriptions: Vec<(Vec<Input>, EventTrigger)> = Vec::new();
        let mut tasks = Vec::new();

        info!(controllers = self.controllers.len(), "starting controller engine");

        for controller in self.controllers {
            let rt = ControllerRuntime::new(
                controller.name(),
                controller.inputs(),
                controller.outputs(),
                self.state.clone(),
                cancel.child_token(),
                restart_backoff(self.config.backoff_initial, self.config.backoff_max),
            );

            let trigger = rt.trigger();
            subscriptions.push((controller.inputs(), trigger.clone()));

            // first pass without waiting for an input change
            trigger.fire();

            tasks.push(tokio::spawn(run_controller(controller, rt)));
        }

        let dispatcher = tokio::spawn(dispatch(events, subscriptions, cancel.clone()));

        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                error!(error = %e, "controller task failed");
            }
        }

        dispatcher.abort();
        info!("controller engine stopped");

        Ok(())
    }
}

async fn dispatch(
    mut events: broadcast::Receiver<super::state::StateEvent>,
    subscriptions: Vec<(Vec<Input>, EventTrigger)>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv() => event,
        };

        match event {
            Ok(event) => {
                let destroy_ready = event.is_destroy_ready();

                for (inputs, trigger) in &subscriptions {
                    if inputs.iter().any(|i| i.matches(&event.key, destroy_ready)) {
                        trigger.fire();
                    }
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "state event stream lagged, waking all controllers");

                for (_, trigger) in &subscriptions {
                    trigger.fire();
                }
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn run_controller(mut controller: Box<dyn Controller>, mut rt: ControllerRuntime) {
    let name = controller.name();
    let cancel = rt.cancel_token();

    info!(controller = %name, "controller started");

    loop {
        let outcome = AssertUnwindSafe(controller.run(&mut rt)).catch_unwind().await;

        if cancel.is_cancelled() {
            break;
        }

        match outcome {
            Ok(Ok(())) => {
                // rescheduled on the next event
                continue;
            }
            Ok(Err(e)) => {
                metrics().controller_error(&name);
                let delay = rt.next_backoff();
                warn!(
                    controller = %name,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "controller failed"
                );

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(_) => {
                metrics().controller_panic(&name);
                let delay = rt.next_backoff();
                error!(
                    controller = %name,
                    retry_in_ms = delay.as_millis() as u64,
                    "controller panicked"
                );

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        rt.trigger().fire();
    }

    info!(controller = %name, "controller stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::controller::Output;
    use crate::resources::{HostnameSpec, Namespace, ResolverSpec};
    use async_trait::async_trait;
    use assert_matches::assert_matches;

    struct CopyController {
        name: &'static str,
        fail_first: bool,
    }

    #[async_trait]
    impl Controller for CopyController {
        fn name(&self) -> String {
            self.name.to_string()
        }

        fn inputs(&self) -> Vec<Input> {
            vec![Input::weak(Namespace::Config, Kind::HostnameSpec)]
        }

        fn outputs(&self) -> Vec<Output> {
            vec![Output::exclusive(Kind::HostnameSpec)]
        }

        async fn run(&mut self, rt: &mut ControllerRuntime) -> Result<()> {
            loop {
                if !rt.event().await {
                    return Ok(());
                }

                if self.fail_first {
                    self.fail_first = false;
                    return Err(Error::Internal("first pass fails".into()));
                }

                for r in rt.list::<HostnameSpec>(Namespace::Config) {
                    let spec = r.spec.clone();
                    rt.modify::<HostnameSpec, _>(Namespace::Network, r.id(), move |s| {
                        *s = spec;
                        Ok(())
                    })?;
                }
            }
        }
    }

    #[test]
    fn test_register_rejects_output_conflicts() {
        let mut engine = Engine::new(Arc::new(State::new()), RuntimeConfig::default());

        engine
            .register(Box::new(CopyController {
                name: "a",
                fail_first: false,
            }))
            .unwrap();

        let err = engine
            .register(Box::new(CopyController {
                name: "b",
                fail_first: false,
            }))
            .unwrap_err();
        assert_matches!(err, Error::Configuration(_));
    }

    #[tokio::test]
    async fn test_engine_schedules_and_retries() {
        let state = Arc::new(State::new());
        let mut engine = Engine::new(
            state.clone(),
            RuntimeConfig {
                backoff_initial: Duration::from_millis(10),
                ..Default::default()
            },
        );

        engine
            .register(Box::new(CopyController {
                name: "copy",
                fail_first: true,
            }))
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(engine.run(cancel.clone()));

        state
            .create(
                "test",
                Namespace::Config,
                "h",
                HostnameSpec {
                    hostname: "foo".into(),
                    ..Default::default()
                },
            )
            .unwrap();

        let mut copied = false;
        for _ in 0..100 {
            if state.get::<HostnameSpec>(Namespace::Network, "h").is_some() {
                copied = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(copied);
        assert!(state.get::<ResolverSpec>(Namespace::Network, "h").is_none());

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
