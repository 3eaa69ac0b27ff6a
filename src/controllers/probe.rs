//! Probe Controller
//!
//! Runs one task per merged `ProbeSpec`. Every task dials its TCP endpoint on
//! a fixed interval and reports state changes over the controller's single
//! notification channel; the controller turns them into `ProbeStatus`
//! writes.

use super::pass_done;
use super::probe_config::{DEFAULT_PROBE_INTERVAL, DEFAULT_PROBE_TIMEOUT};
use crate::error::Result;
use crate::metrics::metrics;
use crate::resources::{Kind, Namespace, ProbeSpec, ProbeStatus};
use crate::runtime::{Controller, ControllerRuntime, Input, Output};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const NOTIFY_CAPACITY: usize = 64;

/// Fallbacks for unset probe timings
#[derive(Debug, Clone, Copy)]
pub struct ProbeDefaults {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for ProbeDefaults {
    fn default() -> Self {
        Self {
            interval: DEFAULT_PROBE_INTERVAL,
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

/// Status change reported by a probe task
#[derive(Debug, Clone)]
pub struct ProbeNotification {
    pub id: String,
    generation: u64,
    pub status: ProbeStatus,
}

struct RunningProbe {
    spec: ProbeSpec,
    generation: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl RunningProbe {
    async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

async fn dial(endpoint: &str, dial_timeout: Duration) -> std::result::Result<(), String> {
    match timeout(dial_timeout, TcpStream::connect(endpoint)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("dial {} timed out after {:?}", endpoint, dial_timeout)),
    }
}

async fn run_probe(
    id: String,
    generation: u64,
    spec: ProbeSpec,
    defaults: ProbeDefaults,
    notify: mpsc::Sender<ProbeNotification>,
    cancel: CancellationToken,
) {
    let period = if spec.interval.is_zero() {
        defaults.interval
    } else {
        spec.interval
    };
    let dial_timeout = if spec.tcp.timeout.is_zero() {
        defaults.timeout
    } else {
        spec.tcp.timeout
    };

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut failures = 0u32;
    let mut reported: Option<ProbeStatus> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return,
            outcome = dial(&spec.tcp.endpoint, dial_timeout) => outcome,
        };

        metrics().probe_result(&id, outcome.is_ok());

        let status = match outcome {
            Ok(()) => {
                failures = 0;
                ProbeStatus {
                    success: true,
                    last_error: String::new(),
                }
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                debug!(probe = %id, failures, error = %e, "probe failed");

                if failures < spec.failure_threshold {
                    continue;
                }

                ProbeStatus {
                    success: false,
                    last_error: e,
                }
            }
        };

        if reported.as_ref() == Some(&status) {
            continue;
        }

        reported = Some(status.clone());

        let notification = ProbeNotification {
            id: id.clone(),
            generation,
            status,
        };

        if notify.send(notification).await.is_err() {
            return;
        }
    }
}

/// Supervises probe tasks and publishes `ProbeStatus`
pub struct ProbeController {
    defaults: ProbeDefaults,
    running: HashMap<String, RunningProbe>,
    generation: u64,
    notify_tx: mpsc::Sender<ProbeNotification>,
    notify_rx: mpsc::Receiver<ProbeNotification>,
}

impl Default for ProbeController {
    fn default() -> Self {
        Self::new()
    }
}

impl ProbeController {
    pub fn new() -> Self {
        Self::with_defaults(ProbeDefaults::default())
    }

    pub fn with_defaults(defaults: ProbeDefaults) -> Self {
        let (notify_tx, notify_rx) = mpsc::channel(NOTIFY_CAPACITY);

        Self {
            defaults,
            running: HashMap::new(),
            generation: 0,
            notify_tx,
            notify_rx,
        }
    }

    /// Ids of running probes, sorted
    pub fn running(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.running.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub(crate) async fn reconcile(&mut self, rt: &mut ControllerRuntime) -> Result<()> {
        let desired: HashMap<String, ProbeSpec> = rt
            .list::<ProbeSpec>(Namespace::Network)
            .into_iter()
            .filter(|r| !r.metadata.is_tearing_down())
            .map(|r| (r.metadata.id, r.spec))
            .collect();

        let stale: Vec<String> = self
            .running
            .iter()
            .filter(|(id, probe)| desired.get(*id) != Some(&probe.spec))
            .map(|(id, _)| id.clone())
            .collect();

        for id in stale {
            if let Some(probe) = self.running.remove(&id) {
                debug!(probe = %id, "stopping probe");
                probe.stop().await;
            }
        }

        for (id, spec) in desired {
            if self.running.contains_key(&id) {
                continue;
            }

            self.generation += 1;
            let cancel = CancellationToken::new();

            info!(probe = %id, interval = ?spec.interval, "starting probe");

            let handle = tokio::spawn(run_probe(
                id.clone(),
                self.generation,
                spec.clone(),
                self.defaults,
                self.notify_tx.clone(),
                cancel.clone(),
            ));

            self.running.insert(
                id,
                RunningProbe {
                    spec,
                    generation: self.generation,
                    cancel,
                    handle,
                },
            );
        }

        // statuses of stopped probes
        for status in rt.list::<ProbeStatus>(Namespace::Network) {
            if !self.running.contains_key(&status.metadata.id) {
                rt.teardown_and_destroy::<ProbeStatus>(Namespace::Network, &status.metadata.id)?;
            }
        }

        Ok(())
    }

    pub(crate) fn apply_notification(
        &self,
        rt: &mut ControllerRuntime,
        notification: ProbeNotification,
    ) -> Result<()> {
        let current = self
            .running
            .get(&notification.id)
            .map_or(false, |probe| probe.generation == notification.generation);

        if !current {
            debug!(probe = %notification.id, "dropping late probe notification");
            return Ok(());
        }

        if !notification.status.success {
            warn!(
                probe = %notification.id,
                error = %notification.status.last_error,
                "probe failing"
            );
        }

        let status = notification.status;
        rt.modify::<ProbeStatus, _>(Namespace::Network, &notification.id, |current| {
            *current = status;
            Ok(())
        })
    }

    async fn stop_all(&mut self) {
        for (_, probe) in self.running.drain() {
            probe.stop().await;
        }
    }
}

#[async_trait]
impl Controller for ProbeController {
    fn name(&self) -> String {
        "ProbeController".to_string()
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::weak(Namespace::Network, Kind::ProbeSpec)]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive(Kind::ProbeStatus)]
    }

    async fn run(&mut self, rt: &mut ControllerRuntime) -> Result<()> {
        let result = loop {
            let outcome = tokio::select! {
                more = rt.event() => {
                    if !more {
                        break Ok(());
                    }

                    self.reconcile(rt).await
                }
                Some(notification) = self.notify_rx.recv() => {
                    self.apply_notification(rt, notification)
                }
            };

            if let Err(e) = outcome {
                break Err(e);
            }

            pass_done(rt);
        };

        self.stop_all().await;

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::testutil;
    use crate::resources::{ConfigLayer, TcpProbeSpec};
    use crate::runtime::State;
    use tokio::net::TcpListener;

    fn tcp_probe(endpoint: String, failure_threshold: u32) -> ProbeSpec {
        ProbeSpec {
            interval: Duration::from_millis(10),
            failure_threshold,
            tcp: TcpProbeSpec {
                endpoint,
                timeout: Duration::from_secs(1),
            },
            config_layer: ConfigLayer::Configuration,
        }
    }

    async fn closed_port() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr.to_string()
    }

    async fn next(controller: &mut ProbeController) -> ProbeNotification {
        tokio::time::timeout(Duration::from_secs(5), controller.notify_rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    fn publish(state: &State, spec: ProbeSpec) -> String {
        let id = spec.id();
        state
            .modify::<ProbeSpec, _>("ProbeMergeController", Namespace::Network, &id, |current| {
                *current = spec;
                Ok(())
            })
            .unwrap();
        id
    }

    #[tokio::test]
    async fn test_probe_reports_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();

        let mut controller = ProbeController::new();
        let (state, mut rt) = testutil::runtime(&controller);
        let id = publish(&state, tcp_probe(endpoint, 3));

        controller.reconcile(&mut rt).await.unwrap();
        assert_eq!(controller.running(), vec![id.clone()]);

        let notification = next(&mut controller).await;
        assert!(notification.status.success);
        controller.apply_notification(&mut rt, notification).unwrap();

        let status = state.get::<ProbeStatus>(Namespace::Network, &id).unwrap();
        assert!(status.spec.success);

        controller.stop_all().await;
    }

    #[tokio::test]
    async fn test_probe_failure_threshold() {
        let mut controller = ProbeController::new();
        let (state, mut rt) = testutil::runtime(&controller);
        let id = publish(&state, tcp_probe(closed_port().await, 2));

        controller.reconcile(&mut rt).await.unwrap();

        let notification = next(&mut controller).await;
        assert!(!notification.status.success);
        assert!(!notification.status.last_error.is_empty());
        controller.apply_notification(&mut rt, notification).unwrap();

        let status = state.get::<ProbeStatus>(Namespace::Network, &id).unwrap();
        assert!(!status.spec.success);

        controller.stop_all().await;
    }

    #[tokio::test]
    async fn test_removed_probe_drops_status_and_late_notifications() {
        let mut controller = ProbeController::new();
        let (state, mut rt) = testutil::runtime(&controller);
        let id = publish(&state, tcp_probe(closed_port().await, 1));

        controller.reconcile(&mut rt).await.unwrap();
        let first = next(&mut controller).await;
        controller.apply_notification(&mut rt, first.clone()).unwrap();
        assert!(state.get::<ProbeStatus>(Namespace::Network, &id).is_some());

        state
            .destroy::<ProbeSpec>("ProbeMergeController", Namespace::Network, &id)
            .unwrap();
        controller.reconcile(&mut rt).await.unwrap();

        assert!(controller.running().is_empty());
        assert!(state.get::<ProbeStatus>(Namespace::Network, &id).is_none());

        controller.apply_notification(&mut rt, first).unwrap();
        assert!(state.get::<ProbeStatus>(Namespace::Network, &id).is_none());
    }

    #[tokio::test]
    async fn test_changed_probe_restarts() {
        let mut controller = ProbeController::new();
        let (state, mut rt) = testutil::runtime(&controller);
        let endpoint = closed_port().await;
        let id = publish(&state, tcp_probe(endpoint.clone(), 1));

        controller.reconcile(&mut rt).await.unwrap();
        let first_generation = controller.running[&id].generation;

        publish(&state, tcp_probe(endpoint, 5));
        controller.reconcile(&mut rt).await.unwrap();

        assert_ne!(controller.running[&id].generation, first_generation);
        assert_eq!(controller.running[&id].spec.failure_threshold, 5);

        controller.stop_all().await;
    }
}
