//! Operator Scheduler
//!
//! Runs one long-lived task per merged `OperatorSpec` whose link is present
//! (and up, when required). Tasks report through a shared notify channel;
//! on each notification the controller republishes every running
//! operator's outputs into the `config` namespace under
//! `{operator}/{link}/...` ids and garbage-collects the rest.
//!
//! A panicking operator is counted and restarted with exponential backoff
//! without disturbing its siblings.

use super::pass_done;
use crate::error::Result;
use crate::metrics::metrics;
use crate::resources::{
    operator_prefixed_id, AddressSpec, ConfigLayer, HostnameSpec, Kind, LinkSpec, LinkStatus,
    Namespace, Operator, OperatorSpec, ResolverSpec, RouteSpec, TimeServerSpec, HOSTNAME_ID,
    RESOLVER_ID, TIME_SERVER_ID,
};
use crate::runtime::{restart_backoff, Controller, ControllerRuntime, Input, Output};
use async_trait::async_trait;
use backoff::backoff::Backoff;
use futures::FutureExt;
use ipnetwork::IpNetwork;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// First restart delay of a panicked operator
pub const OPERATOR_BACKOFF_INITIAL: Duration = Duration::from_millis(500);
/// Restart delay ceiling
pub const OPERATOR_BACKOFF_MAX: Duration = Duration::from_secs(60);

// =============================================================================
// Operator Contract
// =============================================================================

/// Specs an operator currently wants published
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OperatorOutputs {
    pub addresses: Vec<AddressSpec>,
    pub links: Vec<LinkSpec>,
    pub routes: Vec<RouteSpec>,
    pub hostname: Option<HostnameSpec>,
    pub resolver: Option<ResolverSpec>,
    pub time_server: Option<TimeServerSpec>,
}

/// Wakes the scheduler after an operator changed its outputs
#[derive(Debug, Clone)]
pub struct OperatorNotifier(mpsc::Sender<()>);

impl OperatorNotifier {
    pub fn notify(&self) {
        // a full channel already carries a pending wake-up
        let _ = self.0.try_send(());
    }
}

/// A DHCP client, shared IP or similar per-link task
#[async_trait]
pub trait NetworkOperator: Send + Sync {
    /// Run until `cancel` fires; call `notify` whenever outputs change
    async fn run(&self, cancel: CancellationToken, notify: OperatorNotifier);

    fn outputs(&self) -> OperatorOutputs;
}

/// Builds operators from merged specs
pub trait OperatorFactory: Send + Sync {
    fn create(&self, spec: &OperatorSpec) -> Arc<dyn NetworkOperator>;
}

// =============================================================================
// Default Operators
// =============================================================================

/// Shared IP claimed for as long as the operator runs
pub struct VipOperator {
    address: Option<AddressSpec>,
    claimed: Mutex<bool>,
}

impl VipOperator {
    pub fn new(spec: &OperatorSpec) -> Self {
        let address = spec
            .vip
            .ip
            .and_then(|ip| IpNetwork::new(ip, if ip.is_ipv4() { 32 } else { 128 }).ok())
            .map(|net| AddressSpec::permanent(&spec.link_name, net, ConfigLayer::Operator));

        Self {
            address,
            claimed: Mutex::new(false),
        }
    }
}

#[async_trait]
impl NetworkOperator for VipOperator {
    async fn run(&self, cancel: CancellationToken, notify: OperatorNotifier) {
        if let Some(address) = &self.address {
            info!(link = %address.link_name, address = %address.address, "shared IP claimed");
            *self.claimed.lock() = true;
            notify.notify();
        }

        cancel.cancelled().await;

        *self.claimed.lock() = false;
    }

    fn outputs(&self) -> OperatorOutputs {
        OperatorOutputs {
            addresses: self
                .address
                .iter()
                .filter(|_| *self.claimed.lock())
                .cloned()
                .collect(),
            ..Default::default()
        }
    }
}

/// Placeholder for operators without a built-in implementation
pub struct IdleOperator {
    operator: Operator,
    link: String,
}

#[async_trait]
impl NetworkOperator for IdleOperator {
    async fn run(&self, cancel: CancellationToken, _notify: OperatorNotifier) {
        debug!(operator = %self.operator, link = %self.link, "no built-in client, idling");
        cancel.cancelled().await;
    }

    fn outputs(&self) -> OperatorOutputs {
        OperatorOutputs::default()
    }
}

/// Shared IPs run in-process; DHCP clients are supplied by the embedder
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultOperatorFactory;

impl OperatorFactory for DefaultOperatorFactory {
    fn create(&self, spec: &OperatorSpec) -> Arc<dyn NetworkOperator> {
        match spec.operator {
            Operator::Vip => Arc::new(VipOperator::new(spec)),
            operator => Arc::new(IdleOperator {
                operator,
                link: spec.link_name.clone(),
            }),
        }
    }
}

// =============================================================================
// Task Supervision
// =============================================================================

struct RunningOperator {
    spec: OperatorSpec,
    operator: Arc<dyn NetworkOperator>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl RunningOperator {
    async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

async fn run_with_restarts(
    operator: Arc<dyn NetworkOperator>,
    spec: OperatorSpec,
    notify: OperatorNotifier,
    cancel: CancellationToken,
    backoff_initial: Duration,
    backoff_max: Duration,
) {
    let mut backoff = restart_backoff(backoff_initial, backoff_max);
    let label = spec.operator.to_string();

    while !cancel.is_cancelled() {
        let outcome = AssertUnwindSafe(operator.run(cancel.clone(), notify.clone()))
            .catch_unwind()
            .await;

        if outcome.is_ok() {
            return;
        }

        metrics().operator_panic(&label, &spec.link_name);
        let delay = backoff.next_backoff().unwrap_or(backoff_max);
        error!(
            operator = %label,
            link = %spec.link_name,
            retry_in_ms = delay.as_millis() as u64,
            "operator panicked"
        );

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

// =============================================================================
// OperatorSpecController
// =============================================================================

/// Schedules operators and publishes their outputs
pub struct OperatorSpecController {
    factory: Arc<dyn OperatorFactory>,
    running: HashMap<String, RunningOperator>,
    notify_tx: mpsc::Sender<()>,
    notify_rx: mpsc::Receiver<()>,
    backoff_initial: Duration,
    backoff_max: Duration,
}

impl OperatorSpecController {
    pub fn new(factory: Arc<dyn OperatorFactory>) -> Self {
        let (notify_tx, notify_rx) = mpsc::channel(1);

        Self {
            factory,
            running: HashMap::new(),
            notify_tx,
            notify_rx,
            backoff_initial: OPERATOR_BACKOFF_INITIAL,
            backoff_max: OPERATOR_BACKOFF_MAX,
        }
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff_initial = initial;
        self.backoff_max = max;
        self
    }

    /// Ids of running operators, sorted
    pub fn running(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.running.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn start(&mut self, id: String, spec: OperatorSpec) {
        let operator = self.factory.create(&spec);
        let cancel = CancellationToken::new();

        debug!(operator = %id, "starting operator");

        let handle = tokio::spawn(run_with_restarts(
            operator.clone(),
            spec.clone(),
            OperatorNotifier(self.notify_tx.clone()),
            cancel.clone(),
            self.backoff_initial,
            self.backoff_max,
        ));

        self.running.insert(
            id,
            RunningOperator {
                spec,
                operator,
                cancel,
                handle,
            },
        );
    }

    async fn stop_all(&mut self) {
        for (_, running) in self.running.drain() {
            running.stop().await;
        }
    }

    pub(crate) async fn reconcile_operators(&mut self, rt: &mut ControllerRuntime) -> Result<()> {
        let links: BTreeMap<String, bool> = rt
            .list::<LinkStatus>(Namespace::Network)
            .into_iter()
            .map(|l| (l.metadata.id, l.spec.is_up()))
            .collect();

        let should_run: BTreeMap<String, OperatorSpec> = rt
            .list::<OperatorSpec>(Namespace::Network)
            .into_iter()
            .filter(|r| !r.metadata.is_tearing_down())
            .filter(|r| match links.get(&r.spec.link_name) {
                None => false,
                Some(up) => *up || !r.spec.require_up,
            })
            .map(|r| (r.metadata.id, r.spec))
            .collect();

        let stale: Vec<String> = self
            .running
            .iter()
            .filter(|(id, running)| should_run.get(*id) != Some(&running.spec))
            .map(|(id, _)| id.clone())
            .collect();

        for id in stale {
            if let Some(running) = self.running.remove(&id) {
                debug!(operator = %id, "stopping operator");
                running.stop().await;
            }
        }

        for (id, spec) in should_run {
            if !self.running.contains_key(&id) {
                self.start(id, spec);
            }
        }

        self.reconcile_outputs(rt)
    }

    pub(crate) fn reconcile_outputs(&self, rt: &mut ControllerRuntime) -> Result<()> {
        rt.start_tracking_outputs();

        for running in self.running.values() {
            let op = running.spec.operator;
            let link = running.spec.link_name.as_str();
            let outputs = running.operator.outputs();

            for mut spec in outputs.addresses {
                spec.config_layer = ConfigLayer::Operator;
                let id = operator_prefixed_id(op, link, &format!("addresses/{}", spec.id()));
                publish(rt, &id, spec)?;
            }

            for mut spec in outputs.links {
                spec.config_layer = ConfigLayer::Operator;
                let id = operator_prefixed_id(op, link, &format!("links/{}", spec.name));
                publish(rt, &id, spec)?;
            }

            for mut spec in outputs.routes {
                spec.config_layer = ConfigLayer::Operator;
                let id = operator_prefixed_id(op, link, &format!("routes/{}", spec.id()));
                publish(rt, &id, spec)?;
            }

            if let Some(mut spec) = outputs.hostname {
                spec.config_layer = ConfigLayer::Operator;
                publish(rt, &operator_prefixed_id(op, link, HOSTNAME_ID), spec)?;
            }

            if let Some(mut spec) = outputs.resolver {
                spec.config_layer = ConfigLayer::Operator;
                publish(rt, &operator_prefixed_id(op, link, RESOLVER_ID), spec)?;
            }

            if let Some(mut spec) = outputs.time_server {
                spec.config_layer = ConfigLayer::Operator;
                publish(rt, &operator_prefixed_id(op, link, TIME_SERVER_ID), spec)?;
            }
        }

        rt.cleanup_outputs::<AddressSpec>(Namespace::Config)?;
        rt.cleanup_outputs::<LinkSpec>(Namespace::Config)?;
        rt.cleanup_outputs::<RouteSpec>(Namespace::Config)?;
        rt.cleanup_outputs::<HostnameSpec>(Namespace::Config)?;
        rt.cleanup_outputs::<ResolverSpec>(Namespace::Config)?;
        rt.cleanup_outputs::<TimeServerSpec>(Namespace::Config)
    }
}

fn publish<T: crate::resources::ResourceSpec>(
    rt: &mut ControllerRuntime,
    id: &str,
    spec: T,
) -> Result<()> {
    rt.modify::<T, _>(Namespace::Config, id, |current| {
        *current = spec;
        Ok(())
    })
}

#[async_trait]
impl Controller for OperatorSpecController {
    fn name(&self) -> String {
        "OperatorSpecController".to_string()
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak(Namespace::Network, Kind::OperatorSpec),
            Input::weak(Namespace::Network, Kind::LinkStatus),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![
            Output::shared(Kind::AddressSpec),
            Output::shared(Kind::LinkSpec),
            Output::shared(Kind::RouteSpec),
            Output::shared(Kind::HostnameSpec),
            Output::shared(Kind::ResolverSpec),
            Output::shared(Kind::TimeServerSpec),
        ]
    }

    async fn run(&mut self, rt: &mut ControllerRuntime) -> Result<()> {
        let result = loop {
            let outcome = tokio::select! {
                more = rt.event() => {
                    if !more {
                        break Ok(());
                    }

                    self.reconcile_operators(rt).await
                }
                Some(()) = self.notify_rx.recv() => self.reconcile_outputs(rt),
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
    use crate::resources::{LinkType, OperState, VipOperatorSpec};
    use crate::runtime::State;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Publishes a fixed address; optionally panics on its first run
    struct FixedOperator {
        address: AddressSpec,
        panic_first: bool,
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl NetworkOperator for FixedOperator {
        async fn run(&self, cancel: CancellationToken, notify: OperatorNotifier) {
            if self.runs.fetch_add(1, Ordering::SeqCst) == 0 && self.panic_first {
                panic!("first run");
            }

            notify.notify();
            cancel.cancelled().await;
        }

        fn outputs(&self) -> OperatorOutputs {
            OperatorOutputs {
                addresses: vec![self.address.clone()],
                ..Default::default()
            }
        }
    }

    struct FixedFactory {
        panic_first: bool,
        runs: Arc<AtomicUsize>,
    }

    impl OperatorFactory for FixedFactory {
        fn create(&self, spec: &OperatorSpec) -> Arc<dyn NetworkOperator> {
            Arc::new(FixedOperator {
                address: AddressSpec::permanent(
                    &spec.link_name,
                    "10.0.0.5/24".parse().unwrap(),
                    ConfigLayer::Default,
                ),
                panic_first: self.panic_first,
                runs: self.runs.clone(),
            })
        }
    }

    fn link(state: &State, name: &str, oper_state: OperState) {
        state
            .modify::<LinkStatus, _>("LinkStatusController", Namespace::Network, name, |status| {
                status.link_type = LinkType::Ether;
                status.oper_state = oper_state;
                Ok(())
            })
            .unwrap();
    }

    fn dhcp4(link: &str) -> OperatorSpec {
        OperatorSpec {
            operator: Operator::Dhcp4,
            link_name: link.to_string(),
            require_up: true,
            config_layer: ConfigLayer::Default,
            ..Default::default()
        }
    }

    fn addresses(state: &State) -> Vec<String> {
        state
            .list::<AddressSpec>(Namespace::Config)
            .into_iter()
            .map(|r| r.metadata.id)
            .collect()
    }

    #[tokio::test]
    async fn test_operator_follows_link_state() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut controller = OperatorSpecController::new(Arc::new(FixedFactory {
            panic_first: false,
            runs,
        }));
        let (state, mut rt) = testutil::runtime(&controller);

        link(&state, "eth0", OperState::Down);
        state
            .create("OperatorMergeController", Namespace::Network, "dhcp4/eth0", dhcp4("eth0"))
            .unwrap();

        controller.reconcile_operators(&mut rt).await.unwrap();
        assert!(controller.running().is_empty());

        link(&state, "eth0", OperState::Up);
        controller.reconcile_operators(&mut rt).await.unwrap();

        assert_eq!(controller.running(), vec!["dhcp4/eth0"]);
        assert_eq!(addresses(&state), vec!["dhcp4/eth0/addresses/eth0/10.0.0.5/24"]);

        let published = state
            .get::<AddressSpec>(Namespace::Config, "dhcp4/eth0/addresses/eth0/10.0.0.5/24")
            .unwrap();
        assert_eq!(published.spec.config_layer, ConfigLayer::Operator);

        link(&state, "eth0", OperState::Down);
        controller.reconcile_operators(&mut rt).await.unwrap();

        assert!(controller.running().is_empty());
        assert!(addresses(&state).is_empty());
    }

    #[tokio::test]
    async fn test_spec_change_restarts_operator() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut controller = OperatorSpecController::new(Arc::new(FixedFactory {
            panic_first: false,
            runs,
        }));
        let (state, mut rt) = testutil::runtime(&controller);

        link(&state, "eth0", OperState::Unknown);
        state
            .create("OperatorMergeController", Namespace::Network, "dhcp4/eth0", dhcp4("eth0"))
            .unwrap();

        controller.reconcile_operators(&mut rt).await.unwrap();
        let first = controller.running["dhcp4/eth0"].cancel.clone();

        state
            .modify::<OperatorSpec, _>("OperatorMergeController", Namespace::Network, "dhcp4/eth0", |spec| {
                spec.dhcp4.route_metric = 512;
                Ok(())
            })
            .unwrap();
        controller.reconcile_operators(&mut rt).await.unwrap();

        assert!(first.is_cancelled());
        assert_eq!(controller.running["dhcp4/eth0"].spec.dhcp4.route_metric, 512);

        controller.stop_all().await;
    }

    #[tokio::test]
    async fn test_panicking_operator_restarted() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut controller = OperatorSpecController::new(Arc::new(FixedFactory {
            panic_first: true,
            runs: runs.clone(),
        }))
        .with_backoff(Duration::from_millis(1), Duration::from_millis(10));
        let (state, mut rt) = testutil::runtime(&controller);

        link(&state, "eth0", OperState::Up);
        state
            .create("OperatorMergeController", Namespace::Network, "dhcp4/eth0", dhcp4("eth0"))
            .unwrap();

        controller.reconcile_operators(&mut rt).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while runs.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // the restarted run notifies
        tokio::time::timeout(Duration::from_secs(5), controller.notify_rx.recv())
            .await
            .unwrap();

        assert_eq!(controller.running(), vec!["dhcp4/eth0"]);
        controller.stop_all().await;
    }

    #[tokio::test]
    async fn test_vip_operator_claims_address() {
        let spec = OperatorSpec {
            operator: Operator::Vip,
            link_name: "eth0".into(),
            vip: VipOperatorSpec {
                ip: Some("10.0.0.100".parse().unwrap()),
                gratuitous_arp: true,
            },
            ..Default::default()
        };

        let operator = DefaultOperatorFactory.create(&spec);
        assert!(operator.outputs().addresses.is_empty());

        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let task = {
            let operator = operator.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { operator.run(cancel, OperatorNotifier(tx)).await })
        };

        rx.recv().await.unwrap();
        let outputs = operator.outputs();
        assert_eq!(outputs.addresses.len(), 1);
        assert_eq!(outputs.addresses[0].address, "10.0.0.100/32".parse().unwrap());

        cancel.cancel();
        task.await.unwrap();
        assert!(operator.outputs().addresses.is_empty());
    }
}
