//! Controller Contract
//!
//! Controllers declare the resources they read ([`Input`]) and the kinds
//! they write ([`Output`]). The engine hands each controller a
//! [`ControllerRuntime`]: a store handle scoped to the controller's name and
//! declared outputs, plus its coalesced event channel.

use super::state::{Metadata, Resource, ResourceKey, State};
use super::trigger::EventTrigger;
use crate::error::{Error, Result};
use crate::resources::{Kind, Namespace, ResourceSpec};
use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

// =============================================================================
// Inputs and Outputs
// =============================================================================

/// Subscription strength of an input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// Any change schedules the controller; finalizers may be placed
    Strong,
    /// Any change schedules the controller
    Weak,
    /// Only torn-down resources without finalizers schedule the controller
    DestroyReady,
}

/// Declared input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Input {
    pub namespace: Namespace,
    pub kind: Kind,
    pub id: Option<String>,
    pub input_kind: InputKind,
}

impl Input {
    pub fn strong(namespace: Namespace, kind: Kind) -> Self {
        Self {
            namespace,
            kind,
            id: None,
            input_kind: InputKind::Strong,
        }
    }

    pub fn weak(namespace: Namespace, kind: Kind) -> Self {
        Self {
            namespace,
            kind,
            id: None,
            input_kind: InputKind::Weak,
        }
    }

    pub fn destroy_ready(namespace: Namespace, kind: Kind) -> Self {
        Self {
            namespace,
            kind,
            id: None,
            input_kind: InputKind::DestroyReady,
        }
    }

    /// Restrict the input to a single id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Whether a store event for `key` should schedule the controller
    pub fn matches(&self, key: &ResourceKey, destroy_ready: bool) -> bool {
        if self.namespace != key.namespace || self.kind != key.kind {
            return false;
        }

        if let Some(id) = &self.id {
            if *id != key.id {
                return false;
            }
        }

        match self.input_kind {
            InputKind::Strong | InputKind::Weak => true,
            InputKind::DestroyReady => destroy_ready,
        }
    }
}

/// Output ownership mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// Only this controller writes the kind
    Exclusive,
    /// Several controllers write disjoint ids of the kind
    Shared,
}

/// Declared output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Output {
    pub kind: Kind,
    pub output_kind: OutputKind,
}

impl Output {
    pub fn exclusive(kind: Kind) -> Self {
        Self {
            kind,
            output_kind: OutputKind::Exclusive,
        }
    }

    pub fn shared(kind: Kind) -> Self {
        Self {
            kind,
            output_kind: OutputKind::Shared,
        }
    }
}

// =============================================================================
// Controller
// =============================================================================

/// A reconciliation loop scheduled by the engine
#[async_trait]
pub trait Controller: Send {
    fn name(&self) -> String;

    fn inputs(&self) -> Vec<Input>;

    fn outputs(&self) -> Vec<Output>;

    /// Run until cancelled; an error restarts the controller with backoff
    async fn run(&mut self, rt: &mut ControllerRuntime) -> Result<()>;
}

// =============================================================================
// Runtime
// =============================================================================

/// Backoff policy for controller restarts
pub fn restart_backoff(initial: Duration, max: Duration) -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: initial,
        initial_interval: initial,
        multiplier: 2.0,
        max_interval: max,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

/// Store access and scheduling handle of one controller
pub struct ControllerRuntime {
    name: String,
    state: Arc<State>,
    inputs: Vec<Input>,
    outputs: Vec<Output>,
    events: mpsc::Receiver<()>,
    trigger: EventTrigger,
    cancel: CancellationToken,
    touched: Option<HashSet<ResourceKey>>,
    backoff: ExponentialBackoff,
}

impl ControllerRuntime {
    pub fn new(
        name: impl Into<String>,
        inputs: Vec<Input>,
        outputs: Vec<Output>,
        state: Arc<State>,
        cancel: CancellationToken,
        backoff: ExponentialBackoff,
    ) -> Self {
        let (tx, events) = mpsc::channel(1);

        Self {
            name: name.into(),
            state,
            inputs,
            outputs,
            events,
            trigger: EventTrigger::new(tx),
            cancel,
            touched: None,
            backoff,
        }
    }

    /// Runtime for a controller outside of the engine
    pub fn for_controller(controller: &dyn Controller, state: Arc<State>) -> Self {
        Self::new(
            controller.name(),
            controller.inputs(),
            controller.outputs(),
            state,
            CancellationToken::new(),
            restart_backoff(Duration::from_millis(100), Duration::from_secs(30)),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> &[Input] {
        &self.inputs
    }

    pub fn state(&self) -> &Arc<State> {
        &self.state
    }

    pub fn trigger(&self) -> EventTrigger {
        self.trigger.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the next event; false once cancelled
    pub async fn event(&mut self) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            msg = self.events.recv() => msg.is_some(),
        }
    }

    /// Delay before the next restart
    pub(crate) fn next_backoff(&mut self) -> Duration {
        self.backoff
            .next_backoff()
            .unwrap_or(self.backoff.max_interval)
    }

    /// Mark a successful pass so the next failure starts from the initial delay
    pub fn reset_restart_backoff(&mut self) {
        self.backoff.reset();
    }

    fn check_output(&self, kind: Kind) -> Result<()> {
        if self.outputs.iter().any(|o| o.kind == kind) {
            Ok(())
        } else {
            Err(Error::UndeclaredOutput {
                controller: self.name.clone(),
                kind: kind.to_string(),
            })
        }
    }

    fn touch(&mut self, key: ResourceKey) {
        if let Some(touched) = self.touched.as_mut() {
            touched.insert(key);
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn get<T: ResourceSpec>(&self, namespace: Namespace, id: &str) -> Option<Resource<T>> {
        self.state.get(namespace, id)
    }

    pub fn list<T: ResourceSpec>(&self, namespace: Namespace) -> Vec<Resource<T>> {
        self.state.list(namespace)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    pub fn modify<T, F>(&mut self, namespace: Namespace, id: &str, f: F) -> Result<()>
    where
        T: ResourceSpec,
        F: FnOnce(&mut T) -> Result<()>,
    {
        self.modify_with_result(namespace, id, f)
    }

    pub fn modify_with_result<T, F, R>(&mut self, namespace: Namespace, id: &str, f: F) -> Result<R>
    where
        T: ResourceSpec,
        F: FnOnce(&mut T) -> Result<R>,
    {
        self.check_output(T::KIND)?;
        let result = self.state.modify_with_result(&self.name, namespace, id, f)?;
        self.touch(ResourceKey::new(namespace, T::KIND, id));

        Ok(result)
    }

    pub fn teardown<T: ResourceSpec>(&mut self, namespace: Namespace, id: &str) -> Result<bool> {
        self.check_output(T::KIND)?;
        self.state.teardown::<T>(&self.name, namespace, id)
    }

    pub fn destroy<T: ResourceSpec>(&mut self, namespace: Namespace, id: &str) -> Result<()> {
        self.check_output(T::KIND)?;
        self.state.destroy::<T>(&self.name, namespace, id)
    }

    /// Tear down and destroy when no finalizers remain; true once gone
    pub fn teardown_and_destroy<T: ResourceSpec>(&mut self, namespace: Namespace, id: &str) -> Result<bool> {
        if self.teardown::<T>(namespace, id)? {
            self.destroy::<T>(namespace, id)?;
            return Ok(true);
        }

        Ok(false)
    }

    fn check_strong_input(&self, namespace: Namespace, kind: Kind) -> Result<()> {
        if self.inputs.iter().any(|i| {
            i.namespace == namespace && i.kind == kind && i.input_kind == InputKind::Strong
        }) {
            Ok(())
        } else {
            Err(Error::Internal(format!(
                "controller {} has no strong input {}/{}",
                self.name, namespace, kind
            )))
        }
    }

    /// Place the controller's finalizer on a strong input
    pub fn add_finalizer<T: ResourceSpec>(&self, namespace: Namespace, id: &str) -> Result<()> {
        self.check_strong_input(namespace, T::KIND)?;
        self.state.add_finalizer::<T>(namespace, id, &self.name)
    }

    pub fn remove_finalizer<T: ResourceSpec>(&self, namespace: Namespace, id: &str) -> Result<()> {
        self.check_strong_input(namespace, T::KIND)?;
        self.state.remove_finalizer::<T>(namespace, id, &self.name)
    }

    // =========================================================================
    // Output Tracking
    // =========================================================================

    /// Start recording written outputs for [`cleanup_outputs`](Self::cleanup_outputs)
    pub fn start_tracking_outputs(&mut self) {
        self.touched = Some(HashSet::new());
    }

    /// Destroy owned resources of `T` that were not written since tracking started
    pub fn cleanup_outputs<T: ResourceSpec>(&mut self, namespace: Namespace) -> Result<()> {
        self.check_output(T::KIND)?;

        let touched = self.touched.clone().unwrap_or_default();

        let stale: Vec<Metadata> = self
            .state
            .list_metadata(namespace, T::KIND)
            .into_iter()
            .filter(|md| md.owner == self.name && !touched.contains(&md.key()))
            .collect();

        for md in stale {
            let key = md.key();
            if self.state.teardown_key(&self.name, &key)? {
                self.state.destroy_key(&self.name, &key)?;
                debug!(controller = %self.name, resource = %key, "cleaned up stale output");
            }
        }

        Ok(())
    }
}
