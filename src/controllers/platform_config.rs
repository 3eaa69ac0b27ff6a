//! Platform Config Controllers
//!
//! The platform snapshot moves through three controllers:
//!
//! - load: publishes the cached snapshot from the state volume once at start
//! - store: persists every new active snapshot, skipping identical bytes
//! - apply: turns the active snapshot (or the cached one while no active
//!   snapshot exists) into platform-layer specs

use super::{pass_done, write_layered};
use crate::error::Result;
use crate::persist::PlatformCache;
use crate::resources::{
    AddressSpec, ConfigLayer, HostnameSpec, Kind, LinkSpec, Namespace, OperatorSpec,
    PlatformConfig, ProbeSpec, ResolverSpec, RouteSpec, TimeServerSpec, HOSTNAME_ID,
    PLATFORM_CONFIG_ACTIVE_ID, PLATFORM_CONFIG_CACHED_ID, RESOLVER_ID, TIME_SERVER_ID,
};
use crate::runtime::{Controller, ControllerRuntime, Input, Output};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Load
// =============================================================================

/// Publishes `PlatformConfig(cached)` from the state volume
pub struct PlatformConfigLoadController {
    cache: Arc<PlatformCache>,
    loaded: bool,
}

impl PlatformConfigLoadController {
    pub fn new(cache: Arc<PlatformCache>) -> Self {
        Self {
            cache,
            loaded: false,
        }
    }

    pub(crate) fn load(&self, rt: &mut ControllerRuntime) -> Result<()> {
        // a broken cache only delays platform networking until the live fetch
        let cached = match self.cache.load() {
            Ok(Some(cached)) => cached,
            Ok(None) => {
                debug!(path = %self.cache.path().display(), "no cached platform config");
                return Ok(());
            }
            Err(e) => {
                warn!(error = %e, "ignoring unreadable platform config cache");
                return Ok(());
            }
        };

        rt.modify::<PlatformConfig, _>(Namespace::Network, PLATFORM_CONFIG_CACHED_ID, |config| {
            *config = cached;
            Ok(())
        })?;

        info!(path = %self.cache.path().display(), "loaded cached platform config");

        Ok(())
    }
}

#[async_trait]
impl Controller for PlatformConfigLoadController {
    fn name(&self) -> String {
        "PlatformConfigLoadController".to_string()
    }

    fn inputs(&self) -> Vec<Input> {
        Vec::new()
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::shared(Kind::PlatformConfig)]
    }

    async fn run(&mut self, rt: &mut ControllerRuntime) -> Result<()> {
        if !self.loaded {
            self.load(rt)?;
            self.loaded = true;
            pass_done(rt);
        }

        while rt.event().await {}

        Ok(())
    }
}

// =============================================================================
// Store
// =============================================================================

/// Persists `PlatformConfig(active)` to the state volume
pub struct PlatformConfigStoreController {
    cache: Arc<PlatformCache>,
}

impl PlatformConfigStoreController {
    pub fn new(cache: Arc<PlatformCache>) -> Self {
        Self { cache }
    }

    pub(crate) fn store(&self, rt: &ControllerRuntime) -> Result<()> {
        let Some(active) = rt.get::<PlatformConfig>(Namespace::Network, PLATFORM_CONFIG_ACTIVE_ID)
        else {
            return Ok(());
        };

        if active.metadata.is_tearing_down() {
            return Ok(());
        }

        if self.cache.store(&active.spec)? {
            info!(path = %self.cache.path().display(), "stored platform config");
        }

        Ok(())
    }
}

#[async_trait]
impl Controller for PlatformConfigStoreController {
    fn name(&self) -> String {
        "PlatformConfigStoreController".to_string()
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::weak(Namespace::Network, Kind::PlatformConfig).with_id(PLATFORM_CONFIG_ACTIVE_ID)]
    }

    fn outputs(&self) -> Vec<Output> {
        Vec::new()
    }

    async fn run(&mut self, rt: &mut ControllerRuntime) -> Result<()> {
        while rt.event().await {
            self.store(rt)?;
            pass_done(rt);
        }

        Ok(())
    }
}

// =============================================================================
// Apply
// =============================================================================

/// Publishes platform-layer specs from the platform snapshot
#[derive(Debug, Default)]
pub struct PlatformConfigApplyController;

/// Active snapshot, falling back to the cached one
fn effective_config(rt: &ControllerRuntime) -> Option<PlatformConfig> {
    [PLATFORM_CONFIG_ACTIVE_ID, PLATFORM_CONFIG_CACHED_ID]
        .into_iter()
        .filter_map(|id| rt.get::<PlatformConfig>(Namespace::Network, id))
        .find(|r| !r.metadata.is_tearing_down())
        .map(|r| r.spec)
}

impl PlatformConfigApplyController {
    pub fn new() -> Self {
        Self
    }

    pub(crate) fn reconcile(&self, rt: &mut ControllerRuntime) -> Result<()> {
        rt.start_tracking_outputs();

        if let Some(config) = effective_config(rt) {
            let layer = ConfigLayer::Platform;

            for mut spec in config.addresses {
                spec.config_layer = layer;
                write_layered(rt, &spec.id(), spec)?;
            }

            for mut spec in config.links {
                spec.config_layer = layer;
                let id = spec.name.clone();
                write_layered(rt, &id, spec)?;
            }

            for mut spec in config.routes {
                spec.config_layer = layer;
                spec.normalize();
                write_layered(rt, &spec.id(), spec)?;
            }

            for mut spec in config.hostnames {
                spec.config_layer = layer;
                write_layered(rt, HOSTNAME_ID, spec)?;
            }

            for mut spec in config.resolvers {
                spec.config_layer = layer;
                write_layered(rt, RESOLVER_ID, spec)?;
            }

            for mut spec in config.time_servers {
                spec.config_layer = layer;
                write_layered(rt, TIME_SERVER_ID, spec)?;
            }

            for mut spec in config.operators {
                spec.config_layer = layer;
                write_layered(rt, &spec.id(), spec)?;
            }

            for mut spec in config.probes {
                spec.config_layer = layer;
                write_layered(rt, &spec.id(), spec)?;
            }
        }

        rt.cleanup_outputs::<AddressSpec>(Namespace::Config)?;
        rt.cleanup_outputs::<LinkSpec>(Namespace::Config)?;
        rt.cleanup_outputs::<RouteSpec>(Namespace::Config)?;
        rt.cleanup_outputs::<HostnameSpec>(Namespace::Config)?;
        rt.cleanup_outputs::<ResolverSpec>(Namespace::Config)?;
        rt.cleanup_outputs::<TimeServerSpec>(Namespace::Config)?;
        rt.cleanup_outputs::<OperatorSpec>(Namespace::Config)?;
        rt.cleanup_outputs::<ProbeSpec>(Namespace::Config)
    }
}

#[async_trait]
impl Controller for PlatformConfigApplyController {
    fn name(&self) -> String {
        "PlatformConfigApplyController".to_string()
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::weak(Namespace::Network, Kind::PlatformConfig)]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![
            Output::shared(Kind::AddressSpec),
            Output::shared(Kind::LinkSpec),
            Output::shared(Kind::RouteSpec),
            Output::shared(Kind::HostnameSpec),
            Output::shared(Kind::ResolverSpec),
            Output::shared(Kind::TimeServerSpec),
            Output::shared(Kind::OperatorSpec),
            Output::shared(Kind::ProbeSpec),
        ]
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
    use crate::persist::PLATFORM_CACHE_FILE;
    use tempfile::TempDir;

    fn snapshot(hostname: &str) -> PlatformConfig {
        PlatformConfig {
            addresses: vec![AddressSpec::permanent(
                "eth0",
                "10.5.0.2/24".parse().unwrap(),
                ConfigLayer::Default,
            )],
            hostnames: vec![HostnameSpec {
                hostname: hostname.into(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_load_publishes_cached() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(PlatformCache::new(dir.path()));
        cache.store(&snapshot("cached-host")).unwrap();

        let controller = PlatformConfigLoadController::new(Arc::new(PlatformCache::new(dir.path())));
        let (state, mut rt) = testutil::runtime(&controller);

        controller.load(&mut rt).unwrap();

        let cached = state
            .get::<PlatformConfig>(Namespace::Network, PLATFORM_CONFIG_CACHED_ID)
            .unwrap();
        assert_eq!(cached.spec, snapshot("cached-host"));
    }

    #[test]
    fn test_load_without_cache() {
        let dir = TempDir::new().unwrap();
        let controller = PlatformConfigLoadController::new(Arc::new(PlatformCache::new(dir.path())));
        let (state, mut rt) = testutil::runtime(&controller);

        controller.load(&mut rt).unwrap();

        assert!(state.list::<PlatformConfig>(Namespace::Network).is_empty());
    }

    #[test]
    fn test_store_active() {
        let dir = TempDir::new().unwrap();
        let controller = PlatformConfigStoreController::new(Arc::new(PlatformCache::new(dir.path())));
        let (state, rt) = testutil::runtime(&controller);

        controller.store(&rt).unwrap();
        assert!(!dir.path().join(PLATFORM_CACHE_FILE).exists());

        state
            .create("platform", Namespace::Network, PLATFORM_CONFIG_ACTIVE_ID, snapshot("live"))
            .unwrap();
        controller.store(&rt).unwrap();

        let stored = PlatformCache::new(dir.path()).load().unwrap();
        assert_eq!(stored, Some(snapshot("live")));
    }

    #[test]
    fn test_apply_prefers_active() {
        let controller = PlatformConfigApplyController::new();
        let (state, mut rt) = testutil::runtime(&controller);

        state
            .create("PlatformConfigLoadController", Namespace::Network, PLATFORM_CONFIG_CACHED_ID, snapshot("cached-host"))
            .unwrap();

        controller.reconcile(&mut rt).unwrap();

        let hostname = state
            .get::<HostnameSpec>(Namespace::Config, "platform/hostname")
            .unwrap();
        assert_eq!(hostname.spec.hostname, "cached-host");
        assert_eq!(hostname.spec.config_layer, ConfigLayer::Platform);

        let address = state
            .get::<AddressSpec>(Namespace::Config, "platform/eth0/10.5.0.2/24")
            .unwrap();
        assert_eq!(address.spec.config_layer, ConfigLayer::Platform);

        let mut live = snapshot("live-host");
        live.addresses.clear();
        state
            .create("platform", Namespace::Network, PLATFORM_CONFIG_ACTIVE_ID, live)
            .unwrap();

        controller.reconcile(&mut rt).unwrap();

        let hostname = state
            .get::<HostnameSpec>(Namespace::Config, "platform/hostname")
            .unwrap();
        assert_eq!(hostname.spec.hostname, "live-host");
        assert!(state.list::<AddressSpec>(Namespace::Config).is_empty());
    }
}
