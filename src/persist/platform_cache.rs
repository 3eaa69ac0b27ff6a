//! Platform Network Cache
//!
//! YAML snapshot of the last platform network configuration, read at boot
//! before the platform can be queried again.

use super::{write_atomic, STATE_FILE_MODE};
use crate::error::{Error, Result, ResultExt};
use crate::resources::PlatformConfig;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Cache file name below the state directory
pub const PLATFORM_CACHE_FILE: &str = "platform-network-config.yaml";

/// Platform cache file with no-op write suppression
pub struct PlatformCache {
    path: PathBuf,
    last_stored: Mutex<Option<Vec<u8>>>,
}

impl PlatformCache {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(PLATFORM_CACHE_FILE),
            last_stored: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cached snapshot, `None` when nothing was stored yet
    pub fn load(&self) -> Result<Option<PlatformConfig>> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::from(e).context(format!("reading {}", self.path.display())))
            }
        };

        let config: PlatformConfig = serde_yaml::from_slice(&data)
            .map_err(Error::from)
            .context(format!("decoding {}", self.path.display()))?;

        *self.last_stored.lock() = Some(data);

        Ok(Some(config))
    }

    /// Store a snapshot; false when the file already holds the same bytes
    pub fn store(&self, config: &PlatformConfig) -> Result<bool> {
        let data = serde_yaml::to_string(config)?.into_bytes();

        let mut last = self.last_stored.lock();

        if last.as_deref() == Some(data.as_slice()) {
            return Ok(false);
        }

        if std::fs::read(&self.path).ok().as_deref() == Some(data.as_slice()) {
            *last = Some(data);
            return Ok(false);
        }

        write_atomic(&self.path, &data, STATE_FILE_MODE)?;
        debug!(path = %self.path.display(), bytes = data.len(), "stored platform network config");

        *last = Some(data);

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{ConfigLayer, HostnameSpec};
    use tempfile::TempDir;

    fn config() -> PlatformConfig {
        PlatformConfig {
            hostnames: vec![HostnameSpec {
                hostname: "node-e2e".into(),
                domainname: "example.org".into(),
                config_layer: ConfigLayer::Platform,
            }],
            external_ips: vec!["1.2.3.4".parse().unwrap()],
            ..Default::default()
        }
    }

    #[test]
    fn test_store_and_load() {
        let dir = TempDir::new().unwrap();
        let cache = PlatformCache::new(dir.path());

        assert_eq!(cache.load().unwrap(), None);

        assert!(cache.store(&config()).unwrap());
        assert!(!cache.store(&config()).unwrap());

        let fresh = PlatformCache::new(dir.path());
        assert_eq!(fresh.load().unwrap(), Some(config()));
        assert!(!fresh.store(&config()).unwrap());
    }

    #[test]
    fn test_identical_file_not_rewritten() {
        let dir = TempDir::new().unwrap();
        let first = PlatformCache::new(dir.path());
        assert!(first.store(&config()).unwrap());

        let second = PlatformCache::new(dir.path());
        assert!(!second.store(&config()).unwrap());
    }
}
