//! Wireguard Key File
//!
//! The mesh private key is generated once and kept on the state volume.

use super::{write_atomic, STATE_FILE_MODE};
use crate::adapters::wireguard::{parse_key, KEY_LEN};
use crate::error::{Error, Result, ResultExt};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use std::path::Path;
use tracing::info;

/// Key file name below the state directory
pub const KUBESPAN_KEY_FILE: &str = "kubespan.key";

// serializes concurrent loads so only one caller generates
static KEY_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// Fresh curve25519 private key, clamped, base64 encoded
pub fn generate_key() -> String {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);

    key[0] &= 248;
    key[31] &= 127;
    key[31] |= 64;

    STANDARD.encode(key)
}

/// Read the key at `path`, generating and storing one on the first miss
pub fn load_or_generate_key(path: &Path) -> Result<String> {
    let _guard = KEY_LOCK.lock();

    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let key = contents.trim().to_string();

            parse_key(&key).context(format!("validating {}", path.display()))?;

            Ok(key)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let key = generate_key();

            write_atomic(path, key.as_bytes(), STATE_FILE_MODE)?;
            info!(path = %path.display(), "generated wireguard private key");

            Ok(key)
        }
        Err(e) => Err(Error::from(e).context(format!("reading {}", path.display()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    #[test]
    fn test_generate_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(KUBESPAN_KEY_FILE);

        let key = load_or_generate_key(&path).unwrap();
        let decoded = parse_key(&key).unwrap();
        assert_eq!(decoded[0] & 7, 0);
        assert_eq!(decoded[31] & 0xc0, 0x40);

        assert_eq!(load_or_generate_key(&path).unwrap(), key);
    }

    #[test]
    fn test_concurrent_loads_coalesce() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(KUBESPAN_KEY_FILE);

        let keys: Vec<String> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| s.spawn(|| load_or_generate_key(&path).unwrap()))
                .collect();

            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(keys.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_corrupt_key_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(KUBESPAN_KEY_FILE);
        std::fs::write(&path, "garbage").unwrap();

        let err = load_or_generate_key(&path).unwrap_err();
        assert_matches!(err.root(), Error::KeyMaterial(_));
    }
}
