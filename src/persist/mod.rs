//! State Volume Persistence
//!
//! Files kept on the state volume across reboots: the cached platform
//! network snapshot and the wireguard mesh private key.

pub mod keyfile;
pub mod platform_cache;

pub use keyfile::{load_or_generate_key, KUBESPAN_KEY_FILE};
pub use platform_cache::{PlatformCache, PLATFORM_CACHE_FILE};

use crate::error::{Error, Result, ResultExt};
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tempfile::NamedTempFile;

/// Mode of files written to the state volume
pub const STATE_FILE_MODE: u32 = 0o400;

/// Write a file atomically: temp file in the target directory, then rename
pub fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Internal(format!("{} has no parent directory", path.display())))?;

    fs::create_dir_all(dir)
        .map_err(Error::from)
        .context(format!("creating {}", dir.display()))?;

    let mut tmp = NamedTempFile::new_in(dir)
        .map_err(Error::from)
        .context(format!("creating temp file in {}", dir.display()))?;

    tmp.write_all(contents)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(Error::from)
        .context(format!("writing {}", path.display()))?;

    fs::set_permissions(tmp.path(), fs::Permissions::from_mode(mode))
        .map_err(Error::from)
        .context(format!("chmod {}", path.display()))?;

    tmp.persist(path)
        .map_err(|e| Error::from(e.error))
        .context(format!("renaming into {}", path.display()))?;

    Ok(())
}
