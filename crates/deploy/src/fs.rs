//! Host filesystem helpers for container mounts.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

/// Create `path` (and any missing parents) and open its permissions so
/// container users can write into it.
pub fn create_host_data_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("Failed to create data directory {}", path.display()))?;
    set_writable(path)
}

#[cfg(unix)]
fn set_writable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = fs::metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?
        .permissions();
    permissions.set_mode(0o777);
    fs::set_permissions(path, permissions)
        .with_context(|| format!("Failed to set permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn set_writable(_path: &Path) -> Result<()> {
    Ok(())
}
