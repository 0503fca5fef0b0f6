//! Chrome user-data directories for launched browsers
//!
//! Every browser incarnation gets its own UUID-named profile directory so a
//! relaunch never collides with the SingletonLock of the process it replaces.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Prefix of every profile directory this crate creates in the temp dir
pub const PROFILE_PREFIX: &str = "fixture_sync_chrome";

/// Owned profile directory, removed on drop unless [`into_path`](Self::into_path) is called
#[derive(Debug)]
pub struct BrowserProfile {
    path: PathBuf,
    cleanup_on_drop: bool,
}

impl BrowserProfile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            cleanup_on_drop: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hand the directory to another owner (the launched browser)
    pub fn into_path(mut self) -> PathBuf {
        self.cleanup_on_drop = false;
        std::mem::take(&mut self.path)
    }
}

impl Drop for BrowserProfile {
    fn drop(&mut self) {
        if self.cleanup_on_drop && self.path.exists() {
            debug!("Removing unused profile directory {}", self.path.display());
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                warn!("Failed to remove profile directory {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Create `<root>/<prefix>_<uuid>` atomically
pub fn create_unique_profile_in(root: &Path, prefix: &str) -> Result<BrowserProfile> {
    let path = root.join(format!("{}_{}", prefix, Uuid::new_v4()));

    // create_dir (not create_dir_all) so a collision fails loudly
    std::fs::create_dir(&path)
        .with_context(|| format!("Failed to create profile directory: {}", path.display()))?;

    debug!("Created Chrome profile directory: {}", path.display());
    Ok(BrowserProfile::new(path))
}

/// Remove profile directories under `dir` left behind by crashed runs.
///
/// Only directories carrying [`PROFILE_PREFIX`] and untouched for longer than
/// `min_age` are removed.
pub fn cleanup_stale_profiles_in(dir: &Path, min_age: Duration) -> Result<usize> {
    let now = SystemTime::now();
    let mut cleaned = 0;

    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read temp directory: {}", dir.display()))?;

    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.starts_with(PROFILE_PREFIX) || !path.is_dir() {
            continue;
        }

        let age = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < min_age {
            continue;
        }

        match std::fs::remove_dir_all(&path) {
            Ok(()) => cleaned += 1,
            Err(e) => warn!("Failed to remove stale profile {}: {}", path.display(), e),
        }
    }

    if cleaned > 0 {
        info!("Cleaned {} stale Chrome profile directories", cleaned);
    }
    Ok(cleaned)
}
