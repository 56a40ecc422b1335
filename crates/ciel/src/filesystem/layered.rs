//! The layered filesystem handle owned by every container.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ciel_common::paths;
use ciel_common::{CielError, CielResult};
use parking_lot::RwLock;

use super::layers::{LayerSet, ResolvedLayers};
use super::overlay::UnionMount;

/// A stack of layer directories under one base directory, mountable as a
/// single root filesystem.
///
/// The handle is mounted exactly when it holds a mount target. Every mount
/// gets a fresh target under the scratch directory.
#[derive(Debug)]
pub struct LayeredFs {
    layers: LayerSet,
    driver: Arc<dyn UnionMount>,
    scratch: PathBuf,
    init_marker: PathBuf,
    state: RwLock<FsState>,
}

#[derive(Debug)]
struct FsState {
    base: PathBuf,
    resolved: ResolvedLayers,
    target: Option<PathBuf>,
}

impl LayeredFs {
    /// Create an unmounted handle rooted at `base`.
    ///
    /// Creates every non-work layer directory that does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error if a layer directory cannot be created.
    pub fn new(
        layers: LayerSet,
        base: impl Into<PathBuf>,
        driver: Arc<dyn UnionMount>,
        scratch: impl Into<PathBuf>,
        init_marker: impl Into<PathBuf>,
    ) -> CielResult<Self> {
        let base = base.into();
        let resolved = layers.resolve(&base);
        resolved.create_dirs()?;

        Ok(Self {
            layers,
            driver,
            scratch: scratch.into(),
            init_marker: init_marker.into(),
            state: RwLock::new(FsState {
                base,
                resolved,
                target: None,
            }),
        })
    }

    /// Move the layer stack to a new base directory.
    ///
    /// # Errors
    ///
    /// Returns an error if a layer directory cannot be created.
    ///
    /// # Panics
    ///
    /// Panics if the filesystem is mounted.
    pub fn set_base_dir(&self, base: impl Into<PathBuf>) -> CielResult<()> {
        let base = base.into();
        let mut state = self.state.write();

        assert!(
            state.target.is_none(),
            "set_base_dir({}) called while mounted",
            base.display()
        );

        let resolved = self.layers.resolve(&base);
        resolved.create_dirs()?;

        tracing::debug!(base = %base.display(), "Layer base directory set");
        state.base = base;
        state.resolved = resolved;
        Ok(())
    }

    /// Current base directory.
    #[must_use]
    pub fn base_dir(&self) -> PathBuf {
        self.state.read().base.clone()
    }

    /// Layers resolved against the current base directory.
    #[must_use]
    pub fn layers(&self) -> ResolvedLayers {
        self.state.read().resolved.clone()
    }

    /// Read-only layer directories, topmost first.
    #[must_use]
    pub fn lower_dirs(&self) -> Vec<PathBuf> {
        self.state.read().resolved.lower_dirs()
    }

    /// Whether the union mount is active.
    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.state.read().target.is_some()
    }

    /// Where the root filesystem is mounted, if it is.
    #[must_use]
    pub fn target(&self) -> Option<PathBuf> {
        self.state.read().target.clone()
    }

    /// Whether the mounted root filesystem contains the init-system binary.
    ///
    /// Always `false` while unmounted.
    #[must_use]
    pub fn is_bootable(&self) -> bool {
        let state = self.state.read();
        state
            .target
            .as_deref()
            .is_some_and(|target| paths::in_root(target, &self.init_marker).exists())
    }

    /// Mount the layer stack at a fresh target.
    ///
    /// Does nothing if already mounted. Blocks on filesystem syscalls; async
    /// callers run it on the blocking pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the target or work directory cannot be created or
    /// the union mount fails. The handle stays unmounted in that case.
    pub fn mount(&self) -> CielResult<()> {
        let mut state = self.state.write();
        if state.target.is_some() {
            return Ok(());
        }

        let target = paths::mount_target(&self.scratch);
        fs::create_dir_all(&target)?;

        let resolved = &state.resolved;
        let lowers = resolved.lower_dirs();
        let mounted = fs::create_dir_all(resolved.work_dir())
            .map_err(CielError::from)
            .and_then(|()| {
                self.driver
                    .mount(&target, resolved.upper_dir(), resolved.work_dir(), &lowers)
            });

        if let Err(err) = mounted {
            discard_dir(&target);
            return Err(err);
        }

        tracing::info!(
            target = %target.display(),
            lowers = lowers.len(),
            "Layered filesystem mounted"
        );
        state.target = Some(target);
        Ok(())
    }

    /// Unmount and remove the target and work directories.
    ///
    /// Does nothing if not mounted. Blocks like [`LayeredFs::mount`]. If the
    /// union mount cannot be removed the
    /// handle stays mounted and no directory is touched. If the mount is
    /// removed but cleanup fails, the handle is unmounted and a
    /// [`CielError::Cleanup`] is returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the unmount or the directory cleanup fails.
    pub fn unmount(&self) -> CielResult<()> {
        let mut state = self.state.write();
        let Some(target) = state.target.clone() else {
            return Ok(());
        };

        self.driver.unmount(&target)?;
        state.target = None;

        let work = state.resolved.work_dir();
        let work_removed = match fs::remove_dir_all(work) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err((work.to_path_buf(), e)),
            _ => Ok(()),
        };
        let target_removed = fs::remove_dir(&target).map_err(|e| (target.clone(), e));

        tracing::info!(target = %target.display(), "Layered filesystem unmounted");
        cleanup_result(work_removed, target_removed)
    }
}

type Removal = Result<(), (PathBuf, io::Error)>;

/// Fold the two cleanup outcomes into one error naming every failed path.
fn cleanup_result(first: Removal, second: Removal) -> CielResult<()> {
    match (first, second) {
        (Ok(()), Ok(())) => Ok(()),
        (Err((path, source)), Ok(())) | (Ok(()), Err((path, source))) => {
            Err(CielError::Cleanup { path, source })
        }
        (Err((first_path, first)), Err((path, second))) => Err(CielError::Cleanup {
            path,
            source: io::Error::new(
                second.kind(),
                format!("{second}; also failed to remove {}: {first}", first_path.display()),
            ),
        }),
    }
}

fn discard_dir(path: &Path) {
    if let Err(e) = fs::remove_dir(path) {
        tracing::warn!(path = %path.display(), error = %e, "Failed to remove unused mount target");
    }
}
