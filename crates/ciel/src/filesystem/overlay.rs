//! Union mount primitive and the kernel overlayfs implementation.

use std::fmt;
use std::path::{Path, PathBuf};

use ciel_common::{CielError, CielResult};

/// Something that can stack directories into a single mount.
///
/// `lowers` are ordered topmost first. Implementations must not leave a
/// mount behind when returning an error from [`UnionMount::mount`], and
/// must leave the mount in place when returning an error from
/// [`UnionMount::unmount`].
pub trait UnionMount: Send + Sync + fmt::Debug {
    /// Mount `upper` over `lowers` at `target`, using `work` for bookkeeping.
    fn mount(&self, target: &Path, upper: &Path, work: &Path, lowers: &[PathBuf])
    -> CielResult<()>;

    /// Remove the union mount at `target`.
    fn unmount(&self, target: &Path) -> CielResult<()>;
}

/// Build the overlayfs option string.
#[must_use]
pub fn mount_options(upper: &Path, work: &Path, lowers: &[PathBuf]) -> String {
    let lower = lowers
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(":");

    format!(
        "lowerdir={},upperdir={},workdir={}",
        lower,
        upper.display(),
        work.display()
    )
}

#[cfg(target_os = "linux")]
fn check_lowers(lowers: &[PathBuf]) -> CielResult<()> {
    if lowers.is_empty() {
        return Err(CielError::Config {
            message: "overlayfs needs at least one lower directory".to_string(),
        });
    }
    Ok(())
}

/// Kernel overlayfs.
#[derive(Debug, Clone, Copy, Default)]
pub struct OverlayMount;

impl OverlayMount {
    /// Create the overlayfs driver.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl UnionMount for OverlayMount {
    #[cfg(target_os = "linux")]
    fn mount(
        &self,
        target: &Path,
        upper: &Path,
        work: &Path,
        lowers: &[PathBuf],
    ) -> CielResult<()> {
        use rustix::mount::{MountFlags, mount};
        use std::ffi::CString;

        check_lowers(lowers)?;
        let options = mount_options(upper, work, lowers);

        tracing::debug!(
            target = %target.display(),
            options = %options,
            "Mounting overlayfs"
        );

        let options_c = CString::new(options).map_err(|_| CielError::Config {
            message: "Invalid overlay options (contains null byte)".to_string(),
        })?;

        mount(
            "overlay",
            target,
            c"overlay",
            MountFlags::empty(),
            options_c.as_c_str(),
        )
        .map_err(|e| CielError::Mount {
            target: target.to_path_buf(),
            source: e.into(),
        })?;

        tracing::info!(target = %target.display(), "OverlayFS mounted");
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn mount(
        &self,
        _target: &Path,
        _upper: &Path,
        _work: &Path,
        _lowers: &[PathBuf],
    ) -> CielResult<()> {
        Err(CielError::Unsupported {
            feature: "overlayfs".to_string(),
        })
    }

    #[cfg(target_os = "linux")]
    fn unmount(&self, target: &Path) -> CielResult<()> {
        use rustix::mount::{UnmountFlags, unmount};

        tracing::debug!(target = %target.display(), "Unmounting overlayfs");

        unmount(target, UnmountFlags::empty()).map_err(|e| CielError::Unmount {
            target: target.to_path_buf(),
            source: e.into(),
        })?;

        tracing::info!(target = %target.display(), "OverlayFS unmounted");
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn unmount(&self, _target: &Path) -> CielResult<()> {
        Err(CielError::Unsupported {
            feature: "overlayfs".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_mount_options() {
        let options = mount_options(
            Path::new("/upper"),
            Path::new("/work"),
            &[PathBuf::from("/layer2"), PathBuf::from("/layer1")],
        );

        assert_eq!(
            options,
            "lowerdir=/layer2:/layer1,upperdir=/upper,workdir=/work"
        );
    }

    #[test]
    fn mount_without_lowers_is_a_config_error() {
        let err = OverlayMount::new()
            .mount(Path::new("/t"), Path::new("/u"), Path::new("/w"), &[])
            .unwrap_err();
        assert!(matches!(err, CielError::Config { .. } | CielError::Unsupported { .. }));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn empty_lowers_are_rejected_before_mounting() {
        let err = check_lowers(&[]).unwrap_err();
        assert!(err.to_string().contains("at least one lower"));
        assert!(check_lowers(&[PathBuf::from("/l")]).is_ok());
    }
}
