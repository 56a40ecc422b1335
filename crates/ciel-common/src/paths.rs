//! Standard filesystem paths for ciel.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;

/// Login shell used for shell-line commands inside a container.
pub const DEFAULT_SHELL: &str = "/bin/bash";

/// Init-system binary whose presence makes a root filesystem bootable.
pub const DEFAULT_INIT_MARKER: &str = "/usr/lib/systemd/systemd";

/// Prefix of every transient mount target directory.
pub const MOUNT_TARGET_PREFIX: &str = "ciel.";

/// Scratch directory holding transient mount targets (default: /tmp).
pub static CIEL_SCRATCH_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("CIEL_SCRATCH_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
});

/// Location of the user configuration file, if a config directory is known.
#[must_use]
pub fn config_file() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("ciel").join("config.toml"))
}

/// A fresh mount target path inside `scratch`.
#[must_use]
pub fn mount_target(scratch: &Path) -> PathBuf {
    scratch.join(format!("{MOUNT_TARGET_PREFIX}{}", crate::id::mount_suffix()))
}

/// Resolve an absolute in-container path against a host-side root.
///
/// `Path::join` discards the root when given an absolute path, so the
/// leading `/` is stripped first.
#[must_use]
pub fn in_root(root: &Path, path: &Path) -> PathBuf {
    root.join(path.strip_prefix("/").unwrap_or(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_resolves_inside_root() {
        assert_eq!(
            in_root(Path::new("/tmp/ciel.abc"), Path::new(DEFAULT_INIT_MARKER)),
            PathBuf::from("/tmp/ciel.abc/usr/lib/systemd/systemd")
        );
        assert_eq!(
            in_root(Path::new("/mnt"), Path::new("bin/sh")),
            PathBuf::from("/mnt/bin/sh")
        );
    }

    #[test]
    fn mount_targets_live_in_scratch() {
        let scratch = Path::new("/var/tmp");
        let a = mount_target(scratch);
        let b = mount_target(scratch);
        assert_ne!(a, b);
        assert_eq!(a.parent(), Some(scratch));
        let file_name = a.file_name().and_then(|n| n.to_str()).unwrap();
        assert!(file_name.starts_with(MOUNT_TARGET_PREFIX));
    }

    #[test]
    fn config_file_is_named_config_toml() {
        if let Some(path) = config_file() {
            assert!(path.ends_with("ciel/config.toml"));
        }
    }
}
