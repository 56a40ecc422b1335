//! Test doubles for the union mount and the execution backends.
//!
//! Used by this crate's tests and available to downstream crates that want
//! to exercise code built on [`Container`](crate::Container) without root
//! privileges or systemd.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ciel_common::paths::{self, DEFAULT_INIT_MARKER};
use ciel_common::{CielError, CielResult, ContainerName};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::filesystem::UnionMount;
use crate::runtime::{BootBackend, ChrootBackend, ContainerCommand};

/// Arguments of one [`UnionMount::mount`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountCall {
    /// Mount target.
    pub target: PathBuf,
    /// Upper directory.
    pub upper: PathBuf,
    /// Work directory.
    pub work: PathBuf,
    /// Lower directories, topmost first.
    pub lowers: Vec<PathBuf>,
}

/// A union mount that records calls instead of mounting.
///
/// In merging mode the fake copies the layers into the target, bottom
/// layer first, so that files in higher layers overwrite lower ones the
/// way overlayfs shadows them. Unmounting empties the target again.
#[derive(Debug, Default)]
pub struct FakeUnionMount {
    mounts: Mutex<Vec<MountCall>>,
    unmounts: Mutex<Vec<PathBuf>>,
    fail_mount: AtomicBool,
    fail_unmount: AtomicBool,
    merge: bool,
    init_marker: Option<PathBuf>,
}

impl FakeUnionMount {
    /// A fake that only records calls.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A fake whose mounted filesystem contains the default init marker.
    #[must_use]
    pub fn bootable() -> Self {
        Self {
            init_marker: Some(PathBuf::from(DEFAULT_INIT_MARKER)),
            ..Self::default()
        }
    }

    /// A fake that materializes the merged view in the target.
    #[must_use]
    pub fn merging() -> Self {
        Self {
            merge: true,
            ..Self::default()
        }
    }

    /// Make subsequent mounts fail.
    pub fn fail_mounts(&self, fail: bool) {
        self.fail_mount.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent unmounts fail.
    pub fn fail_unmounts(&self, fail: bool) {
        self.fail_unmount.store(fail, Ordering::SeqCst);
    }

    /// Number of successful mounts.
    pub fn mount_count(&self) -> usize {
        self.mounts.lock().len()
    }

    /// Number of successful unmounts.
    pub fn unmount_count(&self) -> usize {
        self.unmounts.lock().len()
    }

    /// The most recent successful mount.
    pub fn last_mount(&self) -> Option<MountCall> {
        self.mounts.lock().last().cloned()
    }
}

fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    for entry in walkdir::WalkDir::new(from).min_depth(1) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(std::io::Error::other)?;
        let dest = to.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest)?;
        } else {
            fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

fn empty_dir(dir: &Path) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(path)?;
        } else {
            fs::remove_file(path)?;
        }
    }
    Ok(())
}

impl UnionMount for FakeUnionMount {
    fn mount(
        &self,
        target: &Path,
        upper: &Path,
        work: &Path,
        lowers: &[PathBuf],
    ) -> CielResult<()> {
        if self.fail_mount.load(Ordering::SeqCst) {
            return Err(CielError::Mount {
                target: target.to_path_buf(),
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            });
        }

        if self.merge {
            for layer in lowers.iter().rev().map(PathBuf::as_path).chain([upper]) {
                copy_tree(layer, target)?;
            }
        }
        if let Some(marker) = &self.init_marker {
            let marker = paths::in_root(target, marker);
            if let Some(parent) = marker.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(marker, b"")?;
        }

        self.mounts.lock().push(MountCall {
            target: target.to_path_buf(),
            upper: upper.to_path_buf(),
            work: work.to_path_buf(),
            lowers: lowers.to_vec(),
        });
        Ok(())
    }

    fn unmount(&self, target: &Path) -> CielResult<()> {
        if self.fail_unmount.load(Ordering::SeqCst) {
            return Err(CielError::Unmount {
                target: target.to_path_buf(),
                source: std::io::Error::from(std::io::ErrorKind::ResourceBusy),
            });
        }
        if self.merge || self.init_marker.is_some() {
            empty_dir(target)?;
        }
        self.unmounts.lock().push(target.to_path_buf());
        Ok(())
    }
}

/// One call made to a [`RecordingBackend`].
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    Start {
        machine: String,
        target: PathBuf,
        properties: Vec<String>,
    },
    RunBoot {
        machine: String,
        command: ContainerCommand,
    },
    RunChroot {
        machine: String,
        target: PathBuf,
        command: ContainerCommand,
    },
    Stop {
        machine: String,
    },
    Terminate {
        machine: String,
    },
}

/// A boot and chroot backend that records calls and runs nothing.
///
/// Commands "exit" with a configurable status. Starts can be slowed down
/// to widen race windows, made to fail, and commands can be made to hang
/// until cancelled.
#[derive(Debug)]
pub struct RecordingBackend {
    calls: Mutex<Vec<BackendCall>>,
    exit_code: AtomicI32,
    start_delay: Mutex<Duration>,
    fail_start: AtomicBool,
    hang: AtomicBool,
}

impl Default for RecordingBackend {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            exit_code: AtomicI32::new(0),
            start_delay: Mutex::new(Duration::ZERO),
            fail_start: AtomicBool::new(false),
            hang: AtomicBool::new(false),
        }
    }
}

impl RecordingBackend {
    /// A backend whose commands exit with status 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Status returned by every command.
    pub fn set_exit_code(&self, code: i32) {
        self.exit_code.store(code, Ordering::SeqCst);
    }

    /// Sleep this long inside every boot start.
    pub fn set_start_delay(&self, delay: Duration) {
        *self.start_delay.lock() = delay;
    }

    /// Make boot starts fail.
    pub fn fail_starts(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Make commands never finish on their own.
    pub fn hang_commands(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    /// Every call so far, in order.
    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().clone()
    }

    /// Number of boot starts.
    pub fn start_count(&self) -> usize {
        self.count(|c| matches!(c, BackendCall::Start { .. }))
    }

    /// Number of commands run in boot mode.
    pub fn boot_run_count(&self) -> usize {
        self.count(|c| matches!(c, BackendCall::RunBoot { .. }))
    }

    /// Number of commands run in chroot mode.
    pub fn chroot_run_count(&self) -> usize {
        self.count(|c| matches!(c, BackendCall::RunChroot { .. }))
    }

    fn count(&self, pred: impl Fn(&BackendCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: BackendCall) {
        self.calls.lock().push(call);
    }

    async fn finish(&self) -> CielResult<i32> {
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(self.exit_code.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl BootBackend for RecordingBackend {
    async fn start(
        &self,
        machine: &ContainerName,
        target: &Path,
        properties: &[String],
    ) -> CielResult<()> {
        self.record(BackendCall::Start {
            machine: machine.to_string(),
            target: target.to_path_buf(),
            properties: properties.to_vec(),
        });

        let delay = *self.start_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(CielError::backend("boot machine", "start refused"));
        }
        Ok(())
    }

    async fn run_in_boot(
        &self,
        _ctx: &CancellationToken,
        machine: &ContainerName,
        command: &ContainerCommand,
    ) -> CielResult<i32> {
        self.record(BackendCall::RunBoot {
            machine: machine.to_string(),
            command: command.clone(),
        });
        self.finish().await
    }

    async fn stop(&self, machine: &ContainerName) -> CielResult<()> {
        self.record(BackendCall::Stop {
            machine: machine.to_string(),
        });
        Ok(())
    }
}

#[async_trait]
impl ChrootBackend for RecordingBackend {
    async fn run_in_chroot(
        &self,
        _ctx: &CancellationToken,
        machine: &ContainerName,
        target: &Path,
        command: &ContainerCommand,
    ) -> CielResult<i32> {
        self.record(BackendCall::RunChroot {
            machine: machine.to_string(),
            target: target.to_path_buf(),
            command: command.clone(),
        });
        self.finish().await
    }

    async fn terminate(&self, machine: &ContainerName) -> CielResult<()> {
        self.record(BackendCall::Terminate {
            machine: machine.to_string(),
        });
        Ok(())
    }
}
