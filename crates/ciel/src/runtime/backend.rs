//! Execution backends.
//!
//! The lifecycle controller never spawns processes itself. Booting a
//! container, running commands in it and stopping it are delegated to a
//! [`BootBackend`]; one-shot chroot sessions go through a [`ChrootBackend`].

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use ciel_common::{CielResult, ContainerName};
use tokio_util::sync::CancellationToken;

use crate::filesystem::{OverlayMount, UnionMount};

use super::nspawn::NspawnBackend;

/// A program and its arguments, to be run inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerCommand {
    /// Program path or name, resolved inside the container.
    pub program: String,
    /// Arguments, not including the program.
    pub args: Vec<String>,
}

impl ContainerCommand {
    /// Build a command from a program and its arguments.
    pub fn new<S: AsRef<str>>(program: impl Into<String>, args: &[S]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.as_ref().to_string()).collect(),
        }
    }

    /// Program followed by its arguments.
    pub fn argv(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str))
    }
}

impl fmt::Display for ContainerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.argv().collect::<Vec<_>>().join(" "))
    }
}

/// Runs a container as a full init-system instance.
#[async_trait]
pub trait BootBackend: Send + Sync + fmt::Debug {
    /// Boot the root filesystem at `target` as `machine`.
    ///
    /// `properties` are resource-control settings forwarded verbatim.
    async fn start(
        &self,
        machine: &ContainerName,
        target: &Path,
        properties: &[String],
    ) -> CielResult<()>;

    /// Run a command in the booted machine and return its exit status.
    async fn run_in_boot(
        &self,
        ctx: &CancellationToken,
        machine: &ContainerName,
        command: &ContainerCommand,
    ) -> CielResult<i32>;

    /// Power the machine off. Succeeds if it is not running.
    async fn stop(&self, machine: &ContainerName) -> CielResult<()>;
}

/// Runs single commands with a root filesystem as `/`, without an init system.
#[async_trait]
pub trait ChrootBackend: Send + Sync + fmt::Debug {
    /// Start or reuse a chroot session on `target` and run a command in it.
    async fn run_in_chroot(
        &self,
        ctx: &CancellationToken,
        machine: &ContainerName,
        target: &Path,
        command: &ContainerCommand,
    ) -> CielResult<i32>;

    /// End every chroot session of `machine`. Succeeds if none is running.
    async fn terminate(&self, machine: &ContainerName) -> CielResult<()>;
}

/// The collaborators a container delegates to.
#[derive(Debug, Clone)]
pub struct Drivers {
    /// Union mount primitive.
    pub union: Arc<dyn UnionMount>,
    /// Boot-mode backend.
    pub boot: Arc<dyn BootBackend>,
    /// Chroot-mode backend.
    pub chroot: Arc<dyn ChrootBackend>,
}

impl Drivers {
    /// Kernel overlayfs with systemd-nspawn for both modes.
    #[must_use]
    pub fn system(nspawn: NspawnBackend) -> Self {
        let nspawn = Arc::new(nspawn);
        Self {
            union: Arc::new(OverlayMount::new()),
            boot: nspawn.clone(),
            chroot: nspawn,
        }
    }
}
