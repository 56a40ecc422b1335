//! Container type and operations.

use std::path::PathBuf;
use std::sync::Arc;

use ciel_common::{CielError, CielResult, ContainerName};
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::filesystem::{LayerSet, LayeredFs, ResolvedLayers};

use super::backend::{BootBackend, ChrootBackend, ContainerCommand, Drivers};
use super::config::CielConfig;
use super::events::{self, EventBus, LifecycleEvent};
use super::lifecycle::{RunState, Session};
use super::nspawn::NspawnBackend;

/// An ephemeral container built from a stack of filesystem layers.
///
/// Nothing is mounted or started on creation. [`Container::run`] mounts the
/// layers and starts the container on first use, booting it when the
/// filesystem has an init system and boot is preferred, and falling back
/// to chroot sessions otherwise. [`Container::shutdown`] stops whatever is
/// running and unmounts; call it before dropping the container.
///
/// A container can be shared between tasks. Mounting, starting and
/// stopping are serialized, so concurrent first calls to `run` start the
/// container exactly once.
#[derive(Debug)]
pub struct Container {
    name: ContainerName,
    fs: Arc<LayeredFs>,
    shell: PathBuf,
    state: RwLock<ControllerState>,
    /// Held for the whole of every state transition.
    transition: Mutex<()>,
    boot: Arc<dyn BootBackend>,
    chroot: Arc<dyn ChrootBackend>,
    events: EventBus,
}

#[derive(Debug)]
struct ControllerState {
    session: Session,
    prefer_boot: bool,
    properties: Vec<String>,
}

impl Container {
    /// Create a container on the standard layer table, using overlayfs and
    /// systemd-nspawn.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or the layer directories
    /// cannot be created under `base_dir`.
    pub fn new(
        name: impl Into<String>,
        base_dir: impl Into<PathBuf>,
        config: &CielConfig,
    ) -> CielResult<Self> {
        let drivers = Drivers::system(NspawnBackend::from_config(config));
        Self::with_drivers(name, base_dir, LayerSet::standard(), config, drivers)
    }

    /// Create a container with an explicit layer table and collaborators.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or the layer directories
    /// cannot be created under `base_dir`.
    pub fn with_drivers(
        name: impl Into<String>,
        base_dir: impl Into<PathBuf>,
        layers: LayerSet,
        config: &CielConfig,
        drivers: Drivers,
    ) -> CielResult<Self> {
        let name = ContainerName::new(name)?;
        let fs = Arc::new(LayeredFs::new(
            layers,
            base_dir,
            drivers.union,
            &config.scratch_dir,
            &config.init_marker,
        )?);

        tracing::debug!(container = %name, base = %fs.base_dir().display(), "Container created");

        Ok(Self {
            name,
            fs,
            shell: config.shell.clone(),
            state: RwLock::new(ControllerState {
                session: Session::Idle,
                prefer_boot: config.prefer_boot,
                properties: config.properties.clone(),
            }),
            transition: Mutex::new(()),
            boot: drivers.boot,
            chroot: drivers.chroot,
            events: EventBus::new(),
        })
    }

    /// Container name.
    #[must_use]
    pub fn name(&self) -> &ContainerName {
        &self.name
    }

    /// Lifecycle events of this container.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> RunState {
        let session = self.state.read().session;
        session.run_state(self.fs.is_mounted())
    }

    /// Whether a boot or chroot session is running.
    #[must_use]
    pub fn is_container_active(&self) -> bool {
        self.state.read().session != Session::Idle
    }

    /// Choose between booting and chrooting.
    ///
    /// With `true` (the default) the container boots when the filesystem
    /// is bootable. With `false` it only ever chroots. A running session
    /// is not affected; the choice applies the next time the container starts.
    pub fn set_preference(&self, prefer_boot: bool) {
        self.state.write().prefer_boot = prefer_boot;
    }

    /// Current boot preference.
    #[must_use]
    pub fn prefers_boot(&self) -> bool {
        self.state.read().prefer_boot
    }

    /// Replace the properties passed to the boot backend.
    ///
    /// Properties are systemd resource-control settings such as
    /// `CPUQuota=80%`. They only apply when the container boots.
    pub fn set_properties(&self, properties: Vec<String>) {
        self.state.write().properties = properties;
    }

    /// Append a property passed to the boot backend.
    pub fn add_property(&self, property: impl Into<String>) {
        self.state.write().properties.push(property.into());
    }

    /// Properties that the next boot will use.
    #[must_use]
    pub fn properties(&self) -> Vec<String> {
        self.state.read().properties.clone()
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
        self.fs.set_base_dir(base)
    }

    /// Layers resolved against the current base directory.
    #[must_use]
    pub fn layers(&self) -> ResolvedLayers {
        self.fs.layers()
    }

    /// Whether the root filesystem is mounted.
    #[must_use]
    pub fn is_file_system_mounted(&self) -> bool {
        self.fs.is_mounted()
    }

    /// Whether the mounted root filesystem can be booted.
    #[must_use]
    pub fn is_bootable(&self) -> bool {
        self.fs.is_bootable()
    }

    /// Where the root filesystem is mounted, if it is.
    #[must_use]
    pub fn mount_target(&self) -> Option<PathBuf> {
        self.fs.target()
    }

    /// Mount the root filesystem. Called by [`Container::run`] as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the union mount fails.
    pub async fn mount(&self) -> CielResult<()> {
        let _transition = self.transition.lock().await;
        self.mount_locked().await
    }

    /// Unmount the root filesystem.
    ///
    /// # Errors
    ///
    /// Returns an error if a session is running or the unmount fails.
    pub async fn unmount(&self) -> CielResult<()> {
        let _transition = self.transition.lock().await;
        let session = self.state.read().session;
        if session != Session::Idle {
            return Err(CielError::Config {
                message: format!("{} is running ({session}); shut it down first", self.name),
            });
        }
        self.unmount_locked().await
    }

    /// Run a shell line through the login shell and return its exit status.
    ///
    /// # Errors
    ///
    /// See [`Container::run`].
    pub async fn run_command(&self, ctx: &CancellationToken, line: &str) -> CielResult<i32> {
        let shell = self.shell.display().to_string();
        self.dispatch(ctx, ContainerCommand::new(shell, &["-l", "-c", line]))
            .await
    }

    /// Run a program in the container and return its exit status.
    ///
    /// Mounts the filesystem and starts the container if needed. Cancelling
    /// `ctx` interrupts this command only; the container keeps running.
    ///
    /// # Errors
    ///
    /// Returns an error if the filesystem cannot be mounted, the container
    /// cannot be started, the backend cannot run the command, or `ctx` is
    /// cancelled. A command that runs and fails is `Ok` with its status.
    pub async fn run<S: AsRef<str>>(
        &self,
        ctx: &CancellationToken,
        program: &str,
        args: &[S],
    ) -> CielResult<i32> {
        self.dispatch(ctx, ContainerCommand::new(program, args))
            .await
    }

    async fn dispatch(&self, ctx: &CancellationToken, command: ContainerCommand) -> CielResult<i32> {
        let (session, target) = self.prepare(ctx).await?;

        tracing::debug!(container = %self.name, mode = %session, command = %command, "Dispatching command");

        let run = async {
            match session {
                Session::Boot => self.boot.run_in_boot(ctx, &self.name, &command).await,
                _ => {
                    self.chroot
                        .run_in_chroot(ctx, &self.name, &target, &command)
                        .await
                }
            }
        };

        let exit_code = tokio::select! {
            biased;
            () = ctx.cancelled() => Err(CielError::Cancelled),
            result = run => result,
        }?;

        tracing::debug!(container = %self.name, exit_code, "Command finished");
        Ok(exit_code)
    }

    /// Make sure the filesystem is mounted and a session is running.
    ///
    /// Gives up with [`CielError::Cancelled`] if `ctx` is cancelled before
    /// the transition lock is taken. A start already underway is not
    /// interrupted.
    async fn prepare(&self, ctx: &CancellationToken) -> CielResult<(Session, PathBuf)> {
        if ctx.is_cancelled() {
            return Err(CielError::Cancelled);
        }

        let session = self.state.read().session;
        if session != Session::Idle {
            if let Some(target) = self.fs.target() {
                return Ok((session, target));
            }
        }

        let _transition = tokio::select! {
            biased;
            () = ctx.cancelled() => return Err(CielError::Cancelled),
            guard = self.transition.lock() => guard,
        };
        self.mount_locked().await?;
        let target = self.fs.target().ok_or_else(|| CielError::Internal {
            message: "filesystem unmounted during transition".to_string(),
        })?;

        let (session, prefer_boot, properties) = {
            let state = self.state.read();
            (state.session, state.prefer_boot, state.properties.clone())
        };
        if session != Session::Idle {
            return Ok((session, target));
        }

        let session = if prefer_boot && self.fs.is_bootable() {
            self.boot.start(&self.name, &target, &properties).await?;
            self.events.publish(LifecycleEvent::Booted {
                name: self.name.to_string(),
                timestamp: events::now(),
            });
            Session::Boot
        } else {
            self.events.publish(LifecycleEvent::ChrootStarted {
                name: self.name.to_string(),
                timestamp: events::now(),
            });
            Session::Chroot
        };

        self.state.write().session = session;
        tracing::info!(container = %self.name, mode = %session, "Container started");
        Ok((session, target))
    }

    /// Stop the running session, if any, and unmount the filesystem.
    ///
    /// Safe to call on a container that was never started.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot stop the session (the
    /// container stays up) or the unmount fails.
    pub async fn shutdown(&self) -> CielResult<()> {
        let _transition = self.transition.lock().await;
        let session = self.state.read().session;

        match session {
            Session::Boot => self.boot.stop(&self.name).await?,
            Session::Chroot => self.chroot.terminate(&self.name).await?,
            Session::Idle => {}
        }

        if session != Session::Idle {
            self.state.write().session = Session::Idle;
            self.events.publish(LifecycleEvent::Stopped {
                name: self.name.to_string(),
                timestamp: events::now(),
            });
            tracing::info!(container = %self.name, mode = %session, "Container stopped");
        }

        self.unmount_locked().await
    }

    async fn mount_locked(&self) -> CielResult<()> {
        if self.fs.is_mounted() {
            return Ok(());
        }
        let fs = self.fs.clone();
        blocking(move || fs.mount()).await?;

        if let Some(target) = self.fs.target() {
            self.events.publish(LifecycleEvent::Mounted {
                name: self.name.to_string(),
                target: target.display().to_string(),
                timestamp: events::now(),
            });
        }
        Ok(())
    }

    async fn unmount_locked(&self) -> CielResult<()> {
        if !self.fs.is_mounted() {
            return Ok(());
        }
        let fs = self.fs.clone();
        let result = blocking(move || fs.unmount()).await;

        if !self.fs.is_mounted() {
            self.events.publish(LifecycleEvent::Unmounted {
                name: self.name.to_string(),
                timestamp: events::now(),
            });
        }
        result
    }
}

/// Run a filesystem operation on the blocking thread pool.
async fn blocking<F>(op: F) -> CielResult<()>
where
    F: FnOnce() -> CielResult<()> + Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| CielError::Internal {
            message: format!("filesystem task failed: {e}"),
        })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{BackendCall, FakeUnionMount, RecordingBackend};
    use std::path::Path;

    fn container(temp: &Path, union: FakeUnionMount, backend: Arc<RecordingBackend>) -> Container {
        let config = CielConfig::default().with_scratch_dir(temp.join("scratch"));
        let drivers = Drivers {
            union: Arc::new(union),
            boot: backend.clone(),
            chroot: backend,
        };
        Container::with_drivers("test", temp.join("base"), LayerSet::standard(), &config, drivers)
            .unwrap()
    }

    #[tokio::test]
    async fn new_container_is_unmounted_and_idle() {
        let temp = tempfile::tempdir().unwrap();
        let c = container(temp.path(), FakeUnionMount::new(), Arc::new(RecordingBackend::new()));

        assert_eq!(c.state(), RunState::Unmounted);
        assert!(!c.is_container_active());
        assert!(c.prefers_boot());
        assert!(c.properties().is_empty());
        assert_eq!(c.name().as_str(), "test");
    }

    #[test]
    fn invalid_name_is_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let config = CielConfig::default().with_scratch_dir(temp.path());
        let backend = Arc::new(RecordingBackend::new());
        let drivers = Drivers {
            union: Arc::new(FakeUnionMount::new()),
            boot: backend.clone(),
            chroot: backend,
        };
        let err = Container::with_drivers("bad name", temp.path(), LayerSet::standard(), &config, drivers)
            .unwrap_err();
        assert!(matches!(err, CielError::InvalidName { .. }));
    }

    #[tokio::test]
    async fn properties_and_preference() {
        let temp = tempfile::tempdir().unwrap();
        let c = container(temp.path(), FakeUnionMount::new(), Arc::new(RecordingBackend::new()));

        c.add_property("CPUQuota=80%");
        c.add_property("MemoryMax=70%");
        assert_eq!(c.properties(), ["CPUQuota=80%", "MemoryMax=70%"]);
        c.set_properties(Vec::new());
        assert!(c.properties().is_empty());

        c.set_preference(false);
        assert!(!c.prefers_boot());
    }

    #[tokio::test]
    async fn run_command_uses_login_shell() {
        let temp = tempfile::tempdir().unwrap();
        let backend = Arc::new(RecordingBackend::new());
        let c = container(temp.path(), FakeUnionMount::new(), backend.clone());

        let ctx = CancellationToken::new();
        assert_eq!(c.run_command(&ctx, "echo hi").await.unwrap(), 0);

        let calls = backend.calls();
        let Some(BackendCall::RunChroot { command, .. }) = calls.last() else {
            panic!("expected a chroot run, got {calls:?}");
        };
        assert_eq!(command.argv().collect::<Vec<_>>(), ["/bin/bash", "-l", "-c", "echo hi"]);
    }

    #[tokio::test]
    async fn boot_start_receives_current_properties() {
        let temp = tempfile::tempdir().unwrap();
        let backend = Arc::new(RecordingBackend::new());
        let c = container(temp.path(), FakeUnionMount::bootable(), backend.clone());
        c.add_property("MemoryMax=1G");

        let ctx = CancellationToken::new();
        c.run(&ctx, "true", &[] as &[&str]).await.unwrap();
        assert_eq!(c.state(), RunState::BootActive);

        let target = c.mount_target().unwrap();
        assert!(backend.calls().contains(&BackendCall::Start {
            machine: "test".into(),
            target,
            properties: vec!["MemoryMax=1G".into()],
        }));
    }

    #[tokio::test]
    async fn chroot_session_is_reused_even_if_bootable() {
        let temp = tempfile::tempdir().unwrap();
        let backend = Arc::new(RecordingBackend::new());
        let c = container(temp.path(), FakeUnionMount::bootable(), backend.clone());
        let ctx = CancellationToken::new();

        c.set_preference(false);
        c.run(&ctx, "true", &[] as &[&str]).await.unwrap();
        assert_eq!(c.state(), RunState::ChrootActive);

        c.set_preference(true);
        c.run(&ctx, "true", &[] as &[&str]).await.unwrap();
        assert_eq!(c.state(), RunState::ChrootActive);
        assert_eq!(backend.start_count(), 0);
    }

    #[tokio::test]
    async fn unmount_refuses_while_running() {
        let temp = tempfile::tempdir().unwrap();
        let c = container(temp.path(), FakeUnionMount::new(), Arc::new(RecordingBackend::new()));
        let ctx = CancellationToken::new();
        c.run(&ctx, "true", &[] as &[&str]).await.unwrap();

        assert!(matches!(c.unmount().await, Err(CielError::Config { .. })));
        assert!(c.is_file_system_mounted());

        c.shutdown().await.unwrap();
        assert_eq!(c.state(), RunState::Unmounted);
    }

    #[tokio::test]
    async fn explicit_mount_and_unmount() {
        let temp = tempfile::tempdir().unwrap();
        let c = container(temp.path(), FakeUnionMount::new(), Arc::new(RecordingBackend::new()));

        c.mount().await.unwrap();
        assert_eq!(c.state(), RunState::MountedIdle);
        c.unmount().await.unwrap();
        assert_eq!(c.state(), RunState::Unmounted);
    }

    #[tokio::test]
    async fn events_follow_the_lifecycle() {
        let temp = tempfile::tempdir().unwrap();
        let c = container(temp.path(), FakeUnionMount::bootable(), Arc::new(RecordingBackend::new()));
        let mut rx = c.events().subscribe();
        let ctx = CancellationToken::new();

        c.run(&ctx, "true", &[] as &[&str]).await.unwrap();
        c.shutdown().await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(match event {
                LifecycleEvent::Mounted { .. } => "mounted",
                LifecycleEvent::Booted { .. } => "booted",
                LifecycleEvent::ChrootStarted { .. } => "chroot",
                LifecycleEvent::Stopped { .. } => "stopped",
                LifecycleEvent::Unmounted { .. } => "unmounted",
            });
        }
        assert_eq!(kinds, ["mounted", "booted", "stopped", "unmounted"]);
    }
}
