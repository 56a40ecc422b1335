//! systemd-nspawn backed execution.
//!
//! Boot mode starts `systemd-nspawn --boot` in the background, waits for the
//! machine to reach the `running` state in machined, and runs commands with
//! `systemd-run -M`. Chroot mode runs each command in its own unregistered
//! `systemd-nspawn` invocation.

use std::collections::HashMap;
use std::io::IsTerminal;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use ciel_common::{CielError, CielResult, ContainerName};
use parking_lot::Mutex;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::backend::{BootBackend, ChrootBackend, ContainerCommand};
use super::config::CielConfig;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Backend driving `systemd-nspawn`, `systemd-run` and `machinectl`.
#[derive(Debug)]
pub struct NspawnBackend {
    boot_timeout: Duration,
    pty: bool,
    machines: Mutex<HashMap<String, Child>>,
    sessions: Mutex<HashMap<String, CancellationToken>>,
}

impl NspawnBackend {
    /// Create a backend that waits up to `boot_timeout` for a machine to boot.
    #[must_use]
    pub fn new(boot_timeout: Duration) -> Self {
        Self {
            boot_timeout,
            pty: std::io::stdin().is_terminal(),
            machines: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Create a backend from the runtime configuration.
    #[must_use]
    pub fn from_config(config: &CielConfig) -> Self {
        Self::new(config.boot_timeout())
    }

    fn session(&self, machine: &ContainerName) -> CancellationToken {
        self.sessions
            .lock()
            .entry(machine.to_string())
            .or_default()
            .clone()
    }
}

impl Default for NspawnBackend {
    fn default() -> Self {
        Self::from_config(&CielConfig::default())
    }
}

/// Arguments for booting `target` as `machine`.
fn boot_args(machine: &ContainerName, target: &Path, properties: &[String]) -> Vec<String> {
    let mut args = vec![
        "--quiet".to_string(),
        "--boot".to_string(),
        "-M".to_string(),
        machine.to_string(),
        "-D".to_string(),
        target.display().to_string(),
    ];
    args.extend(properties.iter().map(|p| format!("--property={p}")));
    args
}

/// Arguments for running a command in a booted machine.
fn run_args(machine: &ContainerName, pty: bool, command: &ContainerCommand) -> Vec<String> {
    let mut args = vec![
        "--quiet".to_string(),
        "--wait".to_string(),
        "-M".to_string(),
        machine.to_string(),
        if pty { "--pty" } else { "--pipe" }.to_string(),
        "--".to_string(),
    ];
    args.extend(command.argv().map(str::to_string));
    args
}

/// Arguments for a one-shot chroot session.
fn chroot_args(machine: &ContainerName, target: &Path, command: &ContainerCommand) -> Vec<String> {
    let mut args = vec![
        "--quiet".to_string(),
        "--register=no".to_string(),
        "-M".to_string(),
        machine.to_string(),
        "-D".to_string(),
        target.display().to_string(),
        "--".to_string(),
    ];
    args.extend(command.argv().map(str::to_string));
    args
}

/// Exit status as a shell would report it.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(1)
}

/// machined's state for `machine`, or `None` if it is not registered.
async fn machine_state(machine: &ContainerName) -> CielResult<Option<String>> {
    let output = Command::new("machinectl")
        .args(["show", "--property=State", "--value", machine.as_str()])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await
        .map_err(|e| CielError::backend("query machine state", e))?;

    if !output.status.success() {
        return Ok(None);
    }
    Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string()))
}

/// Spawn `command` and wait for it, killing it if `ctx` or `session` is cancelled.
async fn supervise(
    ctx: &CancellationToken,
    session: Option<&CancellationToken>,
    mut command: Command,
    operation: &str,
) -> CielResult<i32> {
    command.kill_on_drop(true);
    let mut child = command
        .spawn()
        .map_err(|e| CielError::backend(operation, e))?;

    let session_ended = async {
        match session {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        status = child.wait() => {
            let status = status.map_err(|e| CielError::backend(operation, e))?;
            Ok(exit_code(status))
        }
        () = ctx.cancelled() => {
            let _ = child.kill().await;
            Err(CielError::Cancelled)
        }
        () = session_ended => {
            let _ = child.kill().await;
            Err(CielError::backend(operation, "session terminated"))
        }
    }
}

/// Wait until `state` reports the booting machine as `running`.
///
/// On every failure the boot process is killed and reaped before the error
/// is returned, so nothing keeps the root filesystem busy.
async fn await_running<F, Fut>(mut child: Child, timeout: Duration, mut state: F) -> CielResult<Child>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CielResult<Option<String>>>,
{
    let deadline = Instant::now() + timeout;
    let outcome: CielResult<()> = async {
        loop {
            if state().await?.as_deref() == Some("running") {
                return Ok(());
            }
            let exited = child
                .try_wait()
                .map_err(|e| CielError::backend("boot machine", e))?;
            if let Some(status) = exited {
                return Err(CielError::backend(
                    "boot machine",
                    format!("systemd-nspawn exited early ({status})"),
                ));
            }
            if Instant::now() >= deadline {
                return Err(CielError::backend(
                    "boot machine",
                    format!("machine did not come up within {timeout:?}"),
                ));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
    .await;

    match outcome {
        Ok(()) => Ok(child),
        Err(e) => {
            let _ = child.kill().await;
            Err(e)
        }
    }
}

#[async_trait]
impl BootBackend for NspawnBackend {
    async fn start(
        &self,
        machine: &ContainerName,
        target: &Path,
        properties: &[String],
    ) -> CielResult<()> {
        tracing::info!(container = %machine, target = %target.display(), "Booting container");

        let child = Command::new("systemd-nspawn")
            .args(boot_args(machine, target, properties))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CielError::backend("boot machine", e))?;

        let child = await_running(child, self.boot_timeout, || machine_state(machine))
            .await
            .inspect_err(|e| tracing::warn!(container = %machine, error = %e, "Boot failed"))?;

        self.machines.lock().insert(machine.to_string(), child);
        Ok(())
    }

    async fn run_in_boot(
        &self,
        ctx: &CancellationToken,
        machine: &ContainerName,
        command: &ContainerCommand,
    ) -> CielResult<i32> {
        let mut cmd = Command::new("systemd-run");
        cmd.args(run_args(machine, self.pty, command));
        supervise(ctx, None, cmd, "run command in booted machine").await
    }

    async fn stop(&self, machine: &ContainerName) -> CielResult<()> {
        let child = self.machines.lock().remove(machine.as_str());

        if machine_state(machine).await?.is_some() {
            tracing::info!(container = %machine, "Powering off container");
            let status = Command::new("machinectl")
                .args(["poweroff", machine.as_str()])
                .status()
                .await
                .map_err(|e| CielError::backend("power off machine", e))?;
            if !status.success() && machine_state(machine).await?.is_some() {
                return Err(CielError::backend(
                    "power off machine",
                    format!("machinectl poweroff exited with {status}"),
                ));
            }

            let deadline = Instant::now() + self.boot_timeout;
            while machine_state(machine).await?.is_some() {
                if Instant::now() >= deadline {
                    tracing::warn!(container = %machine, "Poweroff timed out, terminating");
                    let _ = Command::new("machinectl")
                        .args(["terminate", machine.as_str()])
                        .status()
                        .await;
                    break;
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }

        if let Some(mut child) = child {
            let _ = child.wait().await;
        }
        Ok(())
    }
}

#[async_trait]
impl ChrootBackend for NspawnBackend {
    async fn run_in_chroot(
        &self,
        ctx: &CancellationToken,
        machine: &ContainerName,
        target: &Path,
        command: &ContainerCommand,
    ) -> CielResult<i32> {
        let session = self.session(machine);
        let mut cmd = Command::new("systemd-nspawn");
        cmd.args(chroot_args(machine, target, command));
        supervise(ctx, Some(&session), cmd, "run command in chroot").await
    }

    async fn terminate(&self, machine: &ContainerName) -> CielResult<()> {
        if let Some(session) = self.sessions.lock().remove(machine.as_str()) {
            session.cancel();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name() -> ContainerName {
        ContainerName::new("buildkit").unwrap()
    }

    #[test]
    fn boot_args_forward_properties() {
        let args = boot_args(
            &name(),
            Path::new("/tmp/ciel.x"),
            &["CPUQuota=80%".to_string(), "MemoryMax=70%".to_string()],
        );
        assert_eq!(
            args,
            [
                "--quiet",
                "--boot",
                "-M",
                "buildkit",
                "-D",
                "/tmp/ciel.x",
                "--property=CPUQuota=80%",
                "--property=MemoryMax=70%"
            ]
        );
    }

    #[test]
    fn run_args_choose_pty_or_pipe() {
        let cmd = ContainerCommand::new("echo", &["hi"]);
        let piped = run_args(&name(), false, &cmd);
        assert_eq!(
            piped,
            ["--quiet", "--wait", "-M", "buildkit", "--pipe", "--", "echo", "hi"]
        );
        assert!(run_args(&name(), true, &cmd).contains(&"--pty".to_string()));
    }

    #[test]
    fn chroot_args_end_with_command() {
        let cmd = ContainerCommand::new("/bin/bash", &["-l", "-c", "make"]);
        let args = chroot_args(&name(), Path::new("/tmp/ciel.y"), &cmd);
        assert_eq!(&args[..2], ["--quiet", "--register=no"]);
        assert_eq!(&args[args.len() - 4..], ["/bin/bash", "-l", "-c", "make"]);
    }

    #[test]
    fn exit_codes() {
        assert_eq!(exit_code(ExitStatus::from_raw(0)), 0);
        assert_eq!(exit_code(ExitStatus::from_raw(3 << 8)), 3);
        // Killed by SIGKILL.
        assert_eq!(exit_code(ExitStatus::from_raw(9)), 137);
    }

    fn sleeper() -> Child {
        Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    fn reaped(pid: u32) -> bool {
        !Path::new(&format!("/proc/{pid}")).exists()
    }

    #[tokio::test]
    async fn failed_state_query_kills_boot_process() {
        let child = sleeper();
        let pid = child.id().unwrap();

        let err = await_running(child, Duration::from_secs(10), || async {
            Err(CielError::backend("query machine state", "machinectl not found"))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, CielError::Backend { .. }));
        assert!(reaped(pid));
    }

    #[tokio::test]
    async fn boot_timeout_kills_boot_process() {
        let child = sleeper();
        let pid = child.id().unwrap();

        let err = await_running(child, Duration::from_millis(100), || async { Ok(None) })
            .await
            .unwrap_err();

        assert!(err.to_string().contains("did not come up"));
        assert!(reaped(pid));
    }

    #[tokio::test]
    async fn early_exit_is_reported() {
        let child = Command::new("true").kill_on_drop(true).spawn().unwrap();
        let err = await_running(child, Duration::from_secs(10), || async { Ok(None) })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exited early"));
    }

    #[tokio::test]
    async fn running_machine_keeps_boot_process() {
        let child = sleeper();
        let pid = child.id().unwrap();

        let mut child = await_running(child, Duration::from_secs(10), || async {
            Ok(Some("running".to_string()))
        })
        .await
        .unwrap();

        assert!(!reaped(pid));
        child.kill().await.unwrap();
    }

    #[tokio::test]
    async fn terminate_without_sessions_is_ok() {
        let backend = NspawnBackend::default();
        backend.terminate(&name()).await.unwrap();
    }

    #[tokio::test]
    async fn terminate_cancels_session_token() {
        let backend = NspawnBackend::default();
        let session = backend.session(&name());
        backend.terminate(&name()).await.unwrap();
        assert!(session.is_cancelled());
        assert!(!backend.session(&name()).is_cancelled());
    }

    #[tokio::test]
    async fn supervise_reports_spawn_failure_as_backend_error() {
        let ctx = CancellationToken::new();
        let cmd = Command::new("/nonexistent/ciel-test-binary");
        let err = supervise(&ctx, None, cmd, "run").await.unwrap_err();
        assert!(matches!(err, CielError::Backend { .. }));
    }

    #[tokio::test]
    async fn supervise_returns_exit_status() {
        let ctx = CancellationToken::new();
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "exit 7"]);
        assert_eq!(supervise(&ctx, None, cmd, "run").await.unwrap(), 7);
    }

    #[tokio::test]
    async fn supervise_kills_on_cancel() {
        let ctx = CancellationToken::new();
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        let started = std::time::Instant::now();
        let err = supervise(&ctx, None, cmd, "run").await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
