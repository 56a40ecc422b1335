//! # Ciel Container Manager
//!
//! Ciel runs throwaway build containers on top of a stack of directory
//! layers merged with OverlayFS.
//!
//! ## Features
//!
//! - **Layered root filesystem**: read-only stub, configuration, toolchain and
//!   cache layers under one writable upper layer
//! - **Lazy start**: the filesystem is mounted and the container started on
//!   the first command
//! - **Boot or chroot**: containers with an init system are booted with
//!   systemd-nspawn, others get chroot sessions
//!
//! ## Usage
//!
//! ```no_run
//! use ciel::runtime::CielConfig;
//! use ciel::Container;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> ciel_common::CielResult<()> {
//! let config = CielConfig::discover()?;
//! let container = Container::new("buildkit", "/var/lib/ciel/buildkit", &config)?;
//!
//! let ctx = CancellationToken::new();
//! let status = container.run_command(&ctx, "cat /etc/os-release").await?;
//! println!("exited with {status}");
//!
//! container.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod cli;
pub mod filesystem;
pub mod runtime;
pub mod testing;

pub use runtime::Container;
