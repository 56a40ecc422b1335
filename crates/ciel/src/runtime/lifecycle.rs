//! Container lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Observable state of a container.
///
/// ```text
/// Unmounted --mount--> MountedIdle --start--> ChrootActive | BootActive
///     ^                    |  ^                      |
///     +------unmount-------+  +------shutdown--------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunState {
    /// Root filesystem not mounted, nothing running.
    Unmounted,
    /// Root filesystem mounted, nothing running.
    MountedIdle,
    /// Commands run in lightweight chroot sessions.
    ChrootActive,
    /// The container booted its init system.
    BootActive,
}

impl RunState {
    /// Whether a session is running.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::ChrootActive | Self::BootActive)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unmounted => write!(f, "unmounted"),
            Self::MountedIdle => write!(f, "mounted"),
            Self::ChrootActive => write!(f, "chroot"),
            Self::BootActive => write!(f, "booted"),
        }
    }
}

/// Which session, if any, a container is running.
///
/// A single value rather than separate booted/chrooted flags, so the two
/// modes cannot both be active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Session {
    #[default]
    Idle,
    Chroot,
    Boot,
}

impl Session {
    pub(crate) const fn run_state(self, mounted: bool) -> RunState {
        match (self, mounted) {
            (Self::Boot, _) => RunState::BootActive,
            (Self::Chroot, _) => RunState::ChrootActive,
            (Self::Idle, true) => RunState::MountedIdle,
            (Self::Idle, false) => RunState::Unmounted,
        }
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Chroot => write!(f, "chroot"),
            Self::Boot => write!(f, "boot"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_maps_to_run_state() {
        assert_eq!(Session::Idle.run_state(false), RunState::Unmounted);
        assert_eq!(Session::Idle.run_state(true), RunState::MountedIdle);
        assert_eq!(Session::Chroot.run_state(true), RunState::ChrootActive);
        assert_eq!(Session::Boot.run_state(true), RunState::BootActive);
    }

    #[test]
    fn only_sessions_are_active() {
        assert!(!RunState::Unmounted.is_active());
        assert!(!RunState::MountedIdle.is_active());
        assert!(RunState::ChrootActive.is_active());
        assert!(RunState::BootActive.is_active());
    }

    #[test]
    fn display() {
        assert_eq!(RunState::BootActive.to_string(), "booted");
        assert_eq!(Session::Chroot.to_string(), "chroot");
    }
}
