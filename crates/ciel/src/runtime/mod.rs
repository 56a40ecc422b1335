//! Container runtime core.
//!
//! This module provides the [`Container`] type, its lifecycle state and
//! the backends it delegates execution to.

mod backend;
mod config;
mod container;
pub mod events;
mod lifecycle;
mod nspawn;

pub use backend::{BootBackend, ChrootBackend, ContainerCommand, Drivers};
pub use config::CielConfig;
pub use container::Container;
pub use events::{EventBus, LifecycleEvent};
pub use lifecycle::RunState;
pub use nspawn::NspawnBackend;
