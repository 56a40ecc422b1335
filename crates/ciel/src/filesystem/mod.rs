//! Layered root filesystems.
//!
//! This module handles:
//! - The layer table and its on-disk directories
//! - OverlayFS mount options and the union mount primitive
//! - Mounting and unmounting a container's merged view

mod layered;
mod layers;
mod overlay;

pub use layered::LayeredFs;
pub use layers::{Layer, LayerDecl, LayerRole, LayerSet, ResolvedLayers};
pub use overlay::{OverlayMount, UnionMount, mount_options};
