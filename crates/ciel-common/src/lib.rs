//! # ciel-common
//!
//! Shared types for the ciel container toolkit:
//! - Container name validation
//! - Standard paths and mount target naming
//! - Common error types

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod paths;

pub use error::{CielError, CielResult};
pub use id::ContainerName;
