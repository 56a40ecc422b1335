//! Declarative layer tables.
//!
//! A container's root filesystem is described by a fixed table of layer
//! declarations. Each declaration has a role and a stacking key; the key
//! doubles as the directory name under the container's base directory.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use ciel_common::{CielError, CielResult};
use serde::{Deserialize, Serialize};

/// Role a directory plays in the union mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerRole {
    /// Read-only layer.
    Lower,
    /// The single writable layer.
    Upper,
    /// Scratch directory used by the overlay driver.
    Work,
}

impl fmt::Display for LayerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lower => write!(f, "lower"),
            Self::Upper => write!(f, "upper"),
            Self::Work => write!(f, "work"),
        }
    }
}

/// The standard ciel layer table.
const STANDARD_LAYERS: &[(LayerRole, &str)] = &[
    (LayerRole::Work, "99-workdir"),
    (LayerRole::Upper, "99-upperdir"),
    (LayerRole::Lower, "50-cache"),
    (LayerRole::Lower, "10-buildkit"),
    (LayerRole::Lower, "01-stub-config"),
    (LayerRole::Lower, "00-stub"),
];

/// A single layer declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerDecl {
    /// Role in the union mount.
    pub role: LayerRole,
    /// Stacking key, also the directory name under the base directory.
    pub key: String,
}

impl LayerDecl {
    /// Declare a layer.
    pub fn new(role: LayerRole, key: impl Into<String>) -> Self {
        Self {
            role,
            key: key.into(),
        }
    }

    /// Declare a read-only layer.
    pub fn lower(key: impl Into<String>) -> Self {
        Self::new(LayerRole::Lower, key)
    }

    /// Declare the writable layer.
    pub fn upper(key: impl Into<String>) -> Self {
        Self::new(LayerRole::Upper, key)
    }

    /// Declare the work directory.
    pub fn work(key: impl Into<String>) -> Self {
        Self::new(LayerRole::Work, key)
    }
}

/// A validated layer table.
///
/// Holds exactly one upper and one work declaration and any number of
/// lower declarations, every key unique.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerSet {
    decls: Vec<LayerDecl>,
}

impl LayerSet {
    /// Validate a layer table.
    ///
    /// # Errors
    ///
    /// Returns [`CielError::Config`] if the table does not have exactly one
    /// upper and one work layer or has no lower layer. Repeated keys and
    /// keys that are not plain directory names are rejected too.
    pub fn new(decls: Vec<LayerDecl>) -> CielResult<Self> {
        let count = |role| decls.iter().filter(|d| d.role == role).count();
        for role in [LayerRole::Upper, LayerRole::Work] {
            let n = count(role);
            if n != 1 {
                return Err(CielError::Config {
                    message: format!("layer table needs exactly one {role} layer, found {n}"),
                });
            }
        }

        // overlayfs refuses an empty lowerdir.
        if count(LayerRole::Lower) == 0 {
            return Err(CielError::Config {
                message: "layer table needs at least one lower layer".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for decl in &decls {
            if !is_plain_name(&decl.key) {
                return Err(CielError::Config {
                    message: format!("layer key {:?} is not a plain directory name", decl.key),
                });
            }
            if !seen.insert(decl.key.as_str()) {
                return Err(CielError::Config {
                    message: format!("duplicate layer key {:?}", decl.key),
                });
            }
        }

        Ok(Self { decls })
    }

    /// The standard table: a cache, buildkit, stub-config and stub stack.
    #[must_use]
    pub fn standard() -> Self {
        Self {
            decls: STANDARD_LAYERS
                .iter()
                .map(|&(role, key)| LayerDecl::new(role, key))
                .collect(),
        }
    }

    /// Declarations in table order.
    pub fn decls(&self) -> &[LayerDecl] {
        &self.decls
    }

    /// Resolve every declaration against a base directory.
    #[must_use]
    pub fn resolve(&self, base: &Path) -> ResolvedLayers {
        ResolvedLayers {
            layers: self
                .decls
                .iter()
                .map(|decl| Layer {
                    role: decl.role,
                    key: decl.key.clone(),
                    path: base.join(&decl.key),
                })
                .collect(),
        }
    }
}

impl Default for LayerSet {
    fn default() -> Self {
        Self::standard()
    }
}

fn is_plain_name(key: &str) -> bool {
    !key.is_empty() && key != "." && key != ".." && !key.contains(['/', ':', ',', '\0'])
}

/// A layer declaration bound to a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    /// Role in the union mount.
    pub role: LayerRole,
    /// Stacking key.
    pub key: String,
    /// Resolved directory.
    pub path: PathBuf,
}

/// A layer table resolved against a base directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLayers {
    layers: Vec<Layer>,
}

impl ResolvedLayers {
    /// All layers in table order.
    pub fn iter(&self) -> impl Iterator<Item = &Layer> {
        self.layers.iter()
    }

    fn single(&self, role: LayerRole) -> &Path {
        // LayerSet guarantees exactly one upper and one work layer.
        self.layers
            .iter()
            .find(|l| l.role == role)
            .map(|l| l.path.as_path())
            .unwrap_or_else(|| unreachable!("validated layer set has a {role} layer"))
    }

    /// The writable layer.
    pub fn upper_dir(&self) -> &Path {
        self.single(LayerRole::Upper)
    }

    /// The overlay work directory.
    pub fn work_dir(&self) -> &Path {
        self.single(LayerRole::Work)
    }

    /// Read-only layers, topmost first.
    ///
    /// Overlayfs gives the first `lowerdir` entry precedence, so the highest
    /// stacking key comes first and shadows everything listed after it.
    #[must_use]
    pub fn lower_dirs(&self) -> Vec<PathBuf> {
        let mut lowers: Vec<&Layer> = self
            .layers
            .iter()
            .filter(|l| l.role == LayerRole::Lower)
            .collect();
        lowers.sort_by(|a, b| b.key.cmp(&a.key));
        lowers.into_iter().map(|l| l.path.clone()).collect()
    }

    /// Layers in stacking order: the work and upper layers, then the lowers topmost first.
    #[must_use]
    pub fn stacking_order(&self) -> Vec<&Layer> {
        let mut ordered: Vec<&Layer> = self.layers.iter().collect();
        ordered.sort_by(|a, b| {
            rank(a.role)
                .cmp(&rank(b.role))
                .then_with(|| b.key.cmp(&a.key))
        });
        ordered
    }

    /// Create every directory except the work directory.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created.
    pub fn create_dirs(&self) -> CielResult<()> {
        for layer in self.layers.iter().filter(|l| l.role != LayerRole::Work) {
            fs::create_dir_all(&layer.path)?;
        }
        Ok(())
    }
}

const fn rank(role: LayerRole) -> u8 {
    match role {
        LayerRole::Work => 0,
        LayerRole::Upper => 1,
        LayerRole::Lower => 2,
    }
}
