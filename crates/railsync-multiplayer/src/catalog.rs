//! Rolling-stock catalog with nearest-length substitution.
//!
//! A joining player may drive stock this node does not have. Instead of
//! refusing the train, the catalog hands out the known car whose length is
//! closest to the one the remote side declared.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::sim::{CarKind, TrainCar};

/// Errors raised while scanning rolling-stock definitions.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// A directory or file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A definition file is not valid RON.
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: ron::error::SpannedError,
    },
}

/// What the catalog knows about one car definition.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CarSpec {
    /// Length in metres.
    pub length: f32,
    /// Vehicle type.
    pub kind: CarKind,
}

/// Outcome of [`CarCatalog::resolve`].
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCar {
    /// Path of the definition actually used.
    pub path: String,
    /// Its properties.
    pub spec: CarSpec,
    /// `true` when `path` differs from the one asked for.
    pub substituted: bool,
}

/// Known rolling stock keyed by path, in path order.
#[derive(Debug, Clone, Default)]
pub struct CarCatalog {
    entries: BTreeMap<String, CarSpec>,
}

impl CarCatalog {
    /// An empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition.
    pub fn insert(&mut self, path: impl Into<String>, spec: CarSpec) {
        self.entries.insert(path.into(), spec);
    }

    /// Number of definitions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Read every `*.ron` file below `dir`. Keys are paths relative to `dir`
    /// with `/` separators.
    pub fn scan(dir: &Path) -> Result<Self, CatalogError> {
        let mut catalog = Self::new();
        let mut pending = vec![dir.to_path_buf()];

        while let Some(current) = pending.pop() {
            let entries = std::fs::read_dir(&current).map_err(|source| CatalogError::Io {
                path: current.clone(),
                source,
            })?;
            for entry in entries {
                let path = entry
                    .map_err(|source| CatalogError::Io {
                        path: current.clone(),
                        source,
                    })?
                    .path();
                if path.is_dir() {
                    pending.push(path);
                } else if path.extension().is_some_and(|ext| ext == "ron") {
                    let text = std::fs::read_to_string(&path).map_err(|source| CatalogError::Io {
                        path: path.clone(),
                        source,
                    })?;
                    let spec: CarSpec = ron::from_str(&text).map_err(|source| CatalogError::Parse {
                        path: path.clone(),
                        source,
                    })?;
                    catalog.insert(catalog_key(dir, &path), spec);
                }
            }
        }

        tracing::info!(count = catalog.len(), dir = %dir.display(), "rolling stock scanned");
        Ok(catalog)
    }

    /// Exact definition for `path`, or the one whose length is closest to
    /// `wanted_length`. Ties go to the first in path order. `None` only when
    /// the catalog is empty.
    pub fn resolve(&self, path: &str, wanted_length: f32) -> Option<ResolvedCar> {
        if let Some(spec) = self.entries.get(path) {
            return Some(ResolvedCar {
                path: path.to_string(),
                spec: *spec,
                substituted: false,
            });
        }

        let mut best: Option<(&String, &CarSpec, f32)> = None;
        for (candidate, spec) in &self.entries {
            let gap = (spec.length - wanted_length).abs();
            if best.is_none_or(|(_, _, best_gap)| gap < best_gap) {
                best = Some((candidate, spec, gap));
            }
        }

        best.map(|(candidate, spec, _)| {
            tracing::warn!(missing = path, substitute = %candidate, "rolling stock substituted");
            ResolvedCar {
                path: candidate.clone(),
                spec: *spec,
                substituted: true,
            }
        })
    }

    /// Build a car for `path`, substituting when needed. With an empty
    /// catalog the car is built as a plain wagon of the declared length.
    pub fn build_car(&self, car_id: &str, path: &str, length: f32, flipped: bool) -> TrainCar {
        let mut car = match self.resolve(path, length) {
            Some(resolved) => TrainCar::new(car_id, resolved.path, resolved.spec.kind, resolved.spec.length),
            None => {
                tracing::warn!(path, "no rolling stock available, using a bare wagon");
                TrainCar::new(car_id, path, CarKind::Wagon, length)
            }
        };
        car.flipped = flipped;
        car
    }
}

fn catalog_key(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
