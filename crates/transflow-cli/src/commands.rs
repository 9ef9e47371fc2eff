//! Subcommand implementations, kept apart from argument parsing so they can
//! be tested without a process.

use anyhow::{Context, Result};
use serde_json::Value;
use std::fs;
use std::path::Path;
use tracing::info;
use transflow_core::{document, GridSpec, Interpolating, InterpolatingVector};

/// A validated document together with its id.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedDocument {
    pub id: String,
    pub vector: InterpolatingVector,
}

impl LoadedDocument {
    pub fn summary(&self) -> String {
        match (self.vector.first_point(), self.vector.last_point()) {
            (Some(first), Some(last)) => format!(
                "{}: {} nodes of length {} on [{}, {}]",
                self.id,
                self.vector.size(),
                self.vector.inner_length(),
                first,
                last
            ),
            _ => format!("{}: empty", self.id),
        }
    }
}

pub fn load(path: &Path, inner_length: usize) -> Result<LoadedDocument> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let json: Value =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    let vector = InterpolatingVector::from_json(&json, inner_length)
        .with_context(|| format!("validating {}", path.display()))?;
    let id = json
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Ok(LoadedDocument { id, vector })
}

pub fn check(path: &Path, inner_length: usize) -> Result<LoadedDocument> {
    let loaded = load(path, inner_length)?;
    info!(id = %loaded.id, nodes = loaded.vector.size(), "document is valid");
    Ok(loaded)
}

/// Interpolates the document onto `grid`; the id is kept.
pub fn resample(path: &Path, inner_length: usize, grid: &GridSpec) -> Result<LoadedDocument> {
    let loaded = load(path, inner_length)?;
    let points = grid.points().context("building target grid")?;
    let vector =
        InterpolatingVector::construct_and_interpolate_from(points, inner_length, &loaded.vector)
            .with_context(|| format!("resampling {}", loaded.id))?;
    info!(
        id = %loaded.id,
        from = loaded.vector.size(),
        to = vector.size(),
        "resampled document"
    );
    Ok(LoadedDocument {
        id: loaded.id,
        vector,
    })
}

/// Writes the document to `output`, or returns its text for stdout.
pub fn emit(loaded: &LoadedDocument, output: Option<&Path>) -> Result<Option<String>> {
    match output {
        Some(path) => {
            document::write_json_file(&loaded.vector, &loaded.id, path)
                .with_context(|| format!("writing {}", path.display()))?;
            Ok(None)
        }
        None => {
            let json = document::to_json(&loaded.vector, &loaded.id)?;
            Ok(Some(serde_json::to_string_pretty(&json)?))
        }
    }
}
