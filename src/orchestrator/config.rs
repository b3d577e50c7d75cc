//! Build configuration parsing.
//!
//! Repositories carry a YAML file describing the container image, the
//! commands to run, and an optional environment matrix. Each matrix
//! combination becomes one job.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::{GantryError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct BuildDefinition {
    pub image: String,
    pub commands: Vec<String>,
    /// Each entry is one environment combination; an empty matrix
    /// yields a single job with no extra environment.
    #[serde(default)]
    pub matrix: Vec<BTreeMap<String, String>>,
}

impl BuildDefinition {
    /// Expand the matrix into per-job environment lists. Entries use
    /// `KEY=VALUE` form and are ordered by key within a combination.
    pub fn expand(&self) -> Vec<Vec<String>> {
        if self.matrix.is_empty() {
            return vec![Vec::new()];
        }
        self.matrix
            .iter()
            .map(|combo| {
                combo
                    .iter()
                    .map(|(key, value)| format!("{}={}", key, value))
                    .collect()
            })
            .collect()
    }
}

pub fn parse_build_definition(raw: &str) -> Result<BuildDefinition> {
    let definition: BuildDefinition = serde_yaml::from_str(raw)
        .map_err(|e| GantryError::BuildConfig(format!("invalid build config: {}", e)))?;
    if definition.image.trim().is_empty() {
        return Err(GantryError::BuildConfig(
            "build config has no image".to_string(),
        ));
    }
    if definition.commands.is_empty() {
        return Err(GantryError::BuildConfig(
            "build config has no commands".to_string(),
        ));
    }
    Ok(definition)
}
