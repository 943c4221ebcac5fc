//! Hook target descriptor list.

use crate::error::HookError;
use crate::pe::ImportedModule;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Descriptor list bundled with the loader.
const BUNDLED: &str = include_str!("delay_inject_hooks.json");

/// Candidate functions of one module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookTarget {
    #[serde(rename = "module", alias = "Name")]
    pub module_name: String,
    #[serde(rename = "exports", alias = "Functions")]
    pub export_names: Vec<String>,
}

/// Ordered list of hook targets. Positions are the ordinals written to the
/// entry marker, so the list is never reordered after loading.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookTargets {
    targets: Vec<HookTarget>,
}

impl HookTargets {
    pub fn new(targets: Vec<HookTarget>) -> Self {
        Self { targets }
    }

    /// The list compiled into the loader.
    pub fn bundled() -> Self {
        // The bundled list is validated by tests; fall back to empty rather than panic in a host.
        Self::from_json(BUNDLED).unwrap_or_else(|e| {
            log::error!("Bundled hook descriptor list is invalid: {}", e);
            Self::default()
        })
    }

    pub fn from_json(json: &str) -> Result<Self, HookError> {
        let targets: Vec<HookTarget> =
            serde_json::from_str(json).map_err(HookError::DescriptorParse)?;
        Ok(Self::new(targets))
    }

    /// Load a descriptor file.
    pub fn load(path: &Path) -> Result<Self, HookError> {
        let json = fs::read_to_string(path).map_err(HookError::DescriptorRead)?;
        let targets = Self::from_json(&json)?;
        log::info!(
            "Loaded {} hook targets from {}",
            targets.export_count(),
            path.display()
        );
        Ok(targets)
    }

    /// Load `path` if given, otherwise the bundled list.
    pub fn load_or_bundled(path: Option<&Path>) -> Result<Self, HookError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::bundled()),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &HookTarget> {
        self.targets.iter()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Total number of candidate exports.
    pub fn export_count(&self) -> usize {
        self.targets.iter().map(|t| t.export_names.len()).sum()
    }

    /// Look up the names behind a pair of marker ordinals.
    pub fn name_of(&self, module_ordinal: usize, export_ordinal: usize) -> Option<(&str, &str)> {
        let target = self.targets.get(module_ordinal)?;
        let export = target.export_names.get(export_ordinal)?;
        Some((target.module_name.as_str(), export.as_str()))
    }

    /// Targets an image with these imports would let the engine hook, as
    /// `(module, export)` pairs in list order.
    pub fn imported_by<'a>(&'a self, imports: &[ImportedModule]) -> Vec<(&'a str, &'a str)> {
        let mut found = Vec::new();

        for target in &self.targets {
            let Some(module) = imports
                .iter()
                .find(|m| m.name.eq_ignore_ascii_case(&target.module_name))
            else {
                continue;
            };

            for export in &target.export_names {
                if module.imports(export) {
                    found.push((target.module_name.as_str(), export.as_str()));
                }
            }
        }

        found
    }
}
