//! Mod loader that loads a configured list of native libraries.

use anyhow::Context;
use loader_core::ModLoader;
use std::path::{Path, PathBuf};

/// Check a library path before handing it to the OS loader.
pub fn validate_library_path(path: &Path) -> anyhow::Result<()> {
    if !path.is_absolute() {
        anyhow::bail!("Mod library path must be absolute: {}", path.display());
    }

    if !path.exists() {
        anyhow::bail!("Mod library not found: {}", path.display());
    }

    if path.extension().and_then(|s| s.to_str()) != Some("dll") {
        log::warn!("Mod library does not have .dll extension: {}", path.display());
    }

    Ok(())
}

/// Loads each library, in order, into the current process. The first
/// failure stops loading.
pub struct LibraryModLoader {
    libraries: Vec<PathBuf>,
}

impl LibraryModLoader {
    pub fn new(libraries: Vec<PathBuf>) -> Self {
        Self { libraries }
    }

    pub fn libraries(&self) -> &[PathBuf] {
        &self.libraries
    }
}

impl ModLoader for LibraryModLoader {
    fn load_for_current_process(&self) -> anyhow::Result<()> {
        if self.libraries.is_empty() {
            log::info!("No mod libraries configured");
            return Ok(());
        }

        for path in &self.libraries {
            validate_library_path(path)?;
            load_library(path).with_context(|| format!("Failed to load {}", path.display()))?;
            log::info!("Loaded mod library: {}", path.display());
        }

        Ok(())
    }
}

#[cfg(windows)]
fn load_library(path: &Path) -> anyhow::Result<()> {
    use windows::core::HSTRING;
    use windows::Win32::System::LibraryLoader::LoadLibraryW;

    // The module stays loaded for the life of the process.
    unsafe { LoadLibraryW(&HSTRING::from(path.as_os_str()))? };
    Ok(())
}

#[cfg(not(windows))]
fn load_library(path: &Path) -> anyhow::Result<()> {
    anyhow::bail!(
        "Loading native mod libraries is only supported on Windows ({})",
        path.display()
    )
}
