//! Detection of DRM wrappers that delay the host's real entry point.

use super::parser::PeFile;
use std::fmt;

/// A known executable wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrmKind {
    /// Steam's executable stub; its unpacker lives in a `.bind` section and
    /// restores the original code and imports before jumping to the real
    /// entry point.
    SteamStub,
}

impl DrmKind {
    /// Advice printed when the wrapper is found.
    pub fn warning(&self) -> &'static str {
        match self {
            DrmKind::SteamStub => {
                "Steam DRM (SteamStub) detected. Code patches made before the game unpacks \
                 itself may be overwritten; mod loading will be delayed until the game's first \
                 import call."
            }
        }
    }
}

impl fmt::Display for DrmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DrmKind::SteamStub => write!(f, "SteamStub"),
        }
    }
}

/// Detect wrappers present in the image.
pub fn detect(pe: &PeFile) -> Vec<DrmKind> {
    let mut found = Vec::new();

    if pe.section(".bind").is_some() {
        found.push(DrmKind::SteamStub);
    }

    found
}

/// Log a warning for each detected wrapper.
pub fn log_warnings(found: &[DrmKind]) {
    for kind in found {
        log::warn!("{}", kind.warning());
    }
}
