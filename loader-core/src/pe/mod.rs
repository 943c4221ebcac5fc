//! PE image reading for the host executable.

pub mod drm;
mod headers;
mod imports;
mod parser;

#[cfg(test)]
pub(crate) mod fixture;

pub use drm::DrmKind;
pub use headers::*;
pub use imports::{find_import_slot, list_imports, ImportedFunction, ImportedModule};
pub use parser::{OptionalHeader, PeFile};
