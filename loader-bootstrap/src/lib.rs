//! Native entry library: loaded into the host, boots the mod loader.
//!
//! The native stub calls `Initialize` once, after the library is mapped.
//! `DllMain` does nothing beyond reporting success.

mod mods;

#[cfg(windows)]
mod entry;

pub use mods::{validate_library_path, LibraryModLoader};
