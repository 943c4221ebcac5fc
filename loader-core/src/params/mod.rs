//! Boot parameters passed from the native loading stub.
//!
//! The native stub hands over a pointer to a `#[repr(C)]` block whose first
//! field is its schema version. Older stubs send shorter blocks, so every copy
//! goes through a version-tiered reader that only touches the fields the
//! sender's version defines.

use crate::error::SchemaError;
use bitflags::bitflags;
use std::mem;

/// Schema version of [`BootParameters`] understood by this build.
///
/// Bump when appending fields, and add a tier to [`TIERS`].
pub const CURRENT_VERSION: i32 = 7;

bitflags! {
    /// How the loader was brought into the process.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BootFlags: i32 {
        /// Loaded by an external mod loader or DLL hijacking instead of the launcher.
        const LOADED_EXTERNALLY = 1;
    }
}

/// Native parameter block.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BootParameters {
    // Version 1
    pub version: i32,
    pub flags: BootFlags,
    // Version 2 to 7 added no fields.
}

/// A group of fields introduced by one schema version.
struct Tier {
    since: i32,
    /// Offset one past the last byte of the tier.
    end: usize,
    copy: fn(&mut BootParameters, &[u8]) -> Result<(), SchemaError>,
}

/// Tiers in ascending order. Later tiers only ever append.
const TIERS: &[Tier] = &[Tier {
    since: 1,
    end: mem::offset_of!(BootParameters, flags) + mem::size_of::<BootFlags>(),
    copy: copy_tier_1,
}];

fn copy_tier_1(target: &mut BootParameters, bytes: &[u8]) -> Result<(), SchemaError> {
    target.version = read_i32(bytes, mem::offset_of!(BootParameters, version))?;
    target.flags =
        BootFlags::from_bits_retain(read_i32(bytes, mem::offset_of!(BootParameters, flags))?);
    Ok(())
}

impl BootParameters {
    /// Parameters describing this build, as a current stub would send them.
    pub fn current(flags: BootFlags) -> Self {
        Self {
            version: CURRENT_VERSION,
            flags,
        }
    }

    /// Whether the block was produced by a stub at the current schema version.
    pub fn is_latest_version(&self) -> bool {
        self.version == CURRENT_VERSION
    }

    /// Copy a parameter block received as raw bytes.
    ///
    /// A block at the current version is copied verbatim. Anything else is
    /// rebuilt from defaults, tier by tier, up to the sender's version. Versions
    /// newer than [`CURRENT_VERSION`] are read with current semantics and their
    /// trailing fields ignored.
    ///
    /// # Errors
    /// * `SchemaError::InvalidVersion` - version is zero or negative
    /// * `SchemaError::Truncated` - the buffer is shorter than the tiers its version claims
    pub fn copy_from_bytes(bytes: &[u8]) -> Result<Self, SchemaError> {
        let version = read_i32(bytes, 0)?;

        if version <= 0 {
            return Err(SchemaError::InvalidVersion(version));
        }

        if version == CURRENT_VERSION && bytes.len() >= mem::size_of::<Self>() {
            // Same layout on both sides.
            return Ok(unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const Self) });
        }

        let mut result = Self::default();

        for tier in TIERS.iter().take_while(|tier| version >= tier.since) {
            if bytes.len() < tier.end {
                return Err(SchemaError::Truncated {
                    available: bytes.len(),
                    required: tier.end,
                });
            }

            (tier.copy)(&mut result, bytes)?;
        }

        if version > CURRENT_VERSION {
            result.version = CURRENT_VERSION;
            log::warn!(
                "Parameter block version {} is newer than supported version {}",
                version,
                CURRENT_VERSION
            );
        }

        Ok(result)
    }

    /// Copy a parameter block from a native pointer.
    ///
    /// Only the bytes covered by the sender's version are read, so a block from
    /// an older stub may be shorter than `size_of::<BootParameters>()`.
    ///
    /// # Safety
    /// `pointer` must be non-null and point to a readable block at least as long
    /// as the tiers its leading version field claims.
    pub unsafe fn copy_from_raw(pointer: *const BootParameters) -> Result<Self, SchemaError> {
        let version = std::ptr::read_unaligned(pointer as *const i32);

        let readable = if version >= CURRENT_VERSION {
            mem::size_of::<Self>()
        } else {
            TIERS
                .iter()
                .take_while(|tier| version >= tier.since)
                .map(|tier| tier.end)
                .last()
                .unwrap_or(mem::size_of::<i32>())
        };

        let bytes = std::slice::from_raw_parts(pointer as *const u8, readable);
        Self::copy_from_bytes(bytes)
    }
}

fn read_i32(bytes: &[u8], offset: usize) -> Result<i32, SchemaError> {
    let end = offset + mem::size_of::<i32>();
    let field = bytes.get(offset..end).ok_or(SchemaError::Truncated {
        available: bytes.len(),
        required: end,
    })?;

    Ok(i32::from_le_bytes([field[0], field[1], field[2], field[3]]))
}
