//! Writes through page protection.

use crate::error::HookError;
use std::ffi::c_void;
use std::mem;
use windows::Win32::System::Memory::{VirtualProtect, PAGE_PROTECTION_FLAGS, PAGE_READWRITE};

/// Store `value` into a pointer-sized slot that may live on a read-only page
/// (the import address table usually does), then restore the old protection.
/// Returns the previous slot value.
///
/// # Safety
/// `slot` must be a valid, aligned pointer-sized location in this process.
pub unsafe fn write_protected(slot: *mut usize, value: usize) -> Result<usize, HookError> {
    let size = mem::size_of::<usize>();
    let mut old = PAGE_PROTECTION_FLAGS(0);

    VirtualProtect(slot as *const c_void, size, PAGE_READWRITE, &mut old).map_err(|e| {
        HookError::ProtectFailed {
            address: slot as usize,
            source: std::io::Error::other(e),
        }
    })?;

    let previous = std::ptr::replace(slot, value);

    let mut ignored = PAGE_PROTECTION_FLAGS(0);
    if let Err(e) = VirtualProtect(slot as *const c_void, size, old, &mut ignored) {
        log::warn!("Failed to restore protection at {:?}: {}", slot, e);
    }

    log::trace!("Slot {:?}: {:#x} -> {:#x}", slot, previous, value);
    Ok(previous)
}
