//! Executable memory allocation with RAII cleanup.

use crate::error::HookError;
use std::ffi::c_void;
use windows::Win32::System::Diagnostics::Debug::FlushInstructionCache;
use windows::Win32::System::Memory::*;
use windows::Win32::System::Threading::GetCurrentProcess;

/// A page of code in this process.
///
/// Freed when dropped, so whoever holds it must be sure no thread is still
/// executing inside it.
pub struct ExecutableMemory {
    address: *mut u8,
    size: usize,
}

// The block is owned exclusively and only read once written.
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}

impl ExecutableMemory {
    /// Allocate an executable block and copy `code` into it.
    ///
    /// # Errors
    /// Returns `HookError::StubAllocationFailed` if the allocation fails.
    pub fn with_code(code: &[u8]) -> Result<Self, HookError> {
        let address = unsafe {
            VirtualAlloc(
                None,
                code.len(),
                MEM_COMMIT | MEM_RESERVE,
                PAGE_EXECUTE_READWRITE,
            )
        };

        if address.is_null() {
            return Err(HookError::StubAllocationFailed(
                std::io::Error::last_os_error(),
            ));
        }

        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), address as *mut u8, code.len());
            if let Err(e) = FlushInstructionCache(GetCurrentProcess(), Some(address as *const c_void), code.len()) {
                log::warn!("FlushInstructionCache failed for {:?}: {}", address, e);
            }
        }

        log::debug!("Wrote {} byte stub at {:?}", code.len(), address);

        Ok(Self {
            address: address as *mut u8,
            size: code.len(),
        })
    }

    pub fn address(&self) -> usize {
        self.address as usize
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = VirtualFree(self.address as *mut c_void, 0, MEM_RELEASE) {
                log::warn!("Failed to free stub memory at {:?}: {}", self.address, e);
            } else {
                log::debug!("Freed stub memory at {:?}", self.address);
            }
        }
    }
}
