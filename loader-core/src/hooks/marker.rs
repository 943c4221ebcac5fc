//! Entry marker cells written by whichever interception fires first.

use crate::error::HookError;
use std::alloc::{self, Layout};
use std::ptr::NonNull;

const UNSET: i32 = -1;

/// Two `i32` cells at a fixed address: module ordinal, then export ordinal.
pub struct EntryMarker {
    cells: NonNull<i32>,
}

unsafe impl Send for EntryMarker {}
unsafe impl Sync for EntryMarker {}

impl EntryMarker {
    fn layout() -> Layout {
        Layout::new::<[i32; 2]>()
    }

    pub fn allocate() -> Result<Self, HookError> {
        let raw = unsafe { alloc::alloc_zeroed(Self::layout()) } as *mut i32;
        let cells = NonNull::new(raw).ok_or(HookError::MarkerAllocationFailed)?;

        unsafe {
            cells.as_ptr().write_volatile(UNSET);
            cells.as_ptr().add(1).write_volatile(UNSET);
        }

        Ok(Self { cells })
    }

    /// Address baked into the interception stubs.
    pub fn cells(&self) -> usize {
        self.cells.as_ptr() as usize
    }

    /// Ordinals of the interception that fired, if any has.
    pub fn read(&self) -> Option<(usize, usize)> {
        let (module, export) = unsafe {
            (
                self.cells.as_ptr().read_volatile(),
                self.cells.as_ptr().add(1).read_volatile(),
            )
        };

        if module < 0 || export < 0 {
            return None;
        }
        Some((module as usize, export as usize))
    }
}

impl Drop for EntryMarker {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.cells.as_ptr() as *mut u8, Self::layout()) };
    }
}
