//! Named memory-mapped handshake slot (Windows).

use super::{segment_name, SlotStorage, SLOT_SIZE};
use crate::error::ReadinessError;
use windows::core::HSTRING;
use windows::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
use windows::Win32::System::Memory::{
    CreateFileMappingW, MapViewOfFile, OpenFileMappingW, UnmapViewOfFile, FILE_MAP_ALL_ACCESS,
    FILE_MAP_READ, MEMORY_MAPPED_VIEW_ADDRESS, PAGE_READWRITE,
};

/// Pagefile-backed named mapping holding the handshake value.
///
/// Unmaps and closes on drop; the OS removes the object with its last handle.
pub struct MappedSlot {
    mapping: HANDLE,
    view: MEMORY_MAPPED_VIEW_ADDRESS,
}

// The view is only accessed through volatile reads and writes of one aligned i32.
unsafe impl Send for MappedSlot {}
unsafe impl Sync for MappedSlot {}

impl MappedSlot {
    fn map(mapping: HANDLE, access: windows::Win32::System::Memory::FILE_MAP) -> std::io::Result<Self> {
        let view = unsafe { MapViewOfFile(mapping, access, 0, 0, SLOT_SIZE) };

        if view.Value.is_null() {
            let error = std::io::Error::last_os_error();
            unsafe {
                let _ = CloseHandle(mapping);
            }
            return Err(error);
        }

        Ok(Self { mapping, view })
    }

    fn cell(&self) -> *mut i32 {
        self.view.Value as *mut i32
    }
}

impl SlotStorage for MappedSlot {
    fn create(pid: u32) -> Result<Self, ReadinessError> {
        let name = segment_name(pid);

        let mapping = unsafe {
            CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                None,
                PAGE_READWRITE,
                0,
                SLOT_SIZE as u32,
                &HSTRING::from(name.as_str()),
            )
        }
        .map_err(|e| ReadinessError::SegmentCreateFailed {
            name: name.clone(),
            source: std::io::Error::other(e),
        })?;

        let slot = Self::map(mapping, FILE_MAP_ALL_ACCESS)
            .map_err(|source| ReadinessError::SegmentCreateFailed { name: name.clone(), source })?;

        log::debug!("Mapped handshake segment '{}' at {:?}", name, slot.view.Value);
        Ok(slot)
    }

    fn open(pid: u32) -> Result<Self, ReadinessError> {
        let name = segment_name(pid);

        let mapping = unsafe { OpenFileMappingW(FILE_MAP_READ.0, false, &HSTRING::from(name.as_str())) }
            .map_err(|e| ReadinessError::SegmentOpenFailed {
                pid,
                source: std::io::Error::other(e),
            })?;

        Self::map(mapping, FILE_MAP_READ)
            .map_err(|source| ReadinessError::SegmentOpenFailed { pid, source })
    }

    fn store(&self, value: i32) -> Result<(), ReadinessError> {
        unsafe { std::ptr::write_volatile(self.cell(), value) };
        Ok(())
    }

    fn load(&self) -> Result<i32, ReadinessError> {
        Ok(unsafe { std::ptr::read_volatile(self.cell()) })
    }
}

impl Drop for MappedSlot {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = UnmapViewOfFile(self.view) {
                log::warn!("Failed to unmap handshake segment: {}", e);
            }
            let _ = CloseHandle(self.mapping);
        }
    }
}
