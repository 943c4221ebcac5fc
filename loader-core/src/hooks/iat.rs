//! Import address table patching for the host executable.

use super::backend::{HookBackend, Interception, ResolutionSkip, ResolvedTarget};
use crate::error::HookError;
use crate::memory::{write_protected, ExecutableMemory};
use crate::pe::find_import_slot;
use crate::shellcode::{interception_stub, StubSpec};
use std::ffi::CString;
use std::sync::{Arc, Mutex};
use windows::core::PCSTR;
use windows::Win32::System::LibraryLoader::{GetModuleHandleA, GetProcAddress};

/// An installed slot patch.
pub struct IatPatch {
    slot: usize,
    original: usize,
    stub: ExecutableMemory,
}

struct Inner {
    image_base: usize,
    /// Stubs of removed patches; a thread may still be running one.
    retired: Mutex<Vec<ExecutableMemory>>,
}

/// Patches the import address table of one mapped image, by default the
/// host executable.
#[derive(Clone)]
pub struct IatBackend {
    inner: Arc<Inner>,
}

impl IatBackend {
    /// Backend for the executable that started the current process.
    pub fn for_host() -> Result<Self, HookError> {
        let module = unsafe { GetModuleHandleA(PCSTR::null()) }
            .map_err(|e| HookError::HostImageUnavailable(std::io::Error::other(e)))?;

        log::debug!("Host image base: {:?}", module.0);
        Ok(Self::for_image(module.0 as usize))
    }

    /// Backend for an image already mapped at `image_base`.
    pub fn for_image(image_base: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                image_base,
                retired: Mutex::new(Vec::new()),
            }),
        }
    }
}

impl HookBackend for IatBackend {
    type Patch = IatPatch;

    fn resolve(&self, module: &str, export: &str) -> Result<ResolvedTarget, ResolutionSkip> {
        let module_name = CString::new(module).map_err(|_| ResolutionSkip::ModuleNotLoaded)?;
        let export_name = CString::new(export).map_err(|_| ResolutionSkip::ExportNotFound)?;

        let handle = unsafe { GetModuleHandleA(PCSTR::from_raw(module_name.as_ptr() as *const u8)) }
            .map_err(|_| ResolutionSkip::ModuleNotLoaded)?;

        let address = unsafe { GetProcAddress(handle, PCSTR::from_raw(export_name.as_ptr() as *const u8)) }
            .ok_or(ResolutionSkip::ExportNotFound)? as usize;

        let slot = unsafe {
            find_import_slot(self.inner.image_base as *const u8, module, export, Some(address))
        }
        .ok_or(ResolutionSkip::NotImported)?;

        Ok(ResolvedTarget {
            address,
            slot: slot as usize,
        })
    }

    fn install(
        &self,
        target: &ResolvedTarget,
        interception: &Interception,
    ) -> Result<IatPatch, HookError> {
        let slot = target.slot as *mut usize;
        // Chain to whatever the slot holds now, which may already be another hook.
        let original = unsafe { slot.read_volatile() };

        let code = interception_stub(&StubSpec {
            marker: interception.marker,
            callback: interception.callback.function as usize,
            context: interception.callback.context as usize,
            original,
        })?;
        let stub = ExecutableMemory::with_code(&code)?;

        unsafe { write_protected(slot, stub.address())? };

        Ok(IatPatch {
            slot: target.slot,
            original,
            stub,
        })
    }

    fn remove(&self, patch: IatPatch) {
        if let Err(e) = unsafe { write_protected(patch.slot as *mut usize, patch.original) } {
            log::warn!("Failed to restore import slot 0x{:X}: {}", patch.slot, e);
        }

        self.inner
            .retired
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(patch.stub);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{EntryCallback, EntryMarker};
    use crate::pe::fixture::ImageBuilder;
    use crate::pe::{PeFile, IMAGE_DIRECTORY_ENTRY_IMPORT, IMAGE_FILE_MACHINE_AMD64, IMAGE_FILE_MACHINE_I386};
    use crate::shellcode::MarkerStore;
    use std::ffi::c_void;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Target = extern "system" fn(i64, f64, i32, f32, i64, f64) -> f64;

    static SEEN: Mutex<Option<(i64, f64, i32, f32, i64, f64)>> = Mutex::new(None);

    extern "system" fn target(a: i64, b: f64, c: i32, d: f32, e: i64, f: f64) -> f64 {
        *SEEN.lock().unwrap() = Some((a, b, c, d, e, f));
        a as f64 + b + c as f64 + d as f64 + e as f64 + f
    }

    unsafe extern "system" fn count_call(context: *const c_void) {
        unsafe { &*(context as *const AtomicUsize) }.fetch_add(1, Ordering::SeqCst);
    }

    fn native_machine() -> u16 {
        if cfg!(target_pointer_width = "64") {
            IMAGE_FILE_MACHINE_AMD64
        } else {
            IMAGE_FILE_MACHINE_I386
        }
    }

    /// A host image with its IAT bound the way the loader leaves it, in
    /// page-aligned memory so slot protection can be changed.
    fn mapped_host(bound: &[(&str, usize)], keep_name_table: bool) -> ExecutableMemory {
        let exports: Vec<&str> = bound.iter().map(|(name, _)| *name).collect();
        let mut image = ImageBuilder::new(native_machine())
            .section(".text", 0x1000, 0x200)
            .import("KERNEL32.dll", &exports)
            .build();

        let pe = PeFile::from_bytes(image.clone()).unwrap();
        let descriptor = pe
            .data_directory(IMAGE_DIRECTORY_ENTRY_IMPORT)
            .unwrap()
            .virtual_address as usize;
        let iat = u32::from_le_bytes(image[descriptor + 16..descriptor + 20].try_into().unwrap()) as usize;

        let width = std::mem::size_of::<usize>();
        for (index, (_, address)) in bound.iter().enumerate() {
            let at = iat + index * width;
            image[at..at + width].copy_from_slice(&address.to_le_bytes());
        }
        if !keep_name_table {
            image[descriptor..descriptor + 4].fill(0);
        }

        ExecutableMemory::with_code(&image).unwrap()
    }

    fn slot_of(image: &ExecutableMemory, export: &str, bound: usize) -> *mut usize {
        unsafe {
            find_import_slot(image.address() as *const u8, "kernel32.dll", export, Some(bound))
        }
        .expect("slot not found")
    }

    #[test]
    fn test_stub_runs_callback_and_preserves_arguments() {
        let original = target as Target as usize;
        let image = mapped_host(&[("GetCommandLineA", 0x1000), ("ExitProcess", original)], true);
        let backend = IatBackend::for_image(image.address());
        let slot = slot_of(&image, "ExitProcess", original);

        let calls = AtomicUsize::new(0);
        let marker = EntryMarker::allocate().unwrap();
        let interception = Interception {
            marker: Some(MarkerStore {
                cells: marker.cells(),
                module_ordinal: 0,
                export_ordinal: 1,
            }),
            callback: EntryCallback {
                function: count_call,
                context: &calls as *const AtomicUsize as *const c_void,
            },
        };
        let resolved = ResolvedTarget {
            address: original,
            slot: slot as usize,
        };

        let patch = backend.install(&resolved, &interception).unwrap();
        let patched = unsafe { slot.read_volatile() };
        assert_eq!(patched, patch.stub.address());
        assert_ne!(patched, original);

        let call: Target = unsafe { std::mem::transmute::<usize, Target>(patched) };
        let result = call(1, 2.5, -3, 4.25, 5, 6.5);

        assert_eq!(result, 1.0 + 2.5 - 3.0 + 4.25 + 5.0 + 6.5);
        assert_eq!(*SEEN.lock().unwrap(), Some((1, 2.5, -3, 4.25, 5, 6.5)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(marker.read(), Some((0, 1)));

        backend.remove(patch);
        assert_eq!(unsafe { slot.read_volatile() }, original);
        assert_eq!(backend.inner.retired.lock().unwrap().len(), 1);

        let direct: Target = unsafe { std::mem::transmute::<usize, Target>(slot.read_volatile()) };
        assert_eq!(direct(0, 0.0, 0, 0.0, 0, 1.0), 1.0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stub_without_marker_still_calls_back() {
        let original = target as Target as usize;
        let image = mapped_host(&[("ExitProcess", original)], true);
        let backend = IatBackend::for_image(image.address());
        let slot = slot_of(&image, "ExitProcess", original);

        let calls = AtomicUsize::new(0);
        let interception = Interception {
            marker: None,
            callback: EntryCallback {
                function: count_call,
                context: &calls as *const AtomicUsize as *const c_void,
            },
        };
        let patch = backend
            .install(
                &ResolvedTarget {
                    address: original,
                    slot: slot as usize,
                },
                &interception,
            )
            .unwrap();

        let call: Target = unsafe { std::mem::transmute::<usize, Target>(slot.read_volatile()) };
        assert_eq!(call(10, 0.5, 1, 0.25, -2, 0.0), 9.75);
        assert_eq!(call(0, 0.0, 0, 0.0, 0, 0.0), 0.0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        backend.remove(patch);
        assert_eq!(unsafe { slot.read_volatile() }, original);
    }

    #[test]
    fn test_resolve_against_loaded_kernel32() {
        let exit = unsafe {
            GetProcAddress(
                GetModuleHandleA(PCSTR::from_raw(b"kernel32.dll\0".as_ptr())).unwrap(),
                PCSTR::from_raw(b"ExitProcess\0".as_ptr()),
            )
        }
        .unwrap() as usize;

        for keep_name_table in [true, false] {
            let image = mapped_host(&[("GetCommandLineA", 0x1000), ("ExitProcess", exit)], keep_name_table);
            let backend = IatBackend::for_image(image.address());

            let resolved = backend.resolve("kernel32.dll", "ExitProcess").unwrap();
            assert_eq!(resolved.address, exit);
            assert_eq!(unsafe { (resolved.slot as *const usize).read() }, exit);

            assert_eq!(
                backend.resolve("kernel32.dll", "GetTickCount"),
                Err(ResolutionSkip::NotImported)
            );
            assert_eq!(
                backend.resolve("kernel32.dll", "NoSuchExportAnywhere"),
                Err(ResolutionSkip::ExportNotFound)
            );
            assert_eq!(
                backend.resolve("steam_api64.dll", "SteamAPI_Init"),
                Err(ResolutionSkip::ModuleNotLoaded)
            );
        }
    }

    #[test]
    fn test_for_host_finds_test_executable() {
        let backend = IatBackend::for_host().unwrap();
        assert_ne!(backend.inner.image_base, 0);
    }
}
