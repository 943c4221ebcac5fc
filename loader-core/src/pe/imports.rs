//! Import table walking, on disk and in a mapped image.

use super::headers::*;
use super::parser::PeFile;
use crate::error::ImageError;
use std::mem;

/// A function named in an image's import table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportedFunction {
    ByName(String),
    ByOrdinal(u16),
}

/// Imports pulled from one module.
#[derive(Debug, Clone)]
pub struct ImportedModule {
    pub name: String,
    pub functions: Vec<ImportedFunction>,
}

impl ImportedModule {
    pub fn imports(&self, function: &str) -> bool {
        self.functions
            .iter()
            .any(|f| matches!(f, ImportedFunction::ByName(name) if name == function))
    }
}

/// List the import table of an image read from disk.
pub fn list_imports(pe: &PeFile) -> Result<Vec<ImportedModule>, ImageError> {
    let directory = match pe.data_directory(IMAGE_DIRECTORY_ENTRY_IMPORT) {
        Some(dir) if dir.virtual_address != 0 => dir,
        _ => {
            log::debug!("Image has no import directory");
            return Ok(Vec::new());
        }
    };

    let descriptor_size = mem::size_of::<ImageImportDescriptor>() as u32;
    let thunk_size: u32 = if pe.is_64bit() { 8 } else { 4 };
    let mut modules = Vec::new();

    for index in 0u32.. {
        let rva = element_rva(directory.virtual_address, index, descriptor_size)?;
        let raw = pe.read_at_rva(rva, descriptor_size as usize)?;
        let descriptor =
            unsafe { std::ptr::read_unaligned(raw.as_ptr() as *const ImageImportDescriptor) };

        if descriptor.is_null() {
            break;
        }

        let name = pe.read_string_at_rva(descriptor.name)?;
        let mut functions = Vec::new();

        for slot in 0u32.. {
            let thunk_rva = element_rva(descriptor.name_table(), slot, thunk_size)?;
            let (value, by_ordinal) = if pe.is_64bit() {
                let value = pe.read_u64_at_rva(thunk_rva)?;
                (value, value & IMAGE_ORDINAL_FLAG64 != 0)
            } else {
                let value = pe.read_u32_at_rva(thunk_rva)? as u64;
                (value, value as u32 & IMAGE_ORDINAL_FLAG32 != 0)
            };

            if value == 0 {
                break;
            }

            if by_ordinal {
                functions.push(ImportedFunction::ByOrdinal(value as u16));
            } else {
                // Skip the 2-byte hint.
                let name_rva = u32::try_from(value)
                    .ok()
                    .and_then(|rva| rva.checked_add(2))
                    .ok_or_else(|| {
                        ImageError::Invalid(format!("Import name RVA out of range: 0x{:X}", value))
                    })?;
                functions.push(ImportedFunction::ByName(pe.read_string_at_rva(name_rva)?));
            }
        }

        log::debug!("{} imports {} functions", name, functions.len());
        modules.push(ImportedModule { name, functions });
    }

    Ok(modules)
}

/// RVA of element `index` of a table of `stride`-byte entries at `base`.
fn element_rva(base: u32, index: u32, stride: u32) -> Result<u32, ImageError> {
    index
        .checked_mul(stride)
        .and_then(|offset| base.checked_add(offset))
        .ok_or_else(|| ImageError::Invalid(format!("Table at RVA 0x{:08X} runs past 4 GiB", base)))
}

/// Locate the import address table slot through which a mapped image calls
/// `module!function`.
///
/// Module names compare case-insensitively; function names exactly. A
/// descriptor with an import name table is searched by name. Once mapped, the
/// IAT holds addresses rather than names, so a descriptor without a name table
/// is only searched for a slot holding `resolved`, the address the loader
/// bound the import to. Every read is checked against `SizeOfImage`.
///
/// # Safety
/// `image_base` must point to a PE image mapped by the loader of the current
/// process (same pointer width), readable for `SizeOfImage` bytes.
pub unsafe fn find_import_slot(
    image_base: *const u8,
    module: &str,
    function: &str,
    resolved: Option<usize>,
) -> Option<*mut usize> {
    let image = MappedImage::new(image_base)?;
    let directory = image.import_directory()?;
    let descriptor_size = mem::size_of::<ImageImportDescriptor>();

    for index in 0usize.. {
        let rva = directory.checked_add(index.checked_mul(descriptor_size)?)?;
        let descriptor: ImageImportDescriptor = image.read(rva)?;
        if descriptor.is_null() {
            return None;
        }

        if image.name_equals(descriptor.name as usize, module.as_bytes(), true) {
            if let Some(slot) = image.find_in_descriptor(&descriptor, function, resolved) {
                return Some(slot);
            }
        }
    }

    None
}

#[cfg(target_pointer_width = "64")]
const NATIVE_OPTIONAL_MAGIC: u16 = IMAGE_NT_OPTIONAL_HDR64_MAGIC;
#[cfg(not(target_pointer_width = "64"))]
const NATIVE_OPTIONAL_MAGIC: u16 = IMAGE_NT_OPTIONAL_HDR32_MAGIC;

/// An image laid out by the loader, bounded by its `SizeOfImage`.
struct MappedImage {
    base: *const u8,
    size: usize,
    imports: usize,
}

impl MappedImage {
    unsafe fn new(base: *const u8) -> Option<Self> {
        let dos = std::ptr::read_unaligned(base as *const ImageDosHeader);
        if dos.validate().is_err() || dos.e_lfanew <= 0 {
            return None;
        }

        let nt = dos.e_lfanew as usize;
        let optional_offset = nt + mem::size_of::<u32>() + mem::size_of::<ImageFileHeader>();
        // Headers must fit the first page before SizeOfImage can be trusted.
        if optional_offset + mem::size_of::<ImageOptionalHeaderNative>() > 0x1000 {
            return None;
        }
        if std::ptr::read_unaligned(base.add(nt) as *const u32) != IMAGE_NT_SIGNATURE {
            return None;
        }

        let optional =
            std::ptr::read_unaligned(base.add(optional_offset) as *const ImageOptionalHeaderNative);
        if optional.magic != NATIVE_OPTIONAL_MAGIC {
            return None;
        }

        Some(Self {
            base,
            size: optional.size_of_image as usize,
            imports: optional.data_directory[IMAGE_DIRECTORY_ENTRY_IMPORT].virtual_address as usize,
        })
    }

    fn import_directory(&self) -> Option<usize> {
        (self.imports != 0).then_some(self.imports)
    }

    fn contains(&self, rva: usize, len: usize) -> bool {
        rva.checked_add(len).is_some_and(|end| end <= self.size)
    }

    unsafe fn read<T: Copy>(&self, rva: usize) -> Option<T> {
        if !self.contains(rva, mem::size_of::<T>()) {
            return None;
        }
        Some(std::ptr::read_unaligned(self.base.add(rva) as *const T))
    }

    /// Compare the NUL-terminated string at `rva` with `expected`.
    unsafe fn name_equals(&self, rva: usize, expected: &[u8], ignore_case: bool) -> bool {
        for index in 0..=expected.len() {
            let Some(byte) = rva.checked_add(index).and_then(|at| self.read::<u8>(at)) else {
                return false;
            };
            let matches = match expected.get(index) {
                None => byte == 0,
                Some(&want) if ignore_case => byte.eq_ignore_ascii_case(&want),
                Some(&want) => byte == want,
            };
            if !matches {
                return false;
            }
        }
        true
    }

    fn slot(&self, table: usize, index: usize) -> Option<*mut usize> {
        let width = mem::size_of::<usize>();
        let rva = table.checked_add(index.checked_mul(width)?)?;
        if !self.contains(rva, width) {
            return None;
        }
        Some(self.base.wrapping_add(rva) as *mut usize)
    }

    unsafe fn find_in_descriptor(
        &self,
        descriptor: &ImageImportDescriptor,
        function: &str,
        resolved: Option<usize>,
    ) -> Option<*mut usize> {
        let slots = descriptor.first_thunk as usize;

        if descriptor.original_first_thunk != 0 {
            let names = descriptor.original_first_thunk as usize;
            let width = mem::size_of::<usize>();
            for index in 0usize.. {
                let thunk: usize = self.read(names.checked_add(index.checked_mul(width)?)?)?;
                if thunk == 0 {
                    break;
                }
                if thunk & IMAGE_ORDINAL_FLAG != 0 {
                    continue;
                }
                // Skip the 2-byte hint.
                let matched = thunk
                    .checked_add(2)
                    .is_some_and(|rva| self.name_equals(rva, function.as_bytes(), false));
                if matched {
                    return self.slot(slots, index);
                }
            }
        }

        let resolved = resolved?;
        for index in 0usize.. {
            let slot = self.slot(slots, index)?;
            let value = std::ptr::read_unaligned(slot as *const usize);
            if value == 0 {
                return None;
            }
            if value == resolved {
                return Some(slot);
            }
        }

        None
    }
}
