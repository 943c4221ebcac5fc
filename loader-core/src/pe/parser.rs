//! On-disk PE image reader for the host executable.

use super::headers::*;
use crate::error::ImageError;
use std::fs::{self, File};
use std::io::Read;
use std::mem;
use std::path::Path;

/// Bytes read up front by [`PeFile::headers_from_file`]; enough for the
/// headers of every common linker.
const HEADER_WINDOW: usize = 0x1000;

/// Optional header of either width.
#[derive(Debug, Clone, Copy)]
pub enum OptionalHeader {
    Pe32(ImageOptionalHeader32),
    Pe64(ImageOptionalHeader64),
}

/// A host executable read from disk.
///
/// An image read with [`PeFile::headers_from_file`] holds only its headers
/// and section table; RVA reads past them fail.
pub struct PeFile {
    data: Vec<u8>,
    pub file_header: ImageFileHeader,
    pub optional_header: OptionalHeader,
    pub sections: Vec<ImageSectionHeader>,
}

impl PeFile {
    /// Read and parse an image from disk.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ImageError> {
        log::debug!("Reading host image: {}", path.as_ref().display());

        let data = fs::read(path.as_ref()).map_err(ImageError::ReadFailed)?;
        Self::from_bytes(data)
    }

    /// Read only the headers and section table of an image on disk.
    pub fn headers_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ImageError> {
        log::debug!("Reading host image headers: {}", path.as_ref().display());

        let mut file = File::open(path.as_ref()).map_err(ImageError::ReadFailed)?;
        let mut data = Vec::with_capacity(HEADER_WINDOW);
        read_up_to(&mut file, &mut data, HEADER_WINDOW)?;

        let dos_header: ImageDosHeader = read_struct(&data, 0, "DOS header")?;
        dos_header.validate()?;
        let file_header_offset = nt_offset(&dos_header)? + mem::size_of::<u32>();
        let optional_offset = file_header_offset + mem::size_of::<ImageFileHeader>();
        read_up_to(&mut file, &mut data, optional_offset)?;

        let file_header: ImageFileHeader = read_struct(&data, file_header_offset, "COFF header")?;
        let section_table_end = optional_offset
            + file_header.size_of_optional_header as usize
            + file_header.number_of_sections as usize * mem::size_of::<ImageSectionHeader>();
        let end = section_table_end.max(optional_offset + mem::size_of::<ImageOptionalHeader64>());
        read_up_to(&mut file, &mut data, end)?;

        Self::from_bytes(data)
    }

    /// Parse an image held in memory as its file layout.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, ImageError> {
        let dos_header: ImageDosHeader = read_struct(&data, 0, "DOS header")?;
        dos_header.validate()?;

        let nt_offset = nt_offset(&dos_header)?;
        let signature: u32 = read_struct(&data, nt_offset, "NT signature")?;
        if signature != IMAGE_NT_SIGNATURE {
            return Err(ImageError::InvalidPeSignature);
        }

        let file_header_offset = nt_offset + mem::size_of::<u32>();
        let file_header: ImageFileHeader = read_struct(&data, file_header_offset, "COFF header")?;

        let optional_offset = file_header_offset + mem::size_of::<ImageFileHeader>();
        let optional_header = match file_header.machine {
            IMAGE_FILE_MACHINE_AMD64 => {
                OptionalHeader::Pe64(read_struct(&data, optional_offset, "optional header")?)
            }
            IMAGE_FILE_MACHINE_I386 => {
                OptionalHeader::Pe32(read_struct(&data, optional_offset, "optional header")?)
            }
            other => return Err(ImageError::UnsupportedMachine(other)),
        };

        let section_table = optional_offset + file_header.size_of_optional_header as usize;
        let sections = (0..file_header.number_of_sections as usize)
            .map(|i| {
                read_struct::<ImageSectionHeader>(
                    &data,
                    section_table + i * mem::size_of::<ImageSectionHeader>(),
                    "section header",
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        log::debug!(
            "Parsed image: machine=0x{:04X}, {} sections",
            file_header.machine,
            sections.len()
        );

        Ok(Self {
            data,
            file_header,
            optional_header,
            sections,
        })
    }

    pub fn is_64bit(&self) -> bool {
        matches!(self.optional_header, OptionalHeader::Pe64(_))
    }

    pub fn machine_name(&self) -> &'static str {
        if self.is_64bit() {
            "x64"
        } else {
            "x86"
        }
    }

    pub fn entry_point(&self) -> u32 {
        match &self.optional_header {
            OptionalHeader::Pe64(opt) => opt.address_of_entry_point,
            OptionalHeader::Pe32(opt) => opt.address_of_entry_point,
        }
    }

    fn size_of_headers(&self) -> u32 {
        match &self.optional_header {
            OptionalHeader::Pe64(opt) => opt.size_of_headers,
            OptionalHeader::Pe32(opt) => opt.size_of_headers,
        }
    }

    pub fn data_directory(&self, index: usize) -> Option<ImageDataDirectory> {
        match &self.optional_header {
            OptionalHeader::Pe64(opt) => opt.data_directory.get(index).copied(),
            OptionalHeader::Pe32(opt) => opt.data_directory.get(index).copied(),
        }
    }

    pub fn section(&self, name: &str) -> Option<&ImageSectionHeader> {
        self.sections.iter().find(|section| section.name() == name)
    }

    /// Section containing an RVA.
    pub fn section_at(&self, rva: u32) -> Option<&ImageSectionHeader> {
        self.sections.iter().find(|section| {
            let size = section.virtual_size.max(section.size_of_raw_data);
            rva >= section.virtual_address && rva < section.virtual_address.saturating_add(size)
        })
    }

    /// Convert an RVA to a file offset.
    pub fn rva_to_offset(&self, rva: u32) -> Option<usize> {
        if rva < self.size_of_headers() {
            return Some(rva as usize);
        }

        self.section_at(rva).and_then(|section| {
            section
                .pointer_to_raw_data
                .checked_add(rva - section.virtual_address)
                .map(|offset| offset as usize)
        })
    }

    pub fn read_at_rva(&self, rva: u32, size: usize) -> Result<&[u8], ImageError> {
        let offset = self
            .rva_to_offset(rva)
            .ok_or_else(|| ImageError::Invalid(format!("Unmapped RVA 0x{:08X}", rva)))?;

        offset
            .checked_add(size)
            .and_then(|end| self.data.get(offset..end))
            .ok_or_else(|| ImageError::Invalid(format!("Read past end of image at RVA 0x{:08X}", rva)))
    }

    pub fn read_u32_at_rva(&self, rva: u32) -> Result<u32, ImageError> {
        let bytes = self.read_at_rva(rva, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u64_at_rva(&self, rva: u32) -> Result<u64, ImageError> {
        let bytes = self.read_at_rva(rva, 8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }

    /// Read a NUL-terminated ASCII string.
    pub fn read_string_at_rva(&self, rva: u32) -> Result<String, ImageError> {
        let offset = self
            .rva_to_offset(rva)
            .ok_or_else(|| ImageError::Invalid(format!("Unmapped string RVA 0x{:08X}", rva)))?;

        let bytes = self.data.get(offset..).unwrap_or_default();
        let len = bytes
            .iter()
            .position(|&c| c == 0)
            .ok_or_else(|| ImageError::Invalid(format!("Unterminated string at RVA 0x{:08X}", rva)))?;

        Ok(String::from_utf8_lossy(&bytes[..len]).to_string())
    }
}

fn nt_offset(dos_header: &ImageDosHeader) -> Result<usize, ImageError> {
    if dos_header.e_lfanew < 0 {
        return Err(ImageError::Invalid(format!(
            "Negative e_lfanew: {}",
            dos_header.e_lfanew
        )));
    }
    Ok(dos_header.e_lfanew as usize)
}

/// Extend `data` from `file` until it holds `len` bytes or the file ends.
fn read_up_to(file: &mut File, data: &mut Vec<u8>, len: usize) -> Result<(), ImageError> {
    if data.len() < len {
        let missing = (len - data.len()) as u64;
        file.by_ref()
            .take(missing)
            .read_to_end(data)
            .map_err(ImageError::ReadFailed)?;
    }
    Ok(())
}

fn read_struct<T: Copy>(data: &[u8], offset: usize, what: &str) -> Result<T, ImageError> {
    if offset.checked_add(mem::size_of::<T>()).map_or(true, |end| end > data.len()) {
        return Err(ImageError::Invalid(format!(
            "Image too small for {} at offset 0x{:X}",
            what, offset
        )));
    }

    Ok(unsafe { std::ptr::read_unaligned(data.as_ptr().add(offset) as *const T) })
}
