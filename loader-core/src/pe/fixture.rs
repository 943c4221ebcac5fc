//! Synthetic PE images for tests.
//!
//! Sections are placed at file offsets equal to their RVAs and the import
//! table lives inside the headers, so the same bytes read as both the file
//! layout and the mapped layout of an image.

use super::headers::*;

const NT_OFFSET: usize = 0x40;
const IMPORT_AREA: usize = 0x400;
const HEADERS_SIZE: usize = 0x1000;

pub struct ImageBuilder {
    machine: u16,
    entry_point: u32,
    sections: Vec<(String, u32, u32)>,
    imports: Vec<(String, Vec<String>)>,
}

impl ImageBuilder {
    pub fn new(machine: u16) -> Self {
        Self {
            machine,
            entry_point: 0,
            sections: Vec::new(),
            imports: Vec::new(),
        }
    }

    pub fn entry_point(mut self, rva: u32) -> Self {
        self.entry_point = rva;
        self
    }

    pub fn section(mut self, name: &str, rva: u32, size: u32) -> Self {
        self.sections.push((name.to_string(), rva, size));
        self
    }

    /// Add an imported module. A function written as `#N` is imported by ordinal.
    pub fn import(mut self, module: &str, functions: &[&str]) -> Self {
        self.imports.push((
            module.to_string(),
            functions.iter().map(|f| f.to_string()).collect(),
        ));
        self
    }

    fn thunk_size(&self) -> usize {
        if self.machine == IMAGE_FILE_MACHINE_I386 {
            4
        } else {
            8
        }
    }

    pub fn build(self) -> Vec<u8> {
        let end = self
            .sections
            .iter()
            .map(|(_, rva, size)| (*rva + *size) as usize)
            .max()
            .unwrap_or(0)
            .max(HEADERS_SIZE);
        let mut image = vec![0u8; end];

        // DOS header
        put_u16(&mut image, 0, IMAGE_DOS_SIGNATURE);
        put_u32(&mut image, 0x3C, NT_OFFSET as u32);

        // NT signature and file header
        put_u32(&mut image, NT_OFFSET, IMAGE_NT_SIGNATURE);
        let file_header = NT_OFFSET + 4;
        let is_pe32 = self.machine == IMAGE_FILE_MACHINE_I386;
        let optional_size: u16 = if is_pe32 { 224 } else { 240 };
        put_u16(&mut image, file_header, self.machine);
        put_u16(&mut image, file_header + 2, self.sections.len() as u16);
        put_u16(&mut image, file_header + 16, optional_size);

        // Optional header
        let optional = file_header + 20;
        let (directories, number_of_rva) = if is_pe32 { (96, 92) } else { (112, 108) };
        put_u16(
            &mut image,
            optional,
            if is_pe32 {
                IMAGE_NT_OPTIONAL_HDR32_MAGIC
            } else {
                IMAGE_NT_OPTIONAL_HDR64_MAGIC
            },
        );
        put_u32(&mut image, optional + 16, self.entry_point);
        put_u32(&mut image, optional + 56, end as u32);
        put_u32(&mut image, optional + 60, HEADERS_SIZE as u32);
        put_u32(&mut image, optional + number_of_rva, 16);

        // Section table
        let table = optional + optional_size as usize;
        for (i, (name, rva, size)) in self.sections.iter().enumerate() {
            let at = table + i * 40;
            let bytes = name.as_bytes();
            image[at..at + bytes.len().min(8)].copy_from_slice(&bytes[..bytes.len().min(8)]);
            put_u32(&mut image, at + 8, *size);
            put_u32(&mut image, at + 12, *rva);
            put_u32(&mut image, at + 16, *size);
            put_u32(&mut image, at + 20, *rva);
        }

        if !self.imports.is_empty() {
            let descriptors_size = (self.imports.len() + 1) * 20;
            let directory = optional + directories + IMAGE_DIRECTORY_ENTRY_IMPORT * 8;
            put_u32(&mut image, directory, IMPORT_AREA as u32);
            put_u32(&mut image, directory + 4, descriptors_size as u32);
            self.write_imports(&mut image, IMPORT_AREA + descriptors_size);
        }

        image
    }

    fn write_imports(&self, image: &mut [u8], mut cursor: usize) {
        let thunk = self.thunk_size();

        for (index, (module, functions)) in self.imports.iter().enumerate() {
            let descriptor = IMPORT_AREA + index * 20;

            let name_rva = cursor;
            cursor = put_str(image, cursor, module);

            let mut thunks = Vec::new();
            for function in functions {
                if let Some(ordinal) = function.strip_prefix('#') {
                    let ordinal: u64 = ordinal.parse().expect("Invalid ordinal");
                    let flag = if thunk == 4 {
                        IMAGE_ORDINAL_FLAG32 as u64
                    } else {
                        IMAGE_ORDINAL_FLAG64
                    };
                    thunks.push(flag | ordinal);
                } else {
                    cursor = align(cursor, 2);
                    thunks.push(cursor as u64);
                    cursor += 2; // hint
                    cursor = put_str(image, cursor, function);
                }
            }

            cursor = align(cursor, 8);
            let int_rva = cursor;
            cursor = put_thunks(image, cursor, &thunks, thunk);
            let iat_rva = cursor;
            cursor = put_thunks(image, cursor, &thunks, thunk);

            put_u32(image, descriptor, int_rva as u32);
            put_u32(image, descriptor + 12, name_rva as u32);
            put_u32(image, descriptor + 16, iat_rva as u32);
        }

        assert!(cursor <= HEADERS_SIZE, "Import area overflow");
    }
}

fn align(value: usize, to: usize) -> usize {
    (value + to - 1) & !(to - 1)
}

fn put_u16(image: &mut [u8], at: usize, value: u16) {
    image[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(image: &mut [u8], at: usize, value: u32) {
    image[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_str(image: &mut [u8], at: usize, text: &str) -> usize {
    image[at..at + text.len()].copy_from_slice(text.as_bytes());
    image[at + text.len()] = 0;
    at + text.len() + 1
}

fn put_thunks(image: &mut [u8], mut at: usize, thunks: &[u64], width: usize) -> usize {
    for value in thunks.iter().chain(std::iter::once(&0)) {
        image[at..at + width].copy_from_slice(&value.to_le_bytes()[..width]);
        at += width;
    }
    at
}
