//! Synthetic PE64 images for loader tests.
//!
//! Builds just enough of a valid image to exercise parsing, mapping,
//! relocation, import patching and export lookup without shipping binary
//! fixtures.

use super::*;

pub const DEFAULT_BASE: u64 = 0x1_4000_0000;
const SECTION_ALIGN: u32 = 0x1000;
const FILE_ALIGN: u32 = 0x200;
const HEADERS_SIZE: u32 = 0x400;

fn align(v: u32, to: u32) -> u32 {
    v.div_ceil(to) * to
}

struct SectionSpec {
    name: &'static [u8],
    data: Vec<u8>,
    virtual_size: u32,
    characteristics: u32,
}

pub struct Builder {
    machine: u16,
    dll: bool,
    image_base: u64,
    entry_rva: u32,
    text: Vec<u8>,
    data: Vec<u8>,
    /// Extra uninitialized (virtual-only) bytes appended to .data.
    data_bss: u32,
    /// DIR64 fixup sites, as rvas into the image.
    relocs: Vec<u32>,
    /// (dll name, imported symbol names)
    imports: Vec<(String, Vec<String>)>,
    /// (export name, rva)
    exports: Vec<(String, u32)>,
    tls: Option<(u32, u32)>, // (raw data bytes in .data, zero fill)
    /// Strip the relocation directory: the image cannot be rebased.
    no_relocs: bool,
}

impl Builder {
    pub fn new() -> Self {
        Builder {
            machine: IMAGE_FILE_MACHINE_AMD64,
            dll: false,
            image_base: DEFAULT_BASE,
            entry_rva: 0x1000,
            text: vec![0xC3; 16], // ret
            data: b"initialized data".to_vec(),
            data_bss: 0,
            relocs: Vec::new(),
            imports: Vec::new(),
            exports: Vec::new(),
            tls: None,
            no_relocs: false,
        }
    }

    pub fn no_relocs(mut self) -> Self {
        self.no_relocs = true;
        self
    }

    pub fn machine(mut self, machine: u16) -> Self {
        self.machine = machine;
        self
    }

    pub fn dll(mut self) -> Self {
        self.dll = true;
        self
    }

    pub fn image_base(mut self, base: u64) -> Self {
        self.image_base = base;
        self
    }

    pub fn data_section(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    pub fn data_bss(mut self, extra: u32) -> Self {
        self.data_bss = extra;
        self
    }

    pub fn reloc_at(mut self, rva: u32) -> Self {
        self.relocs.push(rva);
        self
    }

    pub fn import(mut self, dll: &str, names: &[&str]) -> Self {
        self.imports.push((
            dll.to_owned(),
            names.iter().map(|s| (*s).to_owned()).collect(),
        ));
        self
    }

    pub fn export(mut self, name: &str, rva: u32) -> Self {
        self.exports.push((name.to_owned(), rva));
        self
    }

    pub fn tls(mut self, raw_bytes: u32, zero_fill: u32) -> Self {
        self.tls = Some((raw_bytes, zero_fill));
        self
    }

    /// Rva of the .data section in built images.
    pub const DATA_RVA: u32 = 0x2000;

    pub fn build(self) -> Vec<u8> {
        let mut sections: Vec<SectionSpec> = Vec::new();
        let text_len = self.text.len() as u32;
        sections.push(SectionSpec {
            name: b".text\0\0\0",
            data: self.text,
            virtual_size: text_len,
            characteristics: (SectionFlags::CODE | SectionFlags::EXECUTE | SectionFlags::READ)
                .bits(),
        });
        let data_len = self.data.len() as u32;
        sections.push(SectionSpec {
            name: b".data\0\0\0",
            data: self.data,
            virtual_size: data_len + self.data_bss,
            characteristics: (SectionFlags::INITIALIZED_DATA
                | SectionFlags::READ
                | SectionFlags::WRITE)
                .bits(),
        });

        // Lay out rvas so directory content can reference them.
        let mut rvas = Vec::new();
        let mut next_rva = SECTION_ALIGN;
        for s in &sections {
            rvas.push(next_rva);
            next_rva += align(s.virtual_size.max(1), SECTION_ALIGN);
        }
        assert_eq!(rvas[1], Self::DATA_RVA, "layout drifted; fix DATA_RVA");

        let mut directories = [ImageDataDirectory::default(); 16];

        let mut push_section =
            |sections: &mut Vec<SectionSpec>, rvas: &mut Vec<u32>, next_rva: &mut u32, spec: SectionSpec| {
                let rva = *next_rva;
                rvas.push(rva);
                *next_rva += align(spec.virtual_size.max(1), SECTION_ALIGN);
                sections.push(spec);
                rva
            };

        if !self.imports.is_empty() {
            let (bytes, _) = build_import_section(&self.imports, next_rva);
            let len = bytes.len() as u32;
            let rva = push_section(
                &mut sections,
                &mut rvas,
                &mut next_rva,
                SectionSpec {
                    name: b".idata\0\0",
                    data: bytes,
                    virtual_size: len,
                    characteristics: (SectionFlags::INITIALIZED_DATA
                        | SectionFlags::READ
                        | SectionFlags::WRITE)
                        .bits(),
                },
            );
            directories[directory::IMPORT] = ImageDataDirectory {
                virtual_address: rva,
                size: (self.imports.len() as u32 + 1) * 20,
            };
        }

        if !self.exports.is_empty() {
            let bytes = build_export_section(&self.exports, next_rva);
            let len = bytes.len() as u32;
            let rva = push_section(
                &mut sections,
                &mut rvas,
                &mut next_rva,
                SectionSpec {
                    name: b".edata\0\0",
                    data: bytes,
                    virtual_size: len,
                    characteristics: (SectionFlags::INITIALIZED_DATA | SectionFlags::READ).bits(),
                },
            );
            directories[directory::EXPORT] = ImageDataDirectory {
                virtual_address: rva,
                size: len,
            };
        }

        let mut relocs = self.relocs.clone();

        if let Some((raw, zero_fill)) = self.tls {
            let dir = ImageTlsDirectory64 {
                start_address_of_raw_data: self.image_base + Self::DATA_RVA as u64,
                end_address_of_raw_data: self.image_base + (Self::DATA_RVA + raw) as u64,
                address_of_index: self.image_base + (Self::DATA_RVA + raw) as u64,
                address_of_callbacks: 0,
                size_of_zero_fill: zero_fill,
                characteristics: 0,
            };
            let mut bytes = vec![0u8; std::mem::size_of::<ImageTlsDirectory64>()];
            // SAFETY: plain #[repr(C)] struct to bytes.
            unsafe {
                std::ptr::write_unaligned(bytes.as_mut_ptr() as *mut ImageTlsDirectory64, dir);
            }
            let len = bytes.len() as u32;
            let rva = push_section(
                &mut sections,
                &mut rvas,
                &mut next_rva,
                SectionSpec {
                    name: b".tls\0\0\0\0",
                    data: bytes,
                    virtual_size: len,
                    characteristics: (SectionFlags::INITIALIZED_DATA | SectionFlags::READ).bits(),
                },
            );
            directories[directory::TLS] = ImageDataDirectory {
                virtual_address: rva,
                size: len,
            };
            // The directory's VA fields get fixed up on rebase, like a real
            // linker emits them.
            relocs.extend([rva, rva + 8, rva + 16]);
        }

        if !self.no_relocs {
            let bytes = build_reloc_section(&relocs);
            let len = bytes.len() as u32;
            let rva = push_section(
                &mut sections,
                &mut rvas,
                &mut next_rva,
                SectionSpec {
                    name: b".reloc\0\0",
                    data: bytes,
                    virtual_size: len,
                    characteristics: (SectionFlags::INITIALIZED_DATA
                        | SectionFlags::READ
                        | SectionFlags::DISCARDABLE)
                        .bits(),
                },
            );
            directories[directory::BASERELOC] = ImageDataDirectory {
                virtual_address: rva,
                size: len,
            };
        }

        let size_of_image = next_rva;

        // Emit headers.
        let mut out = vec![0u8; HEADERS_SIZE as usize];
        out[0] = b'M';
        out[1] = b'Z';
        let nt_offset = 0x80u32;
        out[0x3C..0x40].copy_from_slice(&nt_offset.to_le_bytes());
        out[0x80..0x84].copy_from_slice(&IMAGE_NT_SIGNATURE.to_le_bytes());

        let file_header = ImageFileHeader {
            machine: self.machine,
            number_of_sections: sections.len() as u16,
            time_date_stamp: 0,
            pointer_to_symbol_table: 0,
            number_of_symbols: 0,
            size_of_optional_header: std::mem::size_of::<ImageOptionalHeader64>() as u16,
            characteristics: (if self.dll { IMAGE_FILE_DLL } else { 0 }) | 0x0002, // EXECUTABLE_IMAGE
        };
        let optional = ImageOptionalHeader64 {
            magic: IMAGE_NT_OPTIONAL_HDR64_MAGIC,
            major_linker_version: 14,
            minor_linker_version: 0,
            size_of_code: align(text_len, FILE_ALIGN),
            size_of_initialized_data: 0,
            size_of_uninitialized_data: 0,
            address_of_entry_point: self.entry_rva,
            base_of_code: rvas[0],
            image_base: self.image_base,
            section_alignment: SECTION_ALIGN,
            file_alignment: FILE_ALIGN,
            major_operating_system_version: 6,
            minor_operating_system_version: 0,
            major_image_version: 0,
            minor_image_version: 0,
            major_subsystem_version: 6,
            minor_subsystem_version: 0,
            win32_version_value: 0,
            size_of_image,
            size_of_headers: HEADERS_SIZE,
            check_sum: 0,
            subsystem: 3, // console
            dll_characteristics: 0,
            size_of_stack_reserve: 0x10_0000,
            size_of_stack_commit: 0x1000,
            size_of_heap_reserve: 0x10_0000,
            size_of_heap_commit: 0x1000,
            loader_flags: 0,
            number_of_rva_and_sizes: 16,
            data_directory: directories,
        };
        // SAFETY: plain #[repr(C)] structs to bytes at bounds-checked spots.
        unsafe {
            std::ptr::write_unaligned(
                out.as_mut_ptr().add(nt_offset as usize + 4) as *mut ImageFileHeader,
                file_header,
            );
            std::ptr::write_unaligned(
                out.as_mut_ptr().add(nt_offset as usize + 24) as *mut ImageOptionalHeader64,
                optional,
            );
        }

        // Section table + raw data.
        let mut raw_offset = HEADERS_SIZE;
        let sect_table = nt_offset as usize + 24 + std::mem::size_of::<ImageOptionalHeader64>();
        for (i, s) in sections.iter().enumerate() {
            let raw_size = align(s.data.len() as u32, FILE_ALIGN);
            let mut name = [0u8; 8];
            name.copy_from_slice(s.name);
            let header = ImageSectionHeader {
                name,
                virtual_size: s.virtual_size,
                virtual_address: rvas[i],
                size_of_raw_data: raw_size,
                pointer_to_raw_data: raw_offset,
                pointer_to_relocations: 0,
                pointer_to_linenumbers: 0,
                number_of_relocations: 0,
                number_of_linenumbers: 0,
                characteristics: s.characteristics,
            };
            // SAFETY: as above.
            unsafe {
                std::ptr::write_unaligned(
                    out.as_mut_ptr()
                        .add(sect_table + i * std::mem::size_of::<ImageSectionHeader>())
                        as *mut ImageSectionHeader,
                    header,
                );
            }
            out.resize(raw_offset as usize, 0);
            out.extend_from_slice(&s.data);
            out.resize((raw_offset + raw_size) as usize, 0);
            raw_offset += raw_size;
        }
        out
    }
}

/// Import section layout: descriptors, then per-dll ILT/IAT, hint/name
/// entries and dll names. Returns the bytes plus the IAT rva of the first
/// dll's first import.
fn build_import_section(imports: &[(String, Vec<String>)], section_rva: u32) -> (Vec<u8>, u32) {
    let desc_bytes = (imports.len() + 1) * 20;
    let mut thunks_at = desc_bytes;
    let mut thunk_spans = Vec::new(); // (ilt offset, iat offset)
    for (_, names) in imports {
        let span = (names.len() + 1) * 8;
        thunk_spans.push((thunks_at, thunks_at + span));
        thunks_at += span * 2;
    }
    let mut strings_at = thunks_at;
    let mut out = vec![0u8; thunks_at];

    let mut first_iat = 0u32;
    for (i, (dll, names)) in imports.iter().enumerate() {
        let (ilt, iat) = thunk_spans[i];
        if i == 0 {
            first_iat = section_rva + iat as u32;
        }
        for (j, name) in names.iter().enumerate() {
            // Hint/name entry.
            let hn_off = strings_at;
            out.resize(hn_off, 0);
            out.extend_from_slice(&0u16.to_le_bytes());
            out.extend_from_slice(name.as_bytes());
            out.push(0);
            if out.len() % 2 == 1 {
                out.push(0);
            }
            strings_at = out.len();
            let entry = (section_rva as u64) + hn_off as u64;
            out[ilt + j * 8..ilt + j * 8 + 8].copy_from_slice(&entry.to_le_bytes());
            out[iat + j * 8..iat + j * 8 + 8].copy_from_slice(&entry.to_le_bytes());
        }
        // Dll name string.
        let name_off = out.len();
        out.extend_from_slice(dll.as_bytes());
        out.push(0);
        strings_at = out.len();

        let desc = ImageImportDescriptor {
            original_first_thunk: section_rva + ilt as u32,
            time_date_stamp: 0,
            forwarder_chain: 0,
            name: section_rva + name_off as u32,
            first_thunk: section_rva + iat as u32,
        };
        // SAFETY: plain struct into a sized slot.
        unsafe {
            std::ptr::write_unaligned(
                out.as_mut_ptr().add(i * 20) as *mut ImageImportDescriptor,
                desc,
            );
        }
    }
    (out, first_iat)
}

fn build_export_section(exports: &[(String, u32)], section_rva: u32) -> Vec<u8> {
    let dir_size = std::mem::size_of::<ImageExportDirectory>();
    let n = exports.len();
    let funcs_off = dir_size;
    let names_off = funcs_off + n * 4;
    let ords_off = names_off + n * 4;
    let strings_off = ords_off + n * 2;
    let mut out = vec![0u8; strings_off];

    let mut sorted: Vec<_> = exports.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    for (i, (name, rva)) in sorted.iter().enumerate() {
        out[funcs_off + i * 4..funcs_off + i * 4 + 4].copy_from_slice(&rva.to_le_bytes());
        let str_at = out.len();
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        let name_rva = section_rva + str_at as u32;
        out[names_off + i * 4..names_off + i * 4 + 4].copy_from_slice(&name_rva.to_le_bytes());
        out[ords_off + i * 2..ords_off + i * 2 + 2]
            .copy_from_slice(&(i as u16).to_le_bytes());
    }

    let dir = ImageExportDirectory {
        characteristics: 0,
        time_date_stamp: 0,
        major_version: 0,
        minor_version: 0,
        name: 0,
        base: 1,
        number_of_functions: n as u32,
        number_of_names: n as u32,
        address_of_functions: section_rva + funcs_off as u32,
        address_of_names: section_rva + names_off as u32,
        address_of_name_ordinals: section_rva + ords_off as u32,
    };
    // SAFETY: plain struct into a sized slot.
    unsafe {
        std::ptr::write_unaligned(out.as_mut_ptr() as *mut ImageExportDirectory, dir);
    }
    out
}

fn build_reloc_section(rvas: &[u32]) -> Vec<u8> {
    if rvas.is_empty() {
        // A fully position-independent image still carries an (empty) block
        // so the loader can rebase it.
        let mut out = Vec::new();
        out.extend_from_slice(&0x1000u32.to_le_bytes());
        out.extend_from_slice(&12u32.to_le_bytes());
        out.extend_from_slice(&(IMAGE_REL_BASED_ABSOLUTE << 12).to_le_bytes());
        out.extend_from_slice(&(IMAGE_REL_BASED_ABSOLUTE << 12).to_le_bytes());
        return out;
    }
    let mut by_page: std::collections::BTreeMap<u32, Vec<u16>> = Default::default();
    for &rva in rvas {
        by_page
            .entry(rva & !0xFFF)
            .or_default()
            .push((IMAGE_REL_BASED_DIR64 << 12) | (rva & 0xFFF) as u16);
    }
    let mut out = Vec::new();
    for (page, mut entries) in by_page {
        if entries.len() % 2 == 1 {
            entries.push(IMAGE_REL_BASED_ABSOLUTE << 12); // pad
        }
        out.extend_from_slice(&page.to_le_bytes());
        out.extend_from_slice(&((8 + entries.len() * 2) as u32).to_le_bytes());
        for e in entries {
            out.extend_from_slice(&e.to_le_bytes());
        }
    }
    out
}
