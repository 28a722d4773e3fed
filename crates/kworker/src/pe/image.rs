//! Manual image mapping and the between-jobs reset machinery.
//!
//! The worker maps a PE file section-by-section into image memory, applies
//! base relocations, resolves imports (the registry decides what each one
//! binds to) and keeps a virgin copy of the result. Between jobs the live
//! image is reset from the virgin copy via a precomputed quick-copy/
//! quick-zero plan: at most three memcpys over the written parts of the
//! writable sections and at most three memsets over their trailing zero
//! runs, instead of touching the whole image.

use smallvec::SmallVec;

use super::{
    cstr_at, directory, read_at, ImageSectionHeader, ImageTlsDirectory64, PeError, PeFile,
    RuntimeFunction, IMAGE_REL_BASED_ABSOLUTE, IMAGE_REL_BASED_DIR64, IMAGE_REL_BASED_HIGHLOW,
};

/// Memory holding a mapped image. On Windows this is virtual memory with the
/// right protections (and, for the executable, a statically reserved buffer
/// at a known address); elsewhere a page-aligned heap block backs the same
/// logic.
#[derive(Debug)]
pub struct ImageMem {
    ptr: *mut u8,
    size: usize,
}

// SAFETY: the image memory is owned by the module registry and only mutated
// from the worker main thread.
unsafe impl Send for ImageMem {}
unsafe impl Sync for ImageMem {}

impl ImageMem {
    /// Allocate image memory, preferring `preferred_base` (which matters on
    /// Windows where an image at its linked base needs no relocation).
    pub fn allocate(size: usize, preferred_base: u64) -> Option<ImageMem> {
        let ptr = sys::alloc_image(size, preferred_base)?;
        Some(ImageMem { ptr, size })
    }

    pub fn base(&self) -> usize {
        self.ptr as usize
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn bytes(&self) -> &[u8] {
        // SAFETY: ptr/size describe our allocation.
        unsafe { std::slice::from_raw_parts(self.ptr, self.size) }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: ptr/size describe our allocation; callers hold &mut.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.size) }
    }
}

impl Drop for ImageMem {
    fn drop(&mut self) {
        sys::free_image(self.ptr, self.size);
    }
}

/// Copy headers and sections to their virtual addresses.
pub fn map_sections(pe: &PeFile<'_>, image: &mut [u8]) -> Result<(), PeError> {
    let file = pe.data();
    let headers = pe.size_of_headers() as usize;
    if headers > image.len() || headers > file.len() {
        return Err(PeError::Truncated("headers"));
    }
    image[..headers].copy_from_slice(&file[..headers]);

    for s in pe.sections() {
        let va = s.virtual_address as usize;
        let vsize = s.virtual_size as usize;
        if va + vsize > image.len() {
            return Err(PeError::BadRva {
                rva: s.virtual_address,
                size: image.len() as u32,
            });
        }
        let raw = s.pointer_to_raw_data as usize;
        let copy = (s.size_of_raw_data as usize).min(vsize);
        if copy > 0 {
            let src = file
                .get(raw..raw + copy)
                .ok_or(PeError::Truncated("section data"))?;
            image[va..va + copy].copy_from_slice(src);
        }
        // The raw-size..virtual-size tail is zero fill; `image` arrives
        // zeroed, so nothing to do.
    }
    Ok(())
}

/// Apply base relocations for an image loaded `delta` bytes away from its
/// preferred base.
pub fn apply_relocations(pe: &PeFile<'_>, image: &mut [u8], delta: i64) -> Result<(), PeError> {
    if delta == 0 {
        return Ok(());
    }
    let Some(dir) = pe.data_directory(directory::BASERELOC) else {
        // An image without fixups simply cannot move.
        return Err(PeError::BadDirectory("relocation"));
    };
    let mut offset = dir.virtual_address as usize;
    let end = offset + dir.size as usize;
    while offset + 8 <= end {
        let page: u32 = read_at(image, offset, "reloc block")?;
        let block_size: u32 = read_at(image, offset + 4, "reloc block")?;
        if block_size < 8 {
            return Err(PeError::BadDirectory("relocation"));
        }
        let entries = (block_size as usize - 8) / 2;
        for i in 0..entries {
            let raw: u16 = read_at(image, offset + 8 + i * 2, "reloc entry")?;
            let kind = raw >> 12;
            let at = page as usize + (raw & 0xFFF) as usize;
            match kind {
                IMAGE_REL_BASED_ABSOLUTE => {}
                IMAGE_REL_BASED_DIR64 => {
                    let v: u64 = read_at(image, at, "reloc site")?;
                    let fixed = (v as i64).wrapping_add(delta) as u64;
                    image[at..at + 8].copy_from_slice(&fixed.to_le_bytes());
                }
                IMAGE_REL_BASED_HIGHLOW => {
                    let v: u32 = read_at(image, at, "reloc site")?;
                    let fixed = (v as i64).wrapping_add(delta) as u32;
                    image[at..at + 4].copy_from_slice(&fixed.to_le_bytes());
                }
                _ => return Err(PeError::BadDirectory("relocation")),
            }
        }
        offset += block_size as usize;
    }
    Ok(())
}

/// One imported symbol and where its IAT slot lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportEntry {
    pub symbol: ImportSymbol,
    /// Rva of the 8-byte IAT slot to patch.
    pub iat_rva: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportSymbol {
    Name(String),
    Ordinal(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedModule {
    pub dll: String,
    pub entries: Vec<ImportEntry>,
}

const ORDINAL_FLAG64: u64 = 1 << 63;

/// Walk the import directory of a mapped image.
pub fn walk_imports(pe: &PeFile<'_>, image: &[u8]) -> Result<Vec<ImportedModule>, PeError> {
    let Some(dir) = pe.data_directory(directory::IMPORT) else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    let mut desc_off = dir.virtual_address as usize;
    loop {
        let desc: super::ImageImportDescriptor = read_at(image, desc_off, "import descriptor")?;
        if desc.name == 0 && desc.first_thunk == 0 {
            break;
        }
        let dll = cstr_at(image, desc.name as usize)?.to_owned();
        let mut entries = Vec::new();
        // Prefer the unbound thunk array; fall back to the IAT when the
        // linker omitted it.
        let lookup = if desc.original_first_thunk != 0 {
            desc.original_first_thunk
        } else {
            desc.first_thunk
        };
        let mut i = 0usize;
        loop {
            let thunk: u64 = read_at(image, lookup as usize + i * 8, "import thunk")?;
            if thunk == 0 {
                break;
            }
            let symbol = if thunk & ORDINAL_FLAG64 != 0 {
                ImportSymbol::Ordinal((thunk & 0xFFFF) as u16)
            } else {
                // Skip the 2-byte hint.
                ImportSymbol::Name(cstr_at(image, thunk as usize + 2)?.to_owned())
            };
            entries.push(ImportEntry {
                symbol,
                iat_rva: desc.first_thunk + (i * 8) as u32,
            });
            i += 1;
        }
        out.push(ImportedModule { dll, entries });
        desc_off += std::mem::size_of::<super::ImageImportDescriptor>();
    }
    Ok(out)
}

/// Write a resolved address into an IAT slot.
pub fn patch_iat_slot(image: &mut [u8], iat_rva: u32, value: u64) {
    let at = iat_rva as usize;
    image[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

pub fn read_iat_slot(image: &[u8], iat_rva: u32) -> u64 {
    let at = iat_rva as usize;
    u64::from_le_bytes(image[at..at + 8].try_into().unwrap())
}

/// An export resolved from a mapped image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Export {
    /// Rva of the exported code/data.
    Rva(u32),
    /// Forwarder string, `TARGETDLL.Symbol`.
    Forwarder(String),
}

/// Look up a named export in a mapped image.
pub fn find_export(pe: &PeFile<'_>, image: &[u8], name: &str) -> Result<Option<Export>, PeError> {
    let Some(dir) = pe.data_directory(directory::EXPORT) else {
        return Ok(None);
    };
    let ed: super::ImageExportDirectory = read_at(image, dir.virtual_address as usize, "export")?;
    let names = ed.address_of_names as usize;
    let ords = ed.address_of_name_ordinals as usize;
    let funcs = ed.address_of_functions as usize;

    // Export names are lexically sorted in a valid image; binary search.
    let mut lo = 0u32;
    let mut hi = ed.number_of_names;
    while lo < hi {
        let mid = (lo + hi) / 2;
        let name_rva: u32 = read_at(image, names + mid as usize * 4, "export name")?;
        let candidate = cstr_at(image, name_rva as usize)?;
        match candidate.cmp(name) {
            std::cmp::Ordering::Equal => {
                let ord: u16 = read_at(image, ords + mid as usize * 2, "export ordinal")?;
                let rva: u32 = read_at(image, funcs + ord as usize * 4, "export function")?;
                let dir_start = dir.virtual_address;
                let dir_end = dir_start + dir.size;
                if rva >= dir_start && rva < dir_end {
                    return Ok(Some(Export::Forwarder(cstr_at(image, rva as usize)?.to_owned())));
                }
                return Ok(Some(Export::Rva(rva)));
            }
            std::cmp::Ordering::Less => lo = mid + 1,
            std::cmp::Ordering::Greater => hi = mid,
        }
    }
    Ok(None)
}

/// Read the TLS directory of a mapped image, if any.
pub fn read_tls_directory(
    pe: &PeFile<'_>,
    image: &[u8],
) -> Result<Option<ImageTlsDirectory64>, PeError> {
    match pe.data_directory(directory::TLS) {
        Some(dir) => Ok(Some(read_at(image, dir.virtual_address as usize, "TLS")?)),
        None => Ok(None),
    }
}

/// The AMD64 unwind table, for `RtlAddFunctionTable` registration.
pub fn read_function_table(pe: &PeFile<'_>, image: &[u8]) -> Result<Vec<RuntimeFunction>, PeError> {
    let Some(dir) = pe.data_directory(directory::EXCEPTION) else {
        return Ok(Vec::new());
    };
    let count = dir.size as usize / std::mem::size_of::<RuntimeFunction>();
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        out.push(read_at(
            image,
            dir.virtual_address as usize + i * std::mem::size_of::<RuntimeFunction>(),
            "exception",
        )?);
    }
    Ok(out)
}

/// One memcpy/memset descriptor of a reset plan, in image offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetOp {
    pub offset: usize,
    pub len: usize,
}

/// Precomputed plan for resetting a live image from its virgin copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetPlan {
    pub copies: SmallVec<[ResetOp; 3]>,
    pub zeros: SmallVec<[ResetOp; 3]>,
    /// The plan could not be squeezed into the op budget; reset copies the
    /// whole image instead.
    pub whole_image: bool,
}

const MAX_COPIES: usize = 3;
const MAX_ZEROS: usize = 3;
/// Minimum trailing zero run worth a dedicated memset.
const MIN_ZERO_RUN: usize = 128;

/// Build the quick-reset plan by scanning each writable section of the
/// virgin image for a trailing zero run.
pub fn build_reset_plan(sections: &[ImageSectionHeader], virgin: &[u8]) -> ResetPlan {
    let mut copies: Vec<ResetOp> = Vec::new();
    let mut zeros: Vec<ResetOp> = Vec::new();

    for s in sections {
        if !s.is_writable() {
            continue;
        }
        let start = s.virtual_address as usize;
        let len = s.virtual_size as usize;
        if len == 0 || start + len > virgin.len() {
            continue;
        }
        let bytes = &virgin[start..start + len];
        let nonzero_len = bytes
            .iter()
            .rposition(|&b| b != 0)
            .map_or(0, |i| i + 1);
        let zero_run = len - nonzero_len;
        if zero_run >= MIN_ZERO_RUN {
            if nonzero_len > 0 {
                copies.push(ResetOp {
                    offset: start,
                    len: nonzero_len,
                });
            }
            zeros.push(ResetOp {
                offset: start + nonzero_len,
                len: zero_run,
            });
        } else {
            copies.push(ResetOp {
                offset: start,
                len,
            });
        }
    }

    // Zero ops past the budget become copies; copying zeroes from the virgin
    // image is always correct, zeroing non-zero virgin bytes never is.
    zeros.sort_by_key(|z| std::cmp::Reverse(z.len));
    while zeros.len() > MAX_ZEROS {
        let z = zeros.pop().unwrap();
        copies.push(ResetOp {
            offset: z.offset,
            len: z.len,
        });
    }

    // Merge copies until they fit; the gap between two copies is unmodified
    // virgin data, so folding it in is harmless.
    copies.sort_by_key(|c| c.offset);
    while copies.len() > MAX_COPIES {
        let mut best = 1usize;
        let mut best_gap = usize::MAX;
        for i in 1..copies.len() {
            let gap = copies[i].offset - (copies[i - 1].offset + copies[i - 1].len);
            if gap < best_gap {
                best_gap = gap;
                best = i;
            }
        }
        let b = copies.remove(best);
        let a = &mut copies[best - 1];
        a.len = (b.offset + b.len) - a.offset;
    }

    ResetPlan {
        copies: copies.into_iter().collect(),
        zeros: zeros.into_iter().collect(),
        whole_image: false,
    }
}

/// Fallback plan: one whole-image copy.
pub fn whole_image_plan() -> ResetPlan {
    ResetPlan {
        copies: SmallVec::new(),
        zeros: SmallVec::new(),
        whole_image: true,
    }
}

/// Reset `live` to the virgin state using `plan`.
pub fn apply_reset(plan: &ResetPlan, virgin: &[u8], live: &mut [u8]) {
    debug_assert_eq!(virgin.len(), live.len());
    if plan.whole_image {
        live.copy_from_slice(virgin);
        return;
    }
    for c in &plan.copies {
        live[c.offset..c.offset + c.len].copy_from_slice(&virgin[c.offset..c.offset + c.len]);
    }
    for z in &plan.zeros {
        live[z.offset..z.offset + z.len].fill(0);
    }
}

#[cfg(windows)]
mod sys {
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE,
        PAGE_EXECUTE_READWRITE,
    };

    pub fn alloc_image(size: usize, preferred_base: u64) -> Option<*mut u8> {
        // Try the preferred base first; a relocated image costs fixups and
        // loses page sharing, but still works.
        // SAFETY: plain allocation; null checked.
        unsafe {
            let at_base = VirtualAlloc(
                preferred_base as *const _,
                size,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_EXECUTE_READWRITE,
            );
            if !at_base.is_null() {
                return Some(at_base as *mut u8);
            }
            let anywhere = VirtualAlloc(
                std::ptr::null(),
                size,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_EXECUTE_READWRITE,
            );
            (!anywhere.is_null()).then_some(anywhere as *mut u8)
        }
    }

    pub fn free_image(ptr: *mut u8, _size: usize) {
        // SAFETY: ptr came from VirtualAlloc.
        unsafe { VirtualFree(ptr as *mut _, 0, MEM_RELEASE) };
    }
}

#[cfg(not(windows))]
mod sys {
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    const PAGE: usize = 4096;

    pub fn alloc_image(size: usize, _preferred_base: u64) -> Option<*mut u8> {
        let layout = Layout::from_size_align(size.max(1), PAGE).ok()?;
        // SAFETY: non-zero size and valid alignment.
        let p = unsafe { alloc_zeroed(layout) };
        (!p.is_null()).then_some(p)
    }

    pub fn free_image(ptr: *mut u8, size: usize) {
        let layout = Layout::from_size_align(size.max(1), PAGE).unwrap();
        // SAFETY: matches alloc_image.
        unsafe { dealloc(ptr, layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::super::testpe::Builder;
    use super::*;

    fn map(built: &[u8]) -> (PeFile<'_>, Vec<u8>) {
        let pe = PeFile::parse(built).unwrap();
        let mut image = vec![0u8; pe.size_of_image() as usize];
        map_sections(&pe, &mut image).unwrap();
        (pe, image)
    }

    #[test]
    fn sections_land_at_their_rvas() {
        let built = Builder::new().data_section(b"DATA!".to_vec()).build();
        let (pe, image) = map(&built);
        assert_eq!(&image[0x1000], &0xC3);
        assert_eq!(&image[Builder::DATA_RVA as usize..Builder::DATA_RVA as usize + 5], b"DATA!");
        assert_eq!(image.len(), pe.size_of_image() as usize);
    }

    #[test]
    fn relocation_adjusts_dir64_sites() {
        // .data holds a pointer to the image base; relocate and check.
        let site = Builder::DATA_RVA;
        let built = Builder::new()
            .data_section(super::super::testpe::DEFAULT_BASE.to_le_bytes().to_vec())
            .reloc_at(site)
            .build();
        let (pe, mut image) = map(&built);
        let delta = 0x10_0000i64;
        apply_relocations(&pe, &mut image, delta).unwrap();
        let fixed = u64::from_le_bytes(
            image[site as usize..site as usize + 8].try_into().unwrap(),
        );
        assert_eq!(fixed, super::super::testpe::DEFAULT_BASE + 0x10_0000);
        // Zero delta is a no-op even without a reloc directory; a stripped
        // image cannot be rebased at all.
        let built2 = Builder::new().no_relocs().build();
        let (pe2, mut image2) = map(&built2);
        apply_relocations(&pe2, &mut image2, 0).unwrap();
        assert!(apply_relocations(&pe2, &mut image2, 0x1000).is_err());
    }

    #[test]
    fn import_walk_and_patch() {
        let built = Builder::new()
            .import("KERNEL32.dll", &["CreateFileW", "CloseHandle"])
            .import("ucrtbase.dll", &["malloc"])
            .build();
        let (pe, mut image) = map(&built);
        let imports = walk_imports(&pe, &image).unwrap();
        assert_eq!(imports.len(), 2);
        assert_eq!(imports[0].dll, "KERNEL32.dll");
        assert_eq!(
            imports[0].entries[0].symbol,
            ImportSymbol::Name("CreateFileW".to_owned())
        );
        assert_eq!(imports[1].entries.len(), 1);

        let slot = imports[0].entries[1].iat_rva;
        patch_iat_slot(&mut image, slot, 0xDEAD_BEEF_CAFE);
        assert_eq!(read_iat_slot(&image, slot), 0xDEAD_BEEF_CAFE);
    }

    #[test]
    fn export_lookup_binary_search() {
        let built = Builder::new()
            .export("zeta", 0x1008)
            .export("alpha", 0x1000)
            .export("mid", 0x1004)
            .build();
        let (pe, image) = map(&built);
        assert_eq!(
            find_export(&pe, &image, "alpha").unwrap(),
            Some(Export::Rva(0x1000))
        );
        assert_eq!(
            find_export(&pe, &image, "zeta").unwrap(),
            Some(Export::Rva(0x1008))
        );
        assert_eq!(find_export(&pe, &image, "nope").unwrap(), None);
    }

    #[test]
    fn tls_directory_read() {
        let built = Builder::new().tls(0x100, 0x40).build();
        let (pe, image) = map(&built);
        let tls = read_tls_directory(&pe, &image).unwrap().unwrap();
        let raw = tls.end_address_of_raw_data - tls.start_address_of_raw_data;
        assert_eq!(raw, 0x100);
        assert_eq!(tls.size_of_zero_fill, 0x40);
        let no_tls = Builder::new().build();
        let (pe2, image2) = map(&no_tls);
        assert!(read_tls_directory(&pe2, &image2).unwrap().is_none());
    }

    #[test]
    fn reset_plan_splits_trailing_zeros() {
        // 256 bytes of data followed by 512 zeroes.
        let mut data = vec![0xABu8; 256];
        data.extend_from_slice(&[0u8; 512]);
        let built = Builder::new().data_section(data).build();
        let (pe, image) = map(&built);
        let plan = build_reset_plan(pe.sections(), &image);
        assert_eq!(plan.copies.len(), 1);
        assert_eq!(plan.zeros.len(), 1);
        assert_eq!(plan.copies[0], ResetOp { offset: 0x2000, len: 256 });
        assert_eq!(plan.zeros[0], ResetOp { offset: 0x2100, len: 512 });
    }

    #[test]
    fn short_zero_tail_stays_a_copy() {
        let mut data = vec![0xABu8; 256];
        data.extend_from_slice(&[0u8; 64]); // below the run threshold
        let built = Builder::new().data_section(data).build();
        let (pe, image) = map(&built);
        let plan = build_reset_plan(pe.sections(), &image);
        assert_eq!(plan.copies.len(), 1);
        assert!(plan.zeros.is_empty());
        assert_eq!(plan.copies[0].len, 320);
    }

    #[test]
    fn reset_restores_scribbled_image() {
        let mut data = vec![0x11u8; 300];
        data.extend_from_slice(&[0u8; 700]);
        let built = Builder::new().data_section(data).data_bss(0x100).build();
        let (pe, image) = map(&built);
        let virgin = image.clone();
        let plan = build_reset_plan(pe.sections(), &virgin);

        let mut live = image;
        // The tool scribbles over data, the zero tail and the bss.
        for b in &mut live[0x2000..0x2000 + 1000 + 0x100] {
            *b = 0x99;
        }
        apply_reset(&plan, &virgin, &mut live);
        assert_eq!(live, virgin);

        // Two back-to-back resets leave the image byte-identical.
        apply_reset(&plan, &virgin, &mut live);
        assert_eq!(live, virgin);

        // The whole-image fallback agrees.
        let mut live2 = virgin.clone();
        live2[0x2000] = 0xFF;
        apply_reset(&whole_image_plan(), &virgin, &mut live2);
        assert_eq!(live2, virgin);
    }

    #[test]
    fn plan_budget_is_respected() {
        // Synthesize many writable sections to overflow the op budget.
        let mk = |addr: u32, vsize: u32| ImageSectionHeader {
            name: *b".data\0\0\0",
            virtual_size: vsize,
            virtual_address: addr,
            size_of_raw_data: vsize,
            pointer_to_raw_data: 0,
            pointer_to_relocations: 0,
            pointer_to_linenumbers: 0,
            number_of_relocations: 0,
            number_of_linenumbers: 0,
            characteristics: (SectionFlags::INITIALIZED_DATA
                | SectionFlags::READ
                | SectionFlags::WRITE)
                .bits(),
        };
        use super::super::SectionFlags;
        let sections: Vec<_> = (0..6).map(|i| mk(0x1000 + i * 0x1000, 0x800)).collect();
        let mut virgin = vec![0u8; 0x8000];
        for i in 0..6u32 {
            let at = (0x1000 + i * 0x1000) as usize;
            // Half data, half zeroes per section.
            for b in &mut virgin[at..at + 0x400] {
                *b = 0x42;
            }
        }
        let plan = build_reset_plan(&sections, &virgin);
        assert!(plan.copies.len() <= 3);
        assert!(plan.zeros.len() <= 3);

        // The tool may scribble anywhere inside the writable sections.
        let mut live = virgin.clone();
        for s in &sections {
            let at = s.virtual_address as usize;
            for b in &mut live[at..at + s.virtual_size as usize] {
                *b = 0x99;
            }
        }
        apply_reset(&plan, &virgin, &mut live);
        assert_eq!(live, virgin);
    }
}
