//! Import replacement tables.
//!
//! Three tables drive the interception:
//! - the **manual** table, consulted while resolving imports of manually
//!   mapped images (the full surface);
//! - the **native** table, applied by rewriting the IATs of whitelisted
//!   natively loaded toolchain DLLs (files, console, exit);
//! - the **GetProcAddress** table, for the few symbols that need per-tool
//!   isolation even when looked up dynamically.
//!
//! An entry either carries one fixed pointer or a 32-element per-CRT-slot
//! thunk array; the importing side picks the element for the CRT instance it
//! links against.

pub mod api;
pub mod crt;

use std::sync::OnceLock;

use crate::modules::{ImportResolver, MAX_CRT_SLOTS};
use crate::pe::image::ImportSymbol;
use crate::win32::eq_ascii_icase;

#[derive(Debug, Clone)]
pub enum Replacement {
    /// The IAT slot gets this pointer.
    Single(usize),
    /// The IAT slot gets the element for the importing CRT instance.
    CrtSlotArray([usize; MAX_CRT_SLOTS]),
}

#[derive(Debug, Clone)]
pub struct ReplacementEntry {
    pub function: &'static str,
    /// Constrain to imports from this module; `None` matches any.
    pub module: Option<&'static str>,
    /// Only applied when the importing image is the executable (atexit and
    /// friends keep OS semantics inside shared DLLs).
    pub only_executable: bool,
    pub replacement: Replacement,
}

fn entry(function: &'static str, ptr: usize) -> ReplacementEntry {
    ReplacementEntry {
        function,
        module: None,
        only_executable: false,
        replacement: Replacement::Single(ptr),
    }
}

fn exe_entry(function: &'static str, ptr: usize) -> ReplacementEntry {
    ReplacementEntry {
        only_executable: true,
        ..entry(function, ptr)
    }
}

fn slot_entry(function: &'static str, slots: [usize; MAX_CRT_SLOTS]) -> ReplacementEntry {
    ReplacementEntry {
        function,
        module: None,
        only_executable: false,
        replacement: Replacement::CrtSlotArray(slots),
    }
}

/// Shared lookup across the three tables.
pub fn lookup(
    table: &[ReplacementEntry],
    function: &str,
    module: Option<&str>,
    importing_is_executable: bool,
    crt_slot: Option<u8>,
) -> Option<usize> {
    table
        .iter()
        .filter(|e| eq_ascii_icase(e.function.as_bytes(), function.as_bytes()))
        .filter(|e| match (e.module, module) {
            (Some(want), Some(have)) => eq_ascii_icase(want.as_bytes(), have.as_bytes()),
            (Some(_), None) => false,
            (None, _) => true,
        })
        .find(|e| !e.only_executable || importing_is_executable)
        .and_then(|e| match &e.replacement {
            Replacement::Single(p) => Some(*p),
            Replacement::CrtSlotArray(slots) => {
                Some(slots[crt_slot.unwrap_or(0) as usize])
            }
        })
}

/// Full surface, for manually mapped images.
pub fn manual_table() -> &'static [ReplacementEntry] {
    static TABLE: OnceLock<Vec<ReplacementEntry>> = OnceLock::new();
    TABLE.get_or_init(|| {
        use api::*;
        let mut t = vec![
            // Files
            entry("CreateFileA", kw_create_file_a as usize),
            entry("CreateFileW", kw_create_file_w as usize),
            entry("ReadFile", kw_read_file as usize),
            entry("WriteFile", kw_write_file as usize),
            entry("CloseHandle", kw_close_handle as usize),
            entry("SetFilePointer", kw_set_file_pointer as usize),
            entry("SetFilePointerEx", kw_set_file_pointer_ex as usize),
            entry("GetFileSize", kw_get_file_size as usize),
            entry("GetFileSizeEx", kw_get_file_size_ex as usize),
            entry("GetFileType", kw_get_file_type as usize),
            entry("SetEndOfFile", kw_set_end_of_file as usize),
            entry("DeleteFileW", kw_delete_file_w as usize),
            entry("DuplicateHandle", kw_duplicate_handle as usize),
            entry("CreateFileMappingW", kw_create_file_mapping_w as usize),
            entry("MapViewOfFile", kw_map_view_of_file as usize),
            entry("UnmapViewOfFile", kw_unmap_view_of_file as usize),
            entry("GetStdHandle", kw_get_std_handle as usize),
            // Console
            entry("WriteConsoleA", kw_write_console_a as usize),
            entry("WriteConsoleW", kw_write_console_w as usize),
            // Modules
            entry("LoadLibraryA", kw_load_library_a as usize),
            entry("LoadLibraryW", kw_load_library_w as usize),
            entry("LoadLibraryExA", kw_load_library_ex_a as usize),
            entry("LoadLibraryExW", kw_load_library_ex_w as usize),
            entry("FreeLibrary", kw_free_library as usize),
            entry("GetModuleHandleA", kw_get_module_handle_a as usize),
            entry("GetModuleHandleW", kw_get_module_handle_w as usize),
            entry("GetProcAddress", kw_get_proc_address as usize),
            entry("GetModuleFileNameA", kw_get_module_file_name_a as usize),
            entry("GetModuleFileNameW", kw_get_module_file_name_w as usize),
            entry("RtlPcToFileHeader", kw_rtl_pc_to_file_header as usize),
            // Memory and process-wide resources
            entry("VirtualAlloc", kw_virtual_alloc as usize),
            entry("VirtualFree", kw_virtual_free as usize),
            entry("HeapCreate", kw_heap_create as usize),
            entry("HeapDestroy", kw_heap_destroy as usize),
            exe_entry("FlsAlloc", kw_fls_alloc as usize),
            exe_entry("FlsFree", kw_fls_free as usize),
            exe_entry("TlsAlloc", kw_tls_alloc as usize),
            exe_entry("TlsFree", kw_tls_free as usize),
            entry("CreateThread", kw_create_thread as usize),
            // Exit paths
            entry("ExitProcess", kw_exit_process as usize),
            entry("TerminateProcess", kw_terminate_process as usize),
            entry("exit", kw_crt_exit as usize),
            entry("_exit", kw_crt_exit_fast as usize),
            entry("_cexit", kw_crt_cexit as usize),
            entry("_c_exit", kw_crt_c_exit as usize),
            entry("_amsg_exit", kw_crt_amsg_exit as usize),
            exe_entry("atexit", kw_atexit as usize),
            exe_entry("_onexit", kw_onexit as usize),
            // Command line and environment
            entry("GetCommandLineA", kw_get_command_line_a as usize),
            entry("GetCommandLineW", kw_get_command_line_w as usize),
            entry("GetEnvironmentVariableA", kw_get_environment_variable_a as usize),
            entry("GetEnvironmentVariableW", kw_get_environment_variable_w as usize),
            entry("SetEnvironmentVariableA", kw_set_environment_variable_a as usize),
            entry("SetEnvironmentVariableW", kw_set_environment_variable_w as usize),
            entry("getenv", kw_getenv as usize),
            entry("_wgetenv", kw_wgetenv as usize),
            // CryptoAPI (cl.exe hashing)
            entry("CryptAcquireContextW", kw_crypt_acquire_context_w as usize),
            entry("CryptReleaseContext", kw_crypt_release_context as usize),
            entry("CryptCreateHash", kw_crypt_create_hash as usize),
            entry("CryptHashData", kw_crypt_hash_data as usize),
            entry("CryptGetHashParam", kw_crypt_get_hash_param as usize),
            entry("CryptDestroyHash", kw_crypt_destroy_hash as usize),
        ];
        t.push(slot_entry("_wdupenv_s", crt::wdupenv_s_slots()));
        t.push(slot_entry("_dupenv_s", crt::dupenv_s_slots()));
        t
    })
}

/// Narrow surface for whitelisted native DLLs: file, console and exit APIs
/// only. The OS loader owns everything else there.
pub fn native_table() -> &'static [ReplacementEntry] {
    static TABLE: OnceLock<Vec<ReplacementEntry>> = OnceLock::new();
    TABLE.get_or_init(|| {
        use api::*;
        vec![
            entry("CreateFileA", kw_create_file_a as usize),
            entry("CreateFileW", kw_create_file_w as usize),
            entry("ReadFile", kw_read_file as usize),
            entry("WriteFile", kw_write_file as usize),
            entry("CloseHandle", kw_close_handle as usize),
            entry("SetFilePointer", kw_set_file_pointer as usize),
            entry("SetFilePointerEx", kw_set_file_pointer_ex as usize),
            entry("GetFileSize", kw_get_file_size as usize),
            entry("GetFileSizeEx", kw_get_file_size_ex as usize),
            entry("GetFileType", kw_get_file_type as usize),
            entry("SetEndOfFile", kw_set_end_of_file as usize),
            entry("DeleteFileW", kw_delete_file_w as usize),
            entry("WriteConsoleA", kw_write_console_a as usize),
            entry("WriteConsoleW", kw_write_console_w as usize),
            entry("GetStdHandle", kw_get_std_handle as usize),
            entry("ExitProcess", kw_exit_process as usize),
            entry("TerminateProcess", kw_terminate_process as usize),
            entry("exit", kw_crt_exit as usize),
            entry("_exit", kw_crt_exit_fast as usize),
            entry("_amsg_exit", kw_crt_amsg_exit as usize),
        ]
    })
}

/// Symbols that need isolation even through dynamic lookup.
pub fn get_proc_table() -> &'static [ReplacementEntry] {
    static TABLE: OnceLock<Vec<ReplacementEntry>> = OnceLock::new();
    TABLE.get_or_init(|| {
        use api::*;
        vec![
            entry("FlsAlloc", kw_fls_alloc as usize),
            entry("FlsFree", kw_fls_free as usize),
            entry("TlsAlloc", kw_tls_alloc as usize),
            entry("TlsFree", kw_tls_free as usize),
        ]
    })
}

/// The resolver handed to the module registry when loading tools.
#[derive(Debug, Default, Clone, Copy)]
pub struct SandboxResolver;

impl ImportResolver for SandboxResolver {
    fn resolve(
        &self,
        importing_is_executable: bool,
        dll_crt_slot: Option<u8>,
        dll: &str,
        symbol: &ImportSymbol,
    ) -> Option<usize> {
        let ImportSymbol::Name(name) = symbol else {
            return None;
        };
        lookup(
            manual_table(),
            name,
            Some(dll),
            importing_is_executable,
            dll_crt_slot,
        )
    }
}

/// Rewrite the IAT of a natively loaded, whitelisted DLL in place.
///
/// Windows only: it pokes real image memory after flipping the page
/// protection of the `.rdata` IAT pages.
#[cfg(windows)]
pub fn patch_native_iat(module_base: usize) -> Result<usize, crate::pe::PeError> {
    use crate::pe::image::{walk_imports, ImportSymbol};
    use crate::pe::PeFile;
    use windows_sys::Win32::System::Memory::{VirtualProtect, PAGE_READWRITE};

    // SAFETY: the module is loaded; headers and directories are mapped.
    let image = unsafe {
        let size_probe = PeFile::parse(std::slice::from_raw_parts(module_base as *const u8, 0x1000))
            .map(|pe| pe.size_of_image() as usize)?;
        std::slice::from_raw_parts_mut(module_base as *mut u8, size_probe)
    };
    let pe = PeFile::parse(image)?;
    let imports = walk_imports(&pe, image)?;
    let mut patched = 0usize;
    for dep in &imports {
        for entry in &dep.entries {
            let ImportSymbol::Name(name) = &entry.symbol else {
                continue;
            };
            let Some(target) = lookup(native_table(), name, Some(&dep.dll), false, None) else {
                continue;
            };
            let slot = (module_base + entry.iat_rva as usize) as *mut u64;
            // SAFETY: slot points into the module's IAT; protection is
            // restored right after the write.
            unsafe {
                let mut old = 0u32;
                if VirtualProtect(slot as *mut _, 8, PAGE_READWRITE, &mut old) == 0 {
                    continue;
                }
                *slot = target as u64;
                let mut scratch = 0u32;
                VirtualProtect(slot as *mut _, 8, old, &mut scratch);
            }
            patched += 1;
        }
    }
    Ok(patched)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_table_covers_the_exit_family() {
        for f in ["exit", "_exit", "_cexit", "_c_exit", "_amsg_exit", "ExitProcess"] {
            assert!(
                lookup(manual_table(), f, None, true, None).is_some(),
                "missing {f}"
            );
        }
    }

    #[test]
    fn native_table_is_a_subset() {
        assert!(lookup(native_table(), "CreateFileW", None, false, None).is_some());
        assert!(lookup(native_table(), "VirtualAlloc", None, false, None).is_none());
        assert!(lookup(native_table(), "FlsAlloc", None, false, None).is_none());
    }

    #[test]
    fn exe_only_entries_skip_dlls() {
        assert!(lookup(manual_table(), "FlsAlloc", None, true, None).is_some());
        assert!(lookup(manual_table(), "FlsAlloc", None, false, None).is_none());
        assert!(lookup(manual_table(), "atexit", None, false, None).is_none());
    }

    #[test]
    fn lookup_is_case_insensitive_on_module() {
        let got = lookup(
            manual_table(),
            "CreateFileW",
            Some("KERNEL32.DLL"),
            true,
            None,
        );
        assert!(got.is_some());
        // Function names are case-sensitive in PE exports but matched
        // case-insensitively here like the original.
        assert_eq!(
            lookup(manual_table(), "createfilew", None, true, None),
            got
        );
    }

    #[test]
    fn crt_slot_array_dispatches_per_slot() {
        let a = lookup(manual_table(), "_wdupenv_s", None, true, Some(0)).unwrap();
        let b = lookup(manual_table(), "_wdupenv_s", None, true, Some(5)).unwrap();
        assert_ne!(a, b);
        let again = lookup(manual_table(), "_wdupenv_s", None, true, Some(5)).unwrap();
        assert_eq!(b, again);
    }

    #[test]
    fn get_proc_table_isolates_tls() {
        assert!(lookup(get_proc_table(), "FlsAlloc", None, false, None).is_some());
        assert!(lookup(get_proc_table(), "CreateFileW", None, false, None).is_none());
    }
}
