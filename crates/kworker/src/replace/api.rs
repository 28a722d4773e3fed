//! The intercepted Win32/CRT surface.
//!
//! These are the functions patched into IATs. They speak raw Win32: sentinel
//! returns, `SetLastError`, NUL-terminated strings, and they must never let
//! an error escape as an OS exception the original API would not raise. The
//! one deliberate unwind is the exit family, which throws [`SandboxExit`]
//! through `extern "system-unwind"` so the job driver can catch it at the
//! entry-point boundary.
//!
//! Coverage is intentional, not exhaustive: enough of Win32 to satisfy
//! cl.exe, link.exe and the assemblers, nothing more.

#![allow(clippy::missing_safety_doc)]

use std::ffi::c_void;
use std::sync::Arc;

use tracing::trace;

use crate::file_cache::{self, CacheLimits};
use crate::fs_cache::{classify_extension, ExtClass};
use crate::handles::{CloseResult, HandleData, HandleEntry};
use crate::modules::is_virtual_api;
use crate::output::StdStream;
use crate::sandbox::{sandbox, SandboxExit};
use crate::stats::Stats;
use crate::temp_store::{CreateOutcome, TempStore};
use crate::tools::DynLoad;
use crate::win32::{self, error, file, RawHandle};

type Bool = i32;
const TRUE: Bool = 1;
const FALSE: Bool = 0;
const INVALID_HANDLE: usize = usize::MAX;

const STD_INPUT_HANDLE: u32 = 0xFFFF_FFF6; // -10
const STD_OUTPUT_HANDLE: u32 = 0xFFFF_FFF5; // -11
const STD_ERROR_HANDLE: u32 = 0xFFFF_FFF4; // -12

/// NUL-terminated ANSI string from a raw pointer.
unsafe fn ansi_str(ptr: *const u8) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: caller passes a NUL-terminated string per the API contract.
    unsafe {
        Some(
            std::ffi::CStr::from_ptr(ptr as *const _)
                .to_string_lossy()
                .into_owned(),
        )
    }
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

fn create_file_common(path: String, access: u32, disposition: u32, flags: u32) -> usize {
    let sb = sandbox();

    // Temp-file route: the cl.exe scratch names never touch the disk.
    let device_flags = file::FILE_FLAG_BACKUP_SEMANTICS | file::FILE_FLAG_OPEN_REPARSE_POINT;
    if TempStore::is_temp_name(&path)
        && sb.tool_is_cl()
        && access & file::GENERIC_EXECUTE == 0
        && flags & device_flags == 0
    {
        match sb.temp.lock().unwrap().create(&path, disposition) {
            CreateOutcome::Opened(tf) => {
                tf.lock().unwrap().active_handles += 1;
                let handle = sb.alloc_handle();
                sb.handles
                    .enter(HandleEntry::new(handle, access, HandleData::TempFile(tf)));
                win32::set_last_error(error::SUCCESS);
                return handle.0;
            }
            CreateOutcome::FallThrough => {}
            CreateOutcome::Fail(code) => {
                win32::set_last_error(code);
                return INVALID_HANDLE;
            }
        }
    }

    // Cached-read route for headers and friends.
    let write_access = file::GENERIC_WRITE | file::GENERIC_ALL | file::DELETE;
    if access & (write_access | file::GENERIC_EXECUTE) == 0
        && disposition == file::OPEN_EXISTING
    {
        let (pch_caching, cwd) = {
            let job = sb.job.lock().unwrap();
            (job.pch_caching, job.working_dir.clone())
        };
        if classify_extension(&path, pch_caching, sb.tool_is_link()) == ExtClass::CacheableRead {
            let mut fs = sb.fs.lock().unwrap();
            match fs.lookup(&path, &cwd) {
                Ok(obj) => {
                    let hit = fs.user_data::<crate::file_cache::CachedFile>(obj).is_some();
                    match file_cache::get_or_create(&mut fs, obj, CacheLimits { pch_caching }) {
                        Ok(cached) => {
                            drop(fs);
                            if hit {
                                Stats::bump(&sb.stats.cached_file_hits);
                            } else {
                                Stats::bump(&sb.stats.cached_file_misses);
                            }
                            let handle = sb.alloc_handle();
                            sb.handles.enter(HandleEntry::new(
                                handle,
                                access,
                                HandleData::CachedFile(cached),
                            ));
                            win32::set_last_error(error::SUCCESS);
                            return handle.0;
                        }
                        Err(err) => {
                            // Too large or unmappable: plain passthrough.
                            trace!(%err, path, "file not cacheable");
                        }
                    }
                }
                Err(_) => {
                    win32::set_last_error(error::FILE_NOT_FOUND);
                    return INVALID_HANDLE;
                }
            }
        }
    }

    sys::create_file_real(&path, access, disposition, flags)
}

pub unsafe extern "system" fn kw_create_file_w(
    path: *const u16,
    access: u32,
    _share: u32,
    _security: *mut c_void,
    disposition: u32,
    flags: u32,
    _template: usize,
) -> usize {
    // SAFETY: API contract, NUL-terminated path.
    let Some(path) = (unsafe { win32::from_wide_ptr(path) }) else {
        win32::set_last_error(error::INVALID_PARAMETER);
        return INVALID_HANDLE;
    };
    create_file_common(path, access, disposition, flags)
}

pub unsafe extern "system" fn kw_create_file_a(
    path: *const u8,
    access: u32,
    _share: u32,
    _security: *mut c_void,
    disposition: u32,
    flags: u32,
    _template: usize,
) -> usize {
    // SAFETY: API contract, NUL-terminated path.
    let Some(path) = (unsafe { ansi_str(path) }) else {
        win32::set_last_error(error::INVALID_PARAMETER);
        return INVALID_HANDLE;
    };
    create_file_common(path, access, disposition, flags)
}

pub unsafe extern "system" fn kw_read_file(
    handle: usize,
    buffer: *mut u8,
    to_read: u32,
    read_out: *mut u32,
    _overlapped: *mut c_void,
) -> Bool {
    let sb = sandbox();
    let h = RawHandle(handle);
    // SAFETY: buffer has to_read writable bytes per the API contract.
    let buf = unsafe { std::slice::from_raw_parts_mut(buffer, to_read as usize) };
    let result = sb.handles.with_entry(h, |entry| match &entry.data {
        HandleData::CachedFile(f) => {
            let offset = entry.offset;
            let n = f.read_at(offset, buf);
            entry.offset += n as u64;
            Some((n, Some((Arc::clone(f), offset))))
        }
        HandleData::TempFile(tf) => {
            let n = tf.lock().unwrap().read_at(entry.offset, buf);
            entry.offset += n as u64;
            Some((n, None))
        }
        _ => None,
    });
    match result {
        Some(Some((n, hint))) => {
            if let Some((f, offset)) = hint {
                // Remember the read so a following CryptHashData on the same
                // buffer can ride the cached-file fast path.
                sb.hash
                    .lock()
                    .unwrap()
                    .note_cached_read(&f, offset, buffer as usize, n);
            }
            if !read_out.is_null() {
                // SAFETY: out-param per the API contract.
                unsafe { *read_out = n as u32 };
            }
            win32::set_last_error(error::SUCCESS);
            TRUE
        }
        Some(None) => {
            win32::set_last_error(error::ACCESS_DENIED);
            FALSE
        }
        None => sys::read_file_real(handle, buf, read_out),
    }
}

pub unsafe extern "system" fn kw_write_file(
    handle: usize,
    buffer: *const u8,
    to_write: u32,
    written_out: *mut u32,
    _overlapped: *mut c_void,
) -> Bool {
    enum Wrote {
        Stream(StdStream, usize),
        Temp(usize),
        Refused,
    }
    let sb = sandbox();
    let h = RawHandle(handle);
    // SAFETY: buffer holds to_write readable bytes per the API contract.
    let data = unsafe { std::slice::from_raw_parts(buffer, to_write as usize) };
    let result = sb.handles.with_entry(h, |entry| match &entry.data {
        HandleData::Output(stream) => Wrote::Stream(*stream, data.len()),
        HandleData::TempFile(tf) => {
            let mut tf = tf.lock().unwrap();
            match tf.write_at(entry.offset, data) {
                Ok(n) => {
                    entry.offset += n as u64;
                    Wrote::Temp(n)
                }
                Err(code) => {
                    win32::set_last_error(code);
                    Wrote::Refused
                }
            }
        }
        _ => {
            win32::set_last_error(error::ACCESS_DENIED);
            Wrote::Refused
        }
    });
    let n = match result {
        Some(Wrote::Stream(stream, n)) => {
            sb.output.lock().unwrap().write(stream, data);
            n
        }
        Some(Wrote::Temp(n)) => {
            sb.temp.lock().unwrap().note_written(n);
            Stats::add(&sb.stats.temp_bytes_written, n as u64);
            n
        }
        Some(Wrote::Refused) => return FALSE,
        None => return sys::write_file_real(handle, data, written_out),
    };
    if !written_out.is_null() {
        // SAFETY: out-param per the API contract.
        unsafe { *written_out = n as u32 };
    }
    TRUE
}

pub unsafe extern "system" fn kw_close_handle(handle: usize) -> Bool {
    let sb = sandbox();
    match sb.handles.close(RawHandle(handle)) {
        CloseResult::Freed | CloseResult::StillOpen => {
            win32::set_last_error(error::SUCCESS);
            TRUE
        }
        CloseResult::NotOurs => {
            if sb.hash.lock().unwrap().is_ours(handle) {
                // Some tools CloseHandle their crypt handles.
                let _ = sb.hash.lock().unwrap().destroy_hash(handle);
                return TRUE;
            }
            sys::close_handle_real(handle)
        }
    }
}

fn seek_common(handle: usize, distance: i64, method: u32) -> Result<u64, u32> {
    let sb = sandbox();
    sb.handles
        .with_entry(RawHandle(handle), |entry| {
            let size = match &entry.data {
                HandleData::CachedFile(f) => f.size(),
                HandleData::TempFile(tf) => tf.lock().unwrap().size(),
                _ => return Err(error::INVALID_HANDLE),
            };
            let base = match method {
                file::FILE_BEGIN => 0i64,
                file::FILE_CURRENT => entry.offset as i64,
                file::FILE_END => size as i64,
                _ => return Err(error::INVALID_PARAMETER),
            };
            let target = base + distance;
            if target < 0 {
                return Err(error::NEGATIVE_SEEK);
            }
            // Seeking past EOF is allowed; the file grows on the next write.
            entry.offset = target as u64;
            Ok(entry.offset)
        })
        .unwrap_or(Err(error::INVALID_HANDLE))
}

pub unsafe extern "system" fn kw_set_file_pointer(
    handle: usize,
    distance: i32,
    distance_high: *mut i32,
    method: u32,
) -> u32 {
    let dist = if distance_high.is_null() {
        distance as i64
    } else {
        // SAFETY: in/out high part per the API contract.
        let high = unsafe { *distance_high };
        ((high as i64) << 32) | (distance as u32 as i64)
    };
    match seek_common(handle, dist, method) {
        Ok(pos) => {
            if !distance_high.is_null() {
                // SAFETY: out-param per the API contract.
                unsafe { *distance_high = (pos >> 32) as i32 };
            }
            win32::set_last_error(error::SUCCESS);
            pos as u32
        }
        Err(code) => {
            win32::set_last_error(code);
            file::INVALID_SET_FILE_POINTER
        }
    }
}

pub unsafe extern "system" fn kw_set_file_pointer_ex(
    handle: usize,
    distance: i64,
    new_position: *mut i64,
    method: u32,
) -> Bool {
    match seek_common(handle, distance, method) {
        Ok(pos) => {
            if !new_position.is_null() {
                // SAFETY: out-param per the API contract.
                unsafe { *new_position = pos as i64 };
            }
            TRUE
        }
        Err(code) => {
            win32::set_last_error(code);
            FALSE
        }
    }
}

fn size_of_handle(handle: usize) -> Option<u64> {
    sandbox().handles.with_entry(RawHandle(handle), |entry| {
        match &entry.data {
            HandleData::CachedFile(f) => Some(f.size()),
            HandleData::TempFile(tf) => Some(tf.lock().unwrap().size()),
            _ => None,
        }
    })?
}

pub unsafe extern "system" fn kw_get_file_size(handle: usize, size_high: *mut u32) -> u32 {
    match size_of_handle(handle) {
        Some(size) => {
            if !size_high.is_null() {
                // SAFETY: out-param per the API contract.
                unsafe { *size_high = (size >> 32) as u32 };
            }
            win32::set_last_error(error::SUCCESS);
            size as u32
        }
        None => {
            win32::set_last_error(error::INVALID_HANDLE);
            file::INVALID_FILE_SIZE
        }
    }
}

pub unsafe extern "system" fn kw_get_file_size_ex(handle: usize, size_out: *mut i64) -> Bool {
    match size_of_handle(handle) {
        Some(size) => {
            if !size_out.is_null() {
                // SAFETY: out-param per the API contract.
                unsafe { *size_out = size as i64 };
            }
            TRUE
        }
        None => {
            win32::set_last_error(error::INVALID_HANDLE);
            FALSE
        }
    }
}

pub unsafe extern "system" fn kw_get_file_type(handle: usize) -> u32 {
    let sb = sandbox();
    match sb.handles.lookup(RawHandle(handle)) {
        Some(HandleData::Output(_)) => file::FILE_TYPE_CHAR,
        Some(HandleData::CachedFile(_) | HandleData::TempFile(_)) => file::FILE_TYPE_DISK,
        Some(_) => file::FILE_TYPE_UNKNOWN,
        None => sys::get_file_type_real(handle),
    }
}

pub unsafe extern "system" fn kw_set_end_of_file(handle: usize) -> Bool {
    let sb = sandbox();
    sb.handles
        .with_entry(RawHandle(handle), |entry| match &entry.data {
            HandleData::TempFile(tf) => {
                let offset = entry.offset;
                match tf.lock().unwrap().set_end_of_file(offset) {
                    Ok(()) => TRUE,
                    Err(code) => {
                        win32::set_last_error(code);
                        FALSE
                    }
                }
            }
            _ => {
                win32::set_last_error(error::ACCESS_DENIED);
                FALSE
            }
        })
        .unwrap_or_else(|| {
            win32::set_last_error(error::INVALID_HANDLE);
            FALSE
        })
}

pub unsafe extern "system" fn kw_delete_file_w(path: *const u16) -> Bool {
    // SAFETY: API contract, NUL-terminated path.
    let Some(path) = (unsafe { win32::from_wide_ptr(path) }) else {
        win32::set_last_error(error::INVALID_PARAMETER);
        return FALSE;
    };
    let sb = sandbox();
    if TempStore::is_temp_name(&path)
        && let Some(true) = sb.temp.lock().unwrap().delete(&path)
    {
        // The store drops the contents at late cleanup; deletion is free.
        win32::set_last_error(error::SUCCESS);
        return TRUE;
    }
    sys::delete_file_real(&path)
}

pub unsafe extern "system" fn kw_duplicate_handle(
    source_process: usize,
    source: usize,
    target_process: usize,
    target_out: *mut usize,
    _access: u32,
    _inherit: Bool,
    _options: u32,
) -> Bool {
    let sb = sandbox();
    let current = sys::current_process_pseudo_handle();
    let ours = sb.handles.lookup(RawHandle(source)).is_some();
    // Cross-process duplication of an intercepted handle is out of contract;
    // only the same-process case is serviced here.
    if ours && source_process == current && target_process == current {
        let dup = sb.alloc_handle();
        if sb.handles.duplicate(RawHandle(source), dup) {
            if !target_out.is_null() {
                // SAFETY: out-param per the API contract.
                unsafe { *target_out = dup.0 };
            }
            win32::set_last_error(error::SUCCESS);
            return TRUE;
        }
    }
    if ours {
        win32::set_last_error(error::NOT_SUPPORTED);
        return FALSE;
    }
    sys::duplicate_handle_real(source_process, source, target_process, target_out)
}

pub unsafe extern "system" fn kw_create_file_mapping_w(
    file_handle: usize,
    _security: *mut c_void,
    protect: u32,
    size_high: u32,
    size_low: u32,
    _name: *const u16,
) -> usize {
    let sb = sandbox();
    let size = ((size_high as u64) << 32) | size_low as u64;
    let data = sb.handles.lookup(RawHandle(file_handle));
    match data {
        Some(HandleData::CachedFile(f)) => {
            if protect != crate::win32::mem::PAGE_READONLY
                && protect != crate::win32::mem::PAGE_EXECUTE_READ
            {
                win32::set_last_error(error::INVALID_PARAMETER);
                return 0;
            }
            if size != 0 && size != f.size() {
                win32::set_last_error(error::INVALID_PARAMETER);
                return 0;
            }
            let handle = sb.alloc_handle();
            sb.handles
                .enter(HandleEntry::new(handle, protect, HandleData::CachedMapping(f)));
            handle.0
        }
        Some(HandleData::TempFile(tf)) => {
            if let Err(code) = tf.lock().unwrap().map(protect, size) {
                win32::set_last_error(code);
                return 0;
            }
            let handle = sb.alloc_handle();
            sb.handles
                .enter(HandleEntry::new(handle, protect, HandleData::TempMapping(tf)));
            handle.0
        }
        Some(_) => {
            win32::set_last_error(error::INVALID_HANDLE);
            0
        }
        None => sys::create_file_mapping_real(file_handle, protect, size),
    }
}

pub unsafe extern "system" fn kw_map_view_of_file(
    mapping: usize,
    _access: u32,
    _offset_high: u32,
    _offset_low: u32,
    _size: usize,
) -> usize {
    let sb = sandbox();
    let view = match sb.handles.lookup(RawHandle(mapping)) {
        Some(HandleData::CachedMapping(f)) => Some(f.bytes().as_ptr() as usize),
        Some(HandleData::TempMapping(tf)) => {
            let tf = tf.lock().unwrap();
            tf.view().map(|(ptr, _)| ptr as usize)
        }
        Some(_) => None,
        None => return sys::map_view_of_file_real(mapping),
    };
    match view {
        Some(ptr) => {
            sb.views.lock().unwrap().push((ptr, RawHandle(mapping)));
            ptr
        }
        None => {
            win32::set_last_error(error::INVALID_HANDLE);
            0
        }
    }
}

pub unsafe extern "system" fn kw_unmap_view_of_file(view: *const c_void) -> Bool {
    let sb = sandbox();
    let ptr = view as usize;
    let mapping = {
        let mut views = sb.views.lock().unwrap();
        match views.iter().position(|&(p, _)| p == ptr) {
            Some(i) => Some(views.swap_remove(i).1),
            None => None,
        }
    };
    match mapping {
        Some(handle) => {
            if let Some(HandleData::TempMapping(tf)) = sb.handles.lookup(handle) {
                tf.lock().unwrap().unmap();
            }
            TRUE
        }
        None => sys::unmap_view_of_file_real(ptr),
    }
}

pub unsafe extern "system" fn kw_get_std_handle(which: u32) -> usize {
    let sb = sandbox();
    match which {
        STD_OUTPUT_HANDLE => sb.std_out.0,
        STD_ERROR_HANDLE => sb.std_err.0,
        STD_INPUT_HANDLE => sys::std_input_real(),
        _ => {
            win32::set_last_error(error::INVALID_PARAMETER);
            INVALID_HANDLE
        }
    }
}

// ---------------------------------------------------------------------------
// Console
// ---------------------------------------------------------------------------

pub unsafe extern "system" fn kw_write_console_w(
    handle: usize,
    buffer: *const u16,
    to_write: u32,
    written_out: *mut u32,
    _reserved: *mut c_void,
) -> Bool {
    let sb = sandbox();
    let stream = match sb.handles.lookup(RawHandle(handle)) {
        Some(HandleData::Output(s)) => s,
        _ => StdStream::Out,
    };
    // SAFETY: buffer holds to_write UTF-16 units per the API contract.
    let text = unsafe { std::slice::from_raw_parts(buffer, to_write as usize) };
    sb.output.lock().unwrap().write_wide(stream, text);
    if !written_out.is_null() {
        // SAFETY: out-param per the API contract.
        unsafe { *written_out = to_write };
    }
    TRUE
}

pub unsafe extern "system" fn kw_write_console_a(
    handle: usize,
    buffer: *const u8,
    to_write: u32,
    written_out: *mut u32,
    _reserved: *mut c_void,
) -> Bool {
    let sb = sandbox();
    let stream = match sb.handles.lookup(RawHandle(handle)) {
        Some(HandleData::Output(s)) => s,
        _ => StdStream::Out,
    };
    // SAFETY: buffer holds to_write bytes per the API contract.
    let bytes = unsafe { std::slice::from_raw_parts(buffer, to_write as usize) };
    sb.output.lock().unwrap().write(stream, bytes);
    if !written_out.is_null() {
        // SAFETY: out-param per the API contract.
        unsafe { *written_out = to_write };
    }
    TRUE
}

// ---------------------------------------------------------------------------
// Modules
// ---------------------------------------------------------------------------

const LOAD_AS_DATA: u32 = 0x2 | 0x20 | 0x40; // DATAFILE | IMAGE_RESOURCE | DATAFILE_EXCLUSIVE

fn load_library_common(request: &str, flags: u32) -> usize {
    let sb = sandbox();
    let Some(tool) = sb.current_tool() else {
        return sys::load_library_real(request, flags);
    };
    if let Some(cached) = tool.cached_dyn_load(request) {
        return match cached {
            DynLoad::Module(id) => sb.modules.lock().unwrap().get(id).os_handle(),
            DynLoad::Special(h) => h,
        };
    }
    if flags & LOAD_AS_DATA != 0 {
        // Data-only loads go to the OS unchanged but are remembered.
        let h = sys::load_library_real(request, flags);
        if h != 0 {
            tool.remember_dyn_load(request, DynLoad::Special(h));
        }
        return h;
    }
    let mut registry = sb.modules.lock().unwrap();
    let loaded = if is_virtual_api(request) {
        registry
            .load_native(request, false)
            .map(|target| registry.load_virtual_api(request, target))
    } else {
        registry.load_dependency(request, &super::SandboxResolver)
    };
    match loaded {
        Ok(id) => {
            if let Err(err) = registry.initialize(id) {
                trace!(%err, request, "dynamic load init failed");
                win32::set_last_error(error::MOD_NOT_FOUND);
                return 0;
            }
            tool.index_module(&registry, id);
            tool.remember_dyn_load(request, DynLoad::Module(id));
            registry.get(id).os_handle()
        }
        Err(err) => {
            trace!(%err, request, "dynamic load failed");
            win32::set_last_error(error::MOD_NOT_FOUND);
            0
        }
    }
}

pub unsafe extern "system" fn kw_load_library_ex_w(
    name: *const u16,
    _reserved: usize,
    flags: u32,
) -> usize {
    // SAFETY: API contract, NUL-terminated name.
    let Some(name) = (unsafe { win32::from_wide_ptr(name) }) else {
        win32::set_last_error(error::INVALID_PARAMETER);
        return 0;
    };
    load_library_common(&name, flags)
}

pub unsafe extern "system" fn kw_load_library_ex_a(
    name: *const u8,
    _reserved: usize,
    flags: u32,
) -> usize {
    // SAFETY: API contract, NUL-terminated name.
    let Some(name) = (unsafe { ansi_str(name) }) else {
        win32::set_last_error(error::INVALID_PARAMETER);
        return 0;
    };
    load_library_common(&name, flags)
}

pub unsafe extern "system" fn kw_load_library_w(name: *const u16) -> usize {
    // SAFETY: forwarded contract.
    unsafe { kw_load_library_ex_w(name, 0, 0) }
}

pub unsafe extern "system" fn kw_load_library_a(name: *const u8) -> usize {
    // SAFETY: forwarded contract.
    unsafe { kw_load_library_ex_a(name, 0, 0) }
}

pub unsafe extern "system" fn kw_free_library(_module: usize) -> Bool {
    // Modules are cached for the worker's lifetime; the tool's unload is a
    // polite fiction.
    TRUE
}

fn module_handle_common(name: Option<String>) -> usize {
    let sb = sandbox();
    let Some(tool) = sb.current_tool() else {
        return 0;
    };
    let registry = sb.modules.lock().unwrap();
    match name {
        None => registry.get(tool.exe_module).os_handle(),
        Some(name) => match tool.module_by_name(&registry, &name) {
            Some(id) => registry.get(id).os_handle(),
            None => {
                win32::set_last_error(error::MOD_NOT_FOUND);
                0
            }
        },
    }
}

pub unsafe extern "system" fn kw_get_module_handle_w(name: *const u16) -> usize {
    // SAFETY: API contract; null means "the executable".
    module_handle_common(unsafe { win32::from_wide_ptr(name) })
}

pub unsafe extern "system" fn kw_get_module_handle_a(name: *const u8) -> usize {
    // SAFETY: API contract; null means "the executable".
    module_handle_common(unsafe { ansi_str(name) })
}

pub unsafe extern "system" fn kw_get_proc_address(module: usize, name: *const u8) -> usize {
    if (name as usize) < 0x1_0000 {
        // Ordinal lookups are not part of the intercepted surface.
        return sys::get_proc_address_real(module, name as usize);
    }
    // SAFETY: checked non-ordinal; NUL-terminated per the API contract.
    let Some(name) = (unsafe { ansi_str(name) }) else {
        win32::set_last_error(error::INVALID_PARAMETER);
        return 0;
    };
    // Isolation overrides first (FlsAlloc and friends).
    if let Some(replacement) = super::lookup(super::get_proc_table(), &name, None, false, None) {
        return replacement;
    }
    let sb = sandbox();
    let Some(tool) = sb.current_tool() else {
        return 0;
    };
    let mut registry = sb.modules.lock().unwrap();
    let Some(id) = tool.module_from_address(&registry, module) else {
        win32::set_last_error(error::MOD_NOT_FOUND);
        return 0;
    };
    match registry.get_proc_address(id, &name) {
        Some(addr) => addr,
        None => {
            win32::set_last_error(error::PROC_NOT_FOUND);
            0
        }
    }
}

fn module_file_name_common(module: usize) -> Option<String> {
    let sb = sandbox();
    let tool = sb.current_tool()?;
    let registry = sb.modules.lock().unwrap();
    let id = tool.module_from_address(&registry, module)?;
    Some(registry.get(id).path.clone())
}

pub unsafe extern "system" fn kw_get_module_file_name_w(
    module: usize,
    buffer: *mut u16,
    capacity: u32,
) -> u32 {
    let Some(path) = module_file_name_common(module) else {
        win32::set_last_error(error::MOD_NOT_FOUND);
        return 0;
    };
    let wide = win32::wide(&path);
    let n = wide.len().min(capacity as usize);
    // SAFETY: buffer has `capacity` units per the API contract.
    unsafe { std::ptr::copy_nonoverlapping(wide.as_ptr(), buffer, n) };
    if n < wide.len() {
        win32::set_last_error(error::INSUFFICIENT_BUFFER);
        capacity
    } else {
        (n - 1) as u32
    }
}

pub unsafe extern "system" fn kw_get_module_file_name_a(
    module: usize,
    buffer: *mut u8,
    capacity: u32,
) -> u32 {
    let Some(path) = module_file_name_common(module) else {
        win32::set_last_error(error::MOD_NOT_FOUND);
        return 0;
    };
    let mut bytes = path.into_bytes();
    bytes.push(0);
    let n = bytes.len().min(capacity as usize);
    // SAFETY: buffer has `capacity` bytes per the API contract.
    unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), buffer, n) };
    if n < bytes.len() {
        win32::set_last_error(error::INSUFFICIENT_BUFFER);
        capacity
    } else {
        (n - 1) as u32
    }
}

pub unsafe extern "system" fn kw_rtl_pc_to_file_header(
    pc: *const c_void,
    base_out: *mut usize,
) -> usize {
    let sb = sandbox();
    let base = sb
        .current_tool()
        .and_then(|tool| {
            let registry = sb.modules.lock().unwrap();
            tool.module_from_address(&registry, pc as usize)
                .map(|id| registry.get(id).os_handle())
        })
        .unwrap_or(0);
    if !base_out.is_null() {
        // SAFETY: out-param per the API contract.
        unsafe { *base_out = base };
    }
    base
}

// ---------------------------------------------------------------------------
// Memory and process-wide resources
// ---------------------------------------------------------------------------

pub unsafe extern "system" fn kw_virtual_alloc(
    address: *mut c_void,
    size: usize,
    alloc_type: u32,
    protect: u32,
) -> *mut c_void {
    match sandbox()
        .valloc
        .alloc(address as usize, size, alloc_type, protect)
    {
        Some(base) => base as *mut c_void,
        None => {
            win32::set_last_error(error::NOT_ENOUGH_MEMORY);
            std::ptr::null_mut()
        }
    }
}

pub unsafe extern "system" fn kw_virtual_free(
    address: *mut c_void,
    _size: usize,
    free_type: u32,
) -> Bool {
    if sandbox().valloc.free(address as usize, free_type) {
        TRUE
    } else {
        win32::set_last_error(error::INVALID_PARAMETER);
        FALSE
    }
}

pub unsafe extern "system" fn kw_heap_create(
    _options: u32,
    initial_size: usize,
    max_size: usize,
) -> usize {
    match sandbox().heaps.create(initial_size, max_size) {
        Some(h) => h,
        None => {
            win32::set_last_error(error::NOT_ENOUGH_MEMORY);
            0
        }
    }
}

pub unsafe extern "system" fn kw_heap_destroy(heap: usize) -> Bool {
    if sandbox().heaps.destroy(heap) {
        TRUE
    } else {
        win32::set_last_error(error::INVALID_HANDLE);
        FALSE
    }
}

const OUT_OF_INDEXES: u32 = u32::MAX;

pub unsafe extern "system" fn kw_fls_alloc(callback: *mut c_void) -> u32 {
    sandbox().fls.alloc(callback as usize).unwrap_or_else(|| {
        win32::set_last_error(error::NOT_ENOUGH_MEMORY);
        OUT_OF_INDEXES
    })
}

pub unsafe extern "system" fn kw_fls_free(index: u32) -> Bool {
    if sandbox().fls.free(index) {
        TRUE
    } else {
        win32::set_last_error(error::INVALID_PARAMETER);
        FALSE
    }
}

pub unsafe extern "system" fn kw_tls_alloc() -> u32 {
    sandbox().tls.alloc(0).unwrap_or_else(|| {
        win32::set_last_error(error::NOT_ENOUGH_MEMORY);
        OUT_OF_INDEXES
    })
}

pub unsafe extern "system" fn kw_tls_free(index: u32) -> Bool {
    if sandbox().tls.free(index) {
        TRUE
    } else {
        win32::set_last_error(error::INVALID_PARAMETER);
        FALSE
    }
}

pub unsafe extern "system" fn kw_create_thread(
    _security: *mut c_void,
    stack_size: usize,
    start: *mut c_void,
    parameter: *mut c_void,
    flags: u32,
    thread_id: *mut u32,
) -> usize {
    let sb = sandbox();
    // Only the linker's single debug-helper thread is tolerated; compilers
    // have no business spawning threads inside the sandbox.
    let allowed = {
        let mut job = sb.job.lock().unwrap();
        let ok = job
            .tool
            .as_ref()
            .is_some_and(|t| t.hint.is_link())
            && !job.helper_thread_spawned;
        if ok {
            job.helper_thread_spawned = true;
        }
        ok
    };
    if !allowed {
        win32::set_last_error(error::ACCESS_DENIED);
        return 0;
    }
    sys::create_thread_real(stack_size, start as usize, parameter as usize, flags, thread_id)
}

// ---------------------------------------------------------------------------
// Exit paths
// ---------------------------------------------------------------------------

fn sandbox_exit(code: u32) -> ! {
    std::panic::panic_any(SandboxExit { code })
}

pub unsafe extern "system-unwind" fn kw_exit_process(code: u32) -> ! {
    sandbox_exit(code)
}

pub unsafe extern "system-unwind" fn kw_terminate_process(process: usize, code: u32) -> Bool {
    if process == sys::current_process_pseudo_handle() {
        sandbox_exit(code)
    }
    // Terminating some other process is none of our business.
    sys::terminate_process_real(process, code)
}

pub unsafe extern "C-unwind" fn kw_crt_exit(code: i32) -> ! {
    sandbox_exit(code as u32)
}

pub unsafe extern "C-unwind" fn kw_crt_exit_fast(code: i32) -> ! {
    sandbox_exit(code as u32)
}

pub unsafe extern "C-unwind" fn kw_crt_cexit() {
    // _cexit runs atexit processing without terminating; the job driver
    // drains the list at job end either way.
}

pub unsafe extern "C-unwind" fn kw_crt_c_exit() {}

pub unsafe extern "C-unwind" fn kw_crt_amsg_exit(code: i32) -> ! {
    sandbox_exit((128 + code) as u32)
}

pub unsafe extern "C" fn kw_atexit(callback: *mut c_void) -> i32 {
    if callback.is_null() {
        return -1;
    }
    // SAFETY: the CRT contract makes this a void(void) function.
    sandbox()
        .atexit
        .register(unsafe { std::mem::transmute::<*mut c_void, unsafe extern "C" fn()>(callback) });
    0
}

pub unsafe extern "C" fn kw_onexit(callback: *mut c_void) -> *mut c_void {
    if callback.is_null() {
        return std::ptr::null_mut();
    }
    // SAFETY: as for atexit; _onexit returns the callback on success.
    sandbox()
        .atexit
        .register(unsafe { std::mem::transmute::<*mut c_void, unsafe extern "C" fn()>(callback) });
    callback
}

// ---------------------------------------------------------------------------
// Command line and environment
// ---------------------------------------------------------------------------

pub unsafe extern "system" fn kw_get_command_line_w() -> *const u16 {
    let job = sandbox().job.lock().unwrap();
    job.command_line_wide.as_ptr()
}

pub unsafe extern "system" fn kw_get_command_line_a() -> *const u8 {
    let job = sandbox().job.lock().unwrap();
    job.command_line_ansi.as_ptr()
}

pub unsafe extern "system" fn kw_get_environment_variable_w(
    name: *const u16,
    buffer: *mut u16,
    capacity: u32,
) -> u32 {
    // SAFETY: API contract, NUL-terminated name.
    let Some(name) = (unsafe { win32::from_wide_ptr(name) }) else {
        win32::set_last_error(error::INVALID_PARAMETER);
        return 0;
    };
    let value: Option<Vec<u16>> = sandbox()
        .env
        .lock()
        .unwrap()
        .get_wide(&name)
        .map(|w| w.to_vec());
    let Some(value) = value else {
        win32::set_last_error(error::ENVVAR_NOT_FOUND);
        return 0;
    };
    // `value` includes the NUL.
    if (capacity as usize) < value.len() {
        return value.len() as u32;
    }
    // SAFETY: capacity checked above.
    unsafe { std::ptr::copy_nonoverlapping(value.as_ptr(), buffer, value.len()) };
    win32::set_last_error(error::SUCCESS);
    (value.len() - 1) as u32
}

pub unsafe extern "system" fn kw_get_environment_variable_a(
    name: *const u8,
    buffer: *mut u8,
    capacity: u32,
) -> u32 {
    // SAFETY: API contract, NUL-terminated name.
    let Some(name) = (unsafe { ansi_str(name) }) else {
        win32::set_last_error(error::INVALID_PARAMETER);
        return 0;
    };
    let value: Option<String> = sandbox().env.lock().unwrap().get(&name).map(str::to_owned);
    let Some(value) = value else {
        win32::set_last_error(error::ENVVAR_NOT_FOUND);
        return 0;
    };
    let needed = value.len() + 1;
    if (capacity as usize) < needed {
        return needed as u32;
    }
    // SAFETY: capacity checked above.
    unsafe {
        std::ptr::copy_nonoverlapping(value.as_ptr(), buffer, value.len());
        *buffer.add(value.len()) = 0;
    }
    win32::set_last_error(error::SUCCESS);
    value.len() as u32
}

pub unsafe extern "system" fn kw_set_environment_variable_w(
    name: *const u16,
    value: *const u16,
) -> Bool {
    // SAFETY: API contract, NUL-terminated strings.
    let (name, value) = unsafe { (win32::from_wide_ptr(name), win32::from_wide_ptr(value)) };
    let Some(name) = name else {
        win32::set_last_error(error::INVALID_PARAMETER);
        return FALSE;
    };
    let mut env = sandbox().env.lock().unwrap();
    match value {
        Some(v) => env.set(&name, &v),
        None => {
            env.unset(&name);
        }
    }
    TRUE
}

pub unsafe extern "system" fn kw_set_environment_variable_a(
    name: *const u8,
    value: *const u8,
) -> Bool {
    // SAFETY: API contract, NUL-terminated strings.
    let (name, value) = unsafe { (ansi_str(name), ansi_str(value)) };
    let Some(name) = name else {
        win32::set_last_error(error::INVALID_PARAMETER);
        return FALSE;
    };
    let mut env = sandbox().env.lock().unwrap();
    match value {
        Some(v) => env.set(&name, &v),
        None => {
            env.unset(&name);
        }
    }
    TRUE
}

pub unsafe extern "C" fn kw_getenv(name: *const u8) -> *const u8 {
    // SAFETY: API contract, NUL-terminated name.
    let Some(name) = (unsafe { ansi_str(name) }) else {
        return std::ptr::null();
    };
    let env = sandbox().env.lock().unwrap();
    match env.get(&name) {
        // The pointer aims into the entry's stable heap buffer; the CRT
        // contract is "valid until the next modification" and ours matches.
        Some(value) => value.as_ptr(),
        None => std::ptr::null(),
    }
}

pub unsafe extern "C" fn kw_wgetenv(name: *const u16) -> *const u16 {
    // SAFETY: API contract, NUL-terminated name.
    let Some(name) = (unsafe { win32::from_wide_ptr(name) }) else {
        return std::ptr::null();
    };
    let env = sandbox().env.lock().unwrap();
    match env.get_wide(&name) {
        Some(value) => value.as_ptr(),
        None => std::ptr::null(),
    }
}

// ---------------------------------------------------------------------------
// CryptoAPI
// ---------------------------------------------------------------------------

pub unsafe extern "system" fn kw_crypt_acquire_context_w(
    prov_out: *mut usize,
    _container: *const u16,
    _provider: *const u16,
    _prov_type: u32,
    _flags: u32,
) -> Bool {
    if prov_out.is_null() {
        win32::set_last_error(error::INVALID_PARAMETER);
        return FALSE;
    }
    let prov = sandbox().hash.lock().unwrap().acquire_provider();
    // SAFETY: out-param per the API contract.
    unsafe { *prov_out = prov };
    TRUE
}

pub unsafe extern "system" fn kw_crypt_release_context(prov: usize, _flags: u32) -> Bool {
    if sandbox().hash.lock().unwrap().release_provider(prov) {
        TRUE
    } else {
        FALSE
    }
}

pub unsafe extern "system" fn kw_crypt_create_hash(
    _prov: usize,
    alg_id: u32,
    key: usize,
    flags: u32,
    hash_out: *mut usize,
) -> Bool {
    if hash_out.is_null() {
        win32::set_last_error(error::INVALID_PARAMETER);
        return FALSE;
    }
    match sandbox().hash.lock().unwrap().create_hash(alg_id, key, flags) {
        Some(h) => {
            // SAFETY: out-param per the API contract.
            unsafe { *hash_out = h };
            TRUE
        }
        // Keyed/flagged/unknown algorithms are not accelerated.
        None => sys::crypt_create_hash_real(alg_id, key, flags, hash_out),
    }
}

pub unsafe extern "system" fn kw_crypt_hash_data(
    hash: usize,
    data: *const u8,
    len: u32,
    _flags: u32,
) -> Bool {
    let sb = sandbox();
    if !sb.hash.lock().unwrap().is_ours(hash) {
        return sys::crypt_hash_data_real(hash, data, len);
    }
    // SAFETY: data holds len bytes per the API contract.
    let bytes = unsafe { std::slice::from_raw_parts(data, len as usize) };
    match sb
        .hash
        .lock()
        .unwrap()
        .hash_data(hash, data as usize, bytes)
    {
        Ok(()) => TRUE,
        Err(code) => {
            win32::set_last_error(code);
            FALSE
        }
    }
}

pub unsafe extern "system" fn kw_crypt_get_hash_param(
    hash: usize,
    param: u32,
    data_out: *mut u8,
    len_inout: *mut u32,
    _flags: u32,
) -> Bool {
    let sb = sandbox();
    if !sb.hash.lock().unwrap().is_ours(hash) {
        return sys::crypt_get_hash_param_real(hash, param, data_out, len_inout);
    }
    if len_inout.is_null() {
        win32::set_last_error(error::INVALID_PARAMETER);
        return FALSE;
    }
    match sb.hash.lock().unwrap().get_hash_param(hash, param) {
        Ok(value) => {
            // SAFETY: in/out length per the API contract.
            let capacity = unsafe { *len_inout } as usize;
            // SAFETY: as above.
            unsafe { *len_inout = value.len() as u32 };
            if data_out.is_null() {
                return TRUE;
            }
            if capacity < value.len() {
                win32::set_last_error(error::INSUFFICIENT_BUFFER);
                return FALSE;
            }
            // SAFETY: capacity checked above.
            unsafe { std::ptr::copy_nonoverlapping(value.as_ptr(), data_out, value.len()) };
            TRUE
        }
        Err(code) => {
            win32::set_last_error(code);
            FALSE
        }
    }
}

pub unsafe extern "system" fn kw_crypt_destroy_hash(hash: usize) -> Bool {
    let sb = sandbox();
    if !sb.hash.lock().unwrap().is_ours(hash) {
        return sys::crypt_destroy_hash_real(hash);
    }
    match sb.hash.lock().unwrap().destroy_hash(hash) {
        Ok(()) => TRUE,
        Err(code) => {
            win32::set_last_error(code);
            FALSE
        }
    }
}

// ---------------------------------------------------------------------------
// Passthroughs to the real OS
// ---------------------------------------------------------------------------

#[cfg(windows)]
mod sys {
    use crate::win32::{self, error, wide};
    use windows_sys::Win32::Foundation::{
        CloseHandle, DuplicateHandle, GetLastError, INVALID_HANDLE_VALUE,
    };
    use windows_sys::Win32::Storage::FileSystem::{
        CreateFileW, DeleteFileW, GetFileType, ReadFile, WriteFile, FILE_SHARE_DELETE,
        FILE_SHARE_READ, FILE_SHARE_WRITE,
    };
    use windows_sys::Win32::System::Threading::{CreateThread, GetCurrentProcess, TerminateProcess};

    pub fn current_process_pseudo_handle() -> usize {
        // SAFETY: returns the constant pseudo handle.
        (unsafe { GetCurrentProcess() }) as usize
    }

    pub fn create_file_real(path: &str, access: u32, disposition: u32, flags: u32) -> usize {
        // SAFETY: plain passthrough with a NUL-terminated path.
        unsafe {
            let h = CreateFileW(
                wide(path).as_ptr(),
                access,
                FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
                std::ptr::null(),
                disposition,
                flags,
                std::ptr::null_mut(),
            );
            if h == INVALID_HANDLE_VALUE {
                win32::set_last_error(GetLastError());
                usize::MAX
            } else {
                h as usize
            }
        }
    }

    pub fn read_file_real(handle: usize, buf: &mut [u8], read_out: *mut u32) -> i32 {
        // SAFETY: plain passthrough.
        unsafe {
            ReadFile(
                handle as *mut _,
                buf.as_mut_ptr(),
                buf.len() as u32,
                read_out,
                std::ptr::null_mut(),
            )
        }
    }

    pub fn write_file_real(handle: usize, data: &[u8], written_out: *mut u32) -> i32 {
        // SAFETY: plain passthrough.
        unsafe {
            WriteFile(
                handle as *mut _,
                data.as_ptr(),
                data.len() as u32,
                written_out,
                std::ptr::null_mut(),
            )
        }
    }

    pub fn close_handle_real(handle: usize) -> i32 {
        // SAFETY: plain passthrough.
        unsafe { CloseHandle(handle as *mut _) }
    }

    pub fn get_file_type_real(handle: usize) -> u32 {
        // SAFETY: plain passthrough.
        unsafe { GetFileType(handle as *mut _) }
    }

    pub fn delete_file_real(path: &str) -> i32 {
        // SAFETY: plain passthrough.
        unsafe { DeleteFileW(wide(path).as_ptr()) }
    }

    pub fn duplicate_handle_real(
        source_process: usize,
        source: usize,
        target_process: usize,
        target_out: *mut usize,
    ) -> i32 {
        // SAFETY: plain passthrough; out-param forwarded.
        unsafe {
            DuplicateHandle(
                source_process as *mut _,
                source as *mut _,
                target_process as *mut _,
                target_out as *mut _,
                0,
                0,
                2, // DUPLICATE_SAME_ACCESS
            )
        }
    }

    pub fn create_file_mapping_real(file: usize, protect: u32, size: u64) -> usize {
        use windows_sys::Win32::System::Memory::CreateFileMappingW;
        // SAFETY: plain passthrough.
        unsafe {
            let h = CreateFileMappingW(
                file as *mut _,
                std::ptr::null(),
                protect,
                (size >> 32) as u32,
                size as u32,
                std::ptr::null(),
            );
            h as usize
        }
    }

    pub fn map_view_of_file_real(mapping: usize) -> usize {
        use windows_sys::Win32::System::Memory::{MapViewOfFile, FILE_MAP_READ};
        // SAFETY: plain passthrough.
        unsafe { MapViewOfFile(mapping as *mut _, FILE_MAP_READ, 0, 0, 0).Value as usize }
    }

    pub fn unmap_view_of_file_real(view: usize) -> i32 {
        use windows_sys::Win32::System::Memory::{UnmapViewOfFile, MEMORY_MAPPED_VIEW_ADDRESS};
        // SAFETY: plain passthrough.
        unsafe {
            UnmapViewOfFile(MEMORY_MAPPED_VIEW_ADDRESS {
                Value: view as *mut _,
            })
        }
    }

    pub fn std_input_real() -> usize {
        use windows_sys::Win32::System::Console::{GetStdHandle, STD_INPUT_HANDLE};
        // SAFETY: plain passthrough.
        unsafe { GetStdHandle(STD_INPUT_HANDLE) as usize }
    }

    pub fn load_library_real(name: &str, flags: u32) -> usize {
        use windows_sys::Win32::System::LibraryLoader::LoadLibraryExW;
        // SAFETY: plain passthrough.
        unsafe { LoadLibraryExW(wide(name).as_ptr(), std::ptr::null_mut(), flags) as usize }
    }

    pub fn get_proc_address_real(module: usize, ordinal: usize) -> usize {
        use windows_sys::Win32::System::LibraryLoader::GetProcAddress;
        // SAFETY: low-word ordinal passthrough.
        unsafe {
            GetProcAddress(module as *mut _, ordinal as *const u8)
                .map_or(0, |f| f as usize)
        }
    }

    pub fn terminate_process_real(process: usize, code: u32) -> i32 {
        // SAFETY: plain passthrough.
        unsafe { TerminateProcess(process as *mut _, code) }
    }

    pub fn create_thread_real(
        stack_size: usize,
        start: usize,
        parameter: usize,
        flags: u32,
        thread_id: *mut u32,
    ) -> usize {
        // SAFETY: the start routine is whatever the linker registered; the
        // OS calls it with the documented signature.
        unsafe {
            CreateThread(
                std::ptr::null(),
                stack_size,
                std::mem::transmute(start),
                parameter as *const _,
                flags,
                thread_id,
            ) as usize
        }
    }

    pub fn crypt_create_hash_real(
        _alg_id: u32,
        _key: usize,
        _flags: u32,
        _hash_out: *mut usize,
    ) -> i32 {
        // Acquiring a real provider context lazily is not worth it for the
        // algorithms compilers use; report the honest failure instead.
        win32::set_last_error(error::NTE_BAD_ALGID);
        0
    }

    pub fn crypt_hash_data_real(_hash: usize, _data: *const u8, _len: u32) -> i32 {
        win32::set_last_error(error::INVALID_HANDLE);
        0
    }

    pub fn crypt_get_hash_param_real(
        _hash: usize,
        _param: u32,
        _data: *mut u8,
        _len: *mut u32,
    ) -> i32 {
        win32::set_last_error(error::INVALID_HANDLE);
        0
    }

    pub fn crypt_destroy_hash_real(_hash: usize) -> i32 {
        win32::set_last_error(error::INVALID_HANDLE);
        0
    }
}

#[cfg(not(windows))]
mod sys {
    //! Host-neutral fallbacks: honest failures where a real kernel object
    //! would be needed, benign stubs elsewhere.

    use crate::win32::{self, error};

    pub fn current_process_pseudo_handle() -> usize {
        usize::MAX - 1
    }

    pub fn create_file_real(_path: &str, _access: u32, _disposition: u32, _flags: u32) -> usize {
        win32::set_last_error(error::FILE_NOT_FOUND);
        usize::MAX
    }

    pub fn read_file_real(_handle: usize, _buf: &mut [u8], _read_out: *mut u32) -> i32 {
        win32::set_last_error(error::INVALID_HANDLE);
        0
    }

    pub fn write_file_real(_handle: usize, _data: &[u8], _written_out: *mut u32) -> i32 {
        win32::set_last_error(error::INVALID_HANDLE);
        0
    }

    pub fn close_handle_real(_handle: usize) -> i32 {
        win32::set_last_error(error::INVALID_HANDLE);
        0
    }

    pub fn get_file_type_real(_handle: usize) -> u32 {
        crate::win32::file::FILE_TYPE_UNKNOWN
    }

    pub fn delete_file_real(_path: &str) -> i32 {
        win32::set_last_error(error::FILE_NOT_FOUND);
        0
    }

    pub fn duplicate_handle_real(
        _source_process: usize,
        _source: usize,
        _target_process: usize,
        _target_out: *mut usize,
    ) -> i32 {
        win32::set_last_error(error::NOT_SUPPORTED);
        0
    }

    pub fn create_file_mapping_real(_file: usize, _protect: u32, _size: u64) -> usize {
        win32::set_last_error(error::INVALID_HANDLE);
        0
    }

    pub fn map_view_of_file_real(_mapping: usize) -> usize {
        win32::set_last_error(error::INVALID_HANDLE);
        0
    }

    pub fn unmap_view_of_file_real(_view: usize) -> i32 {
        win32::set_last_error(error::INVALID_PARAMETER);
        0
    }

    pub fn std_input_real() -> usize {
        0
    }

    pub fn load_library_real(_name: &str, _flags: u32) -> usize {
        win32::set_last_error(error::MOD_NOT_FOUND);
        0
    }

    pub fn get_proc_address_real(_module: usize, _ordinal: usize) -> usize {
        win32::set_last_error(error::PROC_NOT_FOUND);
        0
    }

    pub fn terminate_process_real(_process: usize, _code: u32) -> i32 {
        win32::set_last_error(error::ACCESS_DENIED);
        0
    }

    pub fn create_thread_real(
        _stack_size: usize,
        _start: usize,
        _parameter: usize,
        _flags: u32,
        thread_id: *mut u32,
    ) -> usize {
        if !thread_id.is_null() {
            // SAFETY: out-param per the API contract.
            unsafe { *thread_id = 0x1234 };
        }
        0x9000
    }

    pub fn crypt_create_hash_real(
        _alg_id: u32,
        _key: usize,
        _flags: u32,
        _hash_out: *mut usize,
    ) -> i32 {
        win32::set_last_error(error::NTE_BAD_ALGID);
        0
    }

    pub fn crypt_hash_data_real(_hash: usize, _data: *const u8, _len: u32) -> i32 {
        win32::set_last_error(error::INVALID_HANDLE);
        0
    }

    pub fn crypt_get_hash_param_real(
        _hash: usize,
        _param: u32,
        _data: *mut u8,
        _len: *mut u32,
    ) -> i32 {
        win32::set_last_error(error::INVALID_HANDLE);
        0
    }

    pub fn crypt_destroy_hash_real(_hash: usize) -> i32 {
        win32::set_last_error(error::INVALID_HANDLE);
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash_cache::HashAlg;
    use crate::sandbox::test_job_guard as job_guard;
    use crate::win32::wide;

    fn make_cl_job(dir: &std::path::Path) {
        let sb = sandbox();
        let exe = crate::pe::testpe::Builder::new().build();
        let exe_path = dir.join("cl.exe");
        std::fs::write(&exe_path, exe).unwrap();
        let win_path = exe_path.display().to_string().replace('/', "\\");
        let obj = sb.fs.lock().unwrap().lookup(&win_path, "").unwrap();
        let tool = {
            let mut fs = sb.fs.lock().unwrap();
            let mut registry = sb.modules.lock().unwrap();
            sb.tools
                .lock()
                .unwrap()
                .lookup(
                    &mut fs,
                    &mut registry,
                    &crate::modules::NoReplacements,
                    obj,
                )
                .unwrap()
        };
        let mut job = sb.job.lock().unwrap();
        job.tool = Some(tool);
        job.pch_caching = true;
        job.working_dir = dir.display().to_string().replace('/', "\\");
    }

    fn end_job() {
        let sb = sandbox();
        sb.job.lock().unwrap().tool = None;
        for entry in sb.handles.reap_leaked() {
            drop(entry);
        }
        sb.temp.lock().unwrap().reset_for_next_job();
    }

    #[test]
    fn temp_file_round_trip_through_the_shims() {
        let _guard = job_guard();
        let dir = tempfile::tempdir().unwrap();
        make_cl_job(dir.path());

        let path = wide(r"C:\T\_CL_deadbeefab");
        // SAFETY: test drives the shims with valid pointers throughout.
        unsafe {
            let h = kw_create_file_w(
                path.as_ptr(),
                file::GENERIC_READ | file::GENERIC_WRITE,
                0,
                std::ptr::null_mut(),
                file::CREATE_ALWAYS,
                0,
                0,
            );
            assert_ne!(h, INVALID_HANDLE);

            let data: Vec<u8> = (0..1024u32 * 1024).map(|i| (i & 0xFF) as u8).collect();
            let mut written = 0u32;
            assert_eq!(
                kw_write_file(h, data.as_ptr(), data.len() as u32, &mut written, std::ptr::null_mut()),
                TRUE
            );
            assert_eq!(written as usize, data.len());

            // GetFileSize sees the logical size.
            let mut high = 0u32;
            assert_eq!(kw_get_file_size(h, &mut high), 1024 * 1024);
            assert_eq!(high, 0);

            // Seek to 0 and read everything back.
            assert_eq!(kw_set_file_pointer(h, 0, std::ptr::null_mut(), file::FILE_BEGIN), 0);
            let mut back = vec![0u8; data.len()];
            let mut read = 0u32;
            assert_eq!(
                kw_read_file(h, back.as_mut_ptr(), back.len() as u32, &mut read, std::ptr::null_mut()),
                TRUE
            );
            assert_eq!(read as usize, data.len());
            assert_eq!(back, data);

            // Reads past EOF return success and zero bytes.
            assert_eq!(
                kw_read_file(h, back.as_mut_ptr(), 16, &mut read, std::ptr::null_mut()),
                TRUE
            );
            assert_eq!(read, 0);

            // Negative seek fails the documented way.
            assert_eq!(
                kw_set_file_pointer(h, -5, std::ptr::null_mut(), file::FILE_BEGIN),
                file::INVALID_SET_FILE_POINTER
            );
            assert_eq!(win32::last_error(), error::NEGATIVE_SEEK);

            // DeleteFileW on the temp path is a quiet success.
            assert_eq!(kw_delete_file_w(path.as_ptr()), TRUE);

            assert_eq!(kw_close_handle(h), TRUE);
        }
        end_job();
    }

    #[test]
    fn duplicate_and_seek_share_the_record() {
        let _guard = job_guard();
        let dir = tempfile::tempdir().unwrap();
        make_cl_job(dir.path());
        let path = wide(r"C:\T\_CL_0000beefzz");
        // SAFETY: valid pointers throughout.
        unsafe {
            let h = kw_create_file_w(
                path.as_ptr(),
                file::GENERIC_WRITE,
                0,
                std::ptr::null_mut(),
                file::CREATE_ALWAYS,
                0,
                0,
            );
            let current = sys::current_process_pseudo_handle();
            let mut dup = 0usize;
            assert_eq!(
                kw_duplicate_handle(current, h, current, &mut dup, 0, 0, 0),
                TRUE
            );
            assert_ne!(dup, h);
            let mut pos = 0i64;
            assert_eq!(kw_set_file_pointer_ex(h, 42, &mut pos, file::FILE_BEGIN), TRUE);
            // The duplicate observes the shared file pointer.
            assert_eq!(kw_set_file_pointer_ex(dup, 0, &mut pos, file::FILE_CURRENT), TRUE);
            assert_eq!(pos, 42);
            assert_eq!(kw_close_handle(h), TRUE);
            assert_eq!(kw_close_handle(dup), TRUE);
        }
        end_job();
    }

    #[test]
    fn cached_header_read_and_hash_fast_path() {
        let _guard = job_guard();
        let dir = tempfile::tempdir().unwrap();
        make_cl_job(dir.path());

        let header = dir.path().join("stdio.h");
        let content = vec![0x42u8; 4096];
        std::fs::write(&header, &content).unwrap();
        let win_path = header.display().to_string().replace('/', "\\");
        let path_w = wide(&win_path);

        // SAFETY: valid pointers throughout.
        unsafe {
            let h = kw_create_file_w(
                path_w.as_ptr(),
                file::GENERIC_READ,
                file::FILE_SHARE_READ,
                std::ptr::null_mut(),
                file::OPEN_EXISTING,
                0,
                0,
            );
            assert_ne!(h, INVALID_HANDLE);

            let mut buf = vec![0u8; 4096];
            let mut read = 0u32;
            assert_eq!(
                kw_read_file(h, buf.as_mut_ptr(), 4096, &mut read, std::ptr::null_mut()),
                TRUE
            );
            assert_eq!(read, 4096);
            assert_eq!(buf, content);

            // CryptCreateHash + HashData on the same buffer rides the cache.
            let mut prov = 0usize;
            assert_eq!(
                kw_crypt_acquire_context_w(&mut prov, std::ptr::null(), std::ptr::null(), 0, 0),
                TRUE
            );
            let mut hash = 0usize;
            assert_eq!(
                kw_crypt_create_hash(prov, win32::alg::CALG_MD5, 0, 0, &mut hash),
                TRUE
            );
            assert_eq!(kw_crypt_hash_data(hash, buf.as_ptr(), 4096, 0), TRUE);
            let mut digest = [0u8; 16];
            let mut len = 16u32;
            assert_eq!(
                kw_crypt_get_hash_param(
                    hash,
                    win32::alg::HP_HASHVAL,
                    digest.as_mut_ptr(),
                    &mut len,
                    0
                ),
                TRUE
            );
            assert_eq!(len, 16);
            assert_eq!(
                digest.to_vec(),
                HashAlg::Md5.compute(&content).to_vec()
            );
            assert_eq!(kw_crypt_destroy_hash(hash), TRUE);
            assert_eq!(kw_crypt_release_context(prov, 0), TRUE);

            // A second open of the same header is a cache hit.
            let before = sandbox()
                .stats
                .cached_file_hits
                .load(std::sync::atomic::Ordering::Relaxed);
            let h2 = kw_create_file_w(
                path_w.as_ptr(),
                file::GENERIC_READ,
                file::FILE_SHARE_READ,
                std::ptr::null_mut(),
                file::OPEN_EXISTING,
                0,
                0,
            );
            assert_ne!(h2, INVALID_HANDLE);
            let after = sandbox()
                .stats
                .cached_file_hits
                .load(std::sync::atomic::Ordering::Relaxed);
            assert_eq!(after, before + 1);
            assert_eq!(kw_close_handle(h), TRUE);
            assert_eq!(kw_close_handle(h2), TRUE);
        }
        end_job();
    }

    #[test]
    fn stdout_writes_reach_the_output_hub() {
        let _guard = job_guard();
        let dir = tempfile::tempdir().unwrap();
        make_cl_job(dir.path());
        // SAFETY: valid pointers throughout.
        unsafe {
            let out = kw_get_std_handle(STD_OUTPUT_HANDLE);
            assert_eq!(out, sandbox().std_out.0);
            let msg = b"building...\n";
            let mut written = 0u32;
            assert_eq!(
                kw_write_file(out, msg.as_ptr(), msg.len() as u32, &mut written, std::ptr::null_mut()),
                TRUE
            );
            assert_eq!(written as usize, msg.len());
            assert_eq!(kw_get_file_type(out), file::FILE_TYPE_CHAR);
            // Closing stdout is ignored.
            assert_eq!(kw_close_handle(out), TRUE);
            assert_eq!(kw_get_std_handle(STD_OUTPUT_HANDLE), out);
        }
        sandbox().output.lock().unwrap().reset_for_job();
        end_job();
    }

    #[test]
    fn exit_family_unwinds_with_the_code() {
        let caught = std::panic::catch_unwind(|| -> () {
            // SAFETY: diverges by design.
            unsafe { kw_crt_exit(7) }
        })
        .unwrap_err();
        let exit = caught.downcast_ref::<SandboxExit>().unwrap();
        assert_eq!(exit.code, 7);

        let caught = std::panic::catch_unwind(|| -> () {
            // SAFETY: diverges by design.
            unsafe { kw_exit_process(3) }
        })
        .unwrap_err();
        assert_eq!(caught.downcast_ref::<SandboxExit>().unwrap().code, 3);
    }

    #[test]
    fn environment_shims_round_trip() {
        // SAFETY: valid pointers throughout.
        unsafe {
            let name = wide("KW_API_TEST");
            let value = wide("api-value");
            assert_eq!(kw_set_environment_variable_w(name.as_ptr(), value.as_ptr()), TRUE);

            let mut buf = [0u16; 64];
            let n = kw_get_environment_variable_w(name.as_ptr(), buf.as_mut_ptr(), 64);
            assert_eq!(n, 9);
            assert_eq!(win32::from_wide(&buf), "api-value");

            // ANSI view agrees.
            let ansi = kw_getenv(c"KW_API_TEST".as_ptr() as *const u8);
            assert!(!ansi.is_null());
            assert_eq!(ansi_str(ansi).unwrap(), "api-value");

            // Undercapacity returns the required size (with NUL).
            let n = kw_get_environment_variable_w(name.as_ptr(), buf.as_mut_ptr(), 3);
            assert_eq!(n, 10);

            // Unset makes it vanish from both views.
            assert_eq!(
                kw_set_environment_variable_w(name.as_ptr(), std::ptr::null()),
                TRUE
            );
            assert_eq!(kw_get_environment_variable_w(name.as_ptr(), buf.as_mut_ptr(), 64), 0);
            assert_eq!(win32::last_error(), error::ENVVAR_NOT_FOUND);
            assert!(kw_wgetenv(name.as_ptr()).is_null());
        }
    }

    #[test]
    fn create_thread_is_linker_only() {
        let _guard = job_guard();
        let dir = tempfile::tempdir().unwrap();
        make_cl_job(dir.path()); // hint = CL
        // SAFETY: valid pointers.
        unsafe {
            let h = kw_create_thread(std::ptr::null_mut(), 0, std::ptr::null_mut(), std::ptr::null_mut(), 0, std::ptr::null_mut());
            assert_eq!(h, 0);
            assert_eq!(win32::last_error(), error::ACCESS_DENIED);
        }
        end_job();
    }

    #[test]
    fn atexit_registers_into_the_sandbox_list() {
        unsafe extern "C" fn marker() {}
        let before = sandbox().atexit.len();
        // SAFETY: valid function pointer.
        unsafe {
            assert_eq!(kw_atexit(marker as *mut c_void), 0);
            let back = kw_onexit(marker as *mut c_void);
            assert_eq!(back, marker as *mut c_void);
        }
        assert_eq!(sandbox().atexit.len(), before + 2);
        sandbox().atexit.run_and_clear();
    }
}
