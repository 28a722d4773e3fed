//! Exception dispatch for manually mapped images.
//!
//! The OS refuses to run SEH handlers that live in memory it does not know
//! as a loaded image. On AMD64 the fix is clean: register the image's unwind
//! table with `RtlAddFunctionTable`. On x86 there is no table; the OS
//! validates the chained handlers on the stack instead, so a vectored
//! exception handler re-implements the chain walk for handlers pointing into
//! our images.
//!
//! All unsafe is confined here; the rest of the loader only sees
//! [`install`], [`register_image`] and [`unregister_image`].

use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ImageRange {
    base: usize,
    size: usize,
}

static IMAGES: Mutex<Vec<ImageRange>> = Mutex::new(Vec::new());

/// Is `pc` inside a registered manually-mapped image?
pub fn owns_address(pc: usize) -> bool {
    IMAGES
        .lock()
        .unwrap()
        .iter()
        .any(|r| pc >= r.base && pc < r.base + r.size)
}

/// Install the process-wide dispatch hook. Idempotent; called once at worker
/// start.
pub fn install() {
    sys::install();
}

/// Make exception dispatch work for code in `[base, base+size)`. The AMD64
/// side registers `function_table` (already relocated image addresses); the
/// x86 side just needs the range.
pub fn register_image(base: usize, size: usize, function_table: &[super::RuntimeFunction]) {
    let mut images = IMAGES.lock().unwrap();
    if images.iter().any(|r| r.base == base) {
        return;
    }
    images.push(ImageRange { base, size });
    drop(images);
    sys::register_function_table(base, function_table);
}

pub fn unregister_image(base: usize) {
    let mut images = IMAGES.lock().unwrap();
    images.retain(|r| r.base != base);
    drop(images);
    sys::unregister_function_table(base);
}

#[cfg(all(windows, target_arch = "x86_64"))]
mod sys {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use windows_sys::Win32::System::Diagnostics::Debug::{
        RtlAddFunctionTable, RtlDeleteFunctionTable, IMAGE_RUNTIME_FUNCTION_ENTRY,
    };

    // The table memory handed to RtlAddFunctionTable must stay alive until
    // deletion; park each registration here.
    static TABLES: Mutex<Option<HashMap<usize, Box<[IMAGE_RUNTIME_FUNCTION_ENTRY]>>>> =
        Mutex::new(None);

    pub fn install() {}

    pub fn register_function_table(base: usize, table: &[crate::pe::RuntimeFunction]) {
        if table.is_empty() {
            return;
        }
        let mut entries: Vec<IMAGE_RUNTIME_FUNCTION_ENTRY> = Vec::with_capacity(table.len());
        for f in table {
            // SAFETY: zero-init then field writes; the union layout matches.
            let mut e: IMAGE_RUNTIME_FUNCTION_ENTRY = unsafe { std::mem::zeroed() };
            e.BeginAddress = f.begin_address;
            e.EndAddress = f.end_address;
            e.Anonymous.UnwindInfoAddress = f.unwind_info_address;
            entries.push(e);
        }
        let boxed = entries.into_boxed_slice();
        // SAFETY: the entries and the image outlive the registration.
        unsafe {
            RtlAddFunctionTable(boxed.as_ptr() as *mut _, boxed.len() as u32, base as u64);
        }
        TABLES
            .lock()
            .unwrap()
            .get_or_insert_with(HashMap::new)
            .insert(base, boxed);
    }

    pub fn unregister_function_table(base: usize) {
        let mut tables = TABLES.lock().unwrap();
        if let Some(boxed) = tables.as_mut().and_then(|t| t.remove(&base)) {
            // SAFETY: the pointer is the one we registered.
            unsafe {
                RtlDeleteFunctionTable(boxed.as_ptr() as *mut _);
            }
        }
    }
}

#[cfg(all(windows, target_arch = "x86"))]
mod sys {
    //! x86: vectored handler emulating chained SEH dispatch for handlers in
    //! manually mapped images.

    use windows_sys::Win32::Foundation::{EXCEPTION_CONTINUE_EXECUTION, EXCEPTION_CONTINUE_SEARCH};
    use windows_sys::Win32::System::Diagnostics::Debug::{
        AddVectoredExceptionHandler, CONTEXT, EXCEPTION_POINTERS,
    };

    const EXCEPTION_CONTINUE_SEARCH_DISP: i32 = 1;

    #[repr(C)]
    struct ExceptionRegistration {
        next: *mut ExceptionRegistration,
        handler: usize,
    }

    type SehHandler = unsafe extern "C" fn(
        record: *mut core::ffi::c_void,
        frame: *mut ExceptionRegistration,
        context: *mut CONTEXT,
        dispatch: *mut core::ffi::c_void,
    ) -> i32;

    fn exception_list_head() -> *mut ExceptionRegistration {
        let head: usize;
        // SAFETY: fs:[0] is the SEH chain head on x86 Windows.
        unsafe {
            core::arch::asm!("mov {}, fs:[0]", out(reg) head, options(nostack, readonly));
        }
        head as *mut ExceptionRegistration
    }

    unsafe extern "system" fn vectored_dispatch(info: *mut EXCEPTION_POINTERS) -> i32 {
        // Walk the chain; run every handler that points into one of our
        // images, the way the OS dispatcher would if it trusted them.
        // SAFETY: the chain is the thread's live SEH list.
        unsafe {
            let mut frame = exception_list_head();
            while !frame.is_null() && frame as usize != usize::MAX {
                let handler = (*frame).handler;
                if super::owns_address(handler) {
                    let f: SehHandler = std::mem::transmute(handler);
                    let record = (*info).ExceptionRecord as *mut core::ffi::c_void;
                    let disposition =
                        f(record, frame, (*info).ContextRecord, std::ptr::null_mut());
                    if disposition != EXCEPTION_CONTINUE_SEARCH_DISP {
                        return EXCEPTION_CONTINUE_EXECUTION;
                    }
                }
                frame = (*frame).next;
            }
        }
        EXCEPTION_CONTINUE_SEARCH
    }

    pub fn install() {
        // SAFETY: installs a process-wide handler once.
        unsafe {
            AddVectoredExceptionHandler(1, Some(vectored_dispatch));
        }
    }

    pub fn register_function_table(_base: usize, _table: &[crate::pe::RuntimeFunction]) {}

    pub fn unregister_function_table(_base: usize) {}
}

#[cfg(not(windows))]
mod sys {
    pub fn install() {}
    pub fn register_function_table(_base: usize, _table: &[crate::pe::RuntimeFunction]) {}
    pub fn unregister_function_table(_base: usize) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_registry() {
        install();
        register_image(0x10_0000, 0x2000, &[]);
        register_image(0x20_0000, 0x1000, &[]);
        // Double registration is ignored.
        register_image(0x10_0000, 0x9999, &[]);
        assert!(owns_address(0x10_0000));
        assert!(owns_address(0x10_1FFF));
        assert!(!owns_address(0x10_2000));
        assert!(owns_address(0x20_0800));
        unregister_image(0x10_0000);
        assert!(!owns_address(0x10_1000));
        assert!(owns_address(0x20_0800));
        unregister_image(0x20_0000);
        assert!(!owns_address(0x20_0800));
    }
}
