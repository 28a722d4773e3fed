//! Win32 vocabulary shared by the interception layer.
//!
//! The replacement functions speak the Win32 calling convention: sentinel
//! return values plus a per-thread last-error code. The constants live here
//! rather than coming from `windows-sys` so the state machines compile and
//! test on non-Windows hosts; on Windows the last-error cell is mirrored
//! into the real TEB so code we do not intercept observes the same value.

use std::cell::Cell;

/// Raw HANDLE value as the sandboxed tool sees it.
///
/// Stored as `usize` so handle values can live in cross-thread tables; the
/// extern shims convert from the pointer-typed OS representation at the
/// boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
#[display("{_0:#x}")]
pub struct RawHandle(pub usize);

impl RawHandle {
    pub const INVALID: RawHandle = RawHandle(usize::MAX);
    pub const NULL: RawHandle = RawHandle(0);

    /// Index bits used to key the handle table. The kernel hands out handle
    /// values that are multiples of four; bit 31 flags pseudo handles and is
    /// masked off.
    pub fn table_index(self) -> usize {
        (self.0 & !(1usize << 31)) >> 2
    }

    pub fn is_invalid(self) -> bool {
        self == Self::INVALID || self == Self::NULL
    }
}

/// Win32 error codes returned through the last-error cell.
pub mod error {
    pub const SUCCESS: u32 = 0;
    pub const FILE_NOT_FOUND: u32 = 2;
    pub const PATH_NOT_FOUND: u32 = 3;
    pub const ACCESS_DENIED: u32 = 5;
    pub const INVALID_HANDLE: u32 = 6;
    pub const NOT_ENOUGH_MEMORY: u32 = 8;
    pub const NOT_SUPPORTED: u32 = 50;
    pub const FILE_EXISTS: u32 = 80;
    pub const INVALID_PARAMETER: u32 = 87;
    pub const INSUFFICIENT_BUFFER: u32 = 122;
    pub const INVALID_NAME: u32 = 123;
    pub const NEGATIVE_SEEK: u32 = 131;
    pub const ALREADY_EXISTS: u32 = 183;
    pub const ENVVAR_NOT_FOUND: u32 = 203;
    pub const FILENAME_EXCED_RANGE: u32 = 206;
    pub const MOD_NOT_FOUND: u32 = 126;
    pub const PROC_NOT_FOUND: u32 = 127;
    pub const BAD_EXE_FORMAT: u32 = 193;

    // CryptoAPI HRESULT-style codes surfaced by the hash interception.
    pub const NTE_BAD_HASH: u32 = 0x8009_0002;
    pub const NTE_BAD_ALGID: u32 = 0x8009_0008;
    pub const NTE_BAD_FLAGS: u32 = 0x8009_0009;
}

/// File access, share, disposition and flag constants for `CreateFileW`.
pub mod file {
    pub const GENERIC_READ: u32 = 0x8000_0000;
    pub const GENERIC_WRITE: u32 = 0x4000_0000;
    pub const GENERIC_EXECUTE: u32 = 0x2000_0000;
    pub const GENERIC_ALL: u32 = 0x1000_0000;
    pub const DELETE: u32 = 0x0001_0000;

    pub const FILE_SHARE_READ: u32 = 0x1;
    pub const FILE_SHARE_WRITE: u32 = 0x2;
    pub const FILE_SHARE_DELETE: u32 = 0x4;

    pub const CREATE_NEW: u32 = 1;
    pub const CREATE_ALWAYS: u32 = 2;
    pub const OPEN_EXISTING: u32 = 3;
    pub const OPEN_ALWAYS: u32 = 4;
    pub const TRUNCATE_EXISTING: u32 = 5;

    pub const FILE_ATTRIBUTE_NORMAL: u32 = 0x80;
    pub const FILE_FLAG_BACKUP_SEMANTICS: u32 = 0x0200_0000;
    pub const FILE_FLAG_OPEN_REPARSE_POINT: u32 = 0x0020_0000;
    pub const FILE_FLAG_DELETE_ON_CLOSE: u32 = 0x0400_0000;

    pub const FILE_BEGIN: u32 = 0;
    pub const FILE_CURRENT: u32 = 1;
    pub const FILE_END: u32 = 2;

    pub const INVALID_SET_FILE_POINTER: u32 = 0xFFFF_FFFF;
    pub const INVALID_FILE_SIZE: u32 = 0xFFFF_FFFF;

    pub const FILE_TYPE_UNKNOWN: u32 = 0;
    pub const FILE_TYPE_DISK: u32 = 1;
    pub const FILE_TYPE_CHAR: u32 = 2;
    pub const FILE_TYPE_PIPE: u32 = 3;
}

/// Page protection and allocation-type constants for the memory tracker.
pub mod mem {
    pub const MEM_COMMIT: u32 = 0x1000;
    pub const MEM_RESERVE: u32 = 0x2000;
    pub const MEM_DECOMMIT: u32 = 0x4000;
    pub const MEM_RELEASE: u32 = 0x8000;
    pub const MEM_TOP_DOWN: u32 = 0x0010_0000;

    pub const PAGE_NOACCESS: u32 = 0x01;
    pub const PAGE_READONLY: u32 = 0x02;
    pub const PAGE_READWRITE: u32 = 0x04;
    pub const PAGE_WRITECOPY: u32 = 0x08;
    pub const PAGE_EXECUTE: u32 = 0x10;
    pub const PAGE_EXECUTE_READ: u32 = 0x20;
    pub const PAGE_EXECUTE_READWRITE: u32 = 0x40;
}

/// CryptoAPI ALG_ID values the hash cache recognizes.
pub mod alg {
    pub const CALG_MD5: u32 = 0x0000_8003;
    pub const CALG_SHA1: u32 = 0x0000_8004;
    pub const CALG_SHA_256: u32 = 0x0000_800C;
    pub const CALG_SHA_384: u32 = 0x0000_800D;
    pub const CALG_SHA_512: u32 = 0x0000_800E;

    /// `CryptGetHashParam` parameter ids.
    pub const HP_ALGID: u32 = 1;
    pub const HP_HASHVAL: u32 = 2;
    pub const HP_HASHSIZE: u32 = 4;
}

thread_local! {
    static LAST_ERROR: Cell<u32> = const { Cell::new(error::SUCCESS) };
}

/// Set the thread's last-error code, Win32 style.
pub fn set_last_error(code: u32) {
    LAST_ERROR.with(|c| c.set(code));
    #[cfg(windows)]
    unsafe {
        windows_sys::Win32::Foundation::SetLastError(code);
    }
}

/// Read back the thread's last-error code.
pub fn last_error() -> u32 {
    LAST_ERROR.with(|c| c.get())
}

/// Encode a `&str` as a NUL-terminated UTF-16 buffer.
pub fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Decode a UTF-16 slice, stopping at the first NUL if present.
pub fn from_wide(w: &[u16]) -> String {
    let end = w.iter().position(|&c| c == 0).unwrap_or(w.len());
    String::from_utf16_lossy(&w[..end])
}

/// Decode a NUL-terminated UTF-16 string from a raw pointer.
///
/// # Safety
/// `ptr` must point to a NUL-terminated UTF-16 string.
pub unsafe fn from_wide_ptr(ptr: *const u16) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    let mut len = 0usize;
    // SAFETY: caller guarantees NUL termination.
    unsafe {
        while *ptr.add(len) != 0 {
            len += 1;
        }
        Some(String::from_utf16_lossy(std::slice::from_raw_parts(ptr, len)))
    }
}

/// ASCII case-insensitive comparison of two byte strings, as the loader and
/// the env vectors compare names. Non-ASCII bytes compare verbatim.
pub fn eq_ascii_icase(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b)
            .all(|(x, y)| x.eq_ignore_ascii_case(y))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_index_masks_pseudo_bit() {
        assert_eq!(RawHandle(0x14).table_index(), 5);
        assert_eq!(RawHandle(0x8000_0014).table_index(), 5);
    }

    #[test]
    fn last_error_round_trip() {
        set_last_error(error::FILE_NOT_FOUND);
        assert_eq!(last_error(), error::FILE_NOT_FOUND);
        set_last_error(error::SUCCESS);
    }

    #[test]
    fn wide_round_trip() {
        let w = wide("cl.exe");
        assert_eq!(w.last(), Some(&0));
        assert_eq!(from_wide(&w), "cl.exe");
    }

    #[test]
    fn icase_comparison() {
        assert!(eq_ascii_icase(b"PATH", b"path"));
        assert!(!eq_ascii_icase(b"PATH", b"PATHEXT"));
    }
}
