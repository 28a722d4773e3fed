//! Per-job environment and command line.
//!
//! The sandboxed CRT sees four parallel vectors (`papszEnvVars`/`environ`
//! in ANSI, `papwszEnvVars`/`_wenviron` in UTF-16); every mutation keeps the
//! ANSI and wide views in lockstep so a tool mixing `getenv` and
//! `_wgetenv` observes one environment. `PATH` is additionally mirrored into
//! the real process environment because native `LoadLibrary` consults it.
//!
//! The job command line is built from the driver's argv with MSVCRT quoting
//! (or the OpenWatcom variant when the driver says so) and swapped into the
//! PEB for the duration of the job, because MSVC tools re-parse
//! `GetCommandLineW` rather than trusting their argv.

use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

use crate::win32::{eq_ascii_icase, wide};

/// Grow the vectors in chunks so the CRT-visible arrays keep their address
/// across most jobs.
const ENV_CHUNK: usize = 256;

#[derive(Debug, Clone)]
struct EnvEntry {
    /// `NAME=VALUE`, ANSI view.
    ansi: String,
    /// Same pair, UTF-16 view, NUL terminated.
    wide: Vec<u16>,
}

impl EnvEntry {
    fn new(name: &str, value: &str) -> Self {
        let ansi = format!("{name}={value}");
        let wide = wide(&ansi);
        EnvEntry { ansi, wide }
    }

    fn name(&self) -> &str {
        self.ansi.split_once('=').map_or("", |(n, _)| n)
    }

    fn value(&self) -> &str {
        self.ansi.split_once('=').map_or("", |(_, v)| v)
    }
}

#[derive(Debug, Default)]
pub struct Environment {
    entries: Vec<EnvEntry>,
}

impl Environment {
    pub fn new() -> Self {
        let mut env = Environment {
            entries: Vec::new(),
        };
        env.entries.reserve(ENV_CHUNK);
        env
    }

    /// Build from the driver's `NAME=VALUE` block.
    pub fn from_block(block: &[String]) -> Self {
        let mut env = Self::new();
        for pair in block {
            if let Some((name, value)) = pair.split_once('=') {
                env.set(name, value);
            }
        }
        env
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| eq_ascii_icase(e.name().as_bytes(), name.as_bytes()))
    }

    /// Set or replace `name`. Both encodings update together.
    pub fn set(&mut self, name: &str, value: &str) {
        if self.entries.len() == self.entries.capacity() {
            self.entries.reserve(ENV_CHUNK);
        }
        let entry = EnvEntry::new(name, value);
        match self.position(name) {
            Some(i) => self.entries[i] = entry,
            None => self.entries.push(entry),
        }
        if eq_ascii_icase(name.as_bytes(), b"PATH") {
            // Native LoadLibrary searches the real PATH.
            // SAFETY: the worker mutates its environment only from the main
            // thread (§ concurrency model).
            unsafe { std::env::set_var("PATH", value) };
        }
    }

    /// Remove `name` by swapping in the tail entry.
    pub fn unset(&mut self, name: &str) -> bool {
        match self.position(name) {
            Some(i) => {
                self.entries.swap_remove(i);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name).map(|i| self.entries[i].value())
    }

    pub fn get_wide(&self, name: &str) -> Option<&[u16]> {
        self.position(name).map(|i| {
            let e = &self.entries[i];
            let eq = e.ansi.find('=').unwrap_or(0);
            // Past `NAME=`, including the NUL.
            &e.wide[eq + 1..]
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter_ansi(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.ansi.as_str())
    }

    pub fn iter_wide(&self) -> impl Iterator<Item = &[u16]> {
        self.entries.iter().map(|e| e.wide.as_slice())
    }
}

/// Quote one argument per the MSVCRT parsing rules: quotes around anything
/// with spaces, backslash runs doubled only in front of a quote.
fn quote_arg_msvcrt(out: &mut String, arg: &str) {
    let needs_quotes = arg.is_empty() || arg.contains([' ', '\t', '"']);
    if !needs_quotes {
        out.push_str(arg);
        return;
    }
    out.push('"');
    let mut backslashes = 0usize;
    for c in arg.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                // Each pending backslash escapes itself, then the quote.
                out.extend(std::iter::repeat_n('\\', backslashes * 2 + 1));
                backslashes = 0;
                out.push('"');
            }
            c => {
                out.extend(std::iter::repeat_n('\\', backslashes));
                backslashes = 0;
                out.push(c);
            }
        }
    }
    // Trailing backslashes must not swallow the closing quote.
    out.extend(std::iter::repeat_n('\\', backslashes * 2));
    out.push('"');
}

/// The OpenWatcom tools parse their command line themselves and do not treat
/// backslash as an escape; only the quote needs hiding.
fn quote_arg_watcom(out: &mut String, arg: &str) {
    let needs_quotes = arg.is_empty() || arg.contains([' ', '\t', '"']);
    if !needs_quotes {
        out.push_str(arg);
        return;
    }
    out.push('"');
    for c in arg.chars() {
        if c == '"' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
}

/// Join argv into the single command line the tool re-parses.
pub fn build_command_line(argv: &[String], watcom: bool) -> String {
    let mut out = String::new();
    for (i, arg) in argv.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        if watcom {
            quote_arg_watcom(&mut out, arg);
        } else {
            quote_arg_msvcrt(&mut out, arg);
        }
    }
    out
}

/// Counter behind `@@DEBUG_COUNTER@@`; distinct value per expansion for the
/// life of the worker.
static DEBUG_COUNTER: AtomicU64 = AtomicU64::new(0);

const MAX_EXPANDED: usize = 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SpecialEnvError {
    #[error("unknown expansion token @@{0}@@")]
    UnknownToken(String),
    #[error("unterminated @@ token")]
    Unterminated,
    #[error("expanded value is {0} bytes, limit {MAX_EXPANDED}")]
    TooLong(usize),
}

/// Expand `@@TOKEN@@` sequences the driver left for us: values that only the
/// worker process knows.
pub fn expand_special(value: &str) -> Result<String, SpecialEnvError> {
    let mut out = String::new();
    let mut rest = value;
    while let Some(start) = rest.find("@@") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        if let Some(stripped) = after.strip_prefix("@@") {
            // `@@@@` is a literal `@@`.
            out.push_str("@@");
            rest = stripped;
            continue;
        }
        let end = after.find("@@").ok_or(SpecialEnvError::Unterminated)?;
        let token = &after[..end];
        match token {
            "PROCESS_GROUP" => out.push_str(&sys::processor_group().to_string()),
            "AUTHENTICATION_ID" => {
                out.push_str(&format!("{:x}", sys::authentication_id()));
            }
            "PID" => out.push_str(&std::process::id().to_string()),
            "DEBUG_COUNTER" => {
                let n = DEBUG_COUNTER.fetch_add(1, Ordering::Relaxed);
                out.push_str(&n.to_string());
            }
            unknown => return Err(SpecialEnvError::UnknownToken(unknown.to_owned())),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    if out.len() > MAX_EXPANDED {
        return Err(SpecialEnvError::TooLong(out.len()));
    }
    Ok(out)
}

/// Scoped swap of the command line the tool observes via `GetCommandLineW`.
/// The previous line is restored when the guard drops, on every exit path.
#[derive(Debug)]
pub struct CommandLineGuard {
    saved: String,
}

impl CommandLineGuard {
    pub fn swap_in(line: &str) -> Self {
        let saved = sys::peb_command_line();
        sys::set_peb_command_line(line);
        CommandLineGuard { saved }
    }
}

impl Drop for CommandLineGuard {
    fn drop(&mut self) {
        sys::set_peb_command_line(&self.saved);
    }
}

#[cfg(windows)]
mod sys {
    //! Real PEB/TEB access. The structures are the documented prefixes only.

    use std::cell::RefCell;

    #[repr(C)]
    struct UnicodeString {
        length: u16,
        maximum_length: u16,
        buffer: *mut u16,
    }

    // Offsets per the public PEB layout: ProcessParameters within the PEB,
    // CommandLine within RTL_USER_PROCESS_PARAMETERS.
    #[cfg(target_arch = "x86_64")]
    const PEB_PROCESS_PARAMETERS: usize = 0x20;
    #[cfg(target_arch = "x86_64")]
    const PARAMS_COMMAND_LINE: usize = 0x70;
    #[cfg(target_arch = "x86")]
    const PEB_PROCESS_PARAMETERS: usize = 0x10;
    #[cfg(target_arch = "x86")]
    const PARAMS_COMMAND_LINE: usize = 0x40;

    #[cfg(target_arch = "x86_64")]
    fn peb() -> *mut u8 {
        let peb: usize;
        // SAFETY: gs:[0x60] is the PEB pointer on AMD64 Windows.
        unsafe {
            std::arch::asm!(
                "mov {}, gs:[0x60]",
                out(reg) peb,
                options(nostack, pure, readonly)
            );
        }
        peb as *mut u8
    }

    #[cfg(target_arch = "x86")]
    fn peb() -> *mut u8 {
        let peb: usize;
        // SAFETY: fs:[0x30] is the PEB pointer on x86 Windows.
        unsafe {
            std::arch::asm!(
                "mov {}, fs:[0x30]",
                out(reg) peb,
                options(nostack, pure, readonly)
            );
        }
        peb as *mut u8
    }

    unsafe fn command_line_ptr() -> *mut UnicodeString {
        // SAFETY: both pointers are valid for a live process.
        unsafe {
            let params = *(peb().add(PEB_PROCESS_PARAMETERS) as *mut *mut u8);
            params.add(PARAMS_COMMAND_LINE) as *mut UnicodeString
        }
    }

    thread_local! {
        // The wide buffer currently swapped into the PEB must outlive the
        // swap; it is parked here.
        static SWAPPED: RefCell<Option<Vec<u16>>> = const { RefCell::new(None) };
    }

    pub fn peb_command_line() -> String {
        // SAFETY: reads the live PEB command line.
        unsafe {
            let us = &*command_line_ptr();
            let units = std::slice::from_raw_parts(us.buffer, (us.length / 2) as usize);
            String::from_utf16_lossy(units)
        }
    }

    pub fn set_peb_command_line(line: &str) {
        let mut buf: Vec<u16> = line.encode_utf16().collect();
        buf.push(0);
        // SAFETY: single-threaded mutation per the concurrency model; the
        // buffer is parked in SWAPPED until the next swap.
        unsafe {
            let us = &mut *command_line_ptr();
            us.length = ((buf.len() - 1) * 2) as u16;
            us.maximum_length = (buf.len() * 2) as u16;
            us.buffer = buf.as_mut_ptr();
        }
        SWAPPED.with(|s| *s.borrow_mut() = Some(buf));
    }

    pub fn processor_group() -> u16 {
        use windows_sys::Win32::System::Threading::GetCurrentProcessorNumberEx;
        let mut pn = unsafe { std::mem::zeroed() };
        // SAFETY: out-param write of a PROCESSOR_NUMBER.
        unsafe { GetCurrentProcessorNumberEx(&mut pn) };
        pn.Group
    }

    pub fn authentication_id() -> u64 {
        use windows_sys::Win32::Foundation::{CloseHandle, LUID};
        use windows_sys::Win32::Security::{GetTokenInformation, TokenStatistics, TOKEN_QUERY};
        use windows_sys::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

        #[repr(C)]
        struct TokenStats {
            token_id: LUID,
            authentication_id: LUID,
            // remainder of TOKEN_STATISTICS, not inspected
            rest: [u8; 64],
        }

        // SAFETY: standard token query sequence; failures fall back to 0.
        unsafe {
            let mut token = std::ptr::null_mut();
            if OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) == 0 {
                return 0;
            }
            let mut stats: TokenStats = std::mem::zeroed();
            let mut len = 0u32;
            let ok = GetTokenInformation(
                token,
                TokenStatistics,
                &mut stats as *mut _ as *mut _,
                std::mem::size_of::<TokenStats>() as u32,
                &mut len,
            );
            CloseHandle(token);
            if ok == 0 {
                return 0;
            }
            ((stats.authentication_id.HighPart as u64) << 32)
                | stats.authentication_id.LowPart as u64
        }
    }
}

#[cfg(not(windows))]
mod sys {
    //! Host-neutral model of the PEB command line for tests.

    use std::sync::Mutex;

    static COMMAND_LINE: Mutex<String> = Mutex::new(String::new());

    pub fn peb_command_line() -> String {
        COMMAND_LINE.lock().unwrap().clone()
    }

    pub fn set_peb_command_line(line: &str) {
        *COMMAND_LINE.lock().unwrap() = line.to_owned();
    }

    pub fn processor_group() -> u16 {
        0
    }

    pub fn authentication_id() -> u64 {
        0x3e7
    }
}
