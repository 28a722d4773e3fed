//! The sandbox: process-wide state every replacement function reaches.
//!
//! Replacement functions are invoked through patched IATs by code that knows
//! nothing about this crate, so the state hangs off a process-wide handle
//! with interior locking. Per the concurrency model, everything of
//! consequence happens on the worker main thread; the locks exist for the
//! tolerated linker debug thread and OS callbacks.

pub mod history;
pub mod job;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::environment::Environment;
use crate::fs_cache::FsCache;
use crate::handles::HandleTable;
use crate::hash_cache::HashCache;
use crate::modules::ModuleRegistry;
use crate::output::{OutputHub, StdStream};
use crate::stats::Stats;
use crate::temp_store::TempStore;
use crate::tools::{Tool, ToolRegistry};
use crate::vm_tracker::{AtExitList, HeapTracker, SlotKind, SlotTracker, VirtualAllocTracker};
use crate::win32::RawHandle;

/// Payload thrown by the intercepted `exit` family and caught at the job
/// boundary; the Rust rendition of the original's longjmp out of the tool.
#[derive(Debug, Clone, Copy)]
pub struct SandboxExit {
    pub code: u32,
}

/// Per-job mutable context.
#[derive(Debug, Default)]
pub struct JobContext {
    pub tool: Option<Arc<Tool>>,
    pub working_dir: String,
    pub pch_caching: bool,
    pub running: bool,
    /// The command line the tool re-parses, both encodings, stable for the
    /// duration of the job.
    pub command_line_ansi: Vec<u8>,
    pub command_line_wide: Vec<u16>,
    /// `_MSPDBSRV_ENDPOINT_` of the previous job, for selective mspdb
    /// re-initialization.
    pub mspdb_endpoint: Option<String>,
    /// The one debug-helper thread the linker may spawn.
    pub helper_thread_spawned: bool,
}

#[derive(Debug)]
pub struct Sandbox {
    pub fs: Mutex<FsCache>,
    pub temp: Mutex<TempStore>,
    pub handles: HandleTable,
    pub env: Mutex<Environment>,
    pub hash: Mutex<HashCache>,
    pub output: Mutex<OutputHub>,
    pub valloc: VirtualAllocTracker,
    pub heaps: HeapTracker,
    pub fls: SlotTracker,
    pub tls: SlotTracker,
    pub atexit: AtExitList,
    pub modules: Mutex<ModuleRegistry>,
    pub tools: Mutex<ToolRegistry>,
    pub stats: Stats,
    pub job: Mutex<JobContext>,
    pub history: Mutex<history::HistoryRing>,
    /// View pointer -> mapping handle, for `UnmapViewOfFile`.
    pub views: Mutex<Vec<(usize, RawHandle)>>,
    /// Fabricated handle values; reset between jobs once the table is empty.
    next_handle: AtomicUsize,
    restart_requested: AtomicBool,
    /// Fixed handles for the buffered standard streams.
    pub std_out: RawHandle,
    pub std_err: RawHandle,
    /// Working-set budget; crossing it schedules a restart.
    pub memory_limit: u64,
}

/// First fabricated handle value. High enough to stay clear of the handles
/// a young process actually owns.
const HANDLE_BASE: usize = 0x4000;

static SANDBOX: OnceLock<Sandbox> = OnceLock::new();

/// Build-time knobs for [`init`].
#[derive(Debug, Default)]
pub struct SandboxConfig {
    pub volatile_roots: Vec<String>,
    pub memory_limit: Option<u64>,
    /// Capture stdout/stderr as console streams (true when attached to one).
    pub stdout_is_console: bool,
    pub stderr_is_console: bool,
    pub output_sink: Option<Box<dyn crate::output::OutputSink + Send>>,
}

/// Initialize the process-wide sandbox. Idempotent; the first caller wins.
pub fn init(config: SandboxConfig) -> &'static Sandbox {
    SANDBOX.get_or_init(|| {
        let std_out = RawHandle(HANDLE_BASE);
        let std_err = RawHandle(HANDLE_BASE + 4);
        let sink = config
            .output_sink
            .unwrap_or_else(|| Box::new(crate::output::sinks::ProcessSink::default()));
        let output = OutputHub::new(
            sink,
            config.stdout_is_console,
            config.stderr_is_console,
            std_out,
            std_err,
        );
        let handles = HandleTable::new();
        handles.enter(crate::handles::HandleEntry::fixed(
            std_out,
            crate::handles::HandleData::Output(StdStream::Out),
        ));
        handles.enter(crate::handles::HandleEntry::fixed(
            std_err,
            crate::handles::HandleData::Output(StdStream::Err),
        ));

        let mut fs = FsCache::new();
        for root in &config.volatile_roots {
            fs.add_volatile_root(root);
        }
        for var in ["TEMP", "TMP", "TMPDIR"] {
            if let Ok(dir) = std::env::var(var) {
                fs.add_volatile_root(&dir);
            }
        }

        crate::pe::seh::install();

        let valloc = VirtualAllocTracker::new();
        #[cfg(target_pointer_width = "32")]
        {
            // cl.exe loads precompiled headers at a hard-coded base on x86;
            // the range is reserved up front and handed back to matching
            // VirtualAlloc requests without going to the OS.
            valloc.add_fixed_range(0x3E00_0000, 0x0400_0000);
        }

        Sandbox {
            fs: Mutex::new(fs),
            temp: Mutex::new(TempStore::new()),
            handles,
            env: Mutex::new(Environment::new()),
            hash: Mutex::new(HashCache::new()),
            output: Mutex::new(output),
            valloc,
            heaps: HeapTracker::new(),
            fls: SlotTracker::new(SlotKind::Fls),
            tls: SlotTracker::new(SlotKind::Tls),
            atexit: AtExitList::new(),
            modules: Mutex::new(ModuleRegistry::new()),
            tools: Mutex::new(ToolRegistry::new()),
            stats: Stats::new(),
            job: Mutex::new(JobContext::default()),
            history: Mutex::new(history::HistoryRing::new()),
            views: Mutex::new(Vec::new()),
            next_handle: AtomicUsize::new(HANDLE_BASE + 8),
            restart_requested: AtomicBool::new(false),
            std_out,
            std_err,
            memory_limit: config.memory_limit.unwrap_or_else(default_memory_limit),
        }
    })
}

/// The process-wide sandbox. Initializes with defaults when the worker
/// startup path has not run (tests).
pub fn sandbox() -> &'static Sandbox {
    init(SandboxConfig::default())
}

impl Sandbox {
    /// Fabricate a unique HANDLE value for the table.
    pub fn alloc_handle(&self) -> RawHandle {
        RawHandle(self.next_handle.fetch_add(4, Ordering::Relaxed))
    }

    /// Reset the fabricated-handle counter once the table holds only the
    /// fixed entries again, so the table stays small across thousands of
    /// jobs.
    pub fn rewind_handles(&self) {
        if self.handles.live_count() == 2 {
            self.next_handle.store(HANDLE_BASE + 8, Ordering::Relaxed);
        }
    }

    pub fn request_restart(&self) {
        self.restart_requested.store(true, Ordering::Relaxed);
    }

    pub fn restart_requested(&self) -> bool {
        self.restart_requested.load(Ordering::Relaxed)
    }

    /// Tests share one process-wide sandbox; they rewind the restart flag
    /// between scenarios.
    #[cfg(test)]
    pub(crate) fn clear_restart(&self) {
        self.restart_requested.store(false, Ordering::Relaxed);
    }

    /// The current tool, if a job is active.
    pub fn current_tool(&self) -> Option<Arc<Tool>> {
        self.job.lock().unwrap().tool.clone()
    }

    pub fn tool_is_cl(&self) -> bool {
        self.current_tool().is_some_and(|t| t.hint.is_cl())
    }

    pub fn tool_is_link(&self) -> bool {
        self.current_tool().is_some_and(|t| t.hint.is_link())
    }
}

/// min(phys/cpus/4, 1.5 GiB on 32-bit); the env override is applied by the
/// CLI before init.
pub fn default_memory_limit() -> u64 {
    let phys = sys::physical_memory();
    let per_cpu = phys / num_cpus::get() as u64 / 4;
    if cfg!(target_pointer_width = "32") {
        per_cpu.min(1536 * 1024 * 1024)
    } else {
        per_cpu
    }
}

/// Post-job process health, for the restart policy.
#[derive(Debug, Clone, Copy)]
pub struct ProcessBudget {
    pub working_set: u64,
    pub handle_count: u32,
}

pub const HANDLE_COUNT_LIMIT: u32 = 6000;

pub fn query_process_budget() -> ProcessBudget {
    ProcessBudget {
        working_set: sys::working_set(),
        handle_count: sys::handle_count(),
    }
}

#[cfg(windows)]
mod sys {
    pub fn physical_memory() -> u64 {
        use windows_sys::Win32::System::SystemInformation::{
            GlobalMemoryStatusEx, MEMORYSTATUSEX,
        };
        // SAFETY: out-param struct with the documented length field set.
        unsafe {
            let mut status: MEMORYSTATUSEX = std::mem::zeroed();
            status.dwLength = std::mem::size_of::<MEMORYSTATUSEX>() as u32;
            if GlobalMemoryStatusEx(&mut status) != 0 {
                status.ullTotalPhys
            } else {
                8 * 1024 * 1024 * 1024
            }
        }
    }

    pub fn working_set() -> u64 {
        use windows_sys::Win32::System::Threading::GetCurrentProcess;
        use windows_sys::Win32::System::ProcessStatus::{
            GetProcessMemoryInfo, PROCESS_MEMORY_COUNTERS,
        };
        // SAFETY: out-param query on our own process.
        unsafe {
            let mut counters: PROCESS_MEMORY_COUNTERS = std::mem::zeroed();
            counters.cb = std::mem::size_of::<PROCESS_MEMORY_COUNTERS>() as u32;
            if GetProcessMemoryInfo(GetCurrentProcess(), &mut counters, counters.cb) != 0 {
                counters.WorkingSetSize as u64
            } else {
                0
            }
        }
    }

    pub fn handle_count() -> u32 {
        use windows_sys::Win32::System::Threading::{GetCurrentProcess, GetProcessHandleCount};
        // SAFETY: out-param query on our own process.
        unsafe {
            let mut count = 0u32;
            GetProcessHandleCount(GetCurrentProcess(), &mut count);
            count
        }
    }
}

#[cfg(not(windows))]
mod sys {
    pub fn physical_memory() -> u64 {
        8 * 1024 * 1024 * 1024
    }

    pub fn working_set() -> u64 {
        0
    }

    pub fn handle_count() -> u32 {
        0
    }
}

/// Serializes tests that stage a job in the process-wide sandbox.
#[cfg(test)]
pub(crate) static TEST_JOB_LOCK: Mutex<()> = Mutex::new(());

#[cfg(test)]
pub(crate) fn test_job_guard() -> std::sync::MutexGuard<'static, ()> {
    TEST_JOB_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn singleton_has_fixed_stdio() {
        let sb = sandbox();
        assert!(sb.handles.lookup(sb.std_out).is_some());
        assert!(sb.handles.lookup(sb.std_err).is_some());
        assert_eq!(sb.handles.close(sb.std_out), crate::handles::CloseResult::StillOpen);
    }

    #[test]
    fn fabricated_handles_are_distinct() {
        let sb = sandbox();
        let a = sb.alloc_handle();
        let b = sb.alloc_handle();
        assert_ne!(a, b);
        assert_ne!(a.table_index(), b.table_index());
    }

    #[test]
    fn memory_limit_default_is_positive() {
        assert!(default_memory_limit() > 0);
    }
}
