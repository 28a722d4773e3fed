//! Per-job lifecycle: init, entry invocation, cleanup, restart policy.
//!
//! The sequence per submission: invalidate the volatile tree, build the
//! environment and command line, fetch the tool, rewind and re-init module
//! state, swap the PEB command line, call the entry point, then unwind state
//! in two stages — essential cleanup before the reply (PEB, output flush)
//! and late cleanup after it (handles, temp files, trackers), so the driver
//! gets its exit code as early as possible.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::environment::{build_command_line, expand_special, CommandLineGuard, Environment};
use crate::handles::HandleData;
use crate::protocol::{JobArg, JobReply, JobRequest};
use crate::replace::SandboxResolver;
use crate::sandbox::{
    query_process_budget, sandbox, SandboxExit, HANDLE_COUNT_LIMIT,
};
use crate::stats::Stats;
use crate::tools::{resolve_executable, Tool};

/// Sandbox init failed (loader, lookup); the driver treats this as "run the
/// tool the old-fashioned way".
pub const EXIT_LOADER_FAILURE: u32 = 42;
/// `@@TOKEN@@` expansion failed.
pub const EXIT_SPECIAL_ENV: u32 = 43;
/// The tool died on an unhandled exception inside the sandbox.
pub const EXIT_EXCEPTION: u32 = 512;

/// What to call as the job's `main`.
#[derive(Debug, Clone, Copy)]
pub enum EntryPoint {
    /// Entry address of a manually mapped executable.
    Image(usize),
    /// A built-in job body; the self-test path drives full jobs through the
    /// sandbox without a PE image.
    Builtin(fn() -> i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// Entry returned normally.
    Returned(u32),
    /// Entry left through the intercepted exit family.
    Exited(u32),
    /// Unhandled exception; worker restart scheduled.
    Faulted,
}

/// Run a submission end to end and produce the driver reply.
pub fn run_job(request: &JobRequest) -> JobReply {
    let sb = sandbox();
    Stats::bump(&sb.stats.jobs_run);
    sb.fs.lock().unwrap().invalidate_custom_both();

    // Environment and argv, with driver-deferred token expansion.
    let mut env = Environment::from_block(&request.env);
    if let Err(err) = expand_env_tokens(&mut env, request) {
        warn!(%err, "special environment expansion failed");
        return finish_failed_init(EXIT_SPECIAL_ENV);
    }
    let argv = match expand_argv(&request.argv) {
        Ok(argv) => argv,
        Err(err) => {
            warn!(%err, "argument expansion failed");
            return finish_failed_init(EXIT_SPECIAL_ENV);
        }
    };

    // The tool, from cache or a fresh manual map. The lookup runs inside a
    // closure so every lock is released before any failure path executes
    // late cleanup.
    let looked_up = {
        let mut fs = sb.fs.lock().unwrap();
        let resolved = resolve_executable(&mut fs, &env, &request.exe_path, &request.working_dir);
        match resolved.and_then(|r| fs.lookup(&r, "").ok()) {
            Some(obj) => {
                let mut registry = sb.modules.lock().unwrap();
                sb.tools
                    .lock()
                    .unwrap()
                    .lookup(&mut fs, &mut registry, &SandboxResolver, obj)
                    .map_err(|err| err.to_string())
            }
            None => Err(format!("executable {} not found", request.exe_path)),
        }
    };
    let tool = match looked_up {
        Ok(tool) => tool,
        Err(err) => {
            warn!(err, "tool load failed");
            return finish_failed_init(EXIT_LOADER_FAILURE);
        }
    };

    // Rewind module state and bring the tool's closure back to READY.
    let mspdb_changed = {
        let mut job = sb.job.lock().unwrap();
        let current = env.get("_MSPDBSRV_ENDPOINT_").map(str::to_owned);
        let changed = job.mspdb_endpoint != current;
        job.mspdb_endpoint = current;
        changed
    };
    let init_result = {
        let mut registry = sb.modules.lock().unwrap();
        registry.reset_states_for_job(mspdb_changed);
        registry.restore_bits();
        registry.initialize(tool.exe_module)
    };
    if let Err(err) = init_result {
        warn!(%err, "module init failed");
        return finish_failed_init(EXIT_LOADER_FAILURE);
    }

    // Working directory, with the no-op fast path.
    let chdir_ok = {
        let mut job = sb.job.lock().unwrap();
        if job.working_dir == request.working_dir {
            true
        } else if sys::set_current_dir(&request.working_dir) {
            job.working_dir = request.working_dir.clone();
            true
        } else {
            false
        }
    };
    if !chdir_ok {
        warn!(dir = request.working_dir, "chdir failed");
        return finish_failed_init(EXIT_LOADER_FAILURE);
    }

    let command_line = build_command_line(&argv, request.watcom_quoting);
    sb.history.lock().unwrap().push(&command_line);

    // Publish the per-job state the shims consult.
    {
        let mut job = sb.job.lock().unwrap();
        job.tool = Some(Arc::clone(&tool));
        job.pch_caching = !request.no_pch_caching;
        job.helper_thread_spawned = false;
        job.command_line_wide = crate::win32::wide(&command_line);
        let mut ansi = command_line.clone().into_bytes();
        ansi.push(0);
        job.command_line_ansi = ansi;
        job.running = true;
    }
    *sb.env.lock().unwrap() = env;
    sb.output.lock().unwrap().reset_for_job();

    let entry = EntryPoint::Image(tool.entry_point);
    let reply = run_entry_and_cleanup(&tool, &command_line, entry);
    debug!(
        exe = tool.path,
        exit_code = reply.exit_code,
        exiting = reply.exiting,
        "job finished"
    );
    reply
}

/// Drive a [`EntryPoint::Builtin`] through the full job machinery; the
/// `--full-test` path and the lifecycle tests live on this.
pub fn run_builtin_job(tool: &Arc<Tool>, command_line: &str, body: fn() -> i32) -> JobReply {
    let sb = sandbox();
    Stats::bump(&sb.stats.jobs_run);
    sb.history.lock().unwrap().push(command_line);
    {
        let mut job = sb.job.lock().unwrap();
        job.tool = Some(Arc::clone(tool));
        job.pch_caching = true;
        job.helper_thread_spawned = false;
        job.command_line_wide = crate::win32::wide(command_line);
        let mut ansi = command_line.as_bytes().to_vec();
        ansi.push(0);
        job.command_line_ansi = ansi;
        job.running = true;
    }
    sb.output.lock().unwrap().reset_for_job();
    run_entry_and_cleanup(tool, command_line, EntryPoint::Builtin(body))
}

fn run_entry_and_cleanup(tool: &Arc<Tool>, command_line: &str, entry: EntryPoint) -> JobReply {
    let sb = sandbox();

    // PEB swap and TIB snapshot, restored on every exit path.
    let cmdline_guard = CommandLineGuard::swap_in(command_line);
    let tib_guard = sys::TibGuard::save();

    let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| invoke(entry))) {
        Ok(code) => Outcome::Returned(code as u32),
        Err(payload) => match payload.downcast_ref::<SandboxExit>() {
            Some(exit) => Outcome::Exited(exit.code),
            None => Outcome::Faulted,
        },
    };

    // The CRT would have drained atexit registrations on the way out; a
    // faulted tool gets no destructors, same as a real crash.
    if outcome != Outcome::Faulted {
        sb.atexit.run_and_clear();
    }

    // Essential cleanup: what must be true before the reply goes out.
    drop(tib_guard);
    drop(cmdline_guard);
    let exit_code = match outcome {
        Outcome::Returned(code) | Outcome::Exited(code) => code,
        Outcome::Faulted => {
            sb.history.lock().unwrap().dump();
            sb.request_restart();
            Stats::bump(&sb.stats.restarts_scheduled);
            EXIT_EXCEPTION
        }
    };
    {
        let suppress = tool.hint.is_cl() && exit_code == 0;
        sb.output.lock().unwrap().final_flush(suppress);
    }
    sb.job.lock().unwrap().running = false;

    late_cleanup();

    // Restart policy: a worker that has grown fat asks to be replaced.
    let budget = query_process_budget();
    if budget.working_set > sb.memory_limit || budget.handle_count > HANDLE_COUNT_LIMIT {
        info!(
            working_set = budget.working_set,
            handles = budget.handle_count,
            "budget exceeded; scheduling restart"
        );
        sb.request_restart();
        Stats::bump(&sb.stats.restarts_scheduled);
    }

    JobReply {
        exit_code,
        exiting: sb.restart_requested(),
    }
}

fn finish_failed_init(code: u32) -> JobReply {
    let sb = sandbox();
    late_cleanup();
    JobReply {
        exit_code: code,
        exiting: sb.restart_requested(),
    }
}

/// Reclaim everything the job leaked. Runs after the reply in the serve
/// loop; state must be pristine before the next submission.
pub fn late_cleanup() {
    let sb = sandbox();

    let reaped = sb.handles.reap_leaked();
    if !reaped.is_empty() {
        Stats::add(&sb.stats.handles_leaked, reaped.len() as u64);
    }
    for entry in reaped {
        match entry.data {
            HandleData::TempFile(tf) => {
                let mut tf = tf.lock().unwrap();
                tf.active_handles = tf.active_handles.saturating_sub(1);
            }
            HandleData::TempMapping(tf) => tf.lock().unwrap().unmap(),
            _ => {}
        }
    }
    Stats::max(
        &sb.stats.handle_high_water,
        *sb.handles.high_water.lock().unwrap() as u64,
    );
    sb.views.lock().unwrap().clear();
    sb.temp.lock().unwrap().reset_for_next_job();
    sb.hash.lock().unwrap().reset_for_next_job();
    sb.valloc.reclaim();
    sb.heaps.reclaim();
    sb.fls.reclaim();
    sb.tls.reclaim();
    {
        let mut job = sb.job.lock().unwrap();
        job.tool = None;
        job.command_line_ansi.clear();
        job.command_line_wide.clear();
    }
    {
        let registry = sb.modules.lock().unwrap();
        Stats::max(&sb.stats.modules_reset, registry.modules_reset);
    }
    sb.rewind_handles();
}

fn expand_env_tokens(
    env: &mut Environment,
    request: &JobRequest,
) -> Result<(), crate::environment::SpecialEnvError> {
    if request.special_env_name.is_empty() {
        return Ok(());
    }
    let Some(raw) = env.get(&request.special_env_name).map(str::to_owned) else {
        return Ok(());
    };
    let expanded = expand_special(&raw)?;
    env.set(&request.special_env_name, &expanded);
    Ok(())
}

fn expand_argv(argv: &[JobArg]) -> Result<Vec<String>, crate::environment::SpecialEnvError> {
    argv.iter()
        .map(|arg| {
            if arg.flags & JobArg::EXPAND != 0 {
                expand_special(&arg.value)
            } else {
                Ok(arg.value.clone())
            }
        })
        .collect()
}

fn invoke(entry: EntryPoint) -> i32 {
    match entry {
        EntryPoint::Image(address) => sys::call_image_entry(address),
        EntryPoint::Builtin(f) => f(),
    }
}

#[cfg(windows)]
mod sys {
    pub fn set_current_dir(dir: &str) -> bool {
        std::env::set_current_dir(dir).is_ok()
    }

    pub fn call_image_entry(address: usize) -> i32 {
        // The executable's CRT startup takes no arguments; it re-reads the
        // (swapped) PEB command line.
        type EntryFn = unsafe extern "system" fn() -> i32;
        // SAFETY: address is the entry point of a fully initialized,
        // manually mapped executable image.
        unsafe {
            let f: EntryFn = std::mem::transmute(address);
            f()
        }
    }

    /// Snapshot of the exception registration chain. Tools that fault can
    /// leave dangling frames behind; restoring the head contains them.
    #[derive(Debug)]
    pub struct TibGuard {
        #[cfg(target_arch = "x86")]
        head: usize,
    }

    impl TibGuard {
        pub fn save() -> Self {
            #[cfg(target_arch = "x86")]
            {
                let head: usize;
                // SAFETY: fs:[0] is the SEH chain head on x86.
                unsafe {
                    std::arch::asm!("mov {}, fs:[0]", out(reg) head, options(nostack, readonly));
                }
                return TibGuard { head };
            }
            #[cfg(not(target_arch = "x86"))]
            TibGuard {}
        }
    }

    impl Drop for TibGuard {
        fn drop(&mut self) {
            #[cfg(target_arch = "x86")]
            // SAFETY: restores the snapshot taken in save().
            unsafe {
                std::arch::asm!("mov fs:[0], {}", in(reg) self.head, options(nostack));
            }
        }
    }
}

#[cfg(not(windows))]
mod sys {
    pub fn set_current_dir(_dir: &str) -> bool {
        // Job directories are Windows paths; the host-neutral build records
        // them without touching the host cwd.
        true
    }

    pub fn call_image_entry(_address: usize) -> i32 {
        // Mapped images are data on this host; nothing to call.
        0
    }

    #[derive(Debug)]
    pub struct TibGuard {}

    impl TibGuard {
        pub fn save() -> Self {
            TibGuard {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::output::{OutputSink, StdStream};
    use crate::sandbox::test_job_guard as job_guard;
    use crate::win32::file;

    #[derive(Debug, Default)]
    struct Captured {
        console: String,
        out: Vec<u8>,
    }

    static CAPTURE: Mutex<Option<Captured>> = Mutex::new(None);

    #[derive(Debug)]
    struct TestSink;

    impl OutputSink for TestSink {
        fn write_console(&mut self, text: &[u16]) {
            if let Some(c) = CAPTURE.lock().unwrap().as_mut() {
                c.console.push_str(&String::from_utf16_lossy(text));
            }
        }

        fn write_file(&mut self, stream: StdStream, bytes: &[u8]) {
            if let Some(c) = CAPTURE.lock().unwrap().as_mut()
                && stream == StdStream::Out
            {
                c.out.extend_from_slice(bytes);
            }
        }
    }

    fn capture_output() {
        *CAPTURE.lock().unwrap() = Some(Captured::default());
        let _old = sandbox().output.lock().unwrap().set_sink(Box::new(TestSink));
    }

    fn captured() -> Captured {
        CAPTURE.lock().unwrap().take().unwrap()
    }

    fn fake_tool(dir: &std::path::Path, name: &str) -> Arc<Tool> {
        let sb = sandbox();
        let exe = crate::pe::testpe::Builder::new().build();
        let exe_path = dir.join(name);
        std::fs::write(&exe_path, exe).unwrap();
        let win_path = exe_path.display().to_string().replace('/', "\\");
        let mut fs = sb.fs.lock().unwrap();
        let obj = fs.lookup(&win_path, "").unwrap();
        let mut registry = sb.modules.lock().unwrap();
        sb.tools
            .lock()
            .unwrap()
            .lookup(&mut fs, &mut registry, &crate::modules::NoReplacements, obj)
            .unwrap()
    }

    fn hello_then_exit_seven() -> i32 {
        let sb = sandbox();
        let msg = b"hello\n";
        // SAFETY: shim driven with valid pointers.
        unsafe {
            let mut written = 0u32;
            crate::replace::api::kw_write_file(
                sb.std_out.0,
                msg.as_ptr(),
                msg.len() as u32,
                &mut written,
                std::ptr::null_mut(),
            );
            crate::replace::api::kw_crt_exit(7)
        }
    }

    #[test]
    fn exit_via_unwind_reports_code_and_output() {
        let _guard = job_guard();
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(dir.path(), "tool.exe");
        sandbox().clear_restart();
        capture_output();
        let reply = run_builtin_job(&tool, "tool.exe job", hello_then_exit_seven);
        assert_eq!(reply.exit_code, 7);
        assert!(!reply.exiting);
        let cap = captured();
        assert!(cap.console.contains("hello\n") || cap.out.ends_with(b"hello\n"));
    }

    fn faulting_body() -> i32 {
        panic!("simulated access violation");
    }

    #[test]
    fn fault_reports_512_and_schedules_restart() {
        let _guard = job_guard();
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(dir.path(), "tool.exe");
        sandbox().clear_restart();
        capture_output();
        let reply = run_builtin_job(&tool, "tool.exe crash", faulting_body);
        let _ = captured();
        assert_eq!(reply.exit_code, EXIT_EXCEPTION);
        assert!(reply.exiting);
        assert!(sandbox().restart_requested());
        sandbox().clear_restart();
    }

    fn echo_filename_body() -> i32 {
        let sb = sandbox();
        let msg = b"foo.c\r\n";
        // SAFETY: shim driven with valid pointers.
        unsafe {
            let mut written = 0u32;
            crate::replace::api::kw_write_file(
                sb.std_out.0,
                msg.as_ptr(),
                msg.len() as u32,
                &mut written,
                std::ptr::null_mut(),
            );
        }
        0
    }

    #[test]
    fn cl_echo_suppressed_at_job_end() {
        let _guard = job_guard();
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(dir.path(), "cl.exe");
        assert!(tool.hint.is_cl());
        capture_output();
        let reply = run_builtin_job(&tool, "cl.exe /c foo.c", echo_filename_body);
        assert_eq!(reply.exit_code, 0);
        let cap = captured();
        assert!(cap.console.is_empty());
        assert!(cap.out.is_empty());
    }

    fn leaky_body() -> i32 {
        let sb = sandbox();
        // Leak a temp file handle, a virtual allocation and an FLS index.
        let path = crate::win32::wide(r"C:\T\_CL_12345678qq");
        // SAFETY: shim driven with valid pointers.
        unsafe {
            let h = crate::replace::api::kw_create_file_w(
                path.as_ptr(),
                file::GENERIC_WRITE,
                0,
                std::ptr::null_mut(),
                file::CREATE_ALWAYS,
                0,
                0,
            );
            assert_ne!(h, usize::MAX);
            crate::replace::api::kw_virtual_alloc(
                std::ptr::null_mut(),
                8192,
                crate::win32::mem::MEM_COMMIT,
                crate::win32::mem::PAGE_READWRITE,
            );
            crate::replace::api::kw_fls_alloc(std::ptr::null_mut());
        }
        let _ = sb;
        0
    }

    #[test]
    fn leaked_resources_are_reclaimed_between_jobs() {
        let _guard = job_guard();
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(dir.path(), "cl.exe");
        capture_output();
        let before = sandbox()
            .stats
            .handles_leaked
            .load(Ordering::Relaxed);
        let reply = run_builtin_job(&tool, "cl.exe leaky", leaky_body);
        let _ = captured();
        assert_eq!(reply.exit_code, 0);
        let sb = sandbox();
        assert!(sb.stats.handles_leaked.load(Ordering::Relaxed) > before);
        // Only the fixed stdio entries survive late cleanup.
        assert_eq!(sb.handles.live_count(), 2);
        assert!(!sb.fls.is_tracked(1));
    }

    static RUN_COUNT: AtomicU64 = AtomicU64::new(0);

    fn counting_body() -> i32 {
        RUN_COUNT.fetch_add(1, Ordering::SeqCst);
        0
    }

    #[test]
    fn identical_jobs_twice_give_identical_replies() {
        let _guard = job_guard();
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(dir.path(), "tool.exe");
        capture_output();
        let a = run_builtin_job(&tool, "tool.exe again", counting_body);
        let _ = captured();
        capture_output();
        let b = run_builtin_job(&tool, "tool.exe again", counting_body);
        let _ = captured();
        assert_eq!(a.exit_code, b.exit_code);
        assert!(RUN_COUNT.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn full_run_job_with_missing_exe_fails_cleanly() {
        let _guard = job_guard();
        let request = JobRequest {
            exe_path: r"Z:\missing\cl.exe".to_owned(),
            working_dir: r"Z:\build".to_owned(),
            argv: vec![JobArg::plain("cl.exe")],
            env: vec![],
            watcom_quoting: false,
            no_pch_caching: false,
            special_env_name: String::new(),
            post_cmd_argv: vec![],
        };
        let reply = run_job(&request);
        assert_eq!(reply.exit_code, EXIT_LOADER_FAILURE);
    }

    #[test]
    fn bad_special_env_token_fails_the_job() {
        let _guard = job_guard();
        let request = JobRequest {
            exe_path: r"Z:\missing\cl.exe".to_owned(),
            working_dir: r"Z:\build".to_owned(),
            argv: vec![JobArg::plain("cl.exe")],
            env: vec!["KMK_ENV=@@BOGUS@@".to_owned()],
            watcom_quoting: false,
            no_pch_caching: false,
            special_env_name: "KMK_ENV".to_owned(),
            post_cmd_argv: vec![],
        };
        let reply = run_job(&request);
        assert_eq!(reply.exit_code, EXIT_SPECIAL_ENV);
    }
}
