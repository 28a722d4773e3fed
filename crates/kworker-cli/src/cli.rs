//! Command-line surface of the worker process.
//!
//! One worker serves one driver for its whole life, so the CLI is a single
//! command: wire up logging, priority and processor-group affinity, install
//! the console control handler, then hand the pipe to the serve loop.
//!
//! Exit codes: 0 normal shutdown, 1 I/O error, 2 argument error (clap,
//! including a nonexistent `--group`), 3 setup failure, 9 cancelled by
//! Ctrl-C, 10 cancelled by Ctrl-Break, 11 forced exit after the
//! cancellation grace period.

use std::io::IsTerminal as _;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::CommandFactory as _;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use kworker::sandbox::{self, SandboxConfig};
use kworker::worker::{self, WorkerExit};

pub const EXIT_OK: i32 = 0;
pub const EXIT_IO: i32 = 1;
pub const EXIT_SETUP: i32 = 3;
pub const EXIT_CTRL_C: i32 = 9;
pub const EXIT_CTRL_BREAK: i32 = 10;
pub const EXIT_FORCED: i32 = 11;

const CANCEL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, clap::Parser)]
#[command(
    name = "kworker",
    version,
    about = "Compiler-reuse worker: runs build tools in-process for a build driver"
)]
pub struct Cli {
    /// Inherited duplex pipe handle (hex) connecting to the driver. Serves
    /// stdio when omitted.
    #[clap(long, value_parser = parse_handle_hex)]
    pipe: Option<usize>,

    /// Volatile directory tree; cache entries below it are revalidated
    /// every job. Repeatable.
    #[clap(long)]
    volatile: Vec<String>,

    /// Process priority: 1 idle .. 5 high.
    #[clap(long, value_parser = clap::value_parser!(u8).range(1..=5))]
    priority: Option<u8>,

    /// Bind the worker to this processor group.
    #[clap(long)]
    group: Option<u16>,

    /// More logging; repeat for more detail.
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Run the built-in smoke checks and exit.
    #[clap(long)]
    test: bool,

    /// Run the smoke checks plus a full sandbox exercise and exit.
    #[clap(long)]
    full_test: bool,
}

fn parse_handle_hex(s: &str) -> Result<usize, String> {
    let trimmed = s.trim_start_matches("0x").trim_start_matches("0X");
    usize::from_str_radix(trimmed, 16).map_err(|e| format!("not a hex handle: {e}"))
}

impl Cli {
    pub fn run(self) -> i32 {
        setup_logger(self.verbose);

        // A nonexistent processor group is an argument error, same as an
        // out-of-range --priority; clap's range parser cannot know the
        // machine topology, so the check lives here.
        if let Some(group) = self.group
            && let Err(why) = sys::validate_processor_group(group)
        {
            Cli::command()
                .error(
                    clap::error::ErrorKind::ValueValidation,
                    format!("--group {group}: {why}"),
                )
                .exit();
        }

        if self.test || self.full_test {
            return if kworker::selftest::run(self.full_test) {
                EXIT_OK
            } else {
                EXIT_SETUP
            };
        }

        match self.serve() {
            Ok(code) => code,
            Err(err) => {
                eprintln!("kworker: {err:#}");
                EXIT_SETUP
            }
        }
    }

    fn serve(self) -> anyhow::Result<i32> {
        sys::note_main_thread();
        if let Some(priority) = self.priority {
            sys::set_priority(priority).context("Setting process priority")?;
        }
        if let Some(group) = self.group {
            sys::set_processor_group(group).context("Binding processor group")?;
        }

        let memory_limit = memory_limit_from_env().context("Parsing KWORKER_MEMORY_LIMIT")?;
        let print_stats = std::env::var_os("KWORKER_STATS").is_some();

        let sb = sandbox::init(SandboxConfig {
            volatile_roots: self.volatile.clone(),
            memory_limit,
            stdout_is_console: std::io::stdout().is_terminal(),
            stderr_is_console: std::io::stderr().is_terminal(),
            output_sink: None,
        });
        install_cancel_handler().context("Installing console control handler")?;

        info!(
            pipe = ?self.pipe,
            volatile = self.volatile.len(),
            memory_limit = sb.memory_limit,
            "worker ready"
        );

        let exit = match self.pipe {
            Some(handle) => {
                let (mut reader, mut writer) =
                    sys::pipe_from_handle(handle).context("Opening driver pipe")?;
                worker::serve(&mut reader, &mut writer, print_stats)
            }
            None => {
                let mut reader = std::io::stdin().lock();
                let mut writer = std::io::stdout().lock();
                worker::serve(&mut reader, &mut writer, print_stats)
            }
        };

        if print_stats {
            sb.stats.print();
        }
        match exit {
            Ok(WorkerExit::CleanShutdown | WorkerExit::Restarting) => Ok(EXIT_OK),
            Ok(WorkerExit::Cancelled(code)) => Ok(code as i32),
            Err(err) => {
                warn!(%err, "driver pipe error");
                Ok(EXIT_IO)
            }
        }
    }
}

fn setup_logger(verbose: u8) {
    let default_level = match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// `KWORKER_MEMORY_LIMIT` with an optional K/M/G suffix.
fn memory_limit_from_env() -> anyhow::Result<Option<u64>> {
    let Some(raw) = std::env::var_os("KWORKER_MEMORY_LIMIT") else {
        return Ok(None);
    };
    let raw = raw.to_string_lossy();
    Ok(Some(parse_size(raw.trim())?))
}

fn parse_size(s: &str) -> anyhow::Result<u64> {
    if s.is_empty() {
        bail!("empty size");
    }
    let (digits, multiplier) = match s.as_bytes().last().map(u8::to_ascii_uppercase) {
        Some(b'K') => (&s[..s.len() - 1], 1024u64),
        Some(b'M') => (&s[..s.len() - 1], 1024 * 1024),
        Some(b'G') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    let value: u64 = digits.trim().parse().context("not a number")?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| anyhow::anyhow!("size overflows"))
}

static CANCEL_COUNT: AtomicU32 = AtomicU32::new(0);

/// Install the console control handler. Ctrl-C carries exit code 9,
/// Ctrl-Break 10; the platform glue lives in `sys`.
fn install_cancel_handler() -> anyhow::Result<()> {
    sys::install_cancel_handler()
}

/// First control event: ask the serve loop to stop between jobs and start
/// the grace timer. Second: leave immediately with the event's code.
fn handle_cancel(code: i32) {
    let n = CANCEL_COUNT.fetch_add(1, Ordering::SeqCst);
    if n == 0 {
        eprintln!("kworker: cancellation requested; finishing the current job");
        worker::request_cancel(code as u32);
        sys::cancel_pipe_io();
        std::thread::spawn(|| {
            std::thread::sleep(CANCEL_GRACE);
            eprintln!("kworker: grace period expired; forcing exit");
            std::process::exit(EXIT_FORCED);
        });
    } else {
        std::process::exit(code);
    }
}

#[cfg(windows)]
mod sys {
    use std::fs::File;
    use std::os::windows::io::FromRawHandle;

    use anyhow::{bail, Context};

    pub fn pipe_from_handle(handle: usize) -> anyhow::Result<(File, File)> {
        if handle == 0 {
            bail!("pipe handle is null");
        }
        // SAFETY: the driver inherited this handle to us; we own it now.
        let reader = unsafe { File::from_raw_handle(handle as *mut _) };
        let writer = reader.try_clone().context("Duplicating pipe handle")?;
        Ok((reader, writer))
    }

    pub fn set_priority(priority: u8) -> anyhow::Result<()> {
        use windows_sys::Win32::System::Threading::{
            GetCurrentProcess, SetPriorityClass, ABOVE_NORMAL_PRIORITY_CLASS,
            BELOW_NORMAL_PRIORITY_CLASS, HIGH_PRIORITY_CLASS, IDLE_PRIORITY_CLASS,
            NORMAL_PRIORITY_CLASS,
        };
        let class = match priority {
            1 => IDLE_PRIORITY_CLASS,
            2 => BELOW_NORMAL_PRIORITY_CLASS,
            3 => NORMAL_PRIORITY_CLASS,
            4 => ABOVE_NORMAL_PRIORITY_CLASS,
            _ => HIGH_PRIORITY_CLASS,
        };
        // SAFETY: plain priority call on our own process.
        if unsafe { SetPriorityClass(GetCurrentProcess(), class) } == 0 {
            bail!("SetPriorityClass failed");
        }
        Ok(())
    }

    /// Does `group` name a processor group that actually exists? Checked
    /// up front so a bad value is an argument error, not a setup failure.
    pub fn validate_processor_group(group: u16) -> Result<(), String> {
        use windows_sys::Win32::System::SystemInformation::GetActiveProcessorCount;
        // SAFETY: plain count query.
        if unsafe { GetActiveProcessorCount(group) } == 0 {
            Err("no such processor group".to_owned())
        } else {
            Ok(())
        }
    }

    /// Bind the worker thread to `group` using the group's active affinity
    /// mask.
    pub fn set_processor_group(group: u16) -> anyhow::Result<()> {
        use windows_sys::Win32::System::Kernel::GROUP_AFFINITY;
        use windows_sys::Win32::System::SystemInformation::GetActiveProcessorCount;
        use windows_sys::Win32::System::Threading::{GetCurrentThread, SetThreadGroupAffinity};
        // SAFETY: count query plus affinity set on our own thread.
        unsafe {
            let count = GetActiveProcessorCount(group);
            let mask: usize = if count as usize >= usize::BITS as usize {
                usize::MAX
            } else {
                (1usize << count) - 1
            };
            let affinity = GROUP_AFFINITY {
                Mask: mask,
                Group: group,
                Reserved: [0; 3],
            };
            if SetThreadGroupAffinity(GetCurrentThread(), &affinity, std::ptr::null_mut()) == 0 {
                bail!("SetThreadGroupAffinity failed");
            }
        }
        Ok(())
    }

    /// Console control events, with Ctrl-Break kept distinct from Ctrl-C.
    pub fn install_cancel_handler() -> anyhow::Result<()> {
        use windows_sys::Win32::System::Console::{SetConsoleCtrlHandler, CTRL_BREAK_EVENT};

        unsafe extern "system" fn console_ctrl(ctrl_type: u32) -> i32 {
            let code = if ctrl_type == CTRL_BREAK_EVENT {
                super::EXIT_CTRL_BREAK
            } else {
                super::EXIT_CTRL_C
            };
            super::handle_cancel(code);
            1 // handled; the process leaves on its own schedule
        }

        // SAFETY: installs a process-wide handler once at startup.
        if unsafe { SetConsoleCtrlHandler(Some(console_ctrl), 1) } == 0 {
            bail!("SetConsoleCtrlHandler failed");
        }
        Ok(())
    }

    /// Wake a blocked pipe read so the serve loop notices the cancel flag.
    pub fn cancel_pipe_io() {
        use windows_sys::Win32::Foundation::CloseHandle;
        use windows_sys::Win32::System::IO::CancelSynchronousIo;
        use windows_sys::Win32::System::Threading::{OpenThread, THREAD_TERMINATE};
        // SAFETY: cancels our own main thread's blocking read; failure is
        // benign (the loop exits after the in-flight job instead).
        unsafe {
            let thread = OpenThread(THREAD_TERMINATE, 0, main_thread_id());
            if !thread.is_null() {
                CancelSynchronousIo(thread);
                CloseHandle(thread);
            }
        }
    }

    use std::sync::OnceLock;
    static MAIN_THREAD: OnceLock<u32> = OnceLock::new();

    pub fn note_main_thread() {
        use windows_sys::Win32::System::Threading::GetCurrentThreadId;
        // SAFETY: plain id query.
        let _ = MAIN_THREAD.set(unsafe { GetCurrentThreadId() });
    }

    fn main_thread_id() -> u32 {
        use windows_sys::Win32::System::Threading::GetCurrentThreadId;
        // SAFETY: plain id query.
        *MAIN_THREAD.get_or_init(|| unsafe { GetCurrentThreadId() })
    }
}

#[cfg(not(windows))]
mod sys {
    use std::fs::File;

    use anyhow::{bail, Context as _};

    pub fn pipe_from_handle(_handle: usize) -> anyhow::Result<(File, File)> {
        bail!("--pipe takes an inherited Windows handle; use stdio mode here")
    }

    pub fn set_priority(_priority: u8) -> anyhow::Result<()> {
        Ok(())
    }

    pub fn validate_processor_group(group: u16) -> Result<(), String> {
        if group != 0 {
            return Err("no such processor group on this host".to_owned());
        }
        Ok(())
    }

    pub fn set_processor_group(_group: u16) -> anyhow::Result<()> {
        Ok(())
    }

    /// Only Ctrl-C exists here; Ctrl-Break is a Windows console notion.
    pub fn install_cancel_handler() -> anyhow::Result<()> {
        ctrlc::set_handler(|| super::handle_cancel(super::EXIT_CTRL_C))
            .context("ctrlc handler")
    }

    pub fn cancel_pipe_io() {}

    pub fn note_main_thread() {}
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn parses_the_documented_flags() {
        let cli = Cli::parse_from([
            "kworker",
            "--pipe",
            "0x1a4",
            "--volatile",
            r"C:\Temp",
            "--volatile",
            r"D:\obj",
            "--priority",
            "2",
            "--group",
            "1",
            "-vv",
        ]);
        assert_eq!(cli.pipe, Some(0x1A4));
        assert_eq!(cli.volatile.len(), 2);
        assert_eq!(cli.priority, Some(2));
        assert_eq!(cli.group, Some(1));
        assert_eq!(cli.verbose, 2);
        assert!(!cli.test && !cli.full_test);
    }

    #[test]
    fn rejects_out_of_range_priority() {
        assert!(Cli::try_parse_from(["kworker", "--priority", "6"]).is_err());
        assert!(Cli::try_parse_from(["kworker", "--priority", "0"]).is_err());
    }

    #[test]
    fn size_suffixes() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("64K").unwrap(), 64 * 1024);
        assert_eq!(parse_size("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_size("2G").unwrap(), 2 * 1024 * 1024 * 1024);
        assert!(parse_size("x").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn handle_hex_parsing() {
        assert_eq!(parse_handle_hex("1a4").unwrap(), 0x1A4);
        assert_eq!(parse_handle_hex("0x1A4").unwrap(), 0x1A4);
        assert!(parse_handle_hex("zz").is_err());
    }

    #[test]
    fn exit_code_contract() {
        // The driver keys off these values; they are wire contract, not
        // implementation detail.
        assert_eq!(EXIT_OK, 0);
        assert_eq!(EXIT_IO, 1);
        assert_eq!(EXIT_SETUP, 3);
        assert_eq!(EXIT_CTRL_C, 9);
        assert_eq!(EXIT_CTRL_BREAK, 10);
        assert_eq!(EXIT_FORCED, 11);
    }

    #[test]
    fn nonexistent_group_is_rejected_before_serving() {
        // Group 0 exists on every host; group 1000 exists on none. (0xFFFF
        // is ALL_PROCESSOR_GROUPS and must not be used as the bad probe.)
        assert!(sys::validate_processor_group(0).is_ok());
        assert!(sys::validate_processor_group(1000).is_err());
    }
}
