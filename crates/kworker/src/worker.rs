//! The serve loop: read framed submissions off the driver pipe, run them,
//! reply, repeat — until EOF, a scheduled restart, or Ctrl-C.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{debug, info};

use crate::protocol::{read_message, Message, ProtocolError};
use crate::sandbox::{job, sandbox};

/// Set by the console control handler: 9 for Ctrl-C, 10 for Ctrl-Break.
/// Checked between jobs; an in-flight job is never interrupted.
static CANCEL_CODE: AtomicU32 = AtomicU32::new(0);

pub fn request_cancel(code: u32) {
    CANCEL_CODE.store(code, Ordering::SeqCst);
}

pub fn cancel_code() -> u32 {
    CANCEL_CODE.load(Ordering::SeqCst)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Driver closed the pipe; normal end of build.
    CleanShutdown,
    /// This worker asked to be replaced (budget or crash policy).
    Restarting,
    /// Cancelled by console control; carries the process exit code.
    Cancelled(u32),
}

/// Serve submissions until the stream ends. `print_stats` mirrors the
/// `KWORKER_STATS` environment toggle.
pub fn serve(
    reader: &mut impl Read,
    writer: &mut impl Write,
    print_stats: bool,
) -> Result<WorkerExit, ProtocolError> {
    loop {
        let cancel = cancel_code();
        if cancel != 0 {
            info!(code = cancel, "cancelled; leaving the serve loop");
            return Ok(WorkerExit::Cancelled(cancel));
        }
        let message = match read_message(reader) {
            Ok(m) => m,
            Err(ProtocolError::Eof) => {
                debug!("driver closed the pipe");
                return Ok(WorkerExit::CleanShutdown);
            }
            Err(err) => return Err(err),
        };
        match message {
            Message::Job(request) => {
                if !request.post_cmd_argv.is_empty() {
                    // Builtin post commands (kDepObj and friends) dispatch
                    // through the driver-side table, not here.
                    debug!(cmd = request.post_cmd_argv[0], "post command requested");
                }
                let mut reply = job::run_job(&request);
                if cancel_code() != 0 {
                    reply.exiting = true;
                }
                reply.write_to(writer)?;
                writer.flush()?;
                if print_stats {
                    sandbox().stats.print();
                }
                if reply.exiting {
                    info!("exiting flag set; worker will be replaced");
                    return Ok(WorkerExit::Restarting);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;
    use crate::protocol::{encode_job, JobArg, JobRequest};
    use crate::sandbox::test_job_guard;

    fn missing_exe_job() -> JobRequest {
        JobRequest {
            exe_path: r"Z:\nowhere\cl.exe".to_owned(),
            working_dir: r"Z:\build".to_owned(),
            argv: vec![JobArg::plain("cl.exe")],
            env: vec![],
            watcom_quoting: false,
            no_pch_caching: false,
            special_env_name: String::new(),
            post_cmd_argv: vec![],
        }
    }

    #[test]
    fn serves_jobs_until_eof() {
        let _guard = test_job_guard();
        sandbox().clear_restart();
        let mut input = Vec::new();
        input.extend_from_slice(&encode_job(&missing_exe_job()));
        input.extend_from_slice(&encode_job(&missing_exe_job()));

        let mut replies = Vec::new();
        let exit = serve(&mut input.as_slice(), &mut replies, false).unwrap();
        assert_eq!(exit, WorkerExit::CleanShutdown);
        assert_eq!(replies.len(), 2 * crate::protocol::JobReply::ENCODED_LEN);
        // Both replies carry the loader-failure code.
        let code = u32::from_le_bytes(replies[0..4].try_into().unwrap());
        assert_eq!(code, job::EXIT_LOADER_FAILURE);
        let code2 = u32::from_le_bytes(replies[8..12].try_into().unwrap());
        assert_eq!(code2, job::EXIT_LOADER_FAILURE);
    }

    #[test]
    fn serve_over_a_real_pipe() {
        let _guard = test_job_guard();
        sandbox().clear_restart();
        let (mut rx, mut tx) = os_pipe::pipe().unwrap();
        let writer = std::thread::spawn(move || {
            tx.write_all(&encode_job(&missing_exe_job())).unwrap();
            drop(tx);
        });
        let mut replies = Vec::new();
        let exit = serve(&mut rx, &mut replies, false).unwrap();
        writer.join().unwrap();
        assert_eq!(exit, WorkerExit::CleanShutdown);
        assert_eq!(replies.len(), crate::protocol::JobReply::ENCODED_LEN);
    }

    #[test]
    fn cancel_wins_over_pending_input() {
        let _guard = test_job_guard();
        request_cancel(9);
        let input = encode_job(&missing_exe_job());
        let mut replies = Vec::new();
        let exit = serve(&mut input.as_slice(), &mut replies, false).unwrap();
        assert_eq!(exit, WorkerExit::Cancelled(9));
        assert!(replies.is_empty());
        CANCEL_CODE.store(0, std::sync::atomic::Ordering::SeqCst);
    }

    #[test]
    fn garbage_frame_is_a_protocol_error() {
        let _guard = test_job_guard();
        sandbox().clear_restart();
        let mut input = Vec::new();
        input.extend_from_slice(&9u32.to_le_bytes());
        input.extend_from_slice(b"NOPE\0");
        let mut replies = Vec::new();
        assert!(serve(&mut input.as_slice(), &mut replies, false).is_err());
    }
}
