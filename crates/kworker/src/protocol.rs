//! Framed driver protocol.
//!
//! Every message on the driver pipe starts with a little-endian `u32` length
//! that includes the length field itself, followed by a NUL-terminated command
//! tag and a command-specific body. The worker understands `JOB`; anything
//! else is a protocol error that terminates the serve loop.

use std::io::{self, Read, Write};

use thiserror::Error;

/// Upper bound on a single frame. A job carries argv and an environment
/// block, both of which the driver already holds in memory; anything past
/// this is a corrupt stream.
const MAX_FRAME: u32 = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("driver pipe closed")]
    Eof,
    #[error("frame length {0:#x} out of range")]
    BadFrameLength(u32),
    #[error("missing NUL terminator in {0}")]
    UnterminatedString(&'static str),
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("truncated {0}")]
    Truncated(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One argument of a job: the driver's per-argument expansion flags plus the
/// argument bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobArg {
    pub flags: u8,
    pub value: String,
}

impl JobArg {
    /// Flag bit: expand `@@TOKEN@@` sequences in this argument.
    pub const EXPAND: u8 = 0x01;

    pub fn plain(value: impl Into<String>) -> Self {
        JobArg {
            flags: 0,
            value: value.into(),
        }
    }
}

/// A decoded `JOB` submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub exe_path: String,
    pub working_dir: String,
    pub argv: Vec<JobArg>,
    pub env: Vec<String>,
    /// Apply OpenWatcom argument-quoting rules when building the command line.
    pub watcom_quoting: bool,
    /// Disable PCH read caching for this job.
    pub no_pch_caching: bool,
    /// Name of the environment variable carrying `@@TOKEN@@` sequences the
    /// driver could not resolve; empty means none.
    pub special_env_name: String,
    /// Builtin post command, dispatched by name after the tool exits.
    pub post_cmd_argv: Vec<String>,
}

/// Reply for a finished job: the exit code plus whether this worker wants to
/// be restarted before the next submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobReply {
    pub exit_code: u32,
    pub exiting: bool,
}

impl JobReply {
    pub const ENCODED_LEN: usize = 8;

    pub fn encode(self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[..4].copy_from_slice(&self.exit_code.to_le_bytes());
        out[4] = self.exiting as u8;
        out
    }

    pub fn write_to(self, w: &mut impl Write) -> io::Result<()> {
        w.write_all(&self.encode())
    }
}

/// Commands the worker services.
#[derive(Debug)]
pub enum Message {
    Job(Box<JobRequest>),
}

/// Read one framed message from the driver pipe. Blocks until a full frame
/// arrives; a clean EOF before the first length byte maps to
/// [`ProtocolError::Eof`].
pub fn read_message(r: &mut impl Read) -> Result<Message, ProtocolError> {
    let mut len_buf = [0u8; 4];
    if let Err(err) = r.read_exact(&mut len_buf) {
        return Err(match err.kind() {
            io::ErrorKind::UnexpectedEof => ProtocolError::Eof,
            _ => ProtocolError::Io(err),
        });
    }
    let frame_len = u32::from_le_bytes(len_buf);
    if !(4..=MAX_FRAME).contains(&frame_len) {
        return Err(ProtocolError::BadFrameLength(frame_len));
    }
    let mut body = vec![0u8; frame_len as usize - 4];
    r.read_exact(&mut body)?;
    parse_frame(&body)
}

fn parse_frame(body: &[u8]) -> Result<Message, ProtocolError> {
    let mut cur = Cursor { buf: body, pos: 0 };
    let tag = cur.string("command tag")?;
    match tag.as_str() {
        "JOB" => Ok(Message::Job(Box::new(parse_job(&mut cur)?))),
        _ => Err(ProtocolError::UnknownCommand(tag)),
    }
}

fn parse_job(cur: &mut Cursor<'_>) -> Result<JobRequest, ProtocolError> {
    let exe_path = cur.string("executable path")?;
    let working_dir = cur.string("working directory")?;

    let argc = cur.u32("argc")?;
    let mut argv = Vec::with_capacity(argc as usize);
    for _ in 0..argc {
        let flags = cur.byte("argument flags")?;
        let value = cur.string("argument")?;
        argv.push(JobArg { flags, value });
    }

    let env_count = cur.u32("env count")?;
    let mut env = Vec::with_capacity(env_count as usize);
    for _ in 0..env_count {
        env.push(cur.string("env entry")?);
    }

    let watcom_quoting = cur.byte("watcom flag")? != 0;
    let no_pch_caching = cur.byte("pch flag")? != 0;
    let special_env_name = cur.string("special env name")?;

    let post_cmd_argc = cur.u32("post command argc")?;
    let mut post_cmd_argv = Vec::with_capacity(post_cmd_argc as usize);
    for _ in 0..post_cmd_argc {
        post_cmd_argv.push(cur.string("post command argument")?);
    }

    Ok(JobRequest {
        exe_path,
        working_dir,
        argv,
        env,
        watcom_quoting,
        no_pch_caching,
        special_env_name,
        post_cmd_argv,
    })
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn byte(&mut self, what: &'static str) -> Result<u8, ProtocolError> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or(ProtocolError::Truncated(what))?;
        self.pos += 1;
        Ok(b)
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, ProtocolError> {
        let end = self.pos + 4;
        let bytes = self
            .buf
            .get(self.pos..end)
            .ok_or(ProtocolError::Truncated(what))?;
        self.pos = end;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn string(&mut self, what: &'static str) -> Result<String, ProtocolError> {
        let rest = &self.buf[self.pos.min(self.buf.len())..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(ProtocolError::UnterminatedString(what))?;
        let s = String::from_utf8_lossy(&rest[..nul]).into_owned();
        self.pos += nul + 1;
        Ok(s)
    }
}

/// Frame a `JOB` message the way the driver does. Used by the self-test and
/// the protocol tests; the worker itself only decodes.
pub fn encode_job(job: &JobRequest) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(b"JOB\0");
    put_str(&mut body, &job.exe_path);
    put_str(&mut body, &job.working_dir);
    body.extend_from_slice(&(job.argv.len() as u32).to_le_bytes());
    for arg in &job.argv {
        body.push(arg.flags);
        put_str(&mut body, &arg.value);
    }
    body.extend_from_slice(&(job.env.len() as u32).to_le_bytes());
    for e in &job.env {
        put_str(&mut body, e);
    }
    body.push(job.watcom_quoting as u8);
    body.push(job.no_pch_caching as u8);
    put_str(&mut body, &job.special_env_name);
    body.extend_from_slice(&(job.post_cmd_argv.len() as u32).to_le_bytes());
    for a in &job.post_cmd_argv {
        put_str(&mut body, a);
    }

    let mut frame = Vec::with_capacity(body.len() + 4);
    frame.extend_from_slice(&(body.len() as u32 + 4).to_le_bytes());
    frame.extend_from_slice(&body);
    frame
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    fn sample_job() -> JobRequest {
        JobRequest {
            exe_path: r"C:\vc\bin\cl.exe".to_owned(),
            working_dir: r"C:\build".to_owned(),
            argv: vec![JobArg::plain("cl.exe"), JobArg::plain("/c"), JobArg {
                flags: JobArg::EXPAND,
                value: "main.c".to_owned(),
            }],
            env: vec!["PATH=C:\\vc\\bin".to_owned(), "INCLUDE=C:\\vc\\inc".to_owned()],
            watcom_quoting: false,
            no_pch_caching: true,
            special_env_name: "KMK_ENV".to_owned(),
            post_cmd_argv: vec!["kDepObj".to_owned(), "-o".to_owned()],
        }
    }

    #[test]
    fn job_round_trip() {
        let job = sample_job();
        let frame = encode_job(&job);
        let Message::Job(decoded) = read_message(&mut frame.as_slice()).unwrap();
        assert_eq!(*decoded, job);
    }

    #[test]
    fn job_round_trip_over_pipe() {
        let (mut rx, mut tx) = os_pipe::pipe().unwrap();
        let job = sample_job();
        let frame = encode_job(&job);
        let writer = std::thread::spawn(move || tx.write_all(&frame).unwrap());
        let Message::Job(decoded) = read_message(&mut rx).unwrap();
        writer.join().unwrap();
        assert_eq!(*decoded, job);
    }

    #[test]
    fn eof_before_frame_is_clean_shutdown() {
        let empty: &[u8] = &[];
        assert!(matches!(
            read_message(&mut &*empty),
            Err(ProtocolError::Eof)
        ));
    }

    #[test]
    fn bad_length_rejected() {
        let frame = 2u32.to_le_bytes();
        assert!(matches!(
            read_message(&mut frame.as_slice()),
            Err(ProtocolError::BadFrameLength(2))
        ));
    }

    #[test]
    fn unknown_command_rejected() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&9u32.to_le_bytes());
        frame.extend_from_slice(b"PING\0");
        assert!(matches!(
            read_message(&mut frame.as_slice()),
            Err(ProtocolError::UnknownCommand(cmd)) if cmd == "PING"
        ));
    }

    #[test]
    fn reply_layout() {
        let reply = JobReply {
            exit_code: 7,
            exiting: true,
        };
        assert_eq!(reply.encode(), [7, 0, 0, 0, 1, 0, 0, 0]);
    }
}
