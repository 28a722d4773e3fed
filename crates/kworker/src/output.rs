//! Buffered stdout/stderr for the sandboxed tool.
//!
//! Console output is line buffered per stream and serialized through one
//! combined wide-char buffer so interleaved stdout/stderr keeps its order and
//! non-ASCII survives (`WriteConsoleW`, never the ANSI path). Pipe output is
//! block buffered per stream. The worker flushes at job end, which is also
//! where cl.exe's bare source-file echo gets swallowed.

use crate::win32::RawHandle;

/// Combined console buffer capacity, in UTF-16 units.
const COMBINED_CAP: usize = 8 * 1024;
/// Per-stream pipe buffer capacity. Never grows.
const PIPE_BUF_CAP: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdStream {
    Out,
    Err,
}

/// Where flushed bytes actually go. The worker installs a real
/// console/handle-backed sink; tests capture.
pub trait OutputSink: std::fmt::Debug {
    /// Write a wide-char run to the real console.
    fn write_console(&mut self, text: &[u16]);
    /// Write raw bytes to the real backing handle of `stream`.
    fn write_file(&mut self, stream: StdStream, bytes: &[u8]);
}

#[derive(Debug)]
enum StreamState {
    /// Line-buffered console stream: the pending incomplete line.
    Console { partial: Vec<u16> },
    /// Block-buffered pipe/file stream.
    Pipe { buf: Vec<u8> },
}

#[derive(Debug)]
pub struct StreamBuffer {
    stream: StdStream,
    /// Saved OS handle this stream writes through on flush.
    pub backup: RawHandle,
    state: StreamState,
}

impl StreamBuffer {
    fn is_console(&self) -> bool {
        matches!(self.state, StreamState::Console { .. })
    }
}

#[derive(Debug)]
pub struct OutputHub {
    stdout: StreamBuffer,
    stderr: StreamBuffer,
    /// Complete console lines from both streams, in arrival order.
    combined: Vec<u16>,
    /// True once anything reached the sink during the current job.
    flushed: bool,
    sink: Box<dyn OutputSink + Send>,
}

impl OutputHub {
    pub fn new(
        sink: Box<dyn OutputSink + Send>,
        stdout_console: bool,
        stderr_console: bool,
        stdout_backup: RawHandle,
        stderr_backup: RawHandle,
    ) -> Self {
        let mk = |stream, console: bool, backup| StreamBuffer {
            stream,
            backup,
            state: if console {
                StreamState::Console {
                    partial: Vec::new(),
                }
            } else {
                StreamState::Pipe {
                    buf: Vec::with_capacity(PIPE_BUF_CAP),
                }
            },
        };
        OutputHub {
            stdout: mk(StdStream::Out, stdout_console, stdout_backup),
            stderr: mk(StdStream::Err, stderr_console, stderr_backup),
            combined: Vec::new(),
            flushed: false,
            sink,
        }
    }

    fn buffer_mut(&mut self, stream: StdStream) -> &mut StreamBuffer {
        match stream {
            StdStream::Out => &mut self.stdout,
            StdStream::Err => &mut self.stderr,
        }
    }

    /// Intercepted write of ANSI bytes (the `WriteFile` path).
    pub fn write(&mut self, stream: StdStream, bytes: &[u8]) {
        match &self.buffer_mut(stream).state {
            StreamState::Console { .. } => {
                // Convert through the console code page before buffering so
                // the combined buffer is uniformly wide.
                let wide: Vec<u16> = String::from_utf8_lossy(bytes).encode_utf16().collect();
                self.write_console_units(stream, &wide);
            }
            StreamState::Pipe { .. } => self.write_pipe(stream, bytes),
        }
    }

    /// Intercepted `WriteConsoleW`.
    pub fn write_wide(&mut self, stream: StdStream, text: &[u16]) {
        if self.buffer_mut(stream).is_console() {
            self.write_console_units(stream, text);
        } else {
            let bytes = String::from_utf16_lossy(text).into_bytes();
            self.write_pipe(stream, &bytes);
        }
    }

    fn write_console_units(&mut self, stream: StdStream, text: &[u16]) {
        const NL: u16 = b'\n' as u16;
        let mut rest = text;
        while let Some(nl) = rest.iter().position(|&c| c == NL) {
            let (line, tail) = rest.split_at(nl + 1);
            let partial = {
                let StreamState::Console { partial } = &mut self.buffer_mut(stream).state else {
                    unreachable!("console write on pipe stream");
                };
                std::mem::take(partial)
            };
            self.append_combined(&partial);
            self.append_combined(line);
            rest = tail;
        }
        if !rest.is_empty() {
            let StreamState::Console { partial } = &mut self.buffer_mut(stream).state else {
                unreachable!("console write on pipe stream");
            };
            partial.extend_from_slice(rest);
        }
    }

    fn append_combined(&mut self, units: &[u16]) {
        if self.combined.len() + units.len() > COMBINED_CAP {
            self.flush_combined();
        }
        if units.len() > COMBINED_CAP {
            self.sink.write_console(units);
            self.flushed = true;
        } else {
            self.combined.extend_from_slice(units);
        }
    }

    fn flush_combined(&mut self) {
        if self.combined.is_empty() {
            return;
        }
        self.sink.write_console(&self.combined);
        self.combined.clear();
        self.flushed = true;
    }

    fn write_pipe(&mut self, stream: StdStream, bytes: &[u8]) {
        let sb = self.buffer_mut(stream);
        let StreamState::Pipe { buf } = &mut sb.state else {
            unreachable!("pipe write on console stream");
        };
        if buf.len() + bytes.len() > PIPE_BUF_CAP {
            // Overflow: flush buffered content, preferring a line boundary.
            let cut = buf
                .iter()
                .rposition(|&b| b == b'\n')
                .map_or(buf.len(), |i| i + 1);
            let flushed: Vec<u8> = buf.drain(..cut).collect();
            self.sink.write_file(stream, &flushed);
            self.flushed = true;
            let StreamState::Pipe { buf } = &mut self.buffer_mut(stream).state else {
                unreachable!();
            };
            if buf.len() + bytes.len() > PIPE_BUF_CAP {
                let rest: Vec<u8> = buf.drain(..).collect();
                self.sink.write_file(stream, &rest);
                self.sink.write_file(stream, bytes);
                self.flushed = true;
                return;
            }
        }
        let StreamState::Pipe { buf } = &mut self.buffer_mut(stream).state else {
            unreachable!();
        };
        buf.extend_from_slice(bytes);
    }

    /// End-of-job flush. `suppress_cl_echo` is set when the tool hint is
    /// cl.exe; a buffer holding nothing but a trailing-newline run of
    /// filename characters is the compiler echoing the source name, and the
    /// build log reads better without it.
    pub fn final_flush(&mut self, suppress_cl_echo: bool) {
        if suppress_cl_echo && !self.flushed && self.try_suppress_echo() {
            self.reset_for_job();
            return;
        }
        // Emit leftover partial lines, then the combined buffer, then the
        // pipe buffers.
        for stream in [StdStream::Out, StdStream::Err] {
            if let StreamState::Console { partial } = &mut self.buffer_mut(stream).state {
                let partial = std::mem::take(partial);
                self.append_combined(&partial);
            }
        }
        self.flush_combined();
        for stream in [StdStream::Out, StdStream::Err] {
            if let StreamState::Pipe { buf } = &mut self.buffer_mut(stream).state {
                let bytes: Vec<u8> = buf.drain(..).collect();
                if !bytes.is_empty() {
                    self.sink.write_file(stream, &bytes);
                    self.flushed = true;
                }
            }
        }
    }

    fn try_suppress_echo(&self) -> bool {
        fn is_echo_unit(c: u32) -> bool {
            // [A-Za-z0-9._ -] plus the line terminator itself.
            matches!(c, 0x30..=0x39 | 0x41..=0x5A | 0x61..=0x7A)
                || matches!(c, 0x2E | 0x5F | 0x20 | 0x2D | 0x0D | 0x0A)
        }
        if self.stdout.is_console() {
            let StreamState::Console { partial } = &self.stdout.state else {
                return false;
            };
            if !partial.is_empty() {
                return false;
            }
            !self.combined.is_empty()
                && self.combined.last() == Some(&(b'\n' as u16))
                && self.combined.iter().all(|&c| is_echo_unit(c as u32))
        } else {
            let StreamState::Pipe { buf } = &self.stdout.state else {
                return false;
            };
            !buf.is_empty()
                && buf.last() == Some(&b'\n')
                && buf.iter().all(|&b| is_echo_unit(b as u32))
        }
    }

    /// Reset for the next job: buffers empty, flush tracking cleared. The
    /// stream buffers themselves (and their backup handles) persist.
    pub fn reset_for_job(&mut self) {
        for stream in [StdStream::Out, StdStream::Err] {
            match &mut self.buffer_mut(stream).state {
                StreamState::Console { partial } => partial.clear(),
                StreamState::Pipe { buf } => buf.clear(),
            }
        }
        self.combined.clear();
        self.flushed = false;
    }

    /// Swap the sink out, returning the previous one. The worker uses this
    /// once at startup after console detection; tests use it to capture.
    pub fn set_sink(&mut self, sink: Box<dyn OutputSink + Send>) -> Box<dyn OutputSink + Send> {
        std::mem::replace(&mut self.sink, sink)
    }

    pub fn stream_backup(&self, stream: StdStream) -> RawHandle {
        match stream {
            StdStream::Out => self.stdout.backup,
            StdStream::Err => self.stderr.backup,
        }
    }
}

pub mod sinks {
    //! The real sinks behind the hub.

    use super::{OutputSink, StdStream};

    /// Writes to the worker's actual stdout/stderr. On Windows the console
    /// path uses `WriteConsoleW` so wide characters survive; elsewhere (and
    /// for redirected streams) plain byte writes do.
    #[derive(Debug, Default)]
    pub struct ProcessSink {
        _priv: (),
    }

    impl OutputSink for ProcessSink {
        fn write_console(&mut self, text: &[u16]) {
            #[cfg(windows)]
            {
                use windows_sys::Win32::System::Console::{GetStdHandle, WriteConsoleW, STD_OUTPUT_HANDLE};
                // SAFETY: plain console write; a redirected stdout falls
                // back to the byte path below via the error return.
                unsafe {
                    let handle = GetStdHandle(STD_OUTPUT_HANDLE);
                    let mut written = 0u32;
                    if WriteConsoleW(
                        handle,
                        text.as_ptr() as *const _,
                        text.len() as u32,
                        &mut written,
                        std::ptr::null(),
                    ) != 0
                    {
                        return;
                    }
                }
            }
            use std::io::Write as _;
            let s = String::from_utf16_lossy(text);
            let _ = std::io::stdout().write_all(s.as_bytes());
            let _ = std::io::stdout().flush();
        }

        fn write_file(&mut self, stream: StdStream, bytes: &[u8]) {
            use std::io::Write as _;
            let _ = match stream {
                StdStream::Out => std::io::stdout().write_all(bytes),
                StdStream::Err => std::io::stderr().write_all(bytes),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Debug, Default)]
    struct Capture {
        console: String,
        out: Vec<u8>,
        err: Vec<u8>,
    }

    #[derive(Debug, Clone, Default)]
    struct CaptureSink(Arc<Mutex<Capture>>);

    impl OutputSink for CaptureSink {
        fn write_console(&mut self, text: &[u16]) {
            self.0
                .lock()
                .unwrap()
                .console
                .push_str(&String::from_utf16_lossy(text));
        }

        fn write_file(&mut self, stream: StdStream, bytes: &[u8]) {
            let mut cap = self.0.lock().unwrap();
            match stream {
                StdStream::Out => cap.out.extend_from_slice(bytes),
                StdStream::Err => cap.err.extend_from_slice(bytes),
            }
        }
    }

    fn console_hub() -> (OutputHub, Arc<Mutex<Capture>>) {
        let sink = CaptureSink::default();
        let cap = Arc::clone(&sink.0);
        let hub = OutputHub::new(
            Box::new(sink),
            true,
            true,
            RawHandle(0x10),
            RawHandle(0x14),
        );
        (hub, cap)
    }

    fn pipe_hub() -> (OutputHub, Arc<Mutex<Capture>>) {
        let sink = CaptureSink::default();
        let cap = Arc::clone(&sink.0);
        let hub = OutputHub::new(
            Box::new(sink),
            false,
            false,
            RawHandle(0x10),
            RawHandle(0x14),
        );
        (hub, cap)
    }

    #[test]
    fn console_streams_interleave_by_line() {
        let (mut hub, cap) = console_hub();
        hub.write(StdStream::Out, b"compil");
        hub.write(StdStream::Err, b"warning: x\n");
        hub.write(StdStream::Out, b"ing\n");
        hub.final_flush(false);
        // stderr's complete line lands first; stdout's line completes later.
        assert_eq!(cap.lock().unwrap().console, "warning: x\ncompiling\n");
    }

    #[test]
    fn partial_line_is_emitted_at_job_end() {
        let (mut hub, cap) = console_hub();
        hub.write(StdStream::Out, b"no newline");
        hub.final_flush(false);
        assert_eq!(cap.lock().unwrap().console, "no newline");
    }

    #[test]
    fn pipe_stream_is_block_buffered() {
        let (mut hub, cap) = pipe_hub();
        hub.write(StdStream::Out, b"line one\nline ");
        assert!(cap.lock().unwrap().out.is_empty());
        hub.write(StdStream::Out, b"two\n");
        hub.final_flush(false);
        assert_eq!(cap.lock().unwrap().out, b"line one\nline two\n");
    }

    #[test]
    fn pipe_overflow_flushes_at_line_boundary() {
        let (mut hub, cap) = pipe_hub();
        let mut chunk = vec![b'x'; PIPE_BUF_CAP - 10];
        chunk[100] = b'\n';
        hub.write(StdStream::Out, &chunk);
        hub.write(StdStream::Out, b"0123456789abcdef");
        // The overflow flushed through the last newline.
        assert_eq!(cap.lock().unwrap().out.len(), 101);
        hub.final_flush(false);
        assert_eq!(
            cap.lock().unwrap().out.len(),
            PIPE_BUF_CAP - 10 + 16
        );
    }

    #[test]
    fn cl_echo_suppressed_on_console() {
        let (mut hub, cap) = console_hub();
        hub.write(StdStream::Out, b"foo.c\r\n");
        hub.final_flush(true);
        assert_eq!(cap.lock().unwrap().console, "");
    }

    #[test]
    fn cl_echo_suppressed_on_pipe() {
        let (mut hub, cap) = pipe_hub();
        hub.write(StdStream::Out, b"my file-name_1.cpp\n");
        hub.final_flush(true);
        assert!(cap.lock().unwrap().out.is_empty());
    }

    #[test]
    fn real_diagnostics_are_not_suppressed() {
        let (mut hub, cap) = console_hub();
        hub.write(StdStream::Out, b"foo.c(3): error C2065\n");
        hub.final_flush(true);
        assert_eq!(cap.lock().unwrap().console, "foo.c(3): error C2065\n");
    }

    #[test]
    fn suppression_only_without_prior_flush() {
        let (mut hub, cap) = console_hub();
        let long_line = "a".repeat(COMBINED_CAP) + "\n";
        hub.write(StdStream::Out, long_line.as_bytes());
        hub.write(StdStream::Out, b"foo.c\n");
        hub.final_flush(true);
        assert!(cap.lock().unwrap().console.ends_with("foo.c\n"));
    }

    #[test]
    fn reset_clears_everything() {
        let (mut hub, cap) = console_hub();
        hub.write(StdStream::Out, b"stale");
        hub.reset_for_job();
        hub.write(StdStream::Out, b"fresh\n");
        hub.final_flush(false);
        assert_eq!(cap.lock().unwrap().console, "fresh\n");
    }

    #[test]
    fn wide_writes_reach_pipe_streams_too() {
        let (mut hub, cap) = pipe_hub();
        let wide: Vec<u16> = "wide text\n".encode_utf16().collect();
        hub.write_wide(StdStream::Err, &wide);
        hub.final_flush(false);
        assert_eq!(cap.lock().unwrap().err, b"wide text\n");
    }
}
