//! In-memory temporary files.
//!
//! cl.exe round-trips intermediate artifacts through `%TEMP%` files named
//! `_CL_<8 hex><2 alpha>` (and occasionally `{<uuid>}`). Those never need to
//! hit the disk: the store keeps them as segmented heap buffers for the
//! duration of the job and drops them wholesale at late cleanup. `DeleteFileW`
//! on one of them is a cheap success.

use std::sync::{Arc, Mutex};

use crate::win32::{error, file};

/// Preferred segment allocation. Falls back to the small size when the heap
/// can't produce a chunk this big.
const SEG_PREFERRED: usize = 4 * 1024 * 1024;
const SEG_FALLBACK: usize = 64 * 1024;

/// One contiguous run of bytes. Segments tile the allocated range from
/// offset 0 with no holes.
#[derive(Debug)]
struct Segment {
    file_offset: u64,
    data: Vec<u8>,
}

#[derive(Debug)]
pub struct TempFile {
    path: String,
    logical_size: u64,
    segments: Vec<Segment>,
    pub active_handles: u32,
    active_mappings: u32,
}

impl TempFile {
    fn new(path: String) -> Self {
        TempFile {
            path,
            logical_size: 0,
            segments: Vec::new(),
            active_handles: 0,
            active_mappings: 0,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.logical_size
    }

    fn allocated(&self) -> u64 {
        self.segments
            .last()
            .map_or(0, |s| s.file_offset + s.data.len() as u64)
    }

    /// Read into `buf` starting at `offset`. Past-EOF reads return 0 bytes;
    /// short reads happen at the logical end only.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize {
        if offset >= self.logical_size {
            return 0;
        }
        let want = buf.len().min((self.logical_size - offset) as usize);
        let mut done = 0usize;
        // Find the segment containing `offset`; they are sorted and tiled.
        let mut idx = match self
            .segments
            .binary_search_by(|s| s.file_offset.cmp(&offset))
        {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        while done < want {
            let seg = &self.segments[idx];
            let in_seg = (offset + done as u64 - seg.file_offset) as usize;
            let n = (want - done).min(seg.data.len() - in_seg);
            buf[done..done + n].copy_from_slice(&seg.data[in_seg..in_seg + n]);
            done += n;
            idx += 1;
        }
        done
    }

    /// Write `data` at `offset`, growing the file as needed. Writes beyond
    /// EOF zero-fill the gap (fresh segments come back zeroed).
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<usize, u32> {
        let end = offset + data.len() as u64;
        self.ensure_allocated(end)?;
        let mut done = 0usize;
        let mut idx = match self
            .segments
            .binary_search_by(|s| s.file_offset.cmp(&offset))
        {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        while done < data.len() {
            let seg = &mut self.segments[idx];
            let in_seg = (offset + done as u64 - seg.file_offset) as usize;
            let n = (data.len() - done).min(seg.data.len() - in_seg);
            seg.data[in_seg..in_seg + n].copy_from_slice(&data[done..done + n]);
            done += n;
            idx += 1;
        }
        self.logical_size = self.logical_size.max(end);
        Ok(done)
    }

    fn ensure_allocated(&mut self, end: u64) -> Result<(), u32> {
        while self.allocated() < end {
            if self.active_mappings > 0 {
                // A live view pins the segment buffers; no growth under it.
                return Err(error::ACCESS_DENIED);
            }
            let offset = self.allocated();
            let data = alloc_segment(SEG_PREFERRED)
                .or_else(|| alloc_segment(SEG_FALLBACK))
                .ok_or(error::NOT_ENOUGH_MEMORY)?;
            self.segments.push(Segment {
                file_offset: offset,
                data,
            });
        }
        Ok(())
    }

    /// `SetEndOfFile`: truncate or extend to `size`.
    pub fn set_end_of_file(&mut self, size: u64) -> Result<(), u32> {
        if size > self.logical_size {
            self.ensure_allocated(size)?;
        } else {
            // Zero the abandoned tail so a later extension reads back zeroes.
            let mut clear_from = size;
            while clear_from < self.logical_size {
                let idx = match self
                    .segments
                    .binary_search_by(|s| s.file_offset.cmp(&clear_from))
                {
                    Ok(i) => i,
                    Err(i) => i - 1,
                };
                let seg = &mut self.segments[idx];
                let in_seg = (clear_from - seg.file_offset) as usize;
                let n = ((self.logical_size - clear_from) as usize).min(seg.data.len() - in_seg);
                seg.data[in_seg..in_seg + n].fill(0);
                clear_from += n as u64;
            }
        }
        self.logical_size = size;
        Ok(())
    }

    /// Prepare a section view: coalesce to one segment and pin it.
    ///
    /// `protect` must be read-only or execute-read and `size` must name the
    /// whole file (0 means "to the end"). Only one concurrent view per file.
    pub fn map(&mut self, protect: u32, size: u64) -> Result<(), u32> {
        use crate::win32::mem::{PAGE_EXECUTE_READ, PAGE_READONLY};
        if protect != PAGE_READONLY && protect != PAGE_EXECUTE_READ {
            return Err(error::INVALID_PARAMETER);
        }
        if size != 0 && size != self.logical_size {
            return Err(error::INVALID_PARAMETER);
        }
        if self.active_mappings > 0 {
            return Err(error::ACCESS_DENIED);
        }
        self.coalesce()?;
        self.active_mappings += 1;
        Ok(())
    }

    pub fn unmap(&mut self) {
        debug_assert!(self.active_mappings > 0);
        self.active_mappings = self.active_mappings.saturating_sub(1);
    }

    /// Pointer/length of the coalesced view. Valid while a mapping is active.
    pub fn view(&self) -> Option<(*const u8, usize)> {
        if self.active_mappings == 0 {
            return None;
        }
        match self.segments.first() {
            Some(seg) => Some((seg.data.as_ptr(), self.logical_size as usize)),
            None => Some((std::ptr::NonNull::<u8>::dangling().as_ptr(), 0)),
        }
    }

    fn coalesce(&mut self) -> Result<(), u32> {
        if self.segments.len() <= 1 {
            return Ok(());
        }
        let total = self.allocated() as usize;
        let mut merged = alloc_segment_exact(total).ok_or(error::NOT_ENOUGH_MEMORY)?;
        for seg in &self.segments {
            let at = seg.file_offset as usize;
            merged[at..at + seg.data.len()].copy_from_slice(&seg.data);
        }
        self.segments = vec![Segment {
            file_offset: 0,
            data: merged,
        }];
        Ok(())
    }
}

fn alloc_segment(size: usize) -> Option<Vec<u8>> {
    alloc_segment_exact(size)
}

fn alloc_segment_exact(size: usize) -> Option<Vec<u8>> {
    let mut v = Vec::new();
    v.try_reserve_exact(size).ok()?;
    v.resize(size, 0);
    Some(v)
}

/// What an intercepted `CreateFileW` on a temp name should do.
#[derive(Debug)]
pub enum CreateOutcome {
    Opened(Arc<Mutex<TempFile>>),
    /// Not in the store and the disposition wants an existing file: let the
    /// real CreateFile take it.
    FallThrough,
    Fail(u32),
}

#[derive(Debug, Default)]
pub struct TempStore {
    files: Vec<Arc<Mutex<TempFile>>>,
    pub bytes_written: u64,
}

impl TempStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Does `path` look like a compiler temp file? Checked on the final path
    /// component, exact case for the `_CL_` stem.
    pub fn is_temp_name(path: &str) -> bool {
        let name = path.rsplit(['\\', '/']).next().unwrap_or(path);
        is_cl_temp(name) || is_uuid_temp(name)
    }

    fn find(&self, path: &str) -> Option<Arc<Mutex<TempFile>>> {
        // Last-two-byte prefilter before the full compare; the tail of the
        // generated names is the part that actually varies.
        let tail = |s: &str| {
            let b = s.as_bytes();
            (b.len() >= 2).then(|| [b[b.len() - 2], b[b.len() - 1]])
        };
        let want = tail(path)?;
        self.files
            .iter()
            .find(|f| {
                let f = f.lock().unwrap();
                tail(f.path()) == Some(want) && f.path() == path
            })
            .cloned()
    }

    /// Route an intercepted create. The caller has already checked the name
    /// pattern, the tool hint and the access/flag restrictions.
    pub fn create(&mut self, path: &str, disposition: u32) -> CreateOutcome {
        use crate::win32::file::*;
        if let Some(existing) = self.find(path) {
            match disposition {
                CREATE_NEW => return CreateOutcome::Fail(error::FILE_EXISTS),
                CREATE_ALWAYS | TRUNCATE_EXISTING => {
                    if let Err(code) = existing.lock().unwrap().set_end_of_file(0) {
                        return CreateOutcome::Fail(code);
                    }
                }
                _ => {}
            }
            return CreateOutcome::Opened(existing);
        }
        match disposition {
            OPEN_EXISTING | TRUNCATE_EXISTING => CreateOutcome::FallThrough,
            CREATE_NEW | CREATE_ALWAYS | OPEN_ALWAYS => {
                let file = Arc::new(Mutex::new(TempFile::new(path.to_owned())));
                self.files.push(Arc::clone(&file));
                CreateOutcome::Opened(file)
            }
            _ => CreateOutcome::Fail(error::INVALID_PARAMETER),
        }
    }

    /// `DeleteFileW` on a temp path: succeeds without doing anything if the
    /// file is ours, `None` if the OS should handle it.
    pub fn delete(&self, path: &str) -> Option<bool> {
        self.find(path).map(|_| true)
    }

    pub fn note_written(&mut self, n: usize) {
        self.bytes_written += n as u64;
    }

    /// Late cleanup: drop every temp file of the finished job.
    pub fn reset_for_next_job(&mut self) -> usize {
        let n = self.files.len();
        self.files.clear();
        n
    }
}

fn is_cl_temp(name: &str) -> bool {
    let Some(rest) = name.strip_prefix("_CL_") else {
        return false;
    };
    let b = rest.as_bytes();
    b.len() == 10
        && b[..8].iter().all(u8::is_ascii_hexdigit)
        && b[8..].iter().all(u8::is_ascii_alphabetic)
}

fn is_uuid_temp(name: &str) -> bool {
    let b = name.as_bytes();
    if b.len() != 38 || b[0] != b'{' || b[37] != b'}' {
        return false;
    }
    b[1..37].iter().enumerate().all(|(i, &c)| match i {
        8 | 13 | 18 | 23 => c == b'-',
        _ => c.is_ascii_hexdigit(),
    })
}
