//! Whole-file read cache.
//!
//! Cacheable files (headers, mostly) are opened once, mapped read-only and
//! kept alive on their cache object for the rest of the worker's life. All
//! subsequent opens and reads are served from the mapping without touching
//! the OS, which is where the big win over CreateFile-per-read lives on
//! Windows. Each cached file also carries one digest slot per hash algorithm
//! so repeated hashing of the same header is computed once.

use std::fs::File;
use std::path::Path;
use std::sync::{Arc, Mutex};

use memmap2::Mmap;
use thiserror::Error;

use crate::fs_cache::{FsCache, FsObjId};
use crate::hash_cache::HashAlg;

/// Ceiling for plain cacheable files.
pub const MAX_CACHED_FILE: u64 = 16 * 1024 * 1024;
/// Ceiling for precompiled headers when PCH caching is enabled.
pub const MAX_CACHED_PCH: u64 = 96 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FileCacheError {
    #[error("file too large to cache ({size} bytes, limit {limit})")]
    TooLarge { size: u64, limit: u64 },
    #[error("file changed while opening (stat said {expected}, mapped {actual})")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("open failed: {0}")]
    Open(#[source] std::io::Error),
    #[error("map failed: {0}")]
    Map(#[source] std::io::Error),
}

#[derive(Debug)]
enum Backing {
    Mapped(Mmap),
    /// Zero-length files cannot be mapped; an empty backing serves them.
    Empty,
}

impl Backing {
    fn bytes(&self) -> &[u8] {
        match self {
            Backing::Mapped(m) => m,
            Backing::Empty => &[],
        }
    }
}

/// A file pinned into memory, attached as user data on its cache object.
#[derive(Debug)]
pub struct CachedFile {
    /// Full path, kept for diagnostics.
    path: String,
    obj: FsObjId,
    backing: Backing,
    /// One slot per [`HashAlg`], filled on first digest query.
    digests: Mutex<[Option<Box<[u8]>>; HashAlg::COUNT]>,
}

impl CachedFile {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn obj(&self) -> FsObjId {
        self.obj
    }

    pub fn bytes(&self) -> &[u8] {
        self.backing.bytes()
    }

    pub fn size(&self) -> u64 {
        self.bytes().len() as u64
    }

    /// Copy up to `buf.len()` bytes starting at `offset`. Reads past EOF
    /// return 0 bytes.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize {
        let bytes = self.bytes();
        let Ok(start) = usize::try_from(offset) else {
            return 0;
        };
        if start >= bytes.len() {
            return 0;
        }
        let n = buf.len().min(bytes.len() - start);
        buf[..n].copy_from_slice(&bytes[start..start + n]);
        n
    }

    /// The file's digest under `alg`, computed at most once. The boolean is
    /// true when this call did the computation.
    pub fn digest(&self, alg: HashAlg) -> (Box<[u8]>, bool) {
        let mut slots = self.digests.lock().unwrap();
        let slot = &mut slots[alg as usize];
        match slot {
            Some(d) => (d.clone(), false),
            None => {
                let d = alg.compute(self.bytes());
                *slot = Some(d.clone());
                (d, true)
            }
        }
    }
}

/// Limits in effect for the current job.
#[derive(Debug, Clone, Copy)]
pub struct CacheLimits {
    pub pch_caching: bool,
}

impl CacheLimits {
    fn ceiling_for(self, path: &str) -> u64 {
        let is_pch = path
            .rsplit('.')
            .next()
            .is_some_and(|e| e.eq_ignore_ascii_case("pch"));
        if is_pch && self.pch_caching {
            MAX_CACHED_PCH
        } else {
            MAX_CACHED_FILE
        }
    }
}

/// Fetch the cached file for `id`, opening and mapping it on first use.
pub fn get_or_create(
    fs: &mut FsCache,
    id: FsObjId,
    limits: CacheLimits,
) -> Result<Arc<CachedFile>, FileCacheError> {
    if let Some(cached) = fs.user_data::<CachedFile>(id) {
        return Ok(cached);
    }

    let path = fs.obj(id).path().to_owned();
    let size = fs.obj(id).file_size().unwrap_or(0);
    let limit = limits.ceiling_for(&path);
    if size > limit {
        return Err(FileCacheError::TooLarge { size, limit });
    }

    let native = if cfg!(windows) {
        path.clone()
    } else {
        path.replace('\\', "/")
    };
    let file = File::open(Path::new(&native)).map_err(FileCacheError::Open)?;
    let backing = if size == 0 {
        Backing::Empty
    } else {
        // SAFETY: the mapping is read-only and build inputs are not mutated
        // mid-job; a concurrent writer is outside the worker's contract.
        let map = unsafe { Mmap::map(&file) }.map_err(FileCacheError::Map)?;
        if map.len() as u64 != size {
            return Err(FileCacheError::SizeMismatch {
                expected: size,
                actual: map.len() as u64,
            });
        }
        Backing::Mapped(map)
    };

    let cached = Arc::new(CachedFile {
        path,
        obj: id,
        backing,
        digests: Mutex::new(std::array::from_fn(|_| None)),
    });
    // The self-pin: the cache object keeps the file bytes alive until the
    // object is invalidated or the worker shuts down.
    fs.set_user_data(id, Arc::clone(&cached));
    Ok(cached)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_file(content: &[u8]) -> (FsCache, Arc<CachedFile>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("x.h");
        std::fs::write(&file, content).unwrap();
        let mut fs = FsCache::new();
        let id = fs
            .lookup(&file.display().to_string().replace('/', "\\"), "")
            .unwrap();
        let cached = get_or_create(&mut fs, id, CacheLimits { pch_caching: false }).unwrap();
        (fs, cached, dir)
    }

    #[test]
    fn second_open_is_served_from_the_pin() {
        let (mut fs, cached, _dir) = cache_file(b"#pragma once\n");
        let again =
            get_or_create(&mut fs, cached.obj(), CacheLimits { pch_caching: false }).unwrap();
        assert!(Arc::ptr_eq(&cached, &again));
    }

    #[test]
    fn read_at_clamps_to_eof() {
        let (_fs, cached, _dir) = cache_file(b"0123456789");
        let mut buf = [0u8; 4];
        assert_eq!(cached.read_at(8, &mut buf), 2);
        assert_eq!(&buf[..2], b"89");
        assert_eq!(cached.read_at(10, &mut buf), 0);
        assert_eq!(cached.read_at(u64::MAX, &mut buf), 0);
    }

    #[test]
    fn empty_file_is_cacheable() {
        let (_fs, cached, _dir) = cache_file(b"");
        let mut buf = [0u8; 1];
        assert_eq!(cached.size(), 0);
        assert_eq!(cached.read_at(0, &mut buf), 0);
    }

    #[test]
    fn digest_computed_once_per_algorithm() {
        let (_fs, cached, _dir) = cache_file(b"cached header bytes");
        let (first, computed) = cached.digest(HashAlg::Md5);
        assert!(computed);
        let (second, computed) = cached.digest(HashAlg::Md5);
        assert!(!computed);
        assert_eq!(first, second);
        let (_, computed) = cached.digest(HashAlg::Sha256);
        assert!(computed);
    }

    #[test]
    fn pch_ceiling_only_with_pch_caching() {
        let limits = CacheLimits { pch_caching: true };
        assert_eq!(limits.ceiling_for(r"C:\o\pre.pch"), MAX_CACHED_PCH);
        let limits = CacheLimits { pch_caching: false };
        assert_eq!(limits.ceiling_for(r"C:\o\pre.pch"), MAX_CACHED_FILE);
        assert_eq!(limits.ceiling_for(r"C:\i\a.h"), MAX_CACHED_FILE);
    }
}
