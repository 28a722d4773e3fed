//! CryptoAPI hash interception.
//!
//! cl.exe hashes every source and header it reads (PDB signatures, `/ZH`
//! checksums) through `CryptCreateHash`/`CryptHashData`/`CryptGetHashParam`.
//! When the buffer handed to `CryptHashData` is byte-for-byte the last read
//! served from a cached file, the hash context binds to that file instead of
//! consuming the data, and finalization can be answered from the file's
//! digest slot — one digest per file per algorithm for the worker lifetime.
//!
//! Only unkeyed, flag-free MD5/SHA-1/SHA-256/SHA-512 hashes are accelerated;
//! everything else is left to the OS provider.

use std::sync::Arc;

use md5::{Digest as _, Md5};
use sha1::Sha1;
use sha2::{Sha256, Sha512};

use crate::file_cache::CachedFile;
use crate::win32::{self, alg, error};

/// Algorithms the cache accelerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlg {
    Md5 = 0,
    Sha1 = 1,
    Sha256 = 2,
    Sha512 = 3,
}

impl HashAlg {
    pub const COUNT: usize = 4;

    pub fn from_alg_id(alg_id: u32) -> Option<Self> {
        match alg_id {
            alg::CALG_MD5 => Some(HashAlg::Md5),
            alg::CALG_SHA1 => Some(HashAlg::Sha1),
            alg::CALG_SHA_256 => Some(HashAlg::Sha256),
            alg::CALG_SHA_512 => Some(HashAlg::Sha512),
            _ => None,
        }
    }

    pub fn digest_len(self) -> usize {
        match self {
            HashAlg::Md5 => 16,
            HashAlg::Sha1 => 20,
            HashAlg::Sha256 => 32,
            HashAlg::Sha512 => 64,
        }
    }

    pub fn compute(self, data: &[u8]) -> Box<[u8]> {
        let mut h = Hasher::new(self);
        h.update(data);
        h.finalize()
    }
}

#[derive(Debug, Clone)]
enum Hasher {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    fn new(alg: HashAlg) -> Self {
        match alg {
            HashAlg::Md5 => Hasher::Md5(Md5::new()),
            HashAlg::Sha1 => Hasher::Sha1(Sha1::new()),
            HashAlg::Sha256 => Hasher::Sha256(Sha256::new()),
            HashAlg::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(h) => h.update(data),
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    fn finalize(self) -> Box<[u8]> {
        match self {
            Hasher::Md5(h) => h.finalize().to_vec().into(),
            Hasher::Sha1(h) => h.finalize().to_vec().into(),
            Hasher::Sha256(h) => h.finalize().to_vec().into(),
            Hasher::Sha512(h) => h.finalize().to_vec().into(),
        }
    }
}

/// Where the bytes of a hash context have come from so far.
#[derive(Debug)]
enum Source {
    /// Nothing hashed yet.
    Fresh,
    /// All input so far equals `file[0..bytes_hashed]`.
    Cached(Arc<CachedFile>),
    /// Input diverged from any cached read; a running hasher carries it.
    Fallback(Hasher),
    /// Running state lost; only an error can come out of finalization.
    GoneBad,
}

const CTX_MAGIC: u32 = 0x6b57_4863; // "kWHc"

/// One in-flight `HCRYPTHASH`.
#[derive(Debug)]
pub struct HashCtx {
    magic: u32,
    alg: HashAlg,
    bytes_hashed: u64,
    source: Source,
    final_digest: Option<Box<[u8]>>,
}

/// The last read the file interception served from a cached file. Compared
/// by buffer address, so a tool that reads into one buffer and hashes a
/// different one never falsely matches.
#[derive(Debug, Clone)]
pub struct LastReadHint {
    pub file: Arc<CachedFile>,
    pub offset: u64,
    pub len: usize,
    pub buffer: usize,
}

/// All hash state for the sandbox: contexts, provider handles, the last-read
/// hint and the digest counters.
#[derive(Debug, Default)]
pub struct HashCache {
    ctxs: Vec<Option<HashCtx>>,
    providers: Vec<bool>,
    hint: Option<LastReadHint>,
    pub digests_computed: u64,
    pub digests_cached: u64,
}

/// Fabricated handle namespaces. Crypt handles never collide with kernel
/// handles, so plain tagged indices work.
const PROV_TAG: usize = 0x5052_0000;
const HASH_TAG: usize = 0x4841_0000;

impl HashCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a read served from a cached file so a following
    /// `CryptHashData` on the same buffer can bind to the file.
    pub fn note_cached_read(&mut self, file: &Arc<CachedFile>, offset: u64, buffer: usize, len: usize) {
        self.hint = Some(LastReadHint {
            file: Arc::clone(file),
            offset,
            len,
            buffer,
        });
    }

    pub fn clear_hint(&mut self) {
        self.hint = None;
    }

    /// `CryptAcquireContext` replacement core: hand out a reusable provider
    /// handle. The OS provider is only acquired if a context later falls off
    /// the fast path.
    pub fn acquire_provider(&mut self) -> usize {
        if let Some(i) = self.providers.iter().position(|used| !used) {
            self.providers[i] = true;
            return PROV_TAG | i;
        }
        self.providers.push(true);
        PROV_TAG | (self.providers.len() - 1)
    }

    pub fn release_provider(&mut self, handle: usize) -> bool {
        match self.providers.get_mut(handle & 0xFFFF) {
            Some(used) if handle & !0xFFFF == PROV_TAG && *used => {
                *used = false;
                true
            }
            _ => {
                win32::set_last_error(error::INVALID_HANDLE);
                false
            }
        }
    }

    /// `CryptCreateHash` replacement core. Returns `None` when the request is
    /// not one we accelerate (keyed, flagged, or unknown algorithm); the shim
    /// then falls through to the OS.
    pub fn create_hash(&mut self, alg_id: u32, key: usize, flags: u32) -> Option<usize> {
        if key != 0 || flags != 0 {
            return None;
        }
        let alg = HashAlg::from_alg_id(alg_id)?;
        let ctx = HashCtx {
            magic: CTX_MAGIC,
            alg,
            bytes_hashed: 0,
            source: Source::Fresh,
            final_digest: None,
        };
        let slot = self
            .ctxs
            .iter()
            .position(|c| c.is_none())
            .unwrap_or_else(|| {
                self.ctxs.push(None);
                self.ctxs.len() - 1
            });
        self.ctxs[slot] = Some(ctx);
        Some(HASH_TAG | slot)
    }

    fn ctx_mut(&mut self, handle: usize) -> Result<&mut HashCtx, u32> {
        if handle & !0xFFFF != HASH_TAG {
            return Err(error::INVALID_HANDLE);
        }
        match self.ctxs.get_mut(handle & 0xFFFF) {
            Some(Some(ctx)) if ctx.magic == CTX_MAGIC => Ok(ctx),
            _ => Err(error::INVALID_HANDLE),
        }
    }

    pub fn is_ours(&self, handle: usize) -> bool {
        handle & !0xFFFF == HASH_TAG
            && matches!(self.ctxs.get(handle & 0xFFFF), Some(Some(_)))
    }

    /// `CryptHashData` replacement core.
    pub fn hash_data(&mut self, handle: usize, buffer: usize, data: &[u8]) -> Result<(), u32> {
        let hint = self.hint.clone();
        let ctx = self.ctx_mut(handle)?;
        if ctx.final_digest.is_some() {
            return Err(error::NTE_BAD_HASH);
        }

        // Fast path: the data is exactly the last cached read, continuing at
        // the context's current offset.
        if let Some(hint) = &hint
            && hint.buffer == buffer
            && hint.len == data.len()
            && hint.offset == ctx.bytes_hashed
        {
            let continues = match &ctx.source {
                Source::Fresh => true,
                Source::Cached(bound) => Arc::ptr_eq(bound, &hint.file),
                _ => false,
            };
            if continues {
                if matches!(ctx.source, Source::Fresh) {
                    ctx.source = Source::Cached(Arc::clone(&hint.file));
                }
                ctx.bytes_hashed += data.len() as u64;
                return Ok(());
            }
        }

        // Off the fast path: replay whatever the context consumed so far into
        // a real hasher, then feed the new data.
        match std::mem::replace(&mut ctx.source, Source::GoneBad) {
            Source::Fresh => {
                ctx.source = Source::Fallback(Hasher::new(ctx.alg));
            }
            Source::Cached(file) => {
                let consumed = ctx.bytes_hashed;
                if consumed <= file.size() {
                    let mut h = Hasher::new(ctx.alg);
                    h.update(&file.bytes()[..consumed as usize]);
                    ctx.source = Source::Fallback(h);
                }
                // else: stays GoneBad; nothing sane can be replayed.
            }
            other @ (Source::Fallback(_) | Source::GoneBad) => ctx.source = other,
        }

        match &mut ctx.source {
            Source::Fallback(h) => {
                h.update(data);
                ctx.bytes_hashed += data.len() as u64;
                Ok(())
            }
            Source::GoneBad => Err(error::NTE_BAD_HASH),
            Source::Fresh | Source::Cached(_) => unreachable!("source was just replaced"),
        }
    }

    /// `CryptGetHashParam` replacement core.
    pub fn get_hash_param(&mut self, handle: usize, param: u32) -> Result<Vec<u8>, u32> {
        match param {
            alg::HP_HASHSIZE => {
                let ctx = self.ctx_mut(handle)?;
                Ok((ctx.alg.digest_len() as u32).to_le_bytes().to_vec())
            }
            alg::HP_ALGID => {
                let ctx = self.ctx_mut(handle)?;
                let id = match ctx.alg {
                    HashAlg::Md5 => alg::CALG_MD5,
                    HashAlg::Sha1 => alg::CALG_SHA1,
                    HashAlg::Sha256 => alg::CALG_SHA_256,
                    HashAlg::Sha512 => alg::CALG_SHA_512,
                };
                Ok(id.to_le_bytes().to_vec())
            }
            alg::HP_HASHVAL => self.finalize(handle),
            _ => Err(error::INVALID_PARAMETER),
        }
    }

    fn finalize(&mut self, handle: usize) -> Result<Vec<u8>, u32> {
        let (alg, bytes_hashed, source) = {
            let ctx = self.ctx_mut(handle)?;
            if let Some(d) = &ctx.final_digest {
                return Ok(d.to_vec());
            }
            (
                ctx.alg,
                ctx.bytes_hashed,
                std::mem::replace(&mut ctx.source, Source::GoneBad),
            )
        };

        let (digest, restored) = match source {
            Source::Fresh => {
                self.digests_computed += 1;
                (alg.compute(&[]), Source::Fresh)
            }
            Source::Cached(file) if bytes_hashed == file.size() => {
                let (digest, computed) = file.digest(alg);
                if computed {
                    self.digests_computed += 1;
                } else {
                    self.digests_cached += 1;
                }
                (digest, Source::Cached(file))
            }
            Source::Cached(file) => {
                // Partial hash of a cached file: compute straight from the
                // mapping, no fallback needed.
                let d = alg.compute(&file.bytes()[..bytes_hashed as usize]);
                self.digests_computed += 1;
                (d, Source::Cached(file))
            }
            Source::Fallback(h) => {
                self.digests_computed += 1;
                (h.finalize(), Source::GoneBad)
            }
            Source::GoneBad => return Err(error::NTE_BAD_HASH),
        };

        let ctx = self.ctx_mut(handle)?;
        ctx.source = restored;
        ctx.final_digest = Some(digest.clone());
        Ok(digest.to_vec())
    }

    /// `CryptDestroyHash` replacement core.
    pub fn destroy_hash(&mut self, handle: usize) -> Result<(), u32> {
        self.ctx_mut(handle)?;
        self.ctxs[handle & 0xFFFF] = None;
        Ok(())
    }

    /// Late cleanup: drop every context a sloppy tool leaked, and the hint.
    pub fn reset_for_next_job(&mut self) -> usize {
        let leaked = self.ctxs.iter().filter(|c| c.is_some()).count();
        self.ctxs.clear();
        self.providers.clear();
        self.hint = None;
        leaked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_cache::{self, CacheLimits};
    use crate::fs_cache::FsCache;

    fn cached(content: &[u8]) -> (Arc<CachedFile>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("h.h");
        std::fs::write(&file, content).unwrap();
        let mut fs = FsCache::new();
        let id = fs
            .lookup(&file.display().to_string().replace('/', "\\"), "")
            .unwrap();
        let f = file_cache::get_or_create(&mut fs, id, CacheLimits { pch_caching: false }).unwrap();
        (f, dir)
    }

    #[test]
    fn fast_path_full_file_uses_digest_slot() {
        let content = vec![0xA5u8; 4096];
        let (file, _dir) = cached(&content);
        let mut hc = HashCache::new();

        let buffer = 0x1000usize;
        hc.note_cached_read(&file, 0, buffer, 4096);

        let h = hc.create_hash(alg::CALG_MD5, 0, 0).unwrap();
        hc.hash_data(h, buffer, &content).unwrap();
        let digest = hc.get_hash_param(h, alg::HP_HASHVAL).unwrap();
        assert_eq!(digest, HashAlg::Md5.compute(&content).to_vec());
        assert_eq!(hc.digests_computed, 1);

        // Second run: digest slot already filled, no recomputation.
        hc.note_cached_read(&file, 0, buffer, 4096);
        let h2 = hc.create_hash(alg::CALG_MD5, 0, 0).unwrap();
        hc.hash_data(h2, buffer, &content).unwrap();
        let digest2 = hc.get_hash_param(h2, alg::HP_HASHVAL).unwrap();
        assert_eq!(digest, digest2);
        assert_eq!(hc.digests_computed, 1);
        assert_eq!(hc.digests_cached, 1);
    }

    #[test]
    fn contiguous_chunks_stay_on_fast_path() {
        let content: Vec<u8> = (0..8192u32).map(|i| i as u8).collect();
        let (file, _dir) = cached(&content);
        let mut hc = HashCache::new();
        let h = hc.create_hash(alg::CALG_SHA_256, 0, 0).unwrap();

        hc.note_cached_read(&file, 0, 0x2000, 4096);
        hc.hash_data(h, 0x2000, &content[..4096]).unwrap();
        hc.note_cached_read(&file, 4096, 0x2000, 4096);
        hc.hash_data(h, 0x2000, &content[4096..]).unwrap();

        let digest = hc.get_hash_param(h, alg::HP_HASHVAL).unwrap();
        assert_eq!(digest, HashAlg::Sha256.compute(&content).to_vec());
        // Full-size match lands in the file's digest slot.
        assert_eq!(hc.digests_computed, 1);
    }

    #[test]
    fn divergent_data_falls_back_with_replay() {
        let content = b"cached file body".to_vec();
        let (file, _dir) = cached(&content);
        let mut hc = HashCache::new();
        let h = hc.create_hash(alg::CALG_SHA1, 0, 0).unwrap();

        // First chunk rides the fast path.
        hc.note_cached_read(&file, 0, 0x3000, 6);
        hc.hash_data(h, 0x3000, &content[..6]).unwrap();
        // Second chunk is unrelated data: replay + fallback.
        hc.hash_data(h, 0x9999, b"extra").unwrap();

        let digest = hc.get_hash_param(h, alg::HP_HASHVAL).unwrap();
        let mut expect = content[..6].to_vec();
        expect.extend_from_slice(b"extra");
        assert_eq!(digest, HashAlg::Sha1.compute(&expect).to_vec());
    }

    #[test]
    fn partial_cached_hash_computes_from_mapping() {
        let content = vec![7u8; 1000];
        let (file, _dir) = cached(&content);
        let mut hc = HashCache::new();
        let h = hc.create_hash(alg::CALG_SHA_512, 0, 0).unwrap();
        hc.note_cached_read(&file, 0, 0x4000, 600);
        hc.hash_data(h, 0x4000, &content[..600]).unwrap();
        let digest = hc.get_hash_param(h, alg::HP_HASHVAL).unwrap();
        assert_eq!(digest, HashAlg::Sha512.compute(&content[..600]).to_vec());
    }

    #[test]
    fn keyed_or_flagged_hashes_not_intercepted() {
        let mut hc = HashCache::new();
        assert!(hc.create_hash(alg::CALG_MD5, 0xdead, 0).is_none());
        assert!(hc.create_hash(alg::CALG_MD5, 0, 1).is_none());
        assert!(hc.create_hash(0x8009, 0, 0).is_none());
    }

    #[test]
    fn error_codes() {
        let mut hc = HashCache::new();
        assert_eq!(hc.hash_data(0xbad, 0, b"x").unwrap_err(), error::INVALID_HANDLE);
        let h = hc.create_hash(alg::CALG_MD5, 0, 0).unwrap();
        hc.hash_data(h, 0x1, b"x").unwrap();
        let _ = hc.get_hash_param(h, alg::HP_HASHVAL).unwrap();
        // Data after finalization is refused.
        assert_eq!(hc.hash_data(h, 0x1, b"y").unwrap_err(), error::NTE_BAD_HASH);
        // Repeated HP_HASHVAL returns the same digest.
        let a = hc.get_hash_param(h, alg::HP_HASHVAL).unwrap();
        let b = hc.get_hash_param(h, alg::HP_HASHVAL).unwrap();
        assert_eq!(a, b);
        hc.destroy_hash(h).unwrap();
        assert_eq!(hc.destroy_hash(h).unwrap_err(), error::INVALID_HANDLE);
    }

    #[test]
    fn provider_handles_recycle() {
        let mut hc = HashCache::new();
        let p1 = hc.acquire_provider();
        let p2 = hc.acquire_provider();
        assert_ne!(p1, p2);
        assert!(hc.release_provider(p1));
        assert_eq!(hc.acquire_provider(), p1);
        assert!(!hc.release_provider(0x1234));
    }
}
