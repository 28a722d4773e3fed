//! Path/attribute cache adapter.
//!
//! The worker keys every cached artifact (read-cached file contents, tool
//! descriptors) off a cache object for the normalized path. Objects are
//! created on first lookup, remember whether the path existed (negative
//! entries included), and can carry typed user data that downstream layers
//! attach: the cached-file store pins file bytes here, the tool registry
//! pins resolved tools here.
//!
//! Subtrees named volatile (the `%TEMP%` family plus whatever the driver
//! passes via `--volatile`) are re-validated once per job: a global custom
//! revision is bumped and any object under a volatile root whose revision is
//! stale gets re-statted on next lookup, dropping its user data when the
//! underlying file changed.

use std::any::Any;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use ahash::AHashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FsCacheError {
    #[error("path not found")]
    NotFound,
    #[error("path component not a directory")]
    NotADirectory,
    #[error("path too long")]
    NameTooLong,
}

/// Index of a cache object. Objects are never removed, so an id stays valid
/// for the life of the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FsObjId(u32);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsObjKind {
    File { size: u64, mtime: Option<SystemTime> },
    Directory,
    /// Negative entry: the path did not exist when last checked.
    Missing,
}

#[derive(Debug)]
pub struct FsObj {
    /// Canonical backslash path.
    path: String,
    kind: FsObjKind,
    /// Revision this object was last validated at. Objects under a volatile
    /// root with a stale revision are re-statted on lookup.
    validated_rev: u64,
    volatile: bool,
    /// Pinned user data, keyed by concrete type. The pin is deliberate: the
    /// cached-file store relies on objects keeping their payload alive until
    /// worker shutdown or invalidation.
    user_data: Vec<Arc<dyn Any + Send + Sync>>,
}

impl FsObj {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn kind(&self) -> &FsObjKind {
        &self.kind
    }

    pub fn file_size(&self) -> Option<u64> {
        match self.kind {
            FsObjKind::File { size, .. } => Some(size),
            _ => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        self.kind == FsObjKind::Missing
    }
}

/// The path/attribute cache.
///
/// Single-threaded by contract (§ concurrency model): all mutation happens on
/// the worker main thread.
#[derive(Debug, Default)]
pub struct FsCache {
    objs: Vec<FsObj>,
    /// Lowercased normalized path -> object.
    by_path: AHashMap<String, FsObjId>,
    /// Roots of the volatile tree, lowercased.
    volatile_roots: Vec<String>,
    current_rev: u64,
    pub misses: u64,
    pub hits: u64,
}

impl FsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a volatile root. Lookups below it are revalidated after every
    /// [`FsCache::invalidate_custom_both`].
    pub fn add_volatile_root(&mut self, root: &str) {
        let norm = normalize_path(root, "");
        self.volatile_roots.push(norm.to_ascii_lowercase());
    }

    /// Bump the custom revision: every volatile object becomes suspect and is
    /// re-statted on its next lookup. Called once per job before any lookups.
    pub fn invalidate_custom_both(&mut self) {
        self.current_rev += 1;
    }

    /// Mark the subtree rooted at `id` volatile, as if passed via
    /// `--volatile`.
    pub fn setup_custom_revision_for_tree(&mut self, id: FsObjId) {
        let root = self.obj(id).path.to_ascii_lowercase();
        if !self.volatile_roots.contains(&root) {
            self.volatile_roots.push(root);
        }
    }

    /// Look up `path` relative to `base`, creating (and stat-ing) the object
    /// if needed. A missing path yields `Err(NotFound)` but still caches the
    /// negative entry.
    pub fn lookup(&mut self, path: &str, base: &str) -> Result<FsObjId, FsCacheError> {
        let id = self.lookup_obj(path, base)?;
        if self.obj(id).is_missing() {
            Err(FsCacheError::NotFound)
        } else {
            Ok(id)
        }
    }

    /// Like [`FsCache::lookup`] but maps a negative entry to `None` instead
    /// of an error.
    pub fn lookup_no_missing(&mut self, path: &str, base: &str) -> Option<FsObjId> {
        self.lookup(path, base).ok()
    }

    fn lookup_obj(&mut self, path: &str, base: &str) -> Result<FsObjId, FsCacheError> {
        let norm = normalize_path(path, base);
        if norm.len() > 260 {
            return Err(FsCacheError::NameTooLong);
        }
        let key = norm.to_ascii_lowercase();
        if let Some(&id) = self.by_path.get(&key) {
            self.hits += 1;
            self.revalidate_if_stale(id);
            return Ok(id);
        }
        self.misses += 1;
        let kind = stat(&norm);
        let volatile = self.is_volatile(&key);
        let id = FsObjId(self.objs.len() as u32);
        self.objs.push(FsObj {
            path: norm,
            kind,
            validated_rev: self.current_rev,
            volatile,
            user_data: Vec::new(),
        });
        self.by_path.insert(key, id);
        Ok(id)
    }

    fn revalidate_if_stale(&mut self, id: FsObjId) {
        let rev = self.current_rev;
        let obj = &mut self.objs[id.0 as usize];
        if !obj.volatile || obj.validated_rev == rev {
            return;
        }
        let fresh = stat(&obj.path);
        if fresh != obj.kind {
            obj.kind = fresh;
            obj.user_data.clear();
        }
        obj.validated_rev = rev;
    }

    pub fn obj(&self, id: FsObjId) -> &FsObj {
        &self.objs[id.0 as usize]
    }

    /// Full path of the object with the requested separator.
    pub fn get_full_path(&self, id: FsObjId, sep: char) -> String {
        let p = &self.obj(id).path;
        if sep == '\\' {
            p.clone()
        } else {
            p.replace('\\', &sep.to_string())
        }
    }

    /// Attach `data`, replacing any previous attachment of the same type.
    pub fn set_user_data<T: Any + Send + Sync>(&mut self, id: FsObjId, data: Arc<T>) {
        let slot = &mut self.objs[id.0 as usize].user_data;
        slot.retain(|d| !d.is::<T>());
        slot.push(data);
    }

    pub fn user_data<T: Any + Send + Sync>(&self, id: FsObjId) -> Option<Arc<T>> {
        self.obj(id)
            .user_data
            .iter()
            .find_map(|d| d.clone().downcast::<T>().ok())
    }

    /// Drop every user-data pin. Only called at worker shutdown.
    pub fn drop_all_user_data(&mut self) {
        for obj in &mut self.objs {
            obj.user_data.clear();
        }
    }

    fn is_volatile(&self, lowercased: &str) -> bool {
        self.volatile_roots.iter().any(|root| {
            lowercased.starts_with(root.as_str())
                && matches!(lowercased.as_bytes().get(root.len()), None | Some(&b'\\'))
        })
    }
}

fn stat(path: &str) -> FsObjKind {
    let native = if cfg!(windows) {
        path.to_owned()
    } else {
        path.replace('\\', "/")
    };
    match fs::metadata(Path::new(&native)) {
        Ok(md) if md.is_dir() => FsObjKind::Directory,
        Ok(md) => FsObjKind::File {
            size: md.len(),
            mtime: md.modified().ok(),
        },
        Err(_) => FsObjKind::Missing,
    }
}

/// Produce a canonical backslash path from whatever the tool handed us:
/// forward or back slashes, `.`/`..` components, trailing separators.
/// Relative paths are resolved against `base` (itself assumed canonical).
pub fn normalize_path(path: &str, base: &str) -> String {
    let mut prefix = String::new();
    let mut rest = path;

    if let Some(stripped) = strip_unc(path) {
        prefix = stripped.0;
        rest = stripped.1;
    } else if has_drive(path) {
        prefix.push(path.as_bytes()[0].to_ascii_uppercase() as char);
        prefix.push(':');
        rest = &path[2..];
    } else if path.starts_with('\\') || path.starts_with('/') {
        // Drive-relative absolute path: take the drive from base.
        if has_drive(base) {
            prefix.push_str(&base[..2]);
        }
    } else if !base.is_empty() {
        return normalize_joined(base, path);
    }

    let mut parts: Vec<&str> = Vec::new();
    push_components(&mut parts, rest);
    let mut out = prefix;
    out.push('\\');
    out.push_str(&parts.join("\\"));
    if out.ends_with('\\') && out.len() > prefix_len(&out) {
        out.pop();
    }
    out
}

fn normalize_joined(base: &str, rel: &str) -> String {
    let joined = format!("{base}\\{rel}");
    normalize_path(&joined, "")
}

fn prefix_len(normalized: &str) -> usize {
    if normalized.starts_with(r"\\") {
        // \\server\share
        normalized
            .match_indices('\\')
            .nth(3)
            .map_or(normalized.len(), |(i, _)| i)
    } else if has_drive(normalized) {
        3
    } else {
        1
    }
}

fn has_drive(p: &str) -> bool {
    let b = p.as_bytes();
    b.len() >= 2 && b[0].is_ascii_alphabetic() && b[1] == b':'
}

fn strip_unc(p: &str) -> Option<(String, &str)> {
    let norm_start = p.starts_with(r"\\") || p.starts_with("//");
    if !norm_start {
        return None;
    }
    let body = &p[2..];
    let mut it = body.splitn(3, ['\\', '/']);
    let server = it.next()?;
    let share = it.next()?;
    let rest = it.next().unwrap_or("");
    Some((format!(r"\\{server}\{share}"), rest))
}

fn push_components<'a>(parts: &mut Vec<&'a str>, path: &'a str) {
    for comp in path.split(['\\', '/']) {
        match comp {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            c => parts.push(c),
        }
    }
}

/// Extension classes driving the read-cache policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtClass {
    /// Contents are worth caching for repeated reads.
    CacheableRead,
    /// Only attribute queries benefit from caching.
    CacheableAttr,
    /// Leave it alone.
    Passthrough,
}

/// Classify `path` for the caching policy.
///
/// `pch_caching` admits `.pch` to the read cache; `linker` widens the
/// attribute class with the artifacts link.exe keeps re-statting.
pub fn classify_extension(path: &str, pch_caching: bool, linker: bool) -> ExtClass {
    let ext = extension_of(path);
    // Uniform handling for 0..=3 character extensions; longer ones never
    // qualify.
    if ext.len() > 3 {
        return ExtClass::Passthrough;
    }
    let mut lower = [0u8; 3];
    for (dst, src) in lower.iter_mut().zip(ext.bytes()) {
        *dst = src.to_ascii_lowercase();
    }
    let ext = &lower[..ext.len()];
    match ext {
        b"" | b"h" | b"hpp" | b"hxx" | b"inl" | b"inc" | b"mac" => ExtClass::CacheableRead,
        b"pch" if pch_caching => ExtClass::CacheableRead,
        b"pch" => ExtClass::CacheableAttr,
        b"dll" | b"exe" | b"rsp" | b"obj" | b"lib" | b"def" if linker => ExtClass::CacheableAttr,
        _ => ExtClass::Passthrough,
    }
}

fn extension_of(path: &str) -> &str {
    let name = path
        .rsplit(['\\', '/'])
        .next()
        .unwrap_or(path);
    match name.rfind('.') {
        // A leading dot is a dotfile, not an extension.
        Some(0) | None => "",
        Some(i) => &name[i + 1..],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_separators_and_dots() {
        assert_eq!(
            normalize_path("C:/sdk/./inc/../include/stdio.h", ""),
            r"C:\sdk\include\stdio.h"
        );
        assert_eq!(normalize_path(r"c:\x\\y\", ""), r"C:\x\y");
    }

    #[test]
    fn resolves_relative_against_base() {
        assert_eq!(
            normalize_path(r"obj\main.obj", r"C:\build"),
            r"C:\build\obj\main.obj"
        );
        assert_eq!(
            normalize_path(r"..\inc\a.h", r"C:\build\src"),
            r"C:\build\inc\a.h"
        );
    }

    #[test]
    fn keeps_unc_prefix() {
        assert_eq!(
            normalize_path(r"\\srv\share\a\..\b.h", ""),
            r"\\srv\share\b.h"
        );
    }

    #[test]
    fn extension_classes() {
        assert_eq!(classify_extension(r"C:\i\stdio.h", false, false), ExtClass::CacheableRead);
        assert_eq!(classify_extension(r"C:\i\vec.hpp", false, false), ExtClass::CacheableRead);
        assert_eq!(classify_extension(r"C:\i\Makefile", false, false), ExtClass::CacheableRead);
        assert_eq!(classify_extension(r"C:\i\x.pch", true, false), ExtClass::CacheableRead);
        assert_eq!(classify_extension(r"C:\i\x.pch", false, false), ExtClass::CacheableAttr);
        assert_eq!(classify_extension(r"C:\i\x.obj", false, true), ExtClass::CacheableAttr);
        assert_eq!(classify_extension(r"C:\i\x.obj", false, false), ExtClass::Passthrough);
        assert_eq!(classify_extension(r"C:\i\x.cpp", false, false), ExtClass::Passthrough);
        assert_eq!(classify_extension(r"C:\i\.gitignore", false, false), ExtClass::CacheableRead);
    }

    #[test]
    fn negative_entries_are_cached() {
        let mut cache = FsCache::new();
        let err = cache.lookup(r"Z:\definitely\missing.h", "").unwrap_err();
        assert_eq!(err, FsCacheError::NotFound);
        let before = cache.misses;
        let _ = cache.lookup(r"Z:\definitely\missing.h", "");
        assert_eq!(cache.misses, before);
    }

    #[test]
    fn user_data_typed_slots() {
        let mut cache = FsCache::new();
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.h");
        std::fs::write(&file, b"x").unwrap();
        let id = cache
            .lookup(&file.display().to_string().replace('/', "\\"), "")
            .unwrap();
        cache.set_user_data(id, Arc::new(42u32));
        cache.set_user_data(id, Arc::new("tool".to_owned()));
        assert_eq!(*cache.user_data::<u32>(id).unwrap(), 42);
        assert_eq!(*cache.user_data::<String>(id).unwrap(), "tool");
        cache.set_user_data(id, Arc::new(7u32));
        assert_eq!(*cache.user_data::<u32>(id).unwrap(), 7);
    }

    #[test]
    fn volatile_tree_revalidates_after_invalidate() {
        let mut cache = FsCache::new();
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().display().to_string().replace('/', "\\");
        cache.add_volatile_root(&root);
        let file = dir.path().join("t.h");
        std::fs::write(&file, b"one").unwrap();
        let path = file.display().to_string().replace('/', "\\");
        let id = cache.lookup(&path, "").unwrap();
        cache.set_user_data(id, Arc::new(1u32));

        // Same revision: no re-stat, user data survives.
        std::fs::write(&file, b"grown").unwrap();
        let _ = cache.lookup(&path, "").unwrap();
        assert!(cache.user_data::<u32>(id).is_some());

        // New job revision: stat changes, user data dropped.
        cache.invalidate_custom_both();
        let _ = cache.lookup(&path, "").unwrap();
        assert!(cache.user_data::<u32>(id).is_none());
    }
}
