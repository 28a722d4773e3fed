//! Table of intercepted HANDLE values.
//!
//! Every handle the interception layer fabricates or takes over lives here,
//! keyed by the handle value's index bits. Entries are type tagged so one
//! `CloseHandle`/`ReadFile` replacement can serve cached files, temp files,
//! section mappings and the output streams alike. A single mutex guards the
//! table structure; the rare off-thread visitors (the tolerated linker debug
//! thread, TLS destructors) are caught misusing an entry by the owner-thread
//! mark.

use std::sync::{Arc, Mutex};
use std::thread::ThreadId;

use crate::file_cache::CachedFile;
use crate::output::StdStream;
use crate::temp_store::TempFile;
use crate::win32::RawHandle;

#[derive(Debug, Clone)]
pub enum HandleData {
    /// Read-only file served from the cached-file store.
    CachedFile(Arc<CachedFile>),
    /// Section handle over a cached file.
    CachedMapping(Arc<CachedFile>),
    /// In-memory temp file.
    TempFile(Arc<Mutex<TempFile>>),
    /// Section handle over a temp file.
    TempMapping(Arc<Mutex<TempFile>>),
    /// One of the buffered standard streams.
    Output(StdStream),
}

#[derive(Debug)]
pub struct HandleEntry {
    pub handle: RawHandle,
    pub refs: u32,
    /// Current file pointer for file-backed entries.
    pub offset: u64,
    pub access: u32,
    /// Fixed entries (stdout/stderr) survive jobs and refuse close.
    pub fixed: bool,
    /// Extra handle values registered via DuplicateHandle.
    aliases: Vec<RawHandle>,
    owner: Option<ThreadId>,
    pub data: HandleData,
}

impl HandleEntry {
    pub fn new(handle: RawHandle, access: u32, data: HandleData) -> Self {
        HandleEntry {
            handle,
            refs: 1,
            offset: 0,
            access,
            fixed: false,
            aliases: Vec::new(),
            owner: None,
            data,
        }
    }

    pub fn fixed(handle: RawHandle, data: HandleData) -> Self {
        HandleEntry {
            fixed: true,
            ..Self::new(handle, crate::win32::file::GENERIC_WRITE, data)
        }
    }

    fn answers_to(&self, handle: RawHandle) -> bool {
        self.handle == handle || self.aliases.contains(&handle)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum CloseResult {
    /// Refcount dropped to zero; the entry is gone.
    Freed,
    /// Still referenced (or fixed); the caller reports success regardless.
    StillOpen,
    /// Not an intercepted handle.
    NotOurs,
}

type Slot = Option<Arc<Mutex<HandleEntry>>>;

#[derive(Debug)]
pub struct HandleTable {
    slots: Mutex<Vec<Slot>>,
    pub high_water: Mutex<usize>,
}

const INITIAL_SLOTS: usize = 64;

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        HandleTable {
            slots: Mutex::new(vec![None; INITIAL_SLOTS]),
            high_water: Mutex::new(0),
        }
    }

    /// Register `entry` under its handle value. Two live entries with the
    /// same index bits mean the table lost track of a close; that is not
    /// recoverable.
    pub fn enter(&self, entry: HandleEntry) {
        let idx = entry.handle.table_index();
        let mut slots = self.slots.lock().unwrap();
        while idx >= slots.len() {
            // Doubling growth keeps previously handed out indices stable.
            let new_len = slots.len() * 2;
            slots.resize(new_len, None);
        }
        assert!(
            slots[idx].is_none(),
            "handle table slot {idx} already occupied (handle {})",
            entry.handle
        );
        slots[idx] = Some(Arc::new(Mutex::new(entry)));
        let live = slots.iter().filter(|s| s.is_some()).count();
        let mut hw = self.high_water.lock().unwrap();
        *hw = (*hw).max(live);
    }

    fn slot(&self, handle: RawHandle) -> Option<Arc<Mutex<HandleEntry>>> {
        let idx = handle.table_index();
        let slots = self.slots.lock().unwrap();
        let entry = slots.get(idx)?.as_ref()?;
        // The record knows its handle values; colliding index bits from a
        // foreign handle must not alias.
        if !entry.lock().unwrap().answers_to(handle) {
            return None;
        }
        Some(Arc::clone(entry))
    }

    /// Is `handle` one of ours? No ownership change.
    pub fn lookup(&self, handle: RawHandle) -> Option<HandleData> {
        let entry = self.slot(handle)?;
        let entry = entry.lock().unwrap();
        Some(entry.data.clone())
    }

    /// Run `f` against the entry, holding the per-entry lock and the owner
    /// mark for the duration.
    pub fn with_entry<R>(
        &self,
        handle: RawHandle,
        f: impl FnOnce(&mut HandleEntry) -> R,
    ) -> Option<R> {
        let entry = self.slot(handle)?;
        let mut entry = entry.lock().unwrap();
        let me = std::thread::current().id();
        debug_assert!(
            entry.owner.is_none(),
            "handle {} used concurrently", entry.handle
        );
        entry.owner = Some(me);
        let r = f(&mut entry);
        entry.owner = None;
        Some(r)
    }

    /// Intercepted `DuplicateHandle`: register `dup` as a second name for
    /// the record behind `src`.
    pub fn duplicate(&self, src: RawHandle, dup: RawHandle) -> bool {
        let Some(entry) = self.slot(src) else {
            return false;
        };
        {
            let mut locked = entry.lock().unwrap();
            locked.refs += 1;
            locked.aliases.push(dup);
        }
        let idx = dup.table_index();
        let mut slots = self.slots.lock().unwrap();
        while idx >= slots.len() {
            let new_len = slots.len() * 2;
            slots.resize(new_len, None);
        }
        assert!(slots[idx].is_none(), "duplicate handle slot collision");
        // The duplicate shares the record: offset, refs and payload are one.
        slots[idx] = Some(entry);
        true
    }

    /// Intercepted `CloseHandle`.
    pub fn close(&self, handle: RawHandle) -> CloseResult {
        let idx = handle.table_index();
        let mut slots = self.slots.lock().unwrap();
        let Some(Some(entry)) = slots.get(idx) else {
            return CloseResult::NotOurs;
        };
        let entry = Arc::clone(entry);
        let mut locked = entry.lock().unwrap();
        if !locked.answers_to(handle) {
            return CloseResult::NotOurs;
        }
        if locked.fixed {
            // Tools close stdout now and then; the fixed streams ignore it.
            return CloseResult::StillOpen;
        }
        locked.refs -= 1;
        locked.aliases.retain(|&a| a != handle);
        let freed = locked.refs == 0;
        drop(locked);
        slots[idx] = None;
        if freed {
            CloseResult::Freed
        } else {
            CloseResult::StillOpen
        }
    }

    /// Late cleanup: pull every non-fixed entry out of the table. Returns
    /// the reaped payloads so the caller can release backing resources.
    pub fn reap_leaked(&self) -> Vec<HandleEntry> {
        let mut slots = self.slots.lock().unwrap();
        let mut taken: Vec<Arc<Mutex<HandleEntry>>> = Vec::new();
        for slot in slots.iter_mut() {
            let fixed = match slot {
                Some(e) => e.lock().unwrap().fixed,
                None => continue,
            };
            if fixed {
                continue;
            }
            let arc = slot.take().unwrap();
            // A duplicated record sits in several slots; keep one copy.
            if !taken.iter().any(|s| Arc::ptr_eq(s, &arc)) {
                taken.push(arc);
            }
        }
        drop(slots);
        taken
            .into_iter()
            .filter_map(|a| Arc::try_unwrap(a).ok())
            .map(|m| m.into_inner().unwrap())
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file() -> Arc<Mutex<TempFile>> {
        let mut store = crate::temp_store::TempStore::new();
        match store.create(r"C:\T\_CL_01234567ab", crate::win32::file::CREATE_ALWAYS) {
            crate::temp_store::CreateOutcome::Opened(f) => f,
            _ => unreachable!(),
        }
    }

    #[test]
    fn enter_lookup_close() {
        let table = HandleTable::new();
        let h = RawHandle(0x44);
        table.enter(HandleEntry::new(
            h,
            crate::win32::file::GENERIC_READ,
            HandleData::TempFile(temp_file()),
        ));
        assert!(matches!(table.lookup(h), Some(HandleData::TempFile(_))));
        assert_eq!(table.close(h), CloseResult::Freed);
        assert!(table.lookup(h).is_none());
        assert_eq!(table.close(h), CloseResult::NotOurs);
    }

    #[test]
    fn foreign_handles_do_not_alias() {
        let table = HandleTable::new();
        let ours = RawHandle(0x44);
        table.enter(HandleEntry::new(
            ours,
            0,
            HandleData::TempFile(temp_file()),
        ));
        // Same index bits, different value (pseudo bit set).
        assert!(table.lookup(RawHandle(0x8000_0044)).is_none());
    }

    #[test]
    fn growth_keeps_existing_entries() {
        let table = HandleTable::new();
        let low = RawHandle(0x10);
        table.enter(HandleEntry::new(low, 0, HandleData::Output(StdStream::Out)));
        // Index beyond the initial capacity forces doubling.
        let high = RawHandle((INITIAL_SLOTS * 8) + 4);
        table.enter(HandleEntry::new(high, 0, HandleData::Output(StdStream::Err)));
        assert!(table.lookup(low).is_some());
        assert!(table.lookup(high).is_some());
    }

    #[test]
    fn fixed_entries_refuse_close_and_survive_reap() {
        let table = HandleTable::new();
        let out = RawHandle(0x1C);
        table.enter(HandleEntry::fixed(out, HandleData::Output(StdStream::Out)));
        assert_eq!(table.close(out), CloseResult::StillOpen);
        table.enter(HandleEntry::new(
            RawHandle(0x20),
            0,
            HandleData::TempFile(temp_file()),
        ));
        let reaped = table.reap_leaked();
        assert_eq!(reaped.len(), 1);
        assert!(table.lookup(out).is_some());
        assert_eq!(table.live_count(), 1);
    }

    #[test]
    fn duplicate_shares_the_record() {
        let table = HandleTable::new();
        let a = RawHandle(0x30);
        let b = RawHandle(0x34);
        table.enter(HandleEntry::new(a, 0, HandleData::TempFile(temp_file())));
        assert!(table.duplicate(a, b));
        table.with_entry(a, |e| e.offset = 123).unwrap();
        assert_eq!(table.with_entry(b, |e| e.offset).unwrap(), 123);
        // Closing one name keeps the record alive through the other.
        assert_eq!(table.close(a), CloseResult::StillOpen);
        assert_eq!(table.close(b), CloseResult::Freed);
    }

    #[test]
    fn with_entry_updates_offset() {
        let table = HandleTable::new();
        let h = RawHandle(0x50);
        table.enter(HandleEntry::new(h, 0, HandleData::TempFile(temp_file())));
        table.with_entry(h, |e| e.offset = 512).unwrap();
        assert_eq!(table.with_entry(h, |e| e.offset).unwrap(), 512);
        assert!(table.with_entry(RawHandle(0x54), |_| ()).is_none());
    }
}
