//! Trackers for process-wide resources the sandboxed tool can leak.
//!
//! A compiler that exits through `exit()` never unwinds its allocations, so
//! everything it takes from the process — virtual memory, private heaps,
//! FLS/TLS indices, atexit registrations — is recorded here and reclaimed at
//! late cleanup. FLS indices are the critical ones: a leaked FLS callback
//! would fire during some later job's thread teardown and land in a dead
//! image.

use std::sync::Mutex;

use tracing::debug;

use crate::win32::mem;

/// One region handed out by the VirtualAlloc replacement.
#[derive(Debug, Clone, Copy)]
struct VirtualAllocation {
    base: usize,
    size: usize,
    /// Came from a pre-reserved fixed range; never returned to the OS.
    from_reserve: bool,
}

/// A pre-reserved address range serviced without the OS. cl.exe hard-codes
/// its PCH load addresses on 32-bit, so those ranges are grabbed at worker
/// start and handed back to matching requests.
#[derive(Debug, derive_new::new)]
pub struct FixedRange {
    pub base: usize,
    pub size: usize,
    #[new(default)]
    in_use: bool,
}

#[derive(Debug, Default)]
pub struct VirtualAllocTracker {
    allocs: Mutex<Vec<VirtualAllocation>>,
    fixed: Mutex<Vec<FixedRange>>,
}

impl VirtualAllocTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a fixed range (32-bit PCH region). The backing reservation is
    /// made once at worker start and lives until shutdown.
    pub fn add_fixed_range(&self, base: usize, size: usize) {
        self.fixed.lock().unwrap().push(FixedRange::new(base, size));
    }

    /// `VirtualAlloc` replacement core.
    pub fn alloc(&self, addr: usize, size: usize, _alloc_type: u32, protect: u32) -> Option<usize> {
        if addr != 0 {
            let mut fixed = self.fixed.lock().unwrap();
            if let Some(range) = fixed
                .iter_mut()
                .find(|r| !r.in_use && addr >= r.base && addr + size <= r.base + r.size)
            {
                range.in_use = true;
                return Some(addr);
            }
        }
        let base = sys::virtual_alloc(addr, size, protect)?;
        self.allocs.lock().unwrap().push(VirtualAllocation {
            base,
            size,
            from_reserve: false,
        });
        Some(base)
    }

    /// `VirtualFree(MEM_RELEASE)` replacement core.
    pub fn free(&self, base: usize, free_type: u32) -> bool {
        if free_type != mem::MEM_RELEASE {
            // MEM_DECOMMIT inside a tracked range is tolerated but the range
            // stays tracked.
            return true;
        }
        {
            let mut fixed = self.fixed.lock().unwrap();
            if let Some(range) = fixed.iter_mut().find(|r| r.in_use && r.base == base) {
                range.in_use = false;
                return true;
            }
        }
        let mut allocs = self.allocs.lock().unwrap();
        match allocs.iter().position(|a| a.base == base) {
            Some(i) => {
                let a = allocs.swap_remove(i);
                sys::virtual_free(a.base, a.size);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, base: usize) -> bool {
        self.allocs.lock().unwrap().iter().any(|a| a.base == base)
            || self
                .fixed
                .lock()
                .unwrap()
                .iter()
                .any(|r| r.in_use && r.base == base)
    }

    /// Late cleanup: release whatever the tool leaked. Fixed ranges are only
    /// marked free; their reservation persists.
    pub fn reclaim(&self) -> usize {
        let mut allocs = self.allocs.lock().unwrap();
        let n = allocs.len();
        for a in allocs.drain(..) {
            debug_assert!(!a.from_reserve);
            sys::virtual_free(a.base, a.size);
        }
        for range in self.fixed.lock().unwrap().iter_mut() {
            range.in_use = false;
        }
        if n > 0 {
            debug!(leaked = n, "reclaimed leaked virtual allocations");
        }
        n
    }
}

/// Private heaps created by a statically linked tool.
#[derive(Debug, Default)]
pub struct HeapTracker {
    heaps: Mutex<Vec<usize>>,
}

impl HeapTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, initial_size: usize, max_size: usize) -> Option<usize> {
        let handle = sys::heap_create(initial_size, max_size)?;
        self.heaps.lock().unwrap().push(handle);
        Some(handle)
    }

    pub fn destroy(&self, handle: usize) -> bool {
        let mut heaps = self.heaps.lock().unwrap();
        match heaps.iter().position(|&h| h == handle) {
            Some(i) => {
                heaps.swap_remove(i);
                sys::heap_destroy(handle);
                true
            }
            None => false,
        }
    }

    pub fn reclaim(&self) -> usize {
        let mut heaps = self.heaps.lock().unwrap();
        let n = heaps.len();
        for h in heaps.drain(..) {
            sys::heap_destroy(h);
        }
        n
    }
}

/// Which index namespace a slot tracker covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Fls,
    Tls,
}

/// FLS/TLS indices handed to the executable image. Tracked so the index —
/// and, for FLS, its registered destructor callback — dies with the job.
#[derive(Debug)]
pub struct SlotTracker {
    kind: SlotKind,
    slots: Mutex<Vec<u32>>,
}

impl SlotTracker {
    pub fn new(kind: SlotKind) -> Self {
        SlotTracker {
            kind,
            slots: Mutex::new(Vec::new()),
        }
    }

    pub fn alloc(&self, callback: usize) -> Option<u32> {
        let index = sys::slot_alloc(self.kind, callback)?;
        self.slots.lock().unwrap().push(index);
        Some(index)
    }

    pub fn free(&self, index: u32) -> bool {
        let mut slots = self.slots.lock().unwrap();
        match slots.iter().position(|&i| i == index) {
            Some(at) => {
                slots.swap_remove(at);
                sys::slot_free(self.kind, index);
                true
            }
            None => false,
        }
    }

    pub fn is_tracked(&self, index: u32) -> bool {
        self.slots.lock().unwrap().contains(&index)
    }

    pub fn reclaim(&self) -> usize {
        let mut slots = self.slots.lock().unwrap();
        let n = slots.len();
        for index in slots.drain(..) {
            sys::slot_free(self.kind, index);
        }
        n
    }
}

/// Callback signature for `atexit`/`_onexit` registrations.
pub type AtExitFn = unsafe extern "C" fn();

/// The sandbox-local atexit list, replacing the CRT's process-level one so a
/// tool's destructors run at its own job end instead of at worker exit.
#[derive(Debug, Default)]
pub struct AtExitList {
    callbacks: Mutex<Vec<AtExitFn>>,
}

impl AtExitList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, f: AtExitFn) {
        self.callbacks.lock().unwrap().push(f);
    }

    pub fn len(&self) -> usize {
        self.callbacks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.lock().unwrap().is_empty()
    }

    /// Run registrations LIFO. Each callback is fenced so one crashing
    /// destructor does not take the remaining ones with it.
    pub fn run_and_clear(&self) -> usize {
        let callbacks: Vec<AtExitFn> = {
            let mut list = self.callbacks.lock().unwrap();
            list.drain(..).collect()
        };
        let n = callbacks.len();
        for f in callbacks.into_iter().rev() {
            let r = std::panic::catch_unwind(|| {
                // SAFETY: registered by the tool as a no-arg C callback.
                unsafe { f() }
            });
            if r.is_err() {
                debug!("atexit callback raised; continuing with the rest");
            }
        }
        n
    }
}

#[cfg(windows)]
mod sys {
    use super::SlotKind;
    use crate::win32::mem;
    use windows_sys::Win32::System::Memory::{
        HeapCreate, HeapDestroy, VirtualAlloc, VirtualFree, MEM_RELEASE,
    };
    use windows_sys::Win32::System::Threading::{
        FlsAlloc, FlsFree, TlsAlloc, TlsFree, FLS_OUT_OF_INDEXES, TLS_OUT_OF_INDEXES,
    };

    pub fn virtual_alloc(addr: usize, size: usize, protect: u32) -> Option<usize> {
        // SAFETY: plain reservation+commit; a null return is handled.
        let p = unsafe {
            VirtualAlloc(
                addr as *const _,
                size,
                mem::MEM_COMMIT | mem::MEM_RESERVE,
                protect,
            )
        };
        (!p.is_null()).then_some(p as usize)
    }

    pub fn virtual_free(base: usize, _size: usize) {
        // SAFETY: base came from VirtualAlloc.
        unsafe { VirtualFree(base as *mut _, 0, MEM_RELEASE) };
    }

    pub fn heap_create(initial_size: usize, max_size: usize) -> Option<usize> {
        // SAFETY: plain heap creation.
        let h = unsafe { HeapCreate(0, initial_size, max_size) };
        (!h.is_null()).then_some(h as usize)
    }

    pub fn heap_destroy(handle: usize) {
        // SAFETY: handle came from HeapCreate.
        unsafe { HeapDestroy(handle as *mut _) };
    }

    pub fn slot_alloc(kind: SlotKind, callback: usize) -> Option<u32> {
        // SAFETY: the callback pointer is whatever the tool registered; the
        // OS calls it with the documented signature.
        unsafe {
            match kind {
                SlotKind::Fls => {
                    let cb = (callback != 0).then(|| std::mem::transmute(callback));
                    let i = FlsAlloc(cb);
                    (i != FLS_OUT_OF_INDEXES).then_some(i)
                }
                SlotKind::Tls => {
                    let i = TlsAlloc();
                    (i != TLS_OUT_OF_INDEXES).then_some(i)
                }
            }
        }
    }

    pub fn slot_free(kind: SlotKind, index: u32) {
        // SAFETY: index came from the matching alloc.
        unsafe {
            match kind {
                SlotKind::Fls => FlsFree(index),
                SlotKind::Tls => TlsFree(index),
            }
        };
    }
}

#[cfg(not(windows))]
mod sys {
    //! Host-neutral backing: page-aligned heap blocks and counter-issued
    //! indices, so the tracking logic runs everywhere.

    use std::alloc::{alloc_zeroed, dealloc, Layout};
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::SlotKind;

    const PAGE: usize = 4096;

    pub fn virtual_alloc(_addr: usize, size: usize, _protect: u32) -> Option<usize> {
        let layout = Layout::from_size_align(size.max(1), PAGE).ok()?;
        // SAFETY: non-zero size, valid alignment.
        let p = unsafe { alloc_zeroed(layout) };
        (!p.is_null()).then_some(p as usize)
    }

    pub fn virtual_free(base: usize, size: usize) {
        let layout = Layout::from_size_align(size.max(1), PAGE).unwrap();
        // SAFETY: base/layout match the allocation above.
        unsafe { dealloc(base as *mut u8, layout) };
    }

    static NEXT_HEAP: AtomicU32 = AtomicU32::new(0x4000);

    pub fn heap_create(_initial_size: usize, _max_size: usize) -> Option<usize> {
        Some(NEXT_HEAP.fetch_add(4, Ordering::Relaxed) as usize)
    }

    pub fn heap_destroy(_handle: usize) {}

    static NEXT_SLOT: AtomicU32 = AtomicU32::new(1);

    pub fn slot_alloc(_kind: SlotKind, _callback: usize) -> Option<u32> {
        Some(NEXT_SLOT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn slot_free(_kind: SlotKind, _index: u32) {}
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn leaked_virtual_allocs_are_reclaimed() {
        let tracker = VirtualAllocTracker::new();
        let a = tracker.alloc(0, 8192, mem::MEM_COMMIT, mem::PAGE_READWRITE).unwrap();
        let b = tracker.alloc(0, 4096, mem::MEM_COMMIT, mem::PAGE_READWRITE).unwrap();
        assert!(tracker.contains(a));
        assert!(tracker.free(a, mem::MEM_RELEASE));
        assert!(!tracker.contains(a));
        assert!(tracker.contains(b));
        assert_eq!(tracker.reclaim(), 1);
        assert!(!tracker.contains(b));
        assert_eq!(tracker.reclaim(), 0);
    }

    #[test]
    fn freeing_unknown_base_fails() {
        let tracker = VirtualAllocTracker::new();
        assert!(!tracker.free(0xdead_0000, mem::MEM_RELEASE));
    }

    #[test]
    fn fixed_range_serviced_from_reserve() {
        let tracker = VirtualAllocTracker::new();
        tracker.add_fixed_range(0x2000_0000, 0x0100_0000);
        let got = tracker
            .alloc(0x2000_0000, 0x10_0000, mem::MEM_RESERVE, mem::PAGE_READWRITE)
            .unwrap();
        assert_eq!(got, 0x2000_0000);
        // The range is busy until freed.
        let next = tracker.alloc(0x2000_0000, 0x1000, mem::MEM_RESERVE, mem::PAGE_READWRITE);
        assert_ne!(next, Some(0x2000_0000));
        assert!(tracker.free(0x2000_0000, mem::MEM_RELEASE));
        let again = tracker
            .alloc(0x2000_0000, 0x1000, mem::MEM_RESERVE, mem::PAGE_READWRITE)
            .unwrap();
        assert_eq!(again, 0x2000_0000);
        tracker.reclaim();
    }

    #[test]
    fn heap_lifecycle() {
        let heaps = HeapTracker::new();
        let h = heaps.create(0x1000, 0).unwrap();
        assert!(heaps.destroy(h));
        assert!(!heaps.destroy(h));
        let _leaked = heaps.create(0x1000, 0).unwrap();
        assert_eq!(heaps.reclaim(), 1);
    }

    #[test]
    fn slot_tracking() {
        let fls = SlotTracker::new(SlotKind::Fls);
        let a = fls.alloc(0).unwrap();
        let b = fls.alloc(0).unwrap();
        assert!(fls.is_tracked(a));
        assert!(fls.free(a));
        assert!(!fls.is_tracked(a));
        assert!(!fls.free(a));
        assert!(fls.is_tracked(b));
        assert_eq!(fls.reclaim(), 1);
    }

    static ORDER: AtomicUsize = AtomicUsize::new(0);
    static FIRST_RAN_AT: AtomicUsize = AtomicUsize::new(0);
    static SECOND_RAN_AT: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn first() {
        FIRST_RAN_AT.store(ORDER.fetch_add(1, Ordering::SeqCst) + 1, Ordering::SeqCst);
    }

    unsafe extern "C" fn second() {
        SECOND_RAN_AT.store(ORDER.fetch_add(1, Ordering::SeqCst) + 1, Ordering::SeqCst);
    }

    #[test]
    fn atexit_runs_lifo_and_clears() {
        let list = AtExitList::new();
        list.register(first);
        list.register(second);
        assert_eq!(list.run_and_clear(), 2);
        // Registered first, so it runs last.
        assert!(FIRST_RAN_AT.load(Ordering::SeqCst) > SECOND_RAN_AT.load(Ordering::SeqCst));
        assert!(list.is_empty());
        assert_eq!(list.run_and_clear(), 0);
    }
}
