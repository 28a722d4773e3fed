//! TLS index provisioning for manually mapped images.
//!
//! A manually mapped module never goes through the OS loader, so the OS
//! would not allocate an implicit-TLS index for it. The worker ships a set
//! of tiny helper DLLs in fixed size classes; loading one natively makes the
//! OS allocate a TLS block of that size and a real index, which the helper
//! reports back and the worker then wires into the mapped module's
//! `AddressOfIndex`. Instances are claimed for good: modules are cached for
//! the worker's lifetime.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TlsError {
    #[error("TLS block of {requested} bytes exceeds the largest helper ({largest} bytes)")]
    BlockTooLarge { requested: usize, largest: usize },
    #[error("all helper instances of the {class} byte class are in use")]
    ClassExhausted { class: usize },
    #[error("helper dll failed to load")]
    HelperLoadFailed,
}

/// (block size, shipped instances) per class.
const CLASSES: [(usize, usize); 4] = [
    (1024, 8),
    (64 * 1024, 4),
    (128 * 1024, 2),
    (512 * 1024, 1),
];

#[derive(Debug)]
struct Instance {
    in_use: bool,
    /// OS-allocated TLS index, captured on first load.
    index: Option<u32>,
}

#[derive(Debug)]
struct Class {
    size: usize,
    instances: Vec<Instance>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsAssignment {
    pub class_size: usize,
    pub instance: usize,
    pub index: u32,
}

#[derive(Debug)]
pub struct TlsHelperPool {
    classes: Vec<Class>,
}

impl Default for TlsHelperPool {
    fn default() -> Self {
        Self::new()
    }
}

impl TlsHelperPool {
    pub fn new() -> Self {
        TlsHelperPool {
            classes: CLASSES
                .iter()
                .map(|&(size, n)| Class {
                    size,
                    instances: (0..n)
                        .map(|_| Instance {
                            in_use: false,
                            index: None,
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    pub fn largest(&self) -> usize {
        self.classes.last().map_or(0, |c| c.size)
    }

    /// Claim the smallest free helper whose block fits `total_size` (raw TLS
    /// data plus zero fill).
    pub fn allocate(&mut self, total_size: usize) -> Result<TlsAssignment, TlsError> {
        let largest = self.largest();
        if total_size > largest {
            return Err(TlsError::BlockTooLarge {
                requested: total_size,
                largest,
            });
        }
        for class in &mut self.classes {
            if class.size < total_size {
                continue;
            }
            if let Some((i, inst)) = class
                .instances
                .iter_mut()
                .enumerate()
                .find(|(_, inst)| !inst.in_use)
            {
                let index = match inst.index {
                    Some(index) => index,
                    None => {
                        let index = sys::load_helper(class.size, i)
                            .ok_or(TlsError::HelperLoadFailed)?;
                        inst.index = Some(index);
                        index
                    }
                };
                inst.in_use = true;
                return Ok(TlsAssignment {
                    class_size: class.size,
                    instance: i,
                    index,
                });
            }
        }
        // Every class that fits is exhausted; report the tightest one.
        let class = self
            .classes
            .iter()
            .find(|c| c.size >= total_size)
            .map_or(largest, |c| c.size);
        Err(TlsError::ClassExhausted { class })
    }
}

#[cfg(windows)]
mod sys {
    use crate::win32::wide;
    use windows_sys::Win32::System::LibraryLoader::{GetProcAddress, LoadLibraryW};

    /// Load the helper of the given class/instance. The helper's DllMain
    /// stores its TLS index where the exported `KWorkerTlsIndex` points.
    pub fn load_helper(class_size: usize, instance: usize) -> Option<u32> {
        let name = format!("kWorkerTls{}K_{}.dll", class_size / 1024, instance);
        // SAFETY: plain load + export query; null-checked.
        unsafe {
            let module = LoadLibraryW(wide(&name).as_ptr());
            if module.is_null() {
                return None;
            }
            let sym = GetProcAddress(module, c"KWorkerTlsIndex".as_ptr() as *const u8)?;
            let index_ptr = sym as usize as *const u32;
            Some(*index_ptr)
        }
    }
}

#[cfg(not(windows))]
mod sys {
    use std::sync::atomic::{AtomicU32, Ordering};

    static NEXT_INDEX: AtomicU32 = AtomicU32::new(64);

    pub fn load_helper(_class_size: usize, _instance: usize) -> Option<u32> {
        Some(NEXT_INDEX.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smallest_fitting_class_wins() {
        let mut pool = TlsHelperPool::new();
        let small = pool.allocate(512).unwrap();
        assert_eq!(small.class_size, 1024);
        let medium = pool.allocate(10_000).unwrap();
        assert_eq!(medium.class_size, 64 * 1024);
        assert_ne!(small.index, medium.index);
    }

    #[test]
    fn instances_are_claimed_for_good() {
        let mut pool = TlsHelperPool::new();
        let a = pool.allocate(512 * 1024).unwrap();
        assert_eq!(a.class_size, 512 * 1024);
        // The single 512K instance is taken; the next request fails.
        assert_eq!(
            pool.allocate(200 * 1024).unwrap_err(),
            TlsError::ClassExhausted { class: 512 * 1024 }
        );
    }

    #[test]
    fn oversized_block_is_an_error() {
        let mut pool = TlsHelperPool::new();
        assert_eq!(
            pool.allocate(600 * 1024).unwrap_err(),
            TlsError::BlockTooLarge {
                requested: 600 * 1024,
                largest: 512 * 1024
            }
        );
    }

    #[test]
    fn exhausting_a_class_spills_upward() {
        let mut pool = TlsHelperPool::new();
        for _ in 0..8 {
            assert_eq!(pool.allocate(100).unwrap().class_size, 1024);
        }
        // Ninth small request lands in the next class up.
        assert_eq!(pool.allocate(100).unwrap().class_size, 64 * 1024);
    }
}
