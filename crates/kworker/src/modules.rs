//! Module registry: every PE image the worker has loaded, ever.
//!
//! Modules are loaded once and cached for the life of the worker; FreeLibrary
//! is deliberately a no-op. System DLLs load natively through the OS loader;
//! the tool's own images are mapped manually so their writable state can be
//! reset between jobs from a virgin copy. A whitelisted set of toolchain
//! DLLs loads natively but still gets its import table patched.
//!
//! Modules refer to each other by registry index, which keeps the import
//! graph simple even when api-set forwarders make it cyclic.

use ahash::RandomState;
use thiserror::Error;
use tracing::{debug, trace};

use crate::pe::image::{self, ImageMem, ImportSymbol, ResetPlan};
use crate::pe::tls::{TlsAssignment, TlsError, TlsHelperPool};
use crate::pe::{seh, PeError, PeFile, RuntimeFunction};

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("cannot open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: {source}")]
    BadImage {
        path: String,
        #[source]
        source: PeError,
    },
    #[error("{path}: image memory allocation of {size} bytes failed")]
    NoImageMemory { path: String, size: usize },
    #[error("{path}: import {symbol} from {dll} not resolved")]
    ImportNotFound {
        path: String,
        dll: String,
        symbol: String,
    },
    #[error("{path}: native load failed")]
    NativeLoadFailed { path: String },
    #[error("{path}: TLS setup failed: {source}")]
    Tls {
        path: String,
        #[source]
        source: TlsError,
    },
    #[error("{path}: module initialization failed")]
    InitFailed { path: String },
    #[error("too many CRT instances (limit {0})")]
    CrtSlotsExhausted(usize),
}

/// How a module gets into the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPolicy {
    /// OS loader, untouched.
    Native,
    /// OS loader, then IAT patched with the native replacement set.
    NativePatched,
    /// Manually mapped, full replacement set, reset between jobs.
    Manual,
}

/// Classify a dependency by name, per the worker's loading rules.
pub fn classify(dll_name: &str) -> LoadPolicy {
    let lower = dll_name.to_ascii_lowercase();
    let stem = lower.strip_suffix(".dll").unwrap_or(&lower);

    // Api-set forwarders and OS DLLs stay native; the CRT forwarders among
    // them still need patching.
    if stem.starts_with("api-ms-win-crt-") {
        return LoadPolicy::NativePatched;
    }
    if stem.starts_with("api-ms-") || stem.starts_with("ext-ms-") {
        return LoadPolicy::Native;
    }
    const PATCHED_PREFIXES: &[&str] = &["msvc", "msdis", "mspdb", "vcruntime", "ucrtbase"];
    if PATCHED_PREFIXES.iter().any(|p| stem.starts_with(p)) {
        return LoadPolicy::NativePatched;
    }
    const NATIVE: &[&str] = &[
        "kernel32", "kernelbase", "ntdll", "user32", "advapi32", "shell32", "ole32",
        "oleaut32", "rpcrt4", "ws2_32", "crypt32", "bcrypt", "imagehlp", "dbghelp", "version",
    ];
    if NATIVE.contains(&stem) {
        return LoadPolicy::Native;
    }
    LoadPolicy::Manual
}

/// Is this a virtual api-set name (`api-ms-*`, `ext-ms-*`)?
pub fn is_virtual_api(dll_name: &str) -> bool {
    let lower = dll_name.to_ascii_lowercase();
    lower.starts_with("api-ms-") || lower.starts_with("ext-ms-")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ModuleState {
    NeedsBits,
    NeedsInit,
    BeingInited,
    InitFailed,
    Ready,
}

/// Manual-layout pieces of a mapped module.
#[derive(Debug)]
pub struct ManualImage {
    pub mem: ImageMem,
    /// Post-relocation, pre-execution snapshot.
    pub virgin: Vec<u8>,
    pub plan: ResetPlan,
    pub entry_rva: u32,
    pub function_table: Vec<RuntimeFunction>,
    pub tls: Option<TlsWiring>,
}

#[derive(Debug)]
pub struct TlsWiring {
    pub assignment: TlsAssignment,
    /// Rva of the module's TLS index variable.
    pub index_rva: u32,
    /// Raw TLS init data (copied out of the image).
    pub init_data: Vec<u8>,
    pub zero_fill: u32,
    /// Image addresses of TLS callbacks.
    pub callbacks: Vec<usize>,
}

#[derive(Debug)]
pub enum Backing {
    Native {
        os_handle: usize,
    },
    Manual(Box<ManualImage>),
}

#[derive(Debug)]
pub struct Module {
    /// Canonical backslash path (or bare name for native system DLLs).
    pub path: String,
    pub path_wide: Vec<u16>,
    /// Offset of the file name within `path`.
    pub base_name_at: usize,
    pub policy: LoadPolicy,
    pub is_executable: bool,
    pub refs: u32,
    pub backing: Backing,
    pub state: ModuleState,
    /// State a job reset rewinds to; READY natives stay READY, manual
    /// modules go back to NEEDS_BITS.
    pub reinit_state: ModuleState,
    pub crt_slot: Option<u8>,
    pub imports: Vec<ModuleId>,
    /// For virtual api-set modules: the module actually implementing the
    /// exports.
    pub virtual_api_target: Option<ModuleId>,
}

impl Module {
    pub fn base_name(&self) -> &str {
        &self.path[self.base_name_at..]
    }

    /// The handle value the tool sees for this module.
    pub fn os_handle(&self) -> usize {
        match &self.backing {
            Backing::Native { os_handle } => *os_handle,
            Backing::Manual(img) => img.mem.base(),
        }
    }

    pub fn is_manual(&self) -> bool {
        matches!(self.backing, Backing::Manual(_))
    }
}

/// One CRT instance the interception layer can route allocations through.
#[derive(Debug, Clone, Copy)]
pub struct CrtSlot {
    pub module: ModuleId,
    pub malloc: usize,
    pub beginthreadex: usize,
}

pub const MAX_CRT_SLOTS: usize = 32;

/// Resolves an import to a replacement pointer, or declines and lets the
/// dependency's own export win. Implemented by the replacement tables.
/// `dll_crt_slot` is the CRT slot of the dependency being imported from,
/// when it has one, so slot-array replacements can pick their variant.
pub trait ImportResolver {
    fn resolve(
        &self,
        importing_is_executable: bool,
        dll_crt_slot: Option<u8>,
        dll: &str,
        symbol: &ImportSymbol,
    ) -> Option<usize>;
}

/// Resolver that never replaces anything; tests and plain loads use it.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoReplacements;

impl ImportResolver for NoReplacements {
    fn resolve(
        &self,
        _exe: bool,
        _slot: Option<u8>,
        _dll: &str,
        _symbol: &ImportSymbol,
    ) -> Option<usize> {
        None
    }
}

const HASH_BUCKETS: usize = 127;

#[derive(Debug)]
pub struct ModuleRegistry {
    modules: Vec<Module>,
    /// Insertion order is load order; this is the global module list.
    buckets: [Vec<ModuleId>; HASH_BUCKETS],
    hasher: RandomState,
    pub tls_pool: TlsHelperPool,
    crt_slots: Vec<CrtSlot>,
    pub modules_reset: u64,
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleRegistry {
    pub fn new() -> Self {
        ModuleRegistry {
            modules: Vec::new(),
            buckets: std::array::from_fn(|_| Vec::new()),
            hasher: RandomState::new(),
            tls_pool: TlsHelperPool::new(),
            crt_slots: Vec::new(),
            modules_reset: 0,
        }
    }

    fn bucket_of(&self, path_lower: &str) -> usize {
        (self.hasher.hash_one(path_lower) % HASH_BUCKETS as u64) as usize
    }

    pub fn get(&self, id: ModuleId) -> &Module {
        &self.modules[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: ModuleId) -> &mut Module {
        &mut self.modules[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn iter_ids(&self) -> impl Iterator<Item = ModuleId> {
        (0..self.modules.len() as u32).map(ModuleId)
    }

    pub fn crt_slot(&self, slot: u8) -> Option<&CrtSlot> {
        self.crt_slots.get(slot as usize)
    }

    /// Find a loaded module by canonical path (ASCII case-insensitive).
    pub fn find_by_path(&self, path: &str) -> Option<ModuleId> {
        let lower = path.to_ascii_lowercase();
        let bucket = &self.buckets[self.bucket_of(&lower)];
        bucket
            .iter()
            .copied()
            .find(|&id| self.get(id).path.eq_ignore_ascii_case(path))
    }

    /// Find a module by the handle value the tool sees.
    pub fn find_by_handle(&self, handle: usize) -> Option<ModuleId> {
        self.iter_ids().find(|&id| {
            self.get(id).os_handle() == handle && self.get(id).virtual_api_target.is_none()
        })
    }

    fn insert(&mut self, module: Module) -> ModuleId {
        let id = ModuleId(self.modules.len() as u32);
        let bucket = self.bucket_of(&module.path.to_ascii_lowercase());
        self.modules.push(module);
        self.buckets[bucket].push(id);
        id
    }

    /// Load (or fetch) a module natively via the OS loader.
    pub fn load_native(&mut self, name: &str, patched: bool) -> Result<ModuleId, LoaderError> {
        if let Some(id) = self.find_by_path(name) {
            self.get_mut(id).refs += 1;
            return Ok(id);
        }
        let os_handle = sys::load_library(name).ok_or_else(|| LoaderError::NativeLoadFailed {
            path: name.to_owned(),
        })?;
        let base_name_at = name.rfind('\\').map_or(0, |i| i + 1);
        let is_crt = {
            let stem = name[base_name_at..].to_ascii_lowercase();
            stem.starts_with("ucrtbase")
                || stem.starts_with("msvcr")
                || stem.starts_with("api-ms-win-crt-heap")
        };
        let id = self.insert(Module {
            path: name.to_owned(),
            path_wide: crate::win32::wide(name),
            base_name_at,
            policy: if patched {
                LoadPolicy::NativePatched
            } else {
                LoadPolicy::Native
            },
            is_executable: false,
            refs: 1,
            backing: Backing::Native { os_handle },
            state: ModuleState::Ready,
            reinit_state: ModuleState::Ready,
            crt_slot: None,
            imports: Vec::new(),
            virtual_api_target: None,
        });
        #[cfg(windows)]
        if patched {
            // Whitelisted natives still route their file/console/exit calls
            // through the sandbox.
            match crate::replace::patch_native_iat(os_handle) {
                Ok(n) => debug!(name, patched_slots = n, "rewrote native IAT"),
                Err(err) => debug!(name, %err, "native IAT patch skipped"),
            }
        }
        if patched && is_crt && self.crt_slots.len() < MAX_CRT_SLOTS {
            // A native CRT instance still gets a slot so wrappers can route
            // allocations into it.
            if let Some(malloc) = sys::get_proc_address(os_handle, "malloc") {
                let beginthreadex = sys::get_proc_address(os_handle, "_beginthreadex").unwrap_or(0);
                let slot = self.crt_slots.len() as u8;
                self.crt_slots.push(CrtSlot {
                    module: id,
                    malloc,
                    beginthreadex,
                });
                self.get_mut(id).crt_slot = Some(slot);
            }
        }
        debug!(name, patched, "loaded native module");
        Ok(id)
    }

    /// Register a virtual api-set module forwarding to `target`.
    pub fn load_virtual_api(&mut self, name: &str, target: ModuleId) -> ModuleId {
        let normalized = name.to_ascii_lowercase();
        if let Some(id) = self.find_by_path(&normalized) {
            return id;
        }
        let os_handle = self.get(target).os_handle();
        let id = self.insert(Module {
            path_wide: crate::win32::wide(&normalized),
            base_name_at: 0,
            path: normalized,
            policy: LoadPolicy::Native,
            is_executable: false,
            refs: 1,
            backing: Backing::Native { os_handle },
            state: ModuleState::Ready,
            reinit_state: ModuleState::Ready,
            crt_slot: None,
            imports: vec![target],
            virtual_api_target: Some(target),
        });
        id
    }

    /// Manually map `path` and resolve its import closure.
    pub fn load_manual(
        &mut self,
        path: &str,
        is_executable: bool,
        resolver: &dyn ImportResolver,
    ) -> Result<ModuleId, LoaderError> {
        if let Some(id) = self.find_by_path(path) {
            self.get_mut(id).refs += 1;
            return Ok(id);
        }
        let native_path = if cfg!(windows) {
            path.to_owned()
        } else {
            path.replace('\\', "/")
        };
        let file_bytes = std::fs::read(&native_path).map_err(|source| LoaderError::Open {
            path: path.to_owned(),
            source,
        })?;
        self.load_manual_bytes(path, &file_bytes, is_executable, resolver)
    }

    /// The mapping pipeline proper, split out so the executable's statically
    /// reserved buffer path and tests can feed bytes directly.
    pub fn load_manual_bytes(
        &mut self,
        path: &str,
        file_bytes: &[u8],
        is_executable: bool,
        resolver: &dyn ImportResolver,
    ) -> Result<ModuleId, LoaderError> {
        let bad = |source| LoaderError::BadImage {
            path: path.to_owned(),
            source,
        };
        let pe = PeFile::parse(file_bytes).map_err(bad)?;
        if !pe.machine_matches_host() {
            return Err(bad(PeError::ArchMismatch(pe.machine())));
        }

        let size = pe.size_of_image() as usize;
        if size > 512 * 1024 * 1024 {
            return Err(bad(PeError::BadDirectory("image size")));
        }
        let mut mem =
            ImageMem::allocate(size, pe.image_base()).ok_or_else(|| LoaderError::NoImageMemory {
                path: path.to_owned(),
                size,
            })?;
        let base = mem.base();
        image::map_sections(&pe, mem.bytes_mut()).map_err(bad)?;

        let delta = base as i64 - pe.image_base() as i64;
        if delta != 0 {
            image::apply_relocations(&pe, mem.bytes_mut(), delta).map_err(bad)?;
        }

        // Reserve our slot before recursing so import cycles terminate.
        let base_name_at = path.rfind('\\').map_or(0, |i| i + 1);
        let id = self.insert(Module {
            path: path.to_owned(),
            path_wide: crate::win32::wide(path),
            base_name_at,
            policy: LoadPolicy::Manual,
            is_executable,
            refs: 1,
            backing: Backing::Native { os_handle: base }, // placeholder until mapped
            state: ModuleState::NeedsBits,
            reinit_state: ModuleState::NeedsBits,
            crt_slot: None,
            imports: Vec::new(),
            virtual_api_target: None,
        });

        match self.build_manual(path, &pe, mem, base, is_executable, resolver) {
            Ok((manual, import_ids)) => {
                seh::register_image(base, size, &manual.function_table);
                let module = self.get_mut(id);
                module.backing = Backing::Manual(manual);
                module.imports = import_ids;
                module.state = ModuleState::NeedsInit;
                if let Err(err) = self.maybe_assign_crt_slot(id, file_bytes) {
                    seh::unregister_image(base);
                    self.evict(id);
                    return Err(err);
                }
                debug!(path, base = format_args!("{base:#x}"), "mapped module");
                Ok(id)
            }
            Err(err) => {
                // A tool that fails to load is not cached; the next job may
                // find a repaired file on disk.
                self.evict(id);
                Err(err)
            }
        }
    }

    /// Evict a half-built module from path lookup. The registry slot stays
    /// as a tombstone; ids are never reused.
    fn evict(&mut self, id: ModuleId) {
        for bucket in &mut self.buckets {
            bucket.retain(|&m| m != id);
        }
        self.get_mut(id).state = ModuleState::InitFailed;
    }

    fn build_manual(
        &mut self,
        path: &str,
        pe: &PeFile<'_>,
        mut mem: ImageMem,
        base: usize,
        is_executable: bool,
        resolver: &dyn ImportResolver,
    ) -> Result<(Box<ManualImage>, Vec<ModuleId>), LoaderError> {
        let bad = |source| LoaderError::BadImage {
            path: path.to_owned(),
            source,
        };

        // Resolve the import closure and patch the IAT.
        let imported = image::walk_imports(pe, mem.bytes()).map_err(bad)?;
        let mut import_ids = Vec::new();
        for dep in &imported {
            let dep_id = self.load_dependency(&dep.dll, resolver)?;
            if !import_ids.contains(&dep_id) {
                import_ids.push(dep_id);
            }
            let dep_slot = self.get(dep_id).crt_slot;
            for entry in &dep.entries {
                let target = match resolver.resolve(is_executable, dep_slot, &dep.dll, &entry.symbol)
                {
                    Some(replacement) => replacement,
                    None => self.resolve_export(dep_id, &entry.symbol).ok_or_else(|| {
                        LoaderError::ImportNotFound {
                            path: path.to_owned(),
                            dll: dep.dll.clone(),
                            symbol: format!("{:?}", entry.symbol),
                        }
                    })?,
                };
                image::patch_iat_slot(mem.bytes_mut(), entry.iat_rva, target as u64);
            }
        }

        // TLS wiring, if the image carries a TLS directory. The directory's
        // VA fields were already rebased by the relocation pass, so image
        // offsets fall out by subtracting the live base.
        let tls = match image::read_tls_directory(pe, mem.bytes()).map_err(bad)? {
            Some(dir) => {
                let raw_len =
                    (dir.end_address_of_raw_data - dir.start_address_of_raw_data) as usize;
                let total = raw_len + dir.size_of_zero_fill as usize;
                let assignment =
                    self.tls_pool
                        .allocate(total)
                        .map_err(|source| LoaderError::Tls {
                            path: path.to_owned(),
                            source,
                        })?;
                let data_rva = (dir.start_address_of_raw_data as usize).wrapping_sub(base);
                if data_rva + raw_len > mem.len() {
                    return Err(bad(PeError::BadDirectory("TLS")));
                }
                let init_data = mem.bytes()[data_rva..data_rva + raw_len].to_vec();
                let index_rva = (dir.address_of_index as usize).wrapping_sub(base);
                if index_rva + 4 > mem.len() {
                    return Err(bad(PeError::BadDirectory("TLS")));
                }
                // Publish the OS index where the image expects it.
                let idx = assignment.index.to_le_bytes();
                mem.bytes_mut()[index_rva..index_rva + 4].copy_from_slice(&idx);
                Some(TlsWiring {
                    assignment,
                    index_rva: index_rva as u32,
                    init_data,
                    zero_fill: dir.size_of_zero_fill,
                    callbacks: read_tls_callbacks(&dir, base, mem.bytes()),
                })
            }
            None => None,
        };

        let function_table = image::read_function_table(pe, mem.bytes()).map_err(bad)?;

        // Virgin snapshot and the quick reset plan.
        let virgin = mem.bytes().to_vec();
        let plan = image::build_reset_plan(pe.sections(), &virgin);
        let entry_rva = pe.entry_point_rva();

        Ok((
            Box::new(ManualImage {
                mem,
                virgin,
                plan,
                entry_rva,
                function_table,
                tls,
            }),
            import_ids,
        ))
    }

    pub(crate) fn load_dependency(
        &mut self,
        dll: &str,
        resolver: &dyn ImportResolver,
    ) -> Result<ModuleId, LoaderError> {
        if is_virtual_api(dll) {
            // The forwarder's implementation DLL loads natively; the virtual
            // name becomes its own registry entry pointing at it.
            let target = self.load_native(dll, false)?;
            return Ok(self.load_virtual_api(dll, target));
        }
        match classify(dll) {
            LoadPolicy::Native => self.load_native(dll, false),
            LoadPolicy::NativePatched => self.load_native(dll, true),
            LoadPolicy::Manual => self.load_manual(dll, false, resolver),
        }
    }

    /// Resolve `symbol` against a dependency: manual modules via their
    /// export directory, native ones via the OS.
    fn resolve_export(&mut self, dep: ModuleId, symbol: &ImportSymbol) -> Option<usize> {
        let dep = match self.get(dep).virtual_api_target {
            Some(real) => real,
            None => dep,
        };
        let module = self.get(dep);
        match &module.backing {
            Backing::Native { os_handle } => match symbol {
                ImportSymbol::Name(name) => sys::get_proc_address(*os_handle, name),
                ImportSymbol::Ordinal(ord) => sys::get_proc_address_ordinal(*os_handle, *ord),
            },
            Backing::Manual(img) => {
                let name = match symbol {
                    ImportSymbol::Name(n) => n.clone(),
                    // Ordinal imports between the toolchain's own DLLs do
                    // not occur in practice.
                    ImportSymbol::Ordinal(_) => return None,
                };
                let pe = PeFile::parse(&img.virgin).ok()?;
                match image::find_export(&pe, img.mem.bytes(), &name).ok()? {
                    Some(image::Export::Rva(rva)) => Some(img.mem.base() + rva as usize),
                    Some(image::Export::Forwarder(fwd)) => {
                        let (fwd_dll, fwd_sym) = fwd.split_once('.')?;
                        let fwd_dll = format!("{fwd_dll}.dll");
                        let dep_id = self.load_dependency(&fwd_dll, &NoReplacements).ok()?;
                        self.resolve_export(dep_id, &ImportSymbol::Name(fwd_sym.to_owned()))
                    }
                    None => None,
                }
            }
        }
    }

    /// Look up a named export the way `GetProcAddress` would.
    pub fn get_proc_address(&mut self, id: ModuleId, name: &str) -> Option<usize> {
        self.resolve_export(id, &ImportSymbol::Name(name.to_owned()))
    }

    /// A module hosting its own CRT gets a slot so replacement wrappers can
    /// route to its allocator.
    fn maybe_assign_crt_slot(
        &mut self,
        id: ModuleId,
        file_bytes: &[u8],
    ) -> Result<(), LoaderError> {
        let malloc = {
            let Backing::Manual(img) = &self.get(id).backing else {
                return Ok(());
            };
            let pe = match PeFile::parse(file_bytes) {
                Ok(pe) => pe,
                Err(_) => return Ok(()),
            };
            match image::find_export(&pe, img.mem.bytes(), "malloc") {
                Ok(Some(image::Export::Rva(rva))) => img.mem.base() + rva as usize,
                _ => return Ok(()),
            }
        };
        if self.crt_slots.len() >= MAX_CRT_SLOTS {
            return Err(LoaderError::CrtSlotsExhausted(MAX_CRT_SLOTS));
        }
        let beginthreadex = self
            .resolve_export(id, &ImportSymbol::Name("_beginthreadex".to_owned()))
            .unwrap_or(0);
        let slot = self.crt_slots.len() as u8;
        self.crt_slots.push(CrtSlot {
            module: id,
            malloc,
            beginthreadex,
        });
        self.get_mut(id).crt_slot = Some(slot);
        trace!(slot, module = self.get(id).path, "assigned CRT slot");
        Ok(())
    }

    /// Job reset step: rewind every module to its reinit baseline. Returns
    /// how many manual images will need their bits restored.
    pub fn reset_states_for_job(&mut self, reinit_mspdb: bool) -> usize {
        let mut needs_bits = 0usize;
        for m in &mut self.modules {
            let target = m.reinit_state.min(m.state);
            m.state = target;
            if m.state == ModuleState::NeedsBits {
                needs_bits += 1;
            }
            if reinit_mspdb
                && m.policy == LoadPolicy::NativePatched
                && m.base_name().to_ascii_lowercase().starts_with("mspdb")
            {
                // The PDB server endpoint changed; force this native through
                // its init path again.
                m.state = ModuleState::NeedsInit.min(m.state);
            }
        }
        needs_bits
    }

    /// Restore the bits of every NEEDS_BITS manual module and advance it to
    /// NEEDS_INIT.
    pub fn restore_bits(&mut self) {
        for m in &mut self.modules {
            if m.state != ModuleState::NeedsBits {
                continue;
            }
            if let Backing::Manual(img) = &mut m.backing {
                image::apply_reset(&img.plan, &img.virgin, img.mem.bytes_mut());
                self.modules_reset += 1;
            }
            m.state = ModuleState::NeedsInit;
        }
    }

    /// Depth-first init: imports first, then TLS, then the module's own
    /// entry point. Cycles are broken by the BEING_INITED mark.
    ///
    /// Callers hold the registry for the whole pass, so a DllMain must not
    /// turn around and LoadLibrary through the interception layer; the
    /// toolchain DLLs do their dynamic loading from their exported entry
    /// points, after init.
    pub fn initialize(&mut self, id: ModuleId) -> Result<(), LoaderError> {
        match self.get(id).state {
            ModuleState::Ready | ModuleState::BeingInited => return Ok(()),
            ModuleState::InitFailed => {
                return Err(LoaderError::InitFailed {
                    path: self.get(id).path.clone(),
                })
            }
            ModuleState::NeedsBits => {
                // Bits restore is a bulk pass; reaching here means it ran.
                debug_assert!(false, "initialize() before restore_bits()");
            }
            ModuleState::NeedsInit => {}
        }
        self.get_mut(id).state = ModuleState::BeingInited;
        let imports = self.get(id).imports.clone();
        for dep in imports {
            if let Err(err) = self.initialize(dep) {
                self.get_mut(id).state = ModuleState::InitFailed;
                return Err(err);
            }
        }

        let ok = {
            let m = self.get(id);
            match &m.backing {
                Backing::Native { .. } => true,
                Backing::Manual(img) => {
                    if let Some(tls) = &img.tls {
                        sys::init_tls_block(tls);
                        for &cb in &tls.callbacks {
                            sys::call_tls_callback(img.mem.base(), cb);
                        }
                    }
                    if m.is_executable || img.entry_rva == 0 {
                        // The executable's entry runs as the job, not here.
                        true
                    } else {
                        sys::call_dll_main(img.mem.base(), img.entry_rva)
                    }
                }
            }
        };
        let m = self.get_mut(id);
        if ok {
            m.state = ModuleState::Ready;
            Ok(())
        } else {
            m.state = ModuleState::InitFailed;
            Err(LoaderError::InitFailed {
                path: m.path.clone(),
            })
        }
    }

    /// Transitive import closure of `id`, including itself, in dependency
    /// order.
    pub fn closure(&self, id: ModuleId) -> Vec<ModuleId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if out.contains(&next) {
                continue;
            }
            out.push(next);
            stack.extend(self.get(next).imports.iter().copied());
        }
        out
    }
}

fn read_tls_callbacks(
    dir: &crate::pe::ImageTlsDirectory64,
    base: usize,
    image: &[u8],
) -> Vec<usize> {
    if dir.address_of_callbacks == 0 {
        return Vec::new();
    }
    let mut at = (dir.address_of_callbacks as usize).wrapping_sub(base);
    let mut out = Vec::new();
    loop {
        let Some(bytes) = image.get(at..at + 8) else {
            break;
        };
        let cb = u64::from_le_bytes(bytes.try_into().unwrap());
        if cb == 0 {
            break;
        }
        out.push(cb as usize);
        at += 8;
    }
    out
}

#[cfg(windows)]
mod sys {
    use super::TlsWiring;
    use crate::win32::wide;
    use windows_sys::Win32::System::LibraryLoader::{
        GetProcAddress, LoadLibraryExW, LOAD_LIBRARY_SEARCH_DEFAULT_DIRS,
    };

    pub fn load_library(name: &str) -> Option<usize> {
        // SAFETY: plain load; null checked.
        let h = unsafe {
            LoadLibraryExW(
                wide(name).as_ptr(),
                std::ptr::null_mut(),
                LOAD_LIBRARY_SEARCH_DEFAULT_DIRS,
            )
        };
        (!h.is_null()).then_some(h as usize)
    }

    pub fn get_proc_address(module: usize, name: &str) -> Option<usize> {
        let name_z = format!("{name}\0");
        // SAFETY: NUL-terminated name; null checked via Option.
        let p = unsafe { GetProcAddress(module as *mut _, name_z.as_ptr()) }?;
        Some(p as usize)
    }

    pub fn get_proc_address_ordinal(module: usize, ordinal: u16) -> Option<usize> {
        // SAFETY: low-word ordinal form of GetProcAddress.
        let p = unsafe { GetProcAddress(module as *mut _, ordinal as usize as *const u8) }?;
        Some(p as usize)
    }

    pub fn init_tls_block(tls: &TlsWiring) {
        use windows_sys::Win32::System::Threading::TlsGetValue;
        // SAFETY: the helper DLL's block is at least init+zero_fill bytes.
        unsafe {
            let block = TlsGetValue(tls.assignment.index) as *mut u8;
            if block.is_null() {
                return;
            }
            std::ptr::copy_nonoverlapping(tls.init_data.as_ptr(), block, tls.init_data.len());
            std::ptr::write_bytes(block.add(tls.init_data.len()), 0, tls.zero_fill as usize);
        }
    }

    pub fn call_tls_callback(base: usize, callback: usize) {
        type TlsCallback = unsafe extern "system" fn(*mut core::ffi::c_void, u32, *mut core::ffi::c_void);
        const DLL_PROCESS_ATTACH: u32 = 1;
        // SAFETY: the callback came out of the image's TLS directory.
        unsafe {
            let f: TlsCallback = std::mem::transmute(callback);
            f(base as *mut _, DLL_PROCESS_ATTACH, std::ptr::null_mut());
        }
    }

    pub fn call_dll_main(base: usize, entry_rva: u32) -> bool {
        type DllMain = unsafe extern "system" fn(*mut core::ffi::c_void, u32, *mut core::ffi::c_void) -> i32;
        const DLL_PROCESS_ATTACH: u32 = 1;
        // SAFETY: entry_rva comes from a validated PE header of the mapped
        // image.
        unsafe {
            let f: DllMain = std::mem::transmute(base + entry_rva as usize);
            f(base as *mut _, DLL_PROCESS_ATTACH, std::ptr::null_mut()) != 0
        }
    }
}

#[cfg(not(windows))]
mod sys {
    //! Host-neutral stand-ins: fabricated native handles, no entry calls.

    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::TlsWiring;

    static NEXT_HANDLE: AtomicUsize = AtomicUsize::new(0x7FF8_0000_0000);

    pub fn load_library(_name: &str) -> Option<usize> {
        Some(NEXT_HANDLE.fetch_add(0x1_0000, Ordering::Relaxed))
    }

    pub fn get_proc_address(module: usize, name: &str) -> Option<usize> {
        // Deterministic fake addresses keep IAT patching observable.
        let mut h = 0usize;
        for b in name.bytes() {
            h = h.wrapping_mul(31).wrapping_add(b as usize);
        }
        Some(module + 0x1000 + (h & 0xFFF))
    }

    pub fn get_proc_address_ordinal(module: usize, ordinal: u16) -> Option<usize> {
        Some(module + 0x1000 + ordinal as usize)
    }

    pub fn init_tls_block(_tls: &TlsWiring) {}

    pub fn call_tls_callback(_base: usize, _callback: usize) {}

    pub fn call_dll_main(_base: usize, _entry_rva: u32) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pe::testpe::Builder;

    #[test]
    fn classification_rules() {
        assert_eq!(classify("KERNEL32.dll"), LoadPolicy::Native);
        assert_eq!(classify("ntdll.dll"), LoadPolicy::Native);
        assert_eq!(classify("api-ms-win-core-file-l1-1-0.dll"), LoadPolicy::Native);
        assert_eq!(
            classify("api-ms-win-crt-heap-l1-1-0.dll"),
            LoadPolicy::NativePatched
        );
        assert_eq!(classify("ucrtbase.dll"), LoadPolicy::NativePatched);
        assert_eq!(classify("MSPDB140.DLL"), LoadPolicy::NativePatched);
        assert_eq!(classify("vcruntime140.dll"), LoadPolicy::NativePatched);
        assert_eq!(classify("c1xx.dll"), LoadPolicy::Manual);
        assert_eq!(classify("c2.dll"), LoadPolicy::Manual);
    }

    fn write_pe(dir: &std::path::Path, name: &str, bytes: &[u8]) -> String {
        let path = dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        path.display().to_string().replace('/', "\\")
    }

    #[test]
    fn manual_load_patches_imports_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let exe = Builder::new()
            .import("KERNEL32.dll", &["CreateFileW"])
            .build();
        let path = write_pe(dir.path(), "tool.exe", &exe);

        let mut reg = ModuleRegistry::new();
        let id = reg.load_manual(&path, true, &NoReplacements).unwrap();
        let m = reg.get(id);
        assert!(m.is_executable);
        assert!(m.is_manual());
        assert_eq!(m.state, ModuleState::NeedsInit);
        assert_eq!(m.imports.len(), 1);
        let dep = m.imports[0];
        assert_eq!(reg.get(dep).path, "KERNEL32.dll");

        // The IAT slot now holds the dependency's resolved address.
        let Backing::Manual(img) = &reg.get(id).backing else {
            unreachable!()
        };
        let pe = PeFile::parse(&img.virgin).unwrap();
        let imports = image::walk_imports(&pe, img.mem.bytes()).unwrap();
        let slot = imports[0].entries[0].iat_rva;
        let patched = image::read_iat_slot(img.mem.bytes(), slot);
        assert_ne!(patched, 0);

        // Second load of the same path is served from the registry.
        let again = reg.load_manual(&path, true, &NoReplacements).unwrap();
        assert_eq!(again, id);
        assert_eq!(reg.get(id).refs, 2);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn replacement_resolver_wins_over_exports() {
        struct Fixed;
        impl ImportResolver for Fixed {
            fn resolve(
                &self,
                _exe: bool,
                _slot: Option<u8>,
                dll: &str,
                symbol: &ImportSymbol,
            ) -> Option<usize> {
                (dll.eq_ignore_ascii_case("KERNEL32.dll")
                    && *symbol == ImportSymbol::Name("CreateFileW".to_owned()))
                .then_some(0xCAFE_0000)
            }
        }
        let dir = tempfile::tempdir().unwrap();
        let exe = Builder::new()
            .import("KERNEL32.dll", &["CreateFileW", "GetLastError"])
            .build();
        let path = write_pe(dir.path(), "tool.exe", &exe);
        let mut reg = ModuleRegistry::new();
        let id = reg.load_manual(&path, true, &Fixed).unwrap();
        let Backing::Manual(img) = &reg.get(id).backing else {
            unreachable!()
        };
        let pe = PeFile::parse(&img.virgin).unwrap();
        let imports = image::walk_imports(&pe, img.mem.bytes()).unwrap();
        assert_eq!(
            image::read_iat_slot(img.mem.bytes(), imports[0].entries[0].iat_rva),
            0xCAFE_0000
        );
        assert_ne!(
            image::read_iat_slot(img.mem.bytes(), imports[0].entries[1].iat_rva),
            0xCAFE_0000
        );
    }

    #[test]
    fn manual_dependency_export_resolution() {
        let dir = tempfile::tempdir().unwrap();
        // A DLL exporting `helper`, imported by the exe. The dll name must
        // classify as Manual.
        let dll = Builder::new().dll().export("helper", 0x1004).build();
        let dll_name = "c1xx.dll";
        write_pe(dir.path(), dll_name, &dll);
        let exe = Builder::new().import("c1xx.dll", &["helper"]).build();
        let exe_path = write_pe(dir.path(), "tool.exe", &exe);

        // Dependency paths resolve relative to the current directory in the
        // host-neutral build; jump there for the load.
        let mut reg = ModuleRegistry::new();
        let old = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();
        let loaded = reg.load_manual(&exe_path, true, &NoReplacements);
        std::env::set_current_dir(old).unwrap();
        let id = loaded.unwrap();

        let dep = reg.get(id).imports[0];
        assert!(reg.get(dep).is_manual());
        let dep_base = reg.get(dep).os_handle();
        let Backing::Manual(img) = &reg.get(id).backing else {
            unreachable!()
        };
        let pe = PeFile::parse(&img.virgin).unwrap();
        let imports = image::walk_imports(&pe, img.mem.bytes()).unwrap();
        assert_eq!(
            image::read_iat_slot(img.mem.bytes(), imports[0].entries[0].iat_rva),
            (dep_base + 0x1004) as u64
        );
    }

    #[test]
    fn virtual_api_forwarding() {
        let mut reg = ModuleRegistry::new();
        let real = reg.load_native("ucrtbase.dll", true).unwrap();
        let virt = reg.load_virtual_api("API-MS-Win-crt-heap-L1-1-0.dll", real);
        assert_eq!(reg.get(virt).path, "api-ms-win-crt-heap-l1-1-0.dll");
        assert_eq!(reg.get(virt).os_handle(), reg.get(real).os_handle());
        // The shared handle resolves to the real module, not the forwarder.
        assert_eq!(reg.find_by_handle(reg.get(real).os_handle()), Some(real));
    }

    #[test]
    fn state_machine_reset_and_init() {
        let dir = tempfile::tempdir().unwrap();
        let exe = Builder::new().build();
        let path = write_pe(dir.path(), "tool.exe", &exe);
        let mut reg = ModuleRegistry::new();
        let id = reg.load_manual(&path, true, &NoReplacements).unwrap();

        reg.get_mut(id).state = ModuleState::Ready; // as after a job
        let needs = reg.reset_states_for_job(false);
        assert_eq!(needs, 1);
        assert_eq!(reg.get(id).state, ModuleState::NeedsBits);
        reg.restore_bits();
        assert_eq!(reg.get(id).state, ModuleState::NeedsInit);
        reg.initialize(id).unwrap();
        assert_eq!(reg.get(id).state, ModuleState::Ready);
        assert_eq!(reg.modules_reset, 1);
    }

    #[test]
    fn reset_restores_scribbled_module_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut data = vec![0x77u8; 512];
        data.extend_from_slice(&[0u8; 512]);
        let exe = Builder::new().data_section(data).build();
        let path = write_pe(dir.path(), "tool.exe", &exe);
        let mut reg = ModuleRegistry::new();
        let id = reg.load_manual(&path, true, &NoReplacements).unwrap();

        {
            let Backing::Manual(img) = &mut reg.get_mut(id).backing else {
                unreachable!()
            };
            let data_at = 0x2000;
            img.mem.bytes_mut()[data_at..data_at + 1024].fill(0xEE);
        }
        reg.get_mut(id).state = ModuleState::Ready;
        reg.reset_states_for_job(false);
        reg.restore_bits();
        let Backing::Manual(img) = &reg.get(id).backing else {
            unreachable!()
        };
        assert_eq!(img.mem.bytes(), img.virgin.as_slice());
    }

    #[test]
    fn tls_module_gets_helper_assignment() {
        let dir = tempfile::tempdir().unwrap();
        let mut data = vec![0x55u8; 0x200];
        data.resize(0x400, 0);
        let exe = Builder::new().data_section(data).tls(0x100, 0x80).build();
        let path = write_pe(dir.path(), "tool.exe", &exe);
        let mut reg = ModuleRegistry::new();
        let id = reg.load_manual(&path, true, &NoReplacements).unwrap();
        let Backing::Manual(img) = &reg.get(id).backing else {
            unreachable!()
        };
        let tls = img.tls.as_ref().unwrap();
        assert_eq!(tls.init_data.len(), 0x100);
        assert_eq!(tls.zero_fill, 0x80);
        assert_eq!(tls.assignment.class_size, 1024);
        // The image's index variable was patched with the OS index.
        let at = tls.index_rva as usize;
        let published = u32::from_le_bytes(img.mem.bytes()[at..at + 4].try_into().unwrap());
        assert_eq!(published, tls.assignment.index);
    }

    #[test]
    fn mspdb_reinit_on_endpoint_change() {
        let mut reg = ModuleRegistry::new();
        let id = reg.load_native("mspdb140.dll", true).unwrap();
        assert_eq!(reg.get(id).state, ModuleState::Ready);
        reg.reset_states_for_job(true);
        assert_eq!(reg.get(id).state, ModuleState::NeedsInit);
        reg.initialize(id).unwrap();
        assert_eq!(reg.get(id).state, ModuleState::Ready);
    }
}
