//! Tool registry: executable path → ready-to-run tool.
//!
//! A tool is an executable that has been manually mapped with its import
//! closure resolved, its entry point located and its module set indexed for
//! the `GetModuleHandle`/`RtlPcToFileHeader` emulation. Tools attach to the
//! cache object of their executable, so they are created once and invalidated
//! exactly when the executable changes on disk.

use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use tracing::debug;

use crate::environment::Environment;
use crate::fs_cache::{FsCache, FsObjId};
use crate::modules::{ImportResolver, LoaderError, ModuleId, ModuleRegistry};

/// What the driver's compiler-family sniffing concluded from the file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilerHint {
    Cl,
    Link,
    None,
}

impl CompilerHint {
    pub fn from_exe_name(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        let stem = lower
            .rsplit(['\\', '/'])
            .next()
            .unwrap_or(&lower)
            .strip_suffix(".exe")
            .map(str::to_owned)
            .unwrap_or(lower.rsplit(['\\', '/']).next().unwrap_or(&lower).to_owned());
        match stem.as_str() {
            "cl" => CompilerHint::Cl,
            "link" => CompilerHint::Link,
            _ => CompilerHint::None,
        }
    }

    pub fn is_cl(self) -> bool {
        self == CompilerHint::Cl
    }

    pub fn is_link(self) -> bool {
        self == CompilerHint::Link
    }
}

/// Result of one intercepted `LoadLibrary` request, cached per tool by the
/// exact request string.
#[derive(Debug, Clone, Copy)]
pub enum DynLoad {
    Module(ModuleId),
    /// Data-only load handed to the OS unchanged.
    Special(usize),
}

#[derive(Debug)]
pub struct Tool {
    /// Canonical executable path.
    pub path: String,
    pub exe_module: ModuleId,
    /// Absolute entry point address of the mapped executable.
    pub entry_point: usize,
    pub hint: CompilerHint,
    /// (os handle, module) sorted by handle for binary search. Modules
    /// sharing a handle (api-set forwarders) sort the real module first.
    sorted_modules: Mutex<Vec<(usize, ModuleId)>>,
    /// `LoadLibrary` results keyed by the exact request string, in request
    /// order.
    dyn_loads: Mutex<IndexMap<String, DynLoad>>,
}

impl Tool {
    /// Binary-search the module owning `address` (a handle value or a pc).
    pub fn module_from_address(
        &self,
        registry: &ModuleRegistry,
        address: usize,
    ) -> Option<ModuleId> {
        if address == 0 {
            return Some(self.exe_module);
        }
        let sorted = self.sorted_modules.lock().unwrap();
        let mut idx = match sorted.binary_search_by(|&(handle, _)| handle.cmp(&address)) {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        // Scan back to the first entry sharing this handle; the real module
        // is ordered before its forwarders.
        while idx > 0 && sorted[idx - 1].0 == sorted[idx].0 {
            idx -= 1;
        }
        let (base, id) = sorted[idx];
        let size = match &registry.get(id).backing {
            crate::modules::Backing::Manual(img) => img.mem.len(),
            // Native sizes are unknown here; an exact handle match is all
            // GetModuleHandle needs.
            crate::modules::Backing::Native { .. } => 1,
        };
        (address < base + size).then_some(id)
    }

    /// Find a module by base name or full path, the `GetModuleHandle` way.
    pub fn module_by_name(&self, registry: &ModuleRegistry, name: &str) -> Option<ModuleId> {
        let want_full = name.contains('\\') || name.contains('/');
        let normalized = name.to_ascii_lowercase();
        let stripped = normalized.strip_suffix(".dll").unwrap_or(&normalized);
        self.sorted_modules
            .lock()
            .unwrap()
            .iter()
            .map(|&(_, id)| id)
            .find(|&id| {
                let m = registry.get(id);
                if want_full {
                    m.path.eq_ignore_ascii_case(name)
                } else {
                    let base = m.base_name().to_ascii_lowercase();
                    base == normalized || base.strip_suffix(".dll") == Some(stripped)
                }
            })
    }

    pub fn cached_dyn_load(&self, request: &str) -> Option<DynLoad> {
        self.dyn_loads.lock().unwrap().get(request).copied()
    }

    pub fn remember_dyn_load(&self, request: &str, load: DynLoad) {
        self.dyn_loads
            .lock()
            .unwrap()
            .insert(request.to_owned(), load);
    }

    pub fn modules(&self) -> Vec<ModuleId> {
        self.sorted_modules
            .lock()
            .unwrap()
            .iter()
            .map(|&(_, id)| id)
            .collect()
    }

    /// A freshly loaded module becomes visible to handle lookups.
    pub fn index_module(&self, registry: &ModuleRegistry, id: ModuleId) {
        let mut sorted = self.sorted_modules.lock().unwrap();
        if sorted.iter().any(|&(_, m)| m == id) {
            return;
        }
        let handle = registry.get(id).os_handle();
        let is_virtual = registry.get(id).virtual_api_target.is_some();
        // Within one handle value the real module sorts before forwarders.
        let at = sorted.partition_point(|&(h, m)| {
            h < handle
                || (h == handle && (is_virtual || registry.get(m).virtual_api_target.is_none()))
        });
        sorted.insert(at, (handle, id));
    }
}

/// Resolve `exe` against the job environment's PATH when it has no
/// directory component, the way CreateProcess would.
pub fn resolve_executable(fs: &mut FsCache, env: &Environment, exe: &str, cwd: &str) -> Option<String> {
    if exe.contains('\\') || exe.contains('/') {
        let id = fs.lookup(exe, cwd).ok()?;
        return Some(fs.obj(id).path().to_owned());
    }
    let with_ext = if exe.to_ascii_lowercase().ends_with(".exe") {
        exe.to_owned()
    } else {
        format!("{exe}.exe")
    };
    for dir in env.get("PATH").unwrap_or("").split(';') {
        if dir.is_empty() {
            continue;
        }
        let candidate = format!("{dir}\\{with_ext}");
        if let Some(id) = fs.lookup_no_missing(&candidate, cwd) {
            return Some(fs.obj(id).path().to_owned());
        }
    }
    None
}

#[derive(Debug, Default)]
pub struct ToolRegistry {
    /// Paths that failed to load this worker lifetime; retried every time by
    /// design (the file may get fixed), but never cached.
    pub load_failures: u64,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch or create the tool for `exe_obj`.
    pub fn lookup(
        &mut self,
        fs: &mut FsCache,
        registry: &mut ModuleRegistry,
        resolver: &dyn ImportResolver,
        exe_obj: FsObjId,
    ) -> Result<Arc<Tool>, LoaderError> {
        if let Some(tool) = fs.user_data::<Tool>(exe_obj) {
            return Ok(tool);
        }
        let path = fs.obj(exe_obj).path().to_owned();
        let exe_module = match registry.load_manual(&path, true, resolver) {
            Ok(id) => id,
            Err(err) => {
                self.load_failures += 1;
                return Err(err);
            }
        };
        let entry_point = match &registry.get(exe_module).backing {
            crate::modules::Backing::Manual(img) => img.mem.base() + img.entry_rva as usize,
            crate::modules::Backing::Native { os_handle } => *os_handle,
        };
        let tool = Tool {
            path: path.clone(),
            exe_module,
            entry_point,
            hint: CompilerHint::from_exe_name(&path),
            sorted_modules: Mutex::new(Vec::new()),
            dyn_loads: Mutex::new(IndexMap::new()),
        };
        for id in registry.closure(exe_module) {
            tool.index_module(registry, id);
        }
        let tool = Arc::new(tool);
        fs.set_user_data(exe_obj, Arc::clone(&tool));
        debug!(path, hint = ?tool.hint, modules = tool.modules().len(), "created tool");
        Ok(tool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::NoReplacements;
    use crate::pe::testpe::Builder;

    #[test]
    fn hint_from_name() {
        assert!(CompilerHint::from_exe_name(r"C:\vc\bin\CL.EXE").is_cl());
        assert!(CompilerHint::from_exe_name(r"C:\vc\bin\link.exe").is_link());
        assert_eq!(
            CompilerHint::from_exe_name(r"C:\bin\ml64.exe"),
            CompilerHint::None
        );
        assert_eq!(CompilerHint::from_exe_name("cl"), CompilerHint::Cl);
    }

    fn make_tool(dir: &std::path::Path) -> (FsCache, ModuleRegistry, ToolRegistry, Arc<Tool>) {
        let exe = Builder::new().import("KERNEL32.dll", &["CloseHandle"]).build();
        let path = dir.join("cl.exe");
        std::fs::write(&path, exe).unwrap();
        let win_path = path.display().to_string().replace('/', "\\");

        let mut fs = FsCache::new();
        let mut registry = ModuleRegistry::new();
        let mut tools = ToolRegistry::new();
        let obj = fs.lookup(&win_path, "").unwrap();
        let tool = tools
            .lookup(&mut fs, &mut registry, &NoReplacements, obj)
            .unwrap();
        (fs, registry, tools, tool)
    }

    #[test]
    fn tool_created_once_and_cached_on_fs_object() {
        let dir = tempfile::tempdir().unwrap();
        let (mut fs, mut registry, mut tools, tool) = make_tool(dir.path());
        assert!(tool.hint.is_cl());
        assert_ne!(tool.entry_point, 0);

        let obj = fs.lookup(&tool.path, "").unwrap();
        let again = tools
            .lookup(&mut fs, &mut registry, &NoReplacements, obj)
            .unwrap();
        assert!(Arc::ptr_eq(&tool, &again));
    }

    #[test]
    fn module_lookup_by_address_and_name() {
        let dir = tempfile::tempdir().unwrap();
        let (_fs, registry, _tools, tool) = make_tool(dir.path());

        let exe = tool.exe_module;
        let base = registry.get(exe).os_handle();
        assert_eq!(tool.module_from_address(&registry, base), Some(exe));
        // An address inside the image maps back to it.
        assert_eq!(tool.module_from_address(&registry, base + 0x1000), Some(exe));
        assert_eq!(tool.module_from_address(&registry, 0), Some(exe));
        assert_eq!(tool.module_from_address(&registry, 1), None);

        let k32 = tool.module_by_name(&registry, "kernel32.dll").unwrap();
        assert_eq!(registry.get(k32).path, "KERNEL32.dll");
        assert!(tool.module_by_name(&registry, "kernel32").is_some());
        assert!(tool.module_by_name(&registry, "no-such.dll").is_none());
    }

    #[test]
    fn dyn_load_cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (_fs, _registry, _tools, tool) = make_tool(dir.path());
        assert!(tool.cached_dyn_load("foo.dll").is_none());
        tool.remember_dyn_load("foo.dll", DynLoad::Special(0x1234));
        match tool.cached_dyn_load("foo.dll") {
            Some(DynLoad::Special(h)) => assert_eq!(h, 0x1234),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn resolve_executable_walks_path() {
        let dir = tempfile::tempdir().unwrap();
        let exe_path = dir.path().join("yasm.exe");
        std::fs::write(&exe_path, b"stub").unwrap();
        let win_dir = dir.path().display().to_string().replace('/', "\\");

        let mut fs = FsCache::new();
        let mut env = Environment::new();
        env.set("PATH", &format!(r"C:\missing;{win_dir}"));
        let found = resolve_executable(&mut fs, &env, "yasm", r"C:\build").unwrap();
        assert!(found.to_ascii_lowercase().ends_with("yasm.exe"));
        assert!(resolve_executable(&mut fs, &env, "absent", r"C:\build").is_none());
    }
}
