//! In-memory host import table for exercising the hook engines.

use super::backend::{HookBackend, Interception, ResolutionSkip, ResolvedTarget};
use crate::error::HookError;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

struct Export {
    address: usize,
    imported: bool,
    hook: Option<(u64, Interception)>,
    original_calls: Vec<usize>,
}

#[derive(Default)]
struct Host {
    modules: BTreeMap<String, BTreeMap<String, Export>>,
    failing: HashSet<String>,
    next_patch: u64,
    removed: usize,
}

pub(crate) struct FakePatch {
    id: u64,
    module: String,
    export: String,
}

/// Shared handle to a simulated host; clones see the same table.
#[derive(Clone, Default)]
pub(crate) struct FakeBackend {
    host: Arc<Mutex<Host>>,
    events: Arc<Mutex<Vec<String>>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a loaded module exporting `exports`, all imported by the host.
    pub fn module(self, name: &str, exports: &[&str]) -> Self {
        {
            let mut host = self.host.lock().unwrap();
            let base = 0x1000_0000 * (host.modules.len() + 1);
            let table = host.modules.entry(name.to_ascii_lowercase()).or_default();
            for (i, export) in exports.iter().enumerate() {
                table.insert(
                    export.to_string(),
                    Export {
                        address: base + i * 0x10,
                        imported: true,
                        hook: None,
                        original_calls: Vec::new(),
                    },
                );
            }
        }
        self
    }

    /// Mark an export as present in its module but absent from the host's imports.
    pub fn not_imported(self, module: &str, export: &str) -> Self {
        self.export_mut(module, export, |e| e.imported = false);
        self
    }

    /// Make installation fail for an export.
    pub fn failing(self, export: &str) -> Self {
        self.host.lock().unwrap().failing.insert(export.to_string());
        self
    }

    fn export_mut<R>(&self, module: &str, export: &str, f: impl FnOnce(&mut Export) -> R) -> Option<R> {
        let mut host = self.host.lock().unwrap();
        host.modules
            .get_mut(&module.to_ascii_lowercase())
            .and_then(|m| m.get_mut(export))
            .map(f)
    }

    /// Shared event log; originals append `"{export}({arg})"`.
    pub fn events(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.events)
    }

    /// Call `module!export` the way host code would: through the
    /// interception if one is installed, then the original.
    pub fn host_call(&self, module: &str, export: &str, arg: usize) {
        let hook = self
            .export_mut(module, export, |e| e.hook.map(|(_, i)| i))
            .expect("Calling an export the host does not have");

        if let Some(interception) = hook {
            if let Some(marker) = interception.marker {
                let cells = marker.cells as *mut i32;
                unsafe {
                    cells.write_volatile(marker.module_ordinal);
                    cells.add(1).write_volatile(marker.export_ordinal);
                }
            }
            let callback = interception.callback;
            unsafe { (callback.function)(callback.context) };
        }

        self.export_mut(module, export, |e| e.original_calls.push(arg));
        self.events
            .lock()
            .unwrap()
            .push(format!("{}({})", export, arg));
    }

    pub fn is_hooked(&self, module: &str, export: &str) -> bool {
        self.export_mut(module, export, |e| e.hook.is_some())
            .unwrap_or(false)
    }

    pub fn original_calls(&self, module: &str, export: &str) -> Vec<usize> {
        self.export_mut(module, export, |e| e.original_calls.clone())
            .unwrap_or_default()
    }

    pub fn active_hooks(&self) -> usize {
        let host = self.host.lock().unwrap();
        host.modules
            .values()
            .flat_map(|m| m.values())
            .filter(|e| e.hook.is_some())
            .count()
    }

    pub fn removed(&self) -> usize {
        self.host.lock().unwrap().removed
    }
}

impl HookBackend for FakeBackend {
    type Patch = FakePatch;

    fn resolve(&self, module: &str, export: &str) -> Result<ResolvedTarget, ResolutionSkip> {
        let host = self.host.lock().unwrap();
        let table = host
            .modules
            .get(&module.to_ascii_lowercase())
            .ok_or(ResolutionSkip::ModuleNotLoaded)?;
        let entry = table.get(export).ok_or(ResolutionSkip::ExportNotFound)?;
        if !entry.imported {
            return Err(ResolutionSkip::NotImported);
        }

        Ok(ResolvedTarget {
            address: entry.address,
            slot: entry.address + 0x8000,
        })
    }

    fn install(
        &self,
        target: &ResolvedTarget,
        interception: &Interception,
    ) -> Result<FakePatch, HookError> {
        let mut host = self.host.lock().unwrap();
        let id = host.next_patch;
        host.next_patch += 1;
        let failing = host.failing.clone();

        for (module, table) in host.modules.iter_mut() {
            for (name, export) in table.iter_mut() {
                if export.address != target.address {
                    continue;
                }
                if failing.contains(name) {
                    return Err(HookError::ProtectFailed {
                        address: target.slot,
                        source: std::io::Error::other("simulated protection failure"),
                    });
                }
                export.hook = Some((id, *interception));
                return Ok(FakePatch {
                    id,
                    module: module.clone(),
                    export: name.clone(),
                });
            }
        }

        Err(HookError::ProtectFailed {
            address: target.slot,
            source: std::io::Error::other("unknown target"),
        })
    }

    fn remove(&self, patch: FakePatch) {
        let mut host = self.host.lock().unwrap();
        if let Some(export) = host
            .modules
            .get_mut(&patch.module)
            .and_then(|m| m.get_mut(&patch.export))
        {
            if matches!(export.hook, Some((id, _)) if id == patch.id) {
                export.hook = None;
            }
        }
        host.removed += 1;
    }
}
