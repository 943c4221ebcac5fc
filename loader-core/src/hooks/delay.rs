//! Delay injection: run an action at the host's first call to any of a set
//! of imports, then remove every interception.

use super::backend::{EntryCallback, HookBackend, Interception, ResolutionSkip};
use super::marker::EntryMarker;
use super::targets::HookTargets;
use crate::error::HookError;
use crate::shellcode::MarkerStore;
use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

type Action = Box<dyn FnOnce() + Send + 'static>;

/// One interception owned by a [`DelayInjector`].
struct InstalledHook<P> {
    module_ordinal: usize,
    export_ordinal: usize,
    address: usize,
    patch: P,
}

/// The import whose call triggered the action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    pub module: String,
    pub export: String,
}

/// How many candidates were armed, and why the rest were not.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Coverage {
    pub candidates: usize,
    pub armed: usize,
    pub module_not_loaded: usize,
    pub export_not_found: usize,
    pub not_imported: usize,
    pub install_failed: usize,
}

impl Coverage {
    fn skip(&mut self, reason: ResolutionSkip, count: usize) {
        match reason {
            ResolutionSkip::ModuleNotLoaded => self.module_not_loaded += count,
            ResolutionSkip::ExportNotFound => self.export_not_found += count,
            ResolutionSkip::NotImported => self.not_imported += count,
        }
    }
}

struct Shared<B: HookBackend> {
    fired: AtomicBool,
    backend: B,
    targets: HookTargets,
    hooks: Mutex<Vec<InstalledHook<B::Patch>>>,
    marker: EntryMarker,
    action: Mutex<Option<Action>>,
    entry_point: Mutex<Option<EntryPoint>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<B: HookBackend> Shared<B> {
    /// Remove every interception. Returns the entry point recorded by the
    /// marker, if any interception fired.
    fn disarm(&self) -> Option<EntryPoint> {
        let entry = self
            .marker
            .read()
            .and_then(|(m, e)| self.targets.name_of(m, e))
            .map(|(module, export)| EntryPoint {
                module: module.to_string(),
                export: export.to_string(),
            });

        let hooks = std::mem::take(&mut *lock(&self.hooks));
        let count = hooks.len();
        for hook in hooks {
            log::trace!(
                "Removing interception {}:{} at 0x{:X}",
                hook.module_ordinal,
                hook.export_ordinal,
                hook.address
            );
            self.backend.remove(hook.patch);
        }
        log::debug!("Removed {} delay injection hooks", count);

        entry
    }
}

/// Called by every interception stub. Only the first call does anything.
unsafe extern "system" fn on_entry<B: HookBackend>(context: *const c_void) {
    let shared = &*(context as *const Shared<B>);
    if shared.fired.swap(true, Ordering::AcqRel) {
        return;
    }

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let entry = shared.disarm();
        match &entry {
            Some(entry) => log::info!(
                "Delay Injection via Entry Point: {}, {}",
                entry.module,
                entry.export
            ),
            None => log::info!("Delay Injection via unknown entry point"),
        }
        *lock(&shared.entry_point) = entry;

        let action = lock(&shared.action).take();
        if let Some(action) = action {
            action();
        }
    }));

    if let Err(payload) = outcome {
        log::error!("Delayed action panicked: {}", panic_message(&payload));
    }
}

pub(crate) fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Mass-hooks the host's imports and runs an action exactly once, at the
/// first call to any of them. Every hook is removed before the action runs.
///
/// Dropping an injector that has not fired removes its hooks and discards
/// the action.
pub struct DelayInjector<B: HookBackend> {
    shared: Arc<Shared<B>>,
    coverage: Coverage,
}

impl<B: HookBackend> DelayInjector<B> {
    /// Arm an interception on every resolvable target.
    ///
    /// # Errors
    /// Only a failed marker allocation is an error. Targets that cannot be
    /// resolved or patched are skipped and counted in [`Self::coverage`].
    pub fn install<F>(backend: B, targets: &HookTargets, action: F) -> Result<Self, HookError>
    where
        F: FnOnce() + Send + 'static,
    {
        let marker = EntryMarker::allocate()?;
        let cells = marker.cells();

        let shared = Arc::new(Shared {
            fired: AtomicBool::new(false),
            backend,
            targets: targets.clone(),
            hooks: Mutex::new(Vec::new()),
            marker,
            action: Mutex::new(Some(Box::new(action))),
            entry_point: Mutex::new(None),
        });

        // Stubs hold a raw pointer. It is only reclaimed when nothing was armed;
        // otherwise a thread may still be inside a stub after the unhook, so the
        // shared state (marker cells included) lives as long as the process.
        let context = Arc::into_raw(Arc::clone(&shared)) as *const c_void;
        let callback = EntryCallback {
            function: on_entry::<B>,
            context,
        };

        let mut coverage = Coverage::default();
        {
            // Held for the whole loop so an early trigger waits for every
            // hook to be recorded before disarming.
            let mut hooks = lock(&shared.hooks);

            for (module_ordinal, target) in shared.targets.iter().enumerate() {
                coverage.candidates += target.export_names.len();

                for (export_ordinal, export) in target.export_names.iter().enumerate() {
                    let resolved = match shared.backend.resolve(&target.module_name, export) {
                        Ok(resolved) => resolved,
                        Err(ResolutionSkip::ModuleNotLoaded) => {
                            let remaining = target.export_names.len() - export_ordinal;
                            log::debug!("{} not loaded, skipping", target.module_name);
                            coverage.skip(ResolutionSkip::ModuleNotLoaded, remaining);
                            break;
                        }
                        Err(reason) => {
                            log::trace!("Skipping {}!{}: {:?}", target.module_name, export, reason);
                            coverage.skip(reason, 1);
                            continue;
                        }
                    };

                    let interception = Interception {
                        marker: Some(MarkerStore {
                            cells,
                            module_ordinal: module_ordinal as i32,
                            export_ordinal: export_ordinal as i32,
                        }),
                        callback,
                    };

                    match shared.backend.install(&resolved, &interception) {
                        Ok(patch) => hooks.push(InstalledHook {
                            module_ordinal,
                            export_ordinal,
                            address: resolved.address,
                            patch,
                        }),
                        Err(e) => {
                            log::warn!("Failed to hook {}!{}: {}", target.module_name, export, e);
                            coverage.install_failed += 1;
                        }
                    }
                }
            }

            coverage.armed = hooks.len();
        }

        if coverage.armed == 0 {
            // No stub references the context.
            unsafe { drop(Arc::from_raw(context as *const Shared<B>)) };
            log::info!("Delay injection: no hookable imports found");
        } else {
            log::info!(
                "Delay injection armed on {} of {} imports",
                coverage.armed,
                coverage.candidates
            );
        }

        Ok(Self { shared, coverage })
    }

    pub fn coverage(&self) -> Coverage {
        self.coverage
    }

    pub fn armed_count(&self) -> usize {
        self.coverage.armed
    }

    pub fn has_fired(&self) -> bool {
        self.shared.fired.load(Ordering::Acquire)
    }

    /// Interceptions still installed.
    pub fn active_hooks(&self) -> usize {
        lock(&self.shared.hooks).len()
    }

    /// The import that triggered the action, once it has fired.
    pub fn entry_point(&self) -> Option<EntryPoint> {
        lock(&self.shared.entry_point).clone()
    }
}

impl<B: HookBackend> Drop for DelayInjector<B> {
    fn drop(&mut self) {
        if self.shared.fired.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.disarm();
        lock(&self.shared.action).take();
        log::debug!("Delay injector dropped before any hook fired");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::fake::FakeBackend;
    use crate::hooks::targets::HookTarget;
    use std::sync::atomic::AtomicUsize;

    fn targets(list: &[(&str, &[&str])]) -> HookTargets {
        HookTargets::new(
            list.iter()
                .map(|(module, exports)| HookTarget {
                    module_name: module.to_string(),
                    export_names: exports.iter().map(|e| e.to_string()).collect(),
                })
                .collect(),
        )
    }

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        (count, move || {
            inner.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn host() -> FakeBackend {
        FakeBackend::new()
            .module("kernel32.dll", &["GetCommandLineA", "GetStartupInfoW", "HeapCreate"])
            .module("user32.dll", &["CreateWindowExW"])
    }

    #[test]
    fn test_first_call_runs_action_once_and_unhooks() {
        let backend = host();
        let list = targets(&[
            ("kernel32.dll", &["GetCommandLineA", "GetStartupInfoW"]),
            ("user32.dll", &["CreateWindowExW"]),
            ("d3d9.dll", &["Direct3DCreate9"]),
        ]);
        let (count, action) = counter();

        let injector = DelayInjector::install(backend.clone(), &list, action).unwrap();
        assert_eq!(injector.armed_count(), 3);
        assert_eq!(backend.active_hooks(), 3);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        backend.host_call("user32.dll", "CreateWindowExW", 1);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(injector.has_fired());
        assert_eq!(backend.active_hooks(), 0);
        assert_eq!(injector.active_hooks(), 0);
        assert_eq!(
            injector.entry_point(),
            Some(EntryPoint {
                module: "user32.dll".into(),
                export: "CreateWindowExW".into(),
            })
        );
        // The triggering call still reached the original.
        assert_eq!(backend.original_calls("user32.dll", "CreateWindowExW"), vec![1]);
    }

    #[test]
    fn test_later_calls_reach_original_only() {
        let backend = host();
        let list = targets(&[("kernel32.dll", &["GetCommandLineA", "HeapCreate"])]);
        let (count, action) = counter();

        let _injector = DelayInjector::install(backend.clone(), &list, action).unwrap();

        backend.host_call("kernel32.dll", "HeapCreate", 7);
        backend.host_call("kernel32.dll", "GetCommandLineA", 8);
        backend.host_call("kernel32.dll", "HeapCreate", 9);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!backend.is_hooked("kernel32.dll", "GetCommandLineA"));
        assert_eq!(backend.original_calls("kernel32.dll", "HeapCreate"), vec![7, 9]);
        assert_eq!(backend.original_calls("kernel32.dll", "GetCommandLineA"), vec![8]);
    }

    #[test]
    fn test_no_resolvable_targets_is_a_no_op() {
        let backend = host();
        let list = targets(&[("steam_api64.dll", &["SteamAPI_Init"])]);
        let (count, action) = counter();

        let injector = DelayInjector::install(backend.clone(), &list, action).unwrap();
        assert_eq!(injector.armed_count(), 0);
        assert_eq!(injector.coverage().module_not_loaded, 1);

        backend.host_call("kernel32.dll", "HeapCreate", 0);
        drop(injector);

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(backend.active_hooks(), 0);
    }

    #[test]
    fn test_drop_before_firing_removes_hooks() {
        let backend = host();
        let list = targets(&[("kernel32.dll", &["GetCommandLineA", "HeapCreate"])]);
        let (count, action) = counter();

        let injector = DelayInjector::install(backend.clone(), &list, action).unwrap();
        assert_eq!(backend.active_hooks(), 2);

        drop(injector);
        assert_eq!(backend.active_hooks(), 0);
        assert_eq!(backend.removed(), 2);

        backend.host_call("kernel32.dll", "HeapCreate", 1);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_coverage_counts_each_skip_reason() {
        let backend = host()
            .not_imported("kernel32.dll", "GetStartupInfoW")
            .failing("HeapCreate");
        let list = targets(&[
            (
                "kernel32.dll",
                &["GetCommandLineA", "GetStartupInfoW", "HeapCreate", "NoSuchExport"],
            ),
            ("steam_api.dll", &["SteamAPI_Init", "SteamAPI_RestartAppIfNecessary"]),
        ]);
        let (_, action) = counter();

        let injector = DelayInjector::install(backend, &list, action).unwrap();

        assert_eq!(
            injector.coverage(),
            Coverage {
                candidates: 6,
                armed: 1,
                module_not_loaded: 2,
                export_not_found: 1,
                not_imported: 1,
                install_failed: 1,
            }
        );
    }

    #[test]
    fn test_panicking_action_is_contained() {
        let backend = host();
        let list = targets(&[("kernel32.dll", &["GetCommandLineA"])]);

        let injector =
            DelayInjector::install(backend.clone(), &list, || panic!("mod failed")).unwrap();

        backend.host_call("kernel32.dll", "GetCommandLineA", 3);

        assert!(injector.has_fired());
        assert_eq!(backend.active_hooks(), 0);
        assert_eq!(backend.original_calls("kernel32.dll", "GetCommandLineA"), vec![3]);
    }

    #[test]
    fn test_concurrent_triggers_run_action_once() {
        let backend = host();
        let list = targets(&[
            ("kernel32.dll", &["GetCommandLineA", "GetStartupInfoW", "HeapCreate"]),
            ("user32.dll", &["CreateWindowExW"]),
        ]);
        let (count, action) = counter();

        let _injector = DelayInjector::install(backend.clone(), &list, action).unwrap();

        std::thread::scope(|scope| {
            for export in ["GetCommandLineA", "GetStartupInfoW", "HeapCreate"] {
                let backend = backend.clone();
                scope.spawn(move || {
                    for arg in 0..50 {
                        backend.host_call("kernel32.dll", export, arg);
                    }
                });
            }
        });

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(backend.active_hooks(), 0);
    }
}
