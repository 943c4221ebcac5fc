//! Permanent interception of process termination.

use super::backend::{EntryCallback, HookBackend, Interception, ResolvedTarget};
use super::delay::panic_message;
use crate::boot::LogSink;
use crate::error::HookError;
use std::ffi::c_void;
use std::mem::ManuallyDrop;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

pub const EXIT_MODULE: &str = "kernel32.dll";
pub const EXIT_EXPORT: &str = "ExitProcess";

struct ExitState {
    sink: Arc<dyn LogSink>,
}

unsafe extern "system" fn on_exit(context: *const c_void) {
    let state = &*(context as *const ExitState);

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        state.sink.write_line("ExitProcess hook: log end");
        state.sink.flush();
    }));

    if let Err(payload) = outcome {
        // The host is terminating either way.
        eprintln!("Exit flush failed: {}", panic_message(&payload));
    }
}

/// Flushes the log sink when the host calls `ExitProcess`, then lets the
/// call continue with its exit code untouched.
///
/// The interception is never removed, so dropping the guard leaves it in
/// place.
pub struct ExitGuard<B: HookBackend> {
    target: ResolvedTarget,
    _patch: ManuallyDrop<B::Patch>,
}

impl<B: HookBackend> ExitGuard<B> {
    /// Install the guard. Returns `Ok(None)` when the host does not import
    /// `ExitProcess`.
    pub fn install(backend: &B, sink: Arc<dyn LogSink>) -> Result<Option<Self>, HookError> {
        let target = match backend.resolve(EXIT_MODULE, EXIT_EXPORT) {
            Ok(target) => target,
            Err(reason) => {
                log::info!(
                    "{}!{} not hookable ({:?}), exit guard not installed",
                    EXIT_MODULE,
                    EXIT_EXPORT,
                    reason
                );
                return Ok(None);
            }
        };

        let state: &'static ExitState = Box::leak(Box::new(ExitState { sink }));
        let interception = Interception {
            marker: None,
            callback: EntryCallback {
                function: on_exit,
                context: state as *const ExitState as *const c_void,
            },
        };

        let patch = backend.install(&target, &interception)?;
        log::debug!("Exit guard installed at slot 0x{:X}", target.slot);

        Ok(Some(Self {
            target,
            _patch: ManuallyDrop::new(patch),
        }))
    }

    pub fn target(&self) -> ResolvedTarget {
        self.target
    }
}
