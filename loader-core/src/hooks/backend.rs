//! The patching capability the hook engines are written against.

use crate::error::HookError;
use crate::shellcode::MarkerStore;
use std::ffi::c_void;
use std::fmt;

/// Signature of the function an interception calls before falling through.
pub type EntryFn = unsafe extern "system" fn(*const c_void);

/// A callback and the opaque context handed to it.
#[derive(Clone, Copy)]
pub struct EntryCallback {
    pub function: EntryFn,
    pub context: *const c_void,
}

// The context is only ever dereferenced by the callback it was paired with.
unsafe impl Send for EntryCallback {}
unsafe impl Sync for EntryCallback {}

impl fmt::Debug for EntryCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryCallback")
            .field("function", &(self.function as usize as *const c_void))
            .field("context", &self.context)
            .finish()
    }
}

/// What an installed interception does before reaching the original.
#[derive(Debug, Clone, Copy)]
pub struct Interception {
    pub marker: Option<MarkerStore>,
    pub callback: EntryCallback,
}

/// Why a candidate export was not hooked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSkip {
    ModuleNotLoaded,
    ExportNotFound,
    /// The export exists but the host image does not import it.
    NotImported,
}

/// A hookable export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedTarget {
    /// Address the module exports.
    pub address: usize,
    /// Location of the patch point.
    pub slot: usize,
}

/// Resolves exports and patches them.
///
/// `remove` must leave the target behaving exactly as before `install`.
/// Code an interception runs must stay valid after `remove` returns, since
/// the thread that triggered the removal is still executing it.
pub trait HookBackend: Send + Sync + 'static {
    /// Handle to one installed interception.
    type Patch: Send;

    fn resolve(&self, module: &str, export: &str) -> Result<ResolvedTarget, ResolutionSkip>;

    fn install(
        &self,
        target: &ResolvedTarget,
        interception: &Interception,
    ) -> Result<Self::Patch, HookError>;

    fn remove(&self, patch: Self::Patch);
}
