//! Import interception: the delay injection engine and the exit guard.

mod backend;
pub mod delay;
pub mod exit_guard;
mod marker;
mod targets;

#[cfg(windows)]
mod iat;

#[cfg(test)]
pub(crate) mod fake;

pub use backend::{
    EntryCallback, EntryFn, HookBackend, Interception, ResolutionSkip, ResolvedTarget,
};
pub use delay::{Coverage, DelayInjector, EntryPoint};
pub use exit_guard::ExitGuard;
pub use marker::EntryMarker;
pub use targets::{HookTarget, HookTargets};

#[cfg(windows)]
pub use iat::{IatBackend, IatPatch};
