// Core library for the mod loader boot bridge

pub mod boot;
pub mod config;
pub mod error;
pub mod hooks;
pub mod logging;
pub mod params;
pub mod pe;
pub mod readiness;
pub mod shellcode;

#[cfg(windows)]
pub mod memory;

pub use boot::{
    BootContext, BootOptions, BootState, HostEndpoint, LogSink, ModLoader, Orchestrator,
    TcpHostEndpoint,
};
pub use config::{BootConfig, DelayPolicy};
pub use error::{BootError, HookError, ImageError, ReadinessError, SchemaError};
pub use hooks::{DelayInjector, ExitGuard, HookBackend, HookTarget, HookTargets};
pub use logging::LoaderLog;
pub use params::{BootFlags, BootParameters};
pub use readiness::{ReadinessPublisher, ReadinessReader, ReadinessState};
