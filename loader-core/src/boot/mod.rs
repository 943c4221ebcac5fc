//! Boot orchestration and the collaborator contracts it drives.

mod context;
mod endpoint;
mod orchestrator;
mod timer;

pub use context::{BootContext, BootState, HostEndpoint, LogSink, ModLoader};
pub use endpoint::TcpHostEndpoint;
pub use orchestrator::{
    fail_boot, BootOptions, Orchestrator, STAGE_CREATE_HOST, STAGE_CREATE_LOADER,
    STAGE_LOAD_MODS, STAGE_LOAD_MODS_DELAYED, STAGE_PE_OPERATIONS, STAGE_PREPARE,
};
pub use timer::BootTimer;
