// Error types for boot operations

use std::time::Duration;
use thiserror::Error;

/// Errors raised while reading the native parameter block.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("Invalid parameter version: {0}")]
    InvalidVersion(i32),

    #[error("Parameter block truncated: {available} of {required} bytes available")]
    Truncated { available: usize, required: usize },
}

/// Errors related to parsing a PE image.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("Failed to read image file")]
    ReadFailed(#[source] std::io::Error),

    #[error("Invalid image: {0}")]
    Invalid(String),

    #[error("Invalid DOS header: expected 'MZ', found {0:04X}")]
    InvalidDosHeader(u16),

    #[error("Invalid PE signature: expected 'PE\\0\\0'")]
    InvalidPeSignature,

    #[error("Unsupported machine type: 0x{0:04X}")]
    UnsupportedMachine(u16),
}

/// Errors related to installing or removing interceptions.
#[derive(Debug, Error)]
pub enum HookError {
    #[error("Failed to allocate entry marker memory")]
    MarkerAllocationFailed,

    #[error("Failed to allocate executable memory for interception stub")]
    StubAllocationFailed(#[source] std::io::Error),

    #[error("Failed to change protection of import slot at 0x{address:X}")]
    ProtectFailed {
        address: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to locate the host image")]
    HostImageUnavailable(#[source] std::io::Error),

    #[error("Interception stubs are not supported on this architecture")]
    UnsupportedArchitecture,

    #[error("Failed to read hook descriptor file")]
    DescriptorRead(#[source] std::io::Error),

    #[error("Failed to parse hook descriptor list")]
    DescriptorParse(#[source] serde_json::Error),
}

/// Errors related to the readiness handshake segment.
#[derive(Debug, Error)]
pub enum ReadinessError {
    #[error("Failed to create handshake segment '{name}'")]
    SegmentCreateFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Handshake segment for process {pid} does not exist")]
    SegmentOpenFailed {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to access handshake segment")]
    Io(#[from] std::io::Error),

    #[error("Readiness token must be positive, got {0}")]
    InvalidToken(i32),

    #[error("Readiness already committed with token {0}")]
    AlreadyCommitted(i32),

    #[error("Process {pid} not ready after {waited:?}")]
    Timeout { pid: u32, waited: Duration },
}

/// Errors that end a boot attempt.
#[derive(Debug, Error)]
pub enum BootError {
    #[error("Boot already started (state: {0})")]
    AlreadyStarted(String),

    #[error("Readiness handshake failed")]
    Readiness(#[from] ReadinessError),

    #[error("Hook installation failed")]
    Hook(#[from] HookError),

    #[error("Host image could not be parsed")]
    Image(#[from] ImageError),

    #[error("Stage '{stage}' failed")]
    Stage {
        stage: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Stage '{stage}' panicked: {message}")]
    StagePanicked { stage: &'static str, message: String },
}

impl BootError {
    /// Wrap a collaborator error as the failure of a named stage.
    pub fn stage(stage: &'static str, error: anyhow::Error) -> Self {
        Self::Stage {
            stage,
            source: error.into(),
        }
    }
}
