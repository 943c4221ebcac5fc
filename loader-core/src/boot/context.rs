//! Process-wide boot state and the collaborators it hands out.

use super::timer::BootTimer;
use crate::error::BootError;
use std::any::Any;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

/// Destination of loader log lines.
pub trait LogSink: Send + Sync {
    fn write_line(&self, line: &str);

    /// Make everything written so far durable. Called synchronously before
    /// the process exits.
    fn flush(&self);

    /// File the log is written to, if any.
    fn log_path(&self) -> Option<&Path>;
}

/// Loads mods into the current process.
pub trait ModLoader: Send + Sync {
    fn load_for_current_process(&self) -> anyhow::Result<()>;
}

/// The endpoint controllers talk to once the loader is ready.
pub trait HostEndpoint: Send + Sync {
    /// Always positive.
    fn port(&self) -> i32;
}

/// Where a boot attempt stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootState {
    Idle,
    Initializing,
    Ready(i32),
    Failed(String),
}

impl fmt::Display for BootState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootState::Idle => write!(f, "idle"),
            BootState::Initializing => write!(f, "initializing"),
            BootState::Ready(port) => write!(f, "ready (port {})", port),
            BootState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Everything a boot attempt shares between its stages, and whatever must
/// stay alive after it.
///
/// Accessors may be called at any time, including before the boot starts;
/// they return `None` rather than panicking.
pub struct BootContext {
    state: Mutex<BootState>,
    log: Arc<dyn LogSink>,
    loader: OnceLock<Arc<dyn ModLoader>>,
    endpoint: OnceLock<Arc<dyn HostEndpoint>>,
    retained: Mutex<Vec<Box<dyn Any + Send>>>,
}

impl BootContext {
    pub fn new(log: Arc<dyn LogSink>) -> Self {
        Self {
            state: Mutex::new(BootState::Idle),
            log,
            loader: OnceLock::new(),
            endpoint: OnceLock::new(),
            retained: Mutex::new(Vec::new()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, BootState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> BootState {
        self.lock_state().clone()
    }

    pub fn log(&self) -> Arc<dyn LogSink> {
        Arc::clone(&self.log)
    }

    pub fn log_path(&self) -> Option<PathBuf> {
        self.log.log_path().map(Path::to_path_buf)
    }

    pub fn loader(&self) -> Option<Arc<dyn ModLoader>> {
        self.loader.get().cloned()
    }

    pub fn endpoint(&self) -> Option<Arc<dyn HostEndpoint>> {
        self.endpoint.get().cloned()
    }

    /// The readiness token, once the boot has succeeded.
    pub fn ready_port(&self) -> Option<i32> {
        match *self.lock_state() {
            BootState::Ready(port) => Some(port),
            _ => None,
        }
    }

    /// Move from `Idle` to `Initializing`. The returned timer is the only
    /// way to run timed stages.
    pub(crate) fn begin(&self) -> Result<BootTimer, BootError> {
        let mut state = self.lock_state();
        if *state != BootState::Idle {
            return Err(BootError::AlreadyStarted(state.to_string()));
        }
        *state = BootState::Initializing;
        drop(state);

        Ok(BootTimer::start(self.log()))
    }

    pub(crate) fn finish(&self, outcome: BootState) {
        *self.lock_state() = outcome;
    }

    pub(crate) fn set_loader(&self, loader: Arc<dyn ModLoader>) {
        if self.loader.set(loader).is_err() {
            log::warn!("Mod loader already set; keeping the first one");
        }
    }

    pub(crate) fn set_endpoint(&self, endpoint: Arc<dyn HostEndpoint>) {
        if self.endpoint.set(endpoint).is_err() {
            log::warn!("Host endpoint already set; keeping the first one");
        }
    }

    /// Keep `value` alive as long as the context.
    pub fn retain<T: Any + Send>(&self, value: T) {
        self.retained
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Box::new(value));
    }

    pub fn retained_count(&self) -> usize {
        self.retained
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}
