//! Boot sequencing: readiness sentinel, timed stages, delay injection and
//! the exit guard, then the readiness token.

use super::context::{BootContext, BootState, HostEndpoint, ModLoader};
use super::timer::execute_timed;
use crate::config::{BootConfig, DelayPolicy};
use crate::error::BootError;
use crate::hooks::delay::panic_message;
use crate::hooks::{DelayInjector, ExitGuard, HookBackend, HookTargets};
use crate::pe::{drm, PeFile};
use crate::readiness::{PlatformSlot, ReadinessPublisher, SlotStorage};
use std::error::Error;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

pub const STAGE_PREPARE: &str = "Prepare Hooks";
pub const STAGE_CREATE_LOADER: &str = "Create Loader";
pub const STAGE_CREATE_HOST: &str = "Create Loader Host (Async)";
pub const STAGE_PE_OPERATIONS: &str = "Parsing PE Header, Checking DRM (Async)";
pub const STAGE_LOAD_MODS: &str = "Loading Mods (Total)";
pub const STAGE_LOAD_MODS_DELAYED: &str = "Loading Mods (Delayed)";

/// What the boot needs to know about the host.
#[derive(Debug, Clone)]
pub struct BootOptions {
    /// Executable to check for DRM wrappers. `None` skips the check.
    pub host_image: Option<PathBuf>,
    pub delay_policy: DelayPolicy,
    pub hook_targets: HookTargets,
}

impl Default for BootOptions {
    fn default() -> Self {
        Self {
            host_image: None,
            delay_policy: DelayPolicy::Auto,
            hook_targets: HookTargets::bundled(),
        }
    }
}

impl BootOptions {
    /// Options for the running process. An unreadable descriptor override
    /// is logged and replaced by the bundled list.
    pub fn from_config(config: &BootConfig) -> Self {
        let hook_targets = match HookTargets::load_or_bundled(config.hook_targets.as_deref()) {
            Ok(targets) => targets,
            Err(e) => {
                log::warn!(
                    "Ignoring hook descriptor override: {:#}",
                    anyhow::Error::from(e)
                );
                HookTargets::bundled()
            }
        };

        Self {
            host_image: std::env::current_exe().ok(),
            delay_policy: config.delay_injection,
            hook_targets,
        }
    }
}

/// Result of the PE stage.
struct PeStage<B: HookBackend> {
    injector: Option<DelayInjector<B>>,
    exit_guard: Option<ExitGuard<B>>,
}

impl<B: HookBackend> PeStage<B> {
    fn defers_loading(&self) -> bool {
        self.injector.is_some()
    }
}

/// Builds the hooking backend and boot options once the boot has started.
type Setup<B> = Box<dyn FnOnce() -> anyhow::Result<(B, BootOptions)> + Send>;

/// Runs one boot attempt against a context.
pub struct Orchestrator<B: HookBackend + Clone, S: SlotStorage = PlatformSlot> {
    context: Arc<BootContext>,
    readiness: ReadinessPublisher<S>,
    setup: Setup<B>,
}

impl<B: HookBackend + Clone, S: SlotStorage + 'static> Orchestrator<B, S> {
    pub fn new(
        context: Arc<BootContext>,
        backend: B,
        readiness: ReadinessPublisher<S>,
        options: BootOptions,
    ) -> Self {
        Self::with_setup(context, readiness, move || Ok((backend, options)))
    }

    /// Build the backend and options inside the boot, after the readiness
    /// sentinel is written. A setup error fails the boot like any stage.
    pub fn with_setup<P>(context: Arc<BootContext>, readiness: ReadinessPublisher<S>, setup: P) -> Self
    where
        P: FnOnce() -> anyhow::Result<(B, BootOptions)> + Send + 'static,
    {
        Self {
            context,
            readiness,
            setup: Box::new(setup),
        }
    }

    /// Boot and return the readiness token, or `0` on failure.
    ///
    /// Never panics and never returns an error: failures are logged, flushed
    /// and recorded as [`BootState::Failed`]. The readiness segment is kept
    /// alive by the context either way.
    pub fn run<L, H>(self, create_loader: L, create_host: H) -> i32
    where
        L: FnOnce() -> anyhow::Result<Arc<dyn ModLoader>>,
        H: FnOnce(Arc<dyn ModLoader>) -> anyhow::Result<Arc<dyn HostEndpoint>> + Send,
    {
        let Self {
            context,
            readiness,
            setup,
        } = self;

        let outcome = boot(&context, &readiness, setup, create_loader, create_host);

        let token = match outcome {
            Ok(port) => {
                context.finish(BootState::Ready(port));
                port
            }
            Err(BootError::AlreadyStarted(state)) => {
                log::warn!("Boot requested again while {}", state);
                return context.ready_port().unwrap_or(0);
            }
            Err(e) => {
                report_failure(&context, &e);
                context.finish(BootState::Failed(describe(&e)));
                0
            }
        };

        context.retain(readiness);
        token
    }
}

/// Record a boot that failed before it could be orchestrated, such as when
/// the readiness segment cannot be created.
///
/// Returns the token to hand back: the published port if a boot already
/// succeeded, otherwise `0`. An earlier outcome is never overwritten.
pub fn fail_boot(context: &BootContext, error: BootError) -> i32 {
    if let Err(e) = context.begin() {
        log::warn!("Not recording '{}': {}", describe(&error), e);
        return context.ready_port().unwrap_or(0);
    }

    report_failure(context, &error);
    context.finish(BootState::Failed(describe(&error)));
    0
}

fn boot<B, S, L, H>(
    context: &BootContext,
    readiness: &ReadinessPublisher<S>,
    setup: Setup<B>,
    create_loader: L,
    create_host: H,
) -> Result<i32, BootError>
where
    B: HookBackend + Clone,
    S: SlotStorage,
    L: FnOnce() -> anyhow::Result<Arc<dyn ModLoader>>,
    H: FnOnce(Arc<dyn ModLoader>) -> anyhow::Result<Arc<dyn HostEndpoint>> + Send,
{
    let timer = context.begin()?;
    readiness.reset()?;

    let (backend, options) = guarded(STAGE_PREPARE, setup)?;
    let (backend, options) = (&backend, &options);

    let loader = timer.execute(STAGE_CREATE_LOADER, || guarded(STAGE_CREATE_LOADER, create_loader))?;
    context.set_loader(Arc::clone(&loader));

    let (host, pe) = thread::scope(|scope| {
        let host_loader = Arc::clone(&loader);
        let host_stage = scope.spawn(|| {
            timer.execute(STAGE_CREATE_HOST, || create_host(host_loader))
        });
        let pe_stage = scope.spawn(|| {
            timer.execute(STAGE_PE_OPERATIONS, || {
                pe_operations(context, backend, options, &loader)
            })
        });

        let host = match host_stage.join() {
            Ok(result) => result.map_err(|e| BootError::stage(STAGE_CREATE_HOST, e)),
            Err(payload) => Err(panicked(STAGE_CREATE_HOST, payload)),
        };
        let pe = match pe_stage.join() {
            Ok(result) => result,
            Err(payload) => Err(panicked(STAGE_PE_OPERATIONS, payload)),
        };
        (host, pe)
    });

    let host = host?;
    let pe = pe?;
    context.set_endpoint(Arc::clone(&host));

    if !pe.defers_loading() {
        timer.execute(STAGE_LOAD_MODS, || {
            guarded(STAGE_LOAD_MODS, || loader.load_for_current_process())
        })?;
    }

    let port = host.port();
    readiness.commit(port)?;

    if let Some(injector) = pe.injector {
        context.retain(injector);
    }
    if let Some(guard) = pe.exit_guard {
        context.retain(guard);
    }

    timer.report_total();
    Ok(port)
}

/// Parse the host image, report DRM, arm delay injection when the policy
/// asks for it, and install the exit guard.
fn pe_operations<B: HookBackend + Clone>(
    context: &BootContext,
    backend: &B,
    options: &BootOptions,
    loader: &Arc<dyn ModLoader>,
) -> Result<PeStage<B>, BootError> {
    let drm_detected = match &options.host_image {
        Some(path) => {
            let pe = PeFile::headers_from_file(path)?;
            log::debug!("Host image: {} ({})", path.display(), pe.machine_name());
            let found = drm::detect(&pe);
            drm::log_warnings(&found);
            !found.is_empty()
        }
        None => {
            log::warn!("Host image path unknown, skipping DRM check");
            false
        }
    };

    let mut stage = PeStage {
        injector: None,
        exit_guard: None,
    };

    if options.delay_policy.should_delay(drm_detected) {
        let loader = Arc::clone(loader);
        let sink = context.log();
        let injector = DelayInjector::install(backend.clone(), &options.hook_targets, move || {
            let result = execute_timed(sink.as_ref(), STAGE_LOAD_MODS_DELAYED, || {
                loader.load_for_current_process()
            });
            if let Err(e) = result {
                sink.write_line(&format!("Failed to load mods after delay injection: {:#}", e));
            }
            sink.flush();
        })?;

        if injector.armed_count() > 0 {
            stage.injector = Some(injector);
        } else {
            log::warn!("Delay injection requested but no imports could be hooked; loading mods now");
        }
    }

    stage.exit_guard = ExitGuard::install(backend, context.log())?;
    Ok(stage)
}

/// Run a collaborator call, turning its error or panic into a stage failure.
fn guarded<T>(
    stage: &'static str,
    call: impl FnOnce() -> anyhow::Result<T>,
) -> Result<T, BootError> {
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(result) => result.map_err(|e| BootError::stage(stage, e)),
        Err(payload) => Err(panicked(stage, payload)),
    }
}

fn panicked(stage: &'static str, payload: Box<dyn std::any::Any + Send>) -> BootError {
    BootError::StagePanicked {
        stage,
        message: panic_message(&payload),
    }
}

/// The error and its causes on one line.
fn describe(error: &BootError) -> String {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

fn report_failure(context: &BootContext, error: &BootError) {
    let log_path = context
        .log_path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(no log file)".to_string());

    let sink = context.log();
    sink.write_line(&format!(
        "Failed to load Reloaded-II.\n{}\nA log is available at: {}",
        describe(error),
        log_path
    ));
    sink.flush();
}
