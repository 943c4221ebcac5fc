//! Native exports.

use crate::mods::LibraryModLoader;
use loader_core::boot::fail_boot;
use loader_core::hooks::IatBackend;
use loader_core::logging::{install_panic_hook, rotate_logs};
use loader_core::*;
use log::LevelFilter;
use std::ffi::c_void;
use std::panic;
use std::sync::{Arc, OnceLock};
use windows::Win32::Foundation::{BOOL, HINSTANCE};

/// Boot context for the life of the process.
static CONTEXT: OnceLock<Arc<BootContext>> = OnceLock::new();

#[no_mangle]
#[allow(non_snake_case)]
pub extern "system" fn DllMain(
    _dll_module: HINSTANCE,
    _call_reason: u32,
    _reserved: *mut c_void,
) -> BOOL {
    // Nothing may run under the loader lock; the stub calls Initialize.
    BOOL::from(true)
}

/// Boot the mod loader. Returns the readiness token, or `0` on failure.
///
/// # Safety
/// `parameters` is null or points to at least `size` readable bytes (or,
/// for `size <= 0`, to a block as long as its version field implies).
#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "system" fn Initialize(parameters: *const BootParameters, size: i32) -> i32 {
    let parameters = parameters as usize;
    match panic::catch_unwind(move || initialize(parameters as *const BootParameters, size)) {
        Ok(port) => port,
        Err(_) => {
            // The panic hook has already logged and flushed.
            0
        }
    }
}

fn initialize(parameters: *const BootParameters, size: i32) -> i32 {
    if let Some(context) = CONTEXT.get() {
        log::warn!("Initialize called again (state: {})", context.state());
        return context.ready_port().unwrap_or(0);
    }

    let log_dir = BootConfig::log_dir_from_env();
    let log = Arc::new(LoaderLog::new(&log_dir, LevelFilter::Info));
    if let Err(e) = LoaderLog::install(Arc::clone(&log)) {
        eprintln!("{:#}", e);
    }
    install_panic_hook(log.clone());

    let config = BootConfig::from_env();
    match rotate_logs(&log_dir, config.log_keep) {
        Ok(0) => {}
        Ok(deleted) => log::debug!("Rotated {} old logs", deleted),
        Err(e) => log::warn!("Failed to rotate logs: {:#}", e),
    }

    let parameters = unsafe { read_parameters(parameters, size) };
    log::info!(
        "Loader starting in process {} (parameters v{}, flags {:?})",
        std::process::id(),
        parameters.version,
        parameters.flags
    );
    if parameters.flags.contains(BootFlags::LOADED_EXTERNALLY) {
        log::info!("Loaded externally; launcher handshake may not be observed");
    }

    let context = Arc::clone(CONTEXT.get_or_init(|| Arc::new(BootContext::new(log.clone()))));

    let readiness = match ReadinessPublisher::publish(std::process::id()) {
        Ok(readiness) => readiness,
        Err(e) => return fail_boot(&context, e.into()),
    };

    let libraries = config.mod_libraries.clone();
    Orchestrator::with_setup(context, readiness, move || {
        let backend = IatBackend::for_host()?;
        Ok((backend, BootOptions::from_config(&config)))
    })
    .run(
        move || Ok(Arc::new(LibraryModLoader::new(libraries)) as Arc<dyn ModLoader>),
        |_| Ok(Arc::new(TcpHostEndpoint::start()?) as Arc<dyn HostEndpoint>),
    )
}

unsafe fn read_parameters(pointer: *const BootParameters, size: i32) -> BootParameters {
    if pointer.is_null() {
        log::warn!("No boot parameters passed, assuming current defaults");
        return BootParameters::current(BootFlags::empty());
    }

    let copied = if size > 0 {
        BootParameters::copy_from_bytes(std::slice::from_raw_parts(
            pointer as *const u8,
            size as usize,
        ))
    } else {
        BootParameters::copy_from_raw(pointer)
    };

    copied.unwrap_or_else(|e| {
        log::warn!("Ignoring boot parameters: {}", e);
        BootParameters::current(BootFlags::empty())
    })
}
