//! Controller tool for the mod loader: waits for the readiness handshake and
//! inspects host executables.

use clap::{Parser, Subcommand};
use loader_core::hooks::exit_guard::{EXIT_EXPORT, EXIT_MODULE};
use loader_core::pe::{self, drm, PeFile};
use loader_core::*;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "loader-cli")]
#[command(about = "Mod loader controller: readiness handshake and host inspection", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Read the readiness slot of a process once
    Status {
        /// Process id of the host
        pid: u32,
    },

    /// Poll the readiness slot until the loader reports its port
    Wait {
        /// Process id of the host
        pid: u32,

        /// Give up after this many milliseconds
        #[arg(long, default_value_t = 30_000)]
        timeout: u64,

        /// Poll interval in milliseconds
        #[arg(long, default_value_t = 100)]
        interval: u64,
    },

    /// Report architecture, DRM wrappers and hookable imports of an executable
    Inspect {
        /// Host executable
        exe: PathBuf,

        /// Hook descriptor list to use instead of the bundled one
        #[arg(long, value_name = "FILE")]
        targets: Option<PathBuf>,
    },

    /// Print the hook descriptor list
    Targets {
        /// Descriptor list to print instead of the bundled one
        #[arg(long, value_name = "FILE")]
        file: Option<PathBuf>,

        /// Print as descriptor JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective boot configuration as JSON
    Config,
}

fn main() {
    env_logger::init();

    let args = Args::parse();

    let result = match args.command {
        Command::Status { pid } => status(pid),
        Command::Wait {
            pid,
            timeout,
            interval,
        } => wait(pid, Duration::from_millis(timeout), Duration::from_millis(interval)),
        Command::Inspect { exe, targets } => inspect(&exe, targets.as_deref()),
        Command::Targets { file, json } => print_targets(file.as_deref(), json),
        Command::Config => print_config(),
    };

    if let Err(e) = result {
        eprintln!("❌ {:#}", e);
        std::process::exit(1);
    }
}

fn status(pid: u32) -> anyhow::Result<()> {
    let reader = ReadinessReader::open(pid)?;

    match reader.read()? {
        ReadinessState::Loading => println!("⏳ Process {}: loading", pid),
        ReadinessState::Ready(port) => println!("✓ Process {}: ready on port {}", pid, port),
    }

    Ok(())
}

fn wait(pid: u32, timeout: Duration, interval: Duration) -> anyhow::Result<()> {
    println!("⏳ Waiting for process {} (timeout {:?})...", pid, timeout);

    let reader = ReadinessReader::open(pid)?;
    let port = reader.wait(timeout, interval)?;

    println!("✓ Loader ready on port {}", port);
    Ok(())
}

fn inspect(exe: &Path, targets: Option<&Path>) -> anyhow::Result<()> {
    let pe = PeFile::from_file(exe)?;
    let targets = HookTargets::load_or_bundled(targets)?;

    println!("🔍 {}", exe.display());
    println!("   Architecture: {}", pe.machine_name());
    println!("   Entry point:  0x{:X}", pe.entry_point());

    let wrappers = drm::detect(&pe);
    if wrappers.is_empty() {
        println!("   DRM:          none detected");
    } else {
        for kind in &wrappers {
            println!("⚠️  DRM: {}", kind);
            println!("   {}", kind.warning());
        }
    }

    let imports = pe::list_imports(&pe)?;
    log::debug!("{} imports from {} modules", exe.display(), imports.len());
    let hookable = targets.imported_by(&imports);

    println!(
        "\n💉 Delay injection: {} of {} hook targets imported",
        hookable.len(),
        targets.export_count()
    );
    for (module, export) in &hookable {
        println!("   {}!{}", module, export);
    }
    if hookable.is_empty() {
        println!("   (none; delayed loading would fall back to immediate loading)");
    }

    let exit_imported = imports
        .iter()
        .any(|m| m.name.eq_ignore_ascii_case(EXIT_MODULE) && m.imports(EXIT_EXPORT));
    if exit_imported {
        println!("\n✓ Exit guard: {}!{} imported", EXIT_MODULE, EXIT_EXPORT);
    } else {
        println!("\n⚠️  Exit guard: {}!{} not imported", EXIT_MODULE, EXIT_EXPORT);
    }

    Ok(())
}

fn print_targets(file: Option<&Path>, json: bool) -> anyhow::Result<()> {
    let targets = HookTargets::load_or_bundled(file)?;

    if json {
        let list: Vec<&HookTarget> = targets.iter().collect();
        println!("{}", serde_json::to_string_pretty(&list)?);
        return Ok(());
    }

    for (ordinal, target) in targets.iter().enumerate() {
        println!("[{}] {}", ordinal, target.module_name);
        for (export_ordinal, export) in target.export_names.iter().enumerate() {
            println!("    [{}] {}", export_ordinal, export);
        }
    }
    println!(
        "\n{} modules, {} exports",
        targets.len(),
        targets.export_count()
    );

    Ok(())
}

fn print_config() -> anyhow::Result<()> {
    let config = BootConfig::from_env();
    println!("{}", config.to_json()?);
    println!("Log directory: {}", config.log_dir().display());
    Ok(())
}
