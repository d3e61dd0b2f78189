//! Burn - bundle engine entry point
//!
//! `run` hosts the engine with the console UX; `elevated` is the companion the
//! engine launches for per-machine packages.

use anyhow::{Context, Result};
use burn_engine::cli::{Cli, Commands};
use burn_engine::config::{EngineConfig, RestartPolicy};
use burn_engine::elevation::SECRET_ENV;
use burn_engine::elevation::companion::{CompanionOptions, run_companion};
use burn_engine::engine::host::initiate_restart;
use burn_engine::engine::{Engine, EngineHost};
use burn_engine::logging::{self, Verbosity};
use burn_engine::manifest::Manifest;
use burn_engine::process_guard::{ProcessGuard, init_signal_handlers};
use burn_engine::registration::{FileRegistrationStore, RegistrationStore};
use burn_engine::runner::ProcessRunner;
use burn_engine::system::{HostSystem, SystemProbe};
use burn_engine::types::BundleAction;
use burn_engine::ux::ConsoleUx;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

fn main() {
    let cli = Cli::parse_args();

    let code = match dispatch(cli) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}

fn dispatch(cli: Cli) -> Result<i32> {
    let quiet = matches!(cli.command, Commands::Run { quiet: true, .. });
    let verbosity = if cli.verbose {
        Verbosity::Verbose
    } else if quiet {
        Verbosity::Quiet
    } else {
        Verbosity::Normal
    };
    logging::init(cli.log.as_deref(), verbosity)?;

    let config = EngineConfig::load_or_default(cli.config.as_deref())
        .context("Failed to load engine configuration")?;

    match cli.command {
        Commands::Run {
            manifest,
            action,
            source,
            layout_dir,
            quiet: _,
            norestart,
        } => run_bundle(
            RunOptions {
                manifest,
                action,
                source,
                layout_dir,
                norestart,
                config_path: cli.config,
            },
            config,
        ),
        Commands::Elevated {
            manifest,
            cache_dir,
        } => run_elevated(&manifest, cache_dir, config),
        Commands::Validate { manifest } => validate(&manifest),
        Commands::Status { manifest } => status(&manifest, &config),
    }
}

struct RunOptions {
    manifest: PathBuf,
    action: BundleAction,
    source: Option<PathBuf>,
    layout_dir: Option<PathBuf>,
    norestart: bool,
    config_path: Option<PathBuf>,
}

fn run_bundle(options: RunOptions, mut config: EngineConfig) -> Result<i32> {
    let manifest_path = std::fs::canonicalize(&options.manifest)
        .with_context(|| format!("Manifest not found: {:?}", options.manifest))?;
    let manifest = Manifest::load(&manifest_path)
        .with_context(|| format!("Failed to load manifest {:?}", manifest_path))?;
    tracing::info!(
        "Bundle {} {} ({})",
        manifest.registration.name,
        manifest.registration.version,
        manifest.registration.id
    );

    if options.norestart {
        config.restart = RestartPolicy::Never;
    }

    let _guard = ProcessGuard::new();
    let ux = Arc::new(ConsoleUx::new(options.action, !options.norestart));
    let mut builder = Engine::builder(manifest, config)
        .ux(ux)
        .manifest_path(&manifest_path);
    if let Some(source) = options.source {
        builder = builder.source_dir(source);
    }
    if let Some(layout_dir) = options.layout_dir {
        builder = builder.layout_dir(layout_dir);
    }
    if let Some(config_path) = options.config_path {
        builder = builder.config_path(config_path);
    }
    let engine = builder.build().context("Failed to start the engine")?;

    if let Err(e) = init_signal_handlers(engine.cancel_flag()) {
        tracing::warn!("Failed to initialize signal handlers: {}", e);
    }

    let summary = EngineHost::run(engine);
    tracing::info!(
        "Finished in phase {} with {} (restart required: {})",
        summary.phase,
        summary.status,
        summary.restart_required
    );

    if summary.restart_requested && !options.norestart {
        if let Err(e) = initiate_restart() {
            tracing::error!("Failed to restart the machine: {}", e);
        }
    }

    Ok(summary.exit_code())
}

fn run_elevated(manifest_path: &Path, cache_dir: PathBuf, config: EngineConfig) -> Result<i32> {
    let secret = std::env::var(SECRET_ENV)
        .with_context(|| format!("{} is not set; the companion is started by the engine", SECRET_ENV))?;
    let manifest = Manifest::load(manifest_path)
        .with_context(|| format!("Failed to load manifest {:?}", manifest_path))?;

    let _guard = ProcessGuard::new();
    // The parent owns cancellation; a signal here only stops installers on exit.
    if let Err(e) = init_signal_handlers(Arc::new(AtomicBool::new(false))) {
        tracing::warn!("Failed to initialize signal handlers: {}", e);
    }

    let timeout = config.pipe_timeout();
    let options = CompanionOptions {
        secret,
        manifest,
        config,
        cache_dir,
        runner: Arc::new(ProcessRunner::default()),
        timeout,
    };
    tracing::info!("Elevated companion serving {:?}", manifest_path);
    let status = run_companion(std::io::stdin(), std::io::stdout(), options)
        .context("Elevated companion failed")?;
    Ok(status.exit_code())
}

fn validate(path: &Path) -> Result<i32> {
    let manifest =
        Manifest::load(path).with_context(|| format!("Invalid manifest {:?}", path))?;
    let source_dir = path.parent().unwrap_or_else(|| Path::new("."));

    println!(
        "Manifest is valid: {} {} ({})",
        manifest.registration.name, manifest.registration.version, manifest.registration.id
    );
    println!("  {} variable(s), {} search(es)", manifest.variables.len(), manifest.searches.len());
    for package in &manifest.packages {
        let payload = package.payload_path(source_dir);
        let marker = if payload.exists() { "ok" } else { "missing" };
        println!(
            "  {} {} {} [{}]",
            package.package_type(),
            package.id,
            payload.display(),
            marker
        );
    }
    Ok(0)
}

fn status(path: &Path, config: &EngineConfig) -> Result<i32> {
    let manifest =
        Manifest::load(path).with_context(|| format!("Failed to load manifest {:?}", path))?;
    let store = FileRegistrationStore::new(config.registration_dir(&manifest.registration.id));
    let boot_id = HostSystem.boot_session_id();

    match store.record().context("Failed to read registration")? {
        Some(record) => {
            println!("{} {} ({})", record.name, record.version, record.bundle_id);
            println!("  installed:   {}", record.installed);
            println!("  per-machine: {}", record.per_machine);
            println!("  session:     {}", record.resume_mode);
        }
        None => println!("{} is not registered", manifest.registration.id),
    }
    println!("  resume type: {}", store.detect_resume_type(boot_id.as_deref()));
    Ok(0)
}
