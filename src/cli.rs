use crate::types::BundleAction;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Burn - a setup chainer for multi-package bundles
#[derive(Parser)]
#[command(name = "burn")]
#[command(about = "Detects, plans and applies a chain of installer packages")]
#[command(version)]
pub struct Cli {
    /// Engine configuration file (JSON). Defaults apply when omitted.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Write the log to this file instead of stderr
    #[arg(long, global = true)]
    pub log: Option<PathBuf>,

    /// Debug-level engine logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a bundle headless: Detect, Plan, Apply
    Run {
        /// Bundle manifest
        #[arg(short, long)]
        manifest: PathBuf,

        /// Bundle action: install, uninstall, modify, repair or layout
        #[arg(short, long, default_value = "install")]
        action: BundleAction,

        /// Directory holding the package payloads (defaults to the manifest's directory)
        #[arg(short, long)]
        source: Option<PathBuf>,

        /// Destination of the layout action
        #[arg(long)]
        layout_dir: Option<PathBuf>,

        /// Only log warnings and errors
        #[arg(short, long)]
        quiet: bool,

        /// Never restart the machine, even when a package asks for it
        #[arg(long)]
        norestart: bool,
    },
    /// Serve package execution for an unprivileged engine over stdin/stdout
    #[command(hide = true)]
    Elevated {
        #[arg(long)]
        manifest: PathBuf,

        #[arg(long)]
        cache_dir: PathBuf,
    },
    /// Check a bundle manifest
    Validate {
        /// Bundle manifest to validate
        manifest: PathBuf,
    },
    /// Show the registration and resume state of a bundle
    Status {
        /// Bundle manifest
        manifest: PathBuf,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}
