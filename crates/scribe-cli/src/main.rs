#![forbid(unsafe_code)]

mod cmd;
mod output;

use clap::{Parser, Subcommand};
use output::OutputMode;
use std::env;
use std::io;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "scribe: versioned migrations for the local message store",
    long_about = None
)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON output instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    /// Derive the output mode from flags.
    const fn output_mode(&self) -> OutputMode {
        if self.json {
            OutputMode::Json
        } else {
            OutputMode::Human
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Initialize a scribe store",
        long_about = "Create .scribe/ with a default config.toml and an empty store.",
        after_help = "EXAMPLES:\n    # Initialize in the current directory\n    scribe init\n\n    # Emit machine-readable output\n    scribe init --json"
    )]
    Init,

    #[command(
        about = "Show the store schema version",
        long_about = "Show the stored schema version, the latest registered version, pending steps, and row counts per collection.",
        after_help = "EXAMPLES:\n    # Human summary\n    scribe status\n\n    # Emit machine-readable output\n    scribe status --json"
    )]
    Status,

    #[command(
        about = "Apply pending migration steps",
        long_about = "Apply every registered step above the stored version, up to the target, checkpointing after each one.",
        after_help = "EXAMPLES:\n    # Migrate to the latest version\n    scribe migrate\n\n    # Stop at a specific version\n    scribe migrate --target 15\n\n    # Emit machine-readable output\n    scribe migrate --json"
    )]
    Migrate(cmd::migrate::MigrateArgs),
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_env("SCRIBE_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if verbose || env::var("DEBUG").is_ok() {
            "scribe=debug,info"
        } else {
            "scribe=info,warn"
        })
    });

    let format = env::var("SCRIBE_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(io::stderr))
                .init();
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let project_root = env::current_dir()?;
    let output = cli.output_mode();
    debug!(root = %project_root.display(), ?output, "resolved project root");

    match cli.command {
        Commands::Init => cmd::init::run_init(output, &project_root),
        Commands::Status => cmd::status::run_status(output, &project_root),
        Commands::Migrate(ref args) => cmd::migrate::run_migrate(args, output, &project_root),
    }
}
