//! # Warehouse Loader CLI (`wload`)
//!
//! The `wload` binary lists objects in storage, bulk-copies the large ones
//! into warehouse tables, and keeps an audit table of every load.
//!
//! ## Usage
//!
//! ```bash
//! wload --config ./config/wload.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `wload init` | Create the audit table if it is missing |
//! | `wload load` | Run one full load pass |
//! | `wload report` | Per-table load counts and average sizes |
//! | `wload validate [KEY]` | Row, column and null counts per object |
//! | `wload completions <shell>` | Print shell completions |
//!
//! ## Examples
//!
//! ```bash
//! # Create the audit table
//! wload init --config ./config/wload.toml
//!
//! # See what a load would do without touching the warehouse
//! wload load --dry-run
//!
//! # Load, with JSON progress lines on stderr
//! wload load --progress json
//!
//! # Dashboard data for external charting
//! wload report --json --output ./dashboard.json
//! ```

use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};

use warehouse_loader::progress::ProgressMode;
use warehouse_loader::{config, load, logging, migrate, report, validate};

/// Warehouse Loader: bulk-copy large storage objects into warehouse tables.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/wload.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "wload",
    about = "Warehouse Loader: bulk-copy large storage objects into warehouse tables",
    version,
    long_about = "Warehouse Loader lists objects under a storage prefix, skips those at or \
    below the size threshold, infers an all-text schema for the rest, recreates one table per \
    object, bulk-copies the object into it and appends an audit row describing the load."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/wload.toml`. Storage, warehouse, load and
    /// logging settings are read from this file.
    #[arg(long, global = true, default_value = "./config/wload.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Create the audit table.
    ///
    /// Connects to the configured warehouse and creates the audit table
    /// if it does not exist. Safe to run repeatedly.
    Init,

    /// Run one load pass.
    ///
    /// Lists every object under the configured prefix and loads each one
    /// above the size threshold into its own table.
    Load {
        /// List objects and print skip/load decisions without touching the warehouse.
        #[arg(long)]
        dry_run: bool,

        /// Maximum number of listed objects to consider.
        #[arg(long)]
        limit: Option<usize>,

        /// Progress on stderr. Defaults to `human` on a TTY, otherwise `off`.
        #[arg(long, value_enum)]
        progress: Option<ProgressArg>,
    },

    /// Report per-table load counts from the audit table.
    Report {
        /// Print the dashboard form: `[{"table": .., "count": ..}]`.
        #[arg(long)]
        json: bool,

        /// Write the report to a file instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Print row, column and null counts for listed objects.
    Validate {
        /// Validate only this object key.
        key: Option<String>,
    },

    /// Print shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Off,
    Human,
    Json,
}

impl From<ProgressArg> for ProgressMode {
    fn from(arg: ProgressArg) -> Self {
        match arg {
            ProgressArg::Off => ProgressMode::Off,
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Commands that don't require config
    if let Commands::Completions { shell } = cli.command {
        let mut command = Cli::command();
        let name = command.get_name().to_string();
        generate(shell, &mut command, name, &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;
    logging::init_logging(&cfg.logging)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Audit table ready.");
        }
        Commands::Load {
            dry_run,
            limit,
            progress,
        } => {
            let mode = progress
                .map(ProgressMode::from)
                .unwrap_or_else(ProgressMode::default_for_tty);
            load::run_load(&cfg, dry_run, limit, mode).await?;
        }
        Commands::Report { json, output } => {
            report::run_report(&cfg, json, output.as_deref()).await?;
        }
        Commands::Validate { key } => {
            validate::run_validate(&cfg, key.as_deref()).await?;
        }
        Commands::Completions { .. } => unreachable!("handled above"),
    }

    Ok(())
}
