//! KanaDB CLI - inspect and edit a KanaDB store from the command line

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kanadb::config::{self, StoreConfig};
use kanadb::{ui, KanaDb};

mod commands;

#[derive(Parser)]
#[command(name = "kanadb")]
#[command(version)]
#[command(about = "Embedded store for analysis results and their reference-counted input files")]
#[command(long_about = r#"
KanaDB stores serialized analyses together with the input files they use.
Files shared by several analyses are stored once and reference counted.

Example usage:
  kanadb put-file counts.h5 --id counts
  kanadb put-analysis state.bin --title "First pass" --files refs.json
  kanadb list
  kanadb rm-analysis 0
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON instead of human-readable output
    #[arg(long, global = true)]
    json: bool,

    /// Path to the database file (overrides the config file)
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Path to the config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a config file and create the store
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },

    /// List stored analyses
    List,

    /// Store a file, adding one reference to it
    PutFile {
        /// File to read
        path: PathBuf,

        /// Id to store under (defaults to the BLAKE3 digest of the content)
        #[arg(long)]
        id: Option<String>,
    },

    /// Print or export a stored file
    GetFile {
        id: String,

        /// Write to this path instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Drop one reference to a file
    RmFile { id: String },

    /// Store an analysis payload
    PutAnalysis {
        /// Serialized analysis to read
        path: PathBuf,

        #[arg(short, long)]
        title: String,

        /// JSON file with the file reference graph
        #[arg(short, long)]
        files: Option<PathBuf>,

        /// Id to store under (defaults to the next free id)
        #[arg(long)]
        id: Option<String>,
    },

    /// Print or export an analysis payload
    GetAnalysis {
        id: String,

        /// Write to this path instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Remove an analysis and release its files
    RmAnalysis { id: String },

    /// Show analysis metadata with file reference counts
    Show { id: String },

    /// Show store statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let store_config = resolve_config(&cli)?;
    tracing::debug!(database = %store_config.database.display(), "using store");

    // opening is deferred until the first operation
    let db = KanaDb::new(store_config.clone());
    let result = match cli.command {
        Commands::Init { force } => {
            let path = cli.config.clone().unwrap_or_else(config::default_config_path);
            commands::run_init(&db, &path, &store_config, force, cli.json).await
        }
        Commands::List => commands::run_list(&db, cli.json).await,
        Commands::PutFile { path, id } => commands::run_put_file(&db, &path, id, cli.json).await,
        Commands::GetFile { id, out } => commands::run_get_file(&db, &id, out.as_deref()).await,
        Commands::RmFile { id } => commands::run_rm_file(&db, &id, cli.json).await,
        Commands::PutAnalysis {
            path,
            title,
            files,
            id,
        } => commands::run_put_analysis(&db, &path, &title, files.as_deref(), id, cli.json).await,
        Commands::GetAnalysis { id, out } => {
            commands::run_get_analysis(&db, &id, out.as_deref()).await
        }
        Commands::RmAnalysis { id } => commands::run_rm_analysis(&db, &id, cli.json).await,
        Commands::Show { id } => commands::run_show(&db, &id, cli.json).await,
        Commands::Stats => commands::run_stats(&db, cli.json).await,
    };

    if let Err(err) = result {
        ui::error(&format!("{:#}", err));
        std::process::exit(1);
    }
    Ok(())
}

fn resolve_config(cli: &Cli) -> anyhow::Result<StoreConfig> {
    let mut store_config = config::load_config(cli.config.as_deref())?.unwrap_or_default();
    if let Some(database) = &cli.database {
        store_config.database = database.clone();
    }
    Ok(store_config)
}
