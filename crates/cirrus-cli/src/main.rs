mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "cirrus")]
#[command(about = "Back up local files to a personal cloud drive or object store")]
#[command(version)]
struct Cli {
    /// Path to the Cirrus config directory (default: ~/.cirrus)
    #[arg(long, global = true, env = "CIRRUS_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the config directory and a default config
    Init,

    /// Show current configuration
    Config,

    /// Select the active backup provider (google_drive, onedrive, tencent_cos, qiniu_kodo, none)
    Use {
        /// Provider name or service code
        provider: String,
    },

    /// Show sign-in state and storage usage
    Status,

    /// Back up one or more files
    Backup {
        /// Files to back up; each file's stem is its target id
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Apply the automatic backup rules (enabled targets, size limit)
        #[arg(long)]
        auto: bool,
    },

    /// Restore remote objects into a directory
    Restore {
        /// Remote object names
        #[arg(required = true)]
        names: Vec<String>,

        /// Destination directory
        #[arg(long, default_value = ".")]
        dest: PathBuf,
    },

    /// Drop the active provider's session
    SignOut,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("cirrus=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let base_dir = match cli.config_dir {
        Some(ref dir) => dir.clone(),
        None => cirrus_core::config::CirrusConfig::default_base_dir()?,
    };

    let rt = tokio::runtime::Runtime::new()?;

    match cli.command {
        Commands::Init => commands::init::run(&base_dir),
        Commands::Config => commands::config::run(&base_dir),
        Commands::Use { ref provider } => commands::select::run(provider, &base_dir),
        Commands::Status => rt.block_on(commands::status::run(&base_dir)),
        Commands::Backup { ref paths, auto } => {
            rt.block_on(commands::backup::run(paths, auto, &base_dir))
        }
        Commands::Restore {
            ref names,
            ref dest,
        } => rt.block_on(commands::restore::run(names, dest, &base_dir)),
        Commands::SignOut => rt.block_on(commands::sign_out::run(&base_dir)),
    }
}
