//! lipa - command-line front-end for the Limba bundle manager.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cmd;
mod console;

#[derive(Parser)]
#[command(name = "lipa")]
#[command(author, version, about = "Install and manage self-contained application bundles")]
struct Cli {
    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install a package from a repository id or a local bundle file
    Install {
        /// Package id (name/version) or path to an .ipk file
        target: String,
        /// Skip signature checks (dangerous)
        #[arg(long)]
        insecure: bool,
        /// Treat missing host components as warnings
        #[arg(long)]
        ignore_foundations: bool,
    },
    /// Remove an installed package
    Remove {
        /// Package id (name/version)
        id: String,
    },
    /// Refresh the repository cache
    Update,
    /// List installed packages
    ListInstalled,
    /// List packages available in the configured repositories
    ListAvailable,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let console = std::sync::Arc::new(console::Console::new(cli.quiet));

    let result = match cli.command {
        Commands::Install {
            target,
            insecure,
            ignore_foundations,
        } => cmd::install::run(&console, &target, insecure, ignore_foundations).await,
        Commands::Remove { id } => cmd::remove::run(&console, &id).await,
        Commands::Update => cmd::update::run(&console).await,
        Commands::ListInstalled => cmd::list::installed(),
        Commands::ListAvailable => cmd::list::available(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
