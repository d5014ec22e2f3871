//! CLI for the ModelOps bundle tool.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod ops;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

#[derive(Parser)]
#[command(
    name = "mob",
    version,
    about = "Package, version, and distribute model code and data as OCI artifacts"
)]
struct Cli {
    /// Talk plain HTTP to the registry (local development registries).
    #[arg(long, global = true)]
    insecure: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize a bundle project in the current directory.
    Init {
        /// The bundle's home: `<host>/<repo>`.
        registry_ref: String,
    },
    /// Start tracking files.
    Add {
        /// Files to track (absolute, CWD-relative, or project-relative).
        #[arg(required = true)]
        paths: Vec<String>,
        /// Track even files the ignore rules exclude.
        #[arg(long)]
        force: bool,
    },
    /// Stop tracking files (does not delete them).
    Remove {
        /// Files to untrack.
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Show sync status against the remote tag.
    Status {
        /// Output format.
        #[arg(long, default_value = "table")]
        format: OutputFormat,
        /// Tag to compare against (default: the configured tag).
        #[arg(long)]
        tag: Option<String>,
    },
    /// Show per-file changes since the last sync.
    Diff {
        /// Tag to compare against (default: the configured tag).
        #[arg(long)]
        tag: Option<String>,
    },
    /// Publish the tracked file set to the registry.
    Push {
        /// Tag to publish (default: the configured tag).
        #[arg(long)]
        tag: Option<String>,
        /// Push even if the tag moved since the last sync.
        #[arg(long)]
        force: bool,
    },
    /// Make the working tree match a published bundle.
    Pull {
        /// Tag or `sha256:` digest (default: the configured tag).
        reference: Option<String>,
        /// Overwrite local changes and apply remote deletions.
        #[arg(long)]
        overwrite: bool,
        /// Also delete local files the remote does not have.
        #[arg(long)]
        mirror: bool,
    },
    /// List tags in the bundle's repository.
    Tags,
    /// Manage the shared object cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Generate shell completion scripts.
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

/// Subcommands for `mob cache`.
#[derive(Subcommand)]
enum CacheAction {
    /// Print the cache directory.
    Dir,
    /// Remove stale temp files left by interrupted downloads.
    Sweep {
        /// Only remove temp files older than this many hours.
        #[arg(long, default_value_t = 24)]
        older_than_hours: u64,
    },
}

/// Output format for status.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub(crate) enum OutputFormat {
    /// Human-readable table.
    #[default]
    Table,
    /// Machine-readable JSON.
    Json,
}

impl Cli {
    async fn dispatch(self) -> Result<()> {
        let insecure = self.insecure;
        match self.command {
            Command::Init { registry_ref } => ops::init(&registry_ref),
            Command::Add { paths, force } => ops::add(&paths, force),
            Command::Remove { paths } => ops::remove(&paths),
            Command::Status { format, tag } => ops::status(format, tag.as_deref(), insecure).await,
            Command::Diff { tag } => ops::diff(tag.as_deref(), insecure).await,
            Command::Push { tag, force } => ops::push(tag.as_deref(), force, insecure).await,
            Command::Pull {
                reference,
                overwrite,
                mirror,
            } => ops::pull(reference.as_deref(), overwrite, mirror, insecure).await,
            Command::Tags => ops::tags(insecure).await,
            Command::Cache { action } => match action {
                CacheAction::Dir => ops::cache_dir(),
                CacheAction::Sweep { older_than_hours } => ops::cache_sweep(older_than_hours),
            },
            Command::Completion { shell } => {
                clap_complete::generate(shell, &mut Self::command(), "mob", &mut std::io::stdout());
                Ok(())
            }
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("MOB_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = Cli::parse().dispatch().await {
        eprintln!("mob: {e:#}");
        std::process::exit(exit_code(&e));
    }
}

/// Maps engine errors to the documented exit codes; everything else is 1.
fn exit_code(error: &anyhow::Error) -> i32 {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<mob::Error>())
        .map_or(1, mob::Error::exit_code)
}
