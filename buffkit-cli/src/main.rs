//! Task invoker for buffkit applications.
//!
//! Exposes migrations, background-job control, and import-map management
//! as `name:subtask` commands. Exit code 0 on success, 1 on failure with
//! the reason on stderr.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "buffkit",
    version,
    about = "buffkit task invoker: migrations, jobs, import maps"
)]
struct Cli {
    /// Path to the configuration file (default: ./buffkit.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply all pending migrations in lexical order
    #[command(name = "buffkit:migrate")]
    Migrate,

    /// List applied and pending migration versions
    #[command(name = "buffkit:migrate:status")]
    MigrateStatus,

    /// Roll back the last N migrations (requires down scripts)
    #[command(name = "buffkit:migrate:down")]
    MigrateDown {
        /// How many migrations to roll back
        n: usize,
    },

    /// Scaffold up/down script files for a new migration
    #[command(name = "buffkit:migrate:create")]
    MigrateCreate {
        /// Migration name (slugified into the filename)
        name: String,
    },

    /// Start worker routines consuming the job queues
    #[command(name = "jobs:worker")]
    JobsWorker {
        /// Number of workers (defaults to the configured count)
        concurrency: Option<usize>,
    },

    /// Register the standard periodic tasks and run the schedule loop
    #[command(name = "jobs:scheduler")]
    JobsScheduler,

    /// Print pending and completed counts by queue
    #[command(name = "jobs:stats")]
    JobsStats,

    /// Add an import-map pin, optionally vendoring the module
    #[command(name = "importmap:pin")]
    ImportmapPin {
        /// Logical module name
        name: String,
        /// Remote URL
        url: String,
        /// Download the module and record an integrity hash
        #[arg(long)]
        download: bool,
    },

    /// Remove an import-map pin
    #[command(name = "importmap:unpin")]
    ImportmapUnpin {
        /// Logical module name
        name: String,
    },

    /// Download every remote pin
    #[command(name = "importmap:vendor")]
    ImportmapVendor,

    /// Refresh all vendored files
    #[command(name = "importmap:update")]
    ImportmapUpdate,

    /// List pins
    #[command(name = "importmap:list")]
    ImportmapList,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => buffkit::config::Config::load_from(path.clone()),
        None => buffkit::config::Config::load(),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };
    buffkit::observability::init_tracing(&config);

    let result = match cli.command {
        Command::Migrate => commands::migrate(&config).await,
        Command::MigrateStatus => commands::migrate_status(&config).await,
        Command::MigrateDown { n } => commands::migrate_down(&config, n).await,
        Command::MigrateCreate { name } => commands::migrate_create(&config, &name),
        Command::JobsWorker { concurrency } => commands::jobs_worker(config, concurrency).await,
        Command::JobsScheduler => commands::jobs_scheduler(config).await,
        Command::JobsStats => commands::jobs_stats(config).await,
        Command::ImportmapPin {
            name,
            url,
            download,
        } => commands::importmap_pin(&config, &name, &url, download).await,
        Command::ImportmapUnpin { name } => commands::importmap_unpin(&config, &name),
        Command::ImportmapVendor => commands::importmap_vendor(&config).await,
        Command::ImportmapUpdate => commands::importmap_update(&config).await,
        Command::ImportmapList => commands::importmap_list(&config),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
