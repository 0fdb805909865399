use anyhow::Result;
use clap::{Parser, Subcommand};
use seedline_migrate::MigrateError;
use std::process::ExitCode;

mod commands;

/// Exit code for "pending migrations detected" so scripts can tell it apart.
const EXIT_PENDING: u8 = 2;

#[derive(Parser)]
#[command(name = "seedline")]
#[command(about = "Data migrations with a regenerated seed snapshot", long_about = None)]
struct Cli {
    /// Layered config paths in merge order (default: seedline.yaml if present)
    #[arg(long = "config", global = true)]
    config_paths: Vec<String>,

    /// Silence logging
    #[arg(long, global = true, default_value_t = false)]
    quiet: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all pending data migrations, then regenerate the artifact
    Migrate,

    /// Apply one migration by version or file name
    Run {
        target: String,
    },

    /// Revert applied migrations, newest first
    Rollback {
        /// How many migrations to revert
        #[arg(long, default_value_t = 1, conflicts_with = "file")]
        steps: usize,

        /// Revert exactly this migration (version or file name)
        #[arg(long)]
        file: Option<String>,
    },

    /// Print every known migration with its state
    Status,

    /// Exit with code 2 when migrations are pending
    Check,

    /// Mark migrations as applied without running them
    Bootstrap {
        /// Highest version to mark (default: all files)
        #[arg(long)]
        cutoff: Option<String>,
    },

    /// Replay the artifact into the database and bootstrap the ledger
    Seed,

    /// Regenerate the artifact from current database state
    Synthesize,

    /// Create an empty migration file stamped with the current UTC time
    New {
        name: String,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash,
}

#[tokio::main]
async fn main() -> ExitCode {
    // dev-time convenience; a missing file is fine
    let _ = dotenvy::from_filename(".env.local");

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            match e.downcast_ref::<MigrateError>() {
                Some(MigrateError::PendingMigrations { .. }) => ExitCode::from(EXIT_PENDING),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let loaded = commands::load_config(&cli.config_paths)?;
    commands::init_tracing(&loaded.config, cli.quiet);
    commands::warn_unused_keys(&loaded.config_json)?;
    let config = loaded.config.clone().with_environment_from_env();

    match cli.cmd {
        Commands::ConfigHash => {
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::New { name } => commands::migrate::new_file(&config, &name)?,

        Commands::Migrate => commands::migrate::migrate(&config).await?,
        Commands::Run { target } => commands::migrate::run_one(&config, &target).await?,
        Commands::Rollback { steps, file } => {
            commands::migrate::rollback(&config, steps, file.as_deref()).await?
        }
        Commands::Status => commands::migrate::status(&config).await?,
        Commands::Check => commands::migrate::check(&config).await?,
        Commands::Bootstrap { cutoff } => {
            commands::migrate::bootstrap(&config, cutoff.as_deref()).await?
        }
        Commands::Seed => commands::migrate::seed(&config).await?,
        Commands::Synthesize => commands::migrate::synthesize(&config).await?,
    }

    Ok(())
}
