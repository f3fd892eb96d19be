//! LOKI Updater - store maintenance tool

use anyhow::{Context, Result};
use clap::Parser;
use loki_common::logging::{init_logging, LogConfig};
use loki_common::Build;
use loki_updater::{
    Lifted, PluginRegistry, Region, SchemaCatalog, Store, Updater, UpdaterConfig,
};
use std::io::{BufRead, BufReader, Write};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "loki-updater")]
#[command(author, version, about = "LOKI knowledge store maintenance")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Knowledge store file (overrides LOKI_DATABASE_PATH)
    #[arg(short, long, global = true)]
    database: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Parser, Debug)]
enum Command {
    /// Show registered sources and their latest refresh attempt
    Status {
        /// Only this source
        source: Option<String>,
    },

    /// List warnings recorded for a source
    Warnings { source: String },

    /// Delete every row a source contributed
    Purge {
        source: String,

        /// Also deactivate the source so refreshes skip it
        #[arg(long)]
        remove: bool,
    },

    /// Freeze the store; later refreshes are refused
    Finalize,

    /// Map regions from a tab-separated file (label, chr, start, end) between builds
    Lift {
        /// Input file
        input: String,

        /// Build the regions are in, e.g. hg18
        #[arg(long)]
        from: Build,

        /// Build to map to, e.g. hg19
        #[arg(long)]
        to: Build,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("loki-updater")
        .build()
        .merge_env()?;
    let _guard = init_logging(&log_config)?;

    let mut config = UpdaterConfig::load()?;
    if let Some(database) = cli.database {
        config.database_path = database;
    }
    if matches!(cli.command, Command::Status { .. } | Command::Warnings { .. } | Command::Lift { .. }) {
        config.read_only = true;
    }

    let store = Store::open(&config, SchemaCatalog::core())
        .await
        .with_context(|| format!("Failed to open knowledge store {}", config.database_path))?;
    let updater = Updater::new(store.clone(), config, PluginRegistry::new());

    match cli.command {
        Command::Status { source } => {
            let sources = updater.sources().await?;
            for record in sources
                .iter()
                .filter(|r| source.as_deref().is_none_or(|s| s == r.name))
            {
                let latest = updater.get_source_status(&record.name).await?;
                let entry = serde_json::json!({ "source": record, "latest_run": latest });
                println!("{}", serde_json::to_string_pretty(&entry)?);
            }
        },
        Command::Warnings { source } => {
            for warning in updater.warnings(&source).await? {
                println!("{}\t{}", warning.created_at.to_rfc3339(), warning.message);
            }
        },
        Command::Purge { source, remove } => {
            let rows = if remove {
                updater.remove_source(&source).await?
            } else {
                updater.purge(&source).await?
            };
            info!(source = %source, rows, "purge complete");
            println!("{rows}");
        },
        Command::Finalize => {
            store.finalize().await?;
            info!("store finalized");
        },
        Command::Lift { input, from, to } => {
            let file = std::fs::File::open(&input)
                .with_context(|| format!("Failed to open {input}"))?;
            let regions = read_regions(BufReader::new(file))?;
            let lifted = updater.map_regions(from.0, to.0, regions).await?;

            let mut stdout = std::io::stdout().lock();
            let mut unmapped = 0u64;
            for result in lifted {
                match result {
                    Lifted::Mapped(r) => {
                        writeln!(stdout, "{}\t{}\t{}\t{}", r.label, r.chr, r.start, r.end)?
                    },
                    Lifted::Unmapped(_) => unmapped += 1,
                }
            }
            info!(unmapped, from = %from, to = %to, "liftover complete");
        },
    }

    store.close().await;
    Ok(())
}

fn read_regions(reader: impl BufRead) -> Result<Vec<Region<()>>> {
    let mut regions = Vec::new();
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        let &[label, chr, start, end] = fields.as_slice() else {
            anyhow::bail!("line {}: expected 4 tab-separated fields", n + 1);
        };
        let start: i64 = start
            .trim()
            .parse()
            .with_context(|| format!("line {}: bad start", n + 1))?;
        let end: i64 = end
            .trim()
            .parse()
            .with_context(|| format!("line {}: bad end", n + 1))?;
        regions.push(Region::new(label, chr, start, end, ()));
    }
    Ok(regions)
}
