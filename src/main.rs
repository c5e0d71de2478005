//! # cparla CLI
//!
//! The `cparla` binary drives every part of the system from a shell:
//! database setup, dataset loading, gated SQL, semantic collections and the
//! MCP server.
//!
//! ## Usage
//!
//! ```bash
//! cparla --config ./config/cparla.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cparla init` | Create the SQLite database and run schema migrations |
//! | `cparla load <file>` | Load a JSON dataset of blocks, legislators, issues and votes |
//! | `cparla tables` | List queryable tables with row counts |
//! | `cparla describe <table>` | Show columns, keys and indexes |
//! | `cparla preview <table>` | Print the first rows of a table |
//! | `cparla query "<sql>"` | Run one read-only SELECT through the gate |
//! | `cparla collections` | List semantic collections |
//! | `cparla rebuild [name\|all]` | Rebuild collections from the relational tables |
//! | `cparla search <name> "<text>"` | Hybrid, dense or keyword search in one collection |
//! | `cparla check [name]` | Compare collections with the relational tables |
//! | `cparla serve mcp` | Start the MCP-compatible HTTP server |

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use serde::Serialize;
use std::path::PathBuf;

use cparla::config::{self, Config};
use cparla::index::SearchMode;
use cparla::sync::CollectionView;
use cparla::tools::ToolContext;
use cparla::{db, ingest, logging, migrate, server};

/// cparla: safe SQL and semantic search over parliamentary voting records.
#[derive(Parser)]
#[command(name = "cparla", version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "./config/cparla.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite file if needed and applies all migrations.
    /// Safe to run repeatedly.
    Init,

    /// Load a JSON dataset into the relational tables.
    ///
    /// The file holds `blocks`, `legislators`, `issues` and `votes` arrays.
    /// Everything is inserted in one transaction; a dangling reference
    /// aborts the whole load.
    Load {
        /// Path to the dataset file.
        file: PathBuf,
    },

    /// List queryable tables and their row counts.
    Tables,

    /// Describe one table: columns, primary key, foreign keys, indexes.
    Describe {
        /// Table name.
        table: String,
    },

    /// Print the first rows of a table.
    Preview {
        /// Table name.
        table: String,

        /// Rows to return, capped by `query.max_rows`.
        #[arg(long)]
        limit: Option<u32>,
    },

    /// Run a single read-only SELECT.
    ///
    /// The statement is validated and wrapped in a row limit before it
    /// reaches the database.
    Query {
        /// The SQL statement.
        sql: String,

        /// Rows to return, capped by `query.max_rows`.
        #[arg(long)]
        limit: Option<u32>,
    },

    /// List semantic collections and the views they can be built from.
    Collections,

    /// Rebuild semantic collections from the relational tables.
    ///
    /// Each rebuild embeds every row of the view into a fresh generation
    /// and swaps it in atomically. Requires an embedding provider.
    Rebuild {
        /// Collection name, or `all`.
        #[arg(default_value = "all")]
        collection: String,
    },

    /// Search one collection.
    ///
    /// `hybrid` fuses vector similarity with BM25 keyword ranking, `dense`
    /// uses vectors only, `keyword` uses BM25 only and needs no embedding
    /// provider. Defaults to `[index].search_type`.
    Search {
        /// Collection name (e.g. `issues-deputies`).
        collection: String,

        /// Free text to search for.
        text: String,

        /// Number of hits to return.
        #[arg(long)]
        k: Option<usize>,

        /// Search mode: hybrid, dense, or keyword.
        #[arg(long)]
        mode: Option<SearchMode>,
    },

    /// Check collections against the relational tables.
    ///
    /// Reports dangling keys (in the collection, gone from the table) and
    /// missing keys (in the table, never embedded).
    Check {
        /// Collection name. Checks every built collection when omitted.
        collection: Option<String>,
    },

    /// Start a server.
    Serve {
        #[command(subcommand)]
        service: ServeService,
    },

    /// Print a shell completion script to stdout.
    Completions {
        /// Target shell.
        shell: Shell,
    },
}

/// Server subcommands.
#[derive(Subcommand)]
enum ServeService {
    /// Start the MCP tool server.
    ///
    /// Binds to `[server].bind` and serves `/mcp` plus the JSON tool API.
    Mcp,
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init();

    // Commands that don't require config
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "cparla", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;
    run(cli.command, &cfg).await
}

async fn run(command: Commands, cfg: &Config) -> anyhow::Result<()> {
    match command {
        Commands::Init => {
            migrate::run_migrations(cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Load { file } => {
            let pool = db::connect(cfg).await?;
            migrate::migrate(&pool).await?;
            let report = ingest::load_file(&pool, &file).await?;
            println!(
                "Loaded {} blocks, {} legislators, {} issues, {} votes from {}",
                report.blocks,
                report.legislators,
                report.issues,
                report.votes,
                file.display()
            );
            println!("Run `cparla rebuild all` to refresh semantic collections.");
        }
        Commands::Tables => {
            let ctx = ToolContext::from_config(cfg).await?;
            print_json(&ctx.store().list_tables().await?)?;
        }
        Commands::Describe { table } => {
            let ctx = ToolContext::from_config(cfg).await?;
            print_json(&ctx.store().describe(&table).await?)?;
        }
        Commands::Preview { table, limit } => {
            let ctx = ToolContext::from_config(cfg).await?;
            print_json(&ctx.store().preview(&table, limit).await?)?;
        }
        Commands::Query { sql, limit } => {
            let ctx = ToolContext::from_config(cfg).await?;
            print_json(&ctx.store().query(&sql, limit).await?)?;
        }
        Commands::Collections => {
            let ctx = ToolContext::from_config(cfg).await?;
            let collections = ctx.index().list_collections().await?;
            if collections.is_empty() {
                println!("No collections built yet. Available views:");
                for view in CollectionView::all() {
                    println!("  {}", view.name);
                }
            } else {
                print_json(&collections)?;
            }
        }
        Commands::Rebuild { collection } => {
            let ctx = ToolContext::from_config(cfg).await?;
            let reports = if collection == "all" {
                ctx.sync().rebuild_all().await?
            } else {
                vec![ctx.sync().rebuild(&collection).await?]
            };
            for r in &reports {
                println!(
                    "Rebuilt {}: {} records, {} dims, {} ({} ms)",
                    r.collection, r.records, r.dims, r.distance, r.elapsed_ms
                );
            }
        }
        Commands::Search {
            collection,
            text,
            k,
            mode,
        } => {
            let ctx = ToolContext::from_config(cfg).await?;
            let top_k = k.unwrap_or(ctx.default_top_k());
            let mode = mode.unwrap_or(ctx.default_search());
            print_json(&ctx.sync().search(&collection, &text, top_k, mode).await?)?;
        }
        Commands::Check { collection } => {
            let ctx = ToolContext::from_config(cfg).await?;
            let names: Vec<String> = match collection {
                Some(name) => vec![name],
                None => ctx
                    .index()
                    .list_collections()
                    .await?
                    .into_iter()
                    .map(|c| c.name)
                    .collect(),
            };
            let mut reports = Vec::with_capacity(names.len());
            for name in &names {
                reports.push(ctx.sync().check(name).await?);
            }
            print_json(&reports)?;
            if reports.iter().any(|r| !r.consistent) {
                anyhow::bail!("inconsistent collections found; run `cparla rebuild`");
            }
        }
        Commands::Serve { service } => match service {
            ServeService::Mcp => {
                server::run_server(cfg).await?;
            }
        },
        Commands::Completions { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
    }

    Ok(())
}
