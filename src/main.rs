//! # Shelfwise CLI (`shelfwise`)
//!
//! ## Usage
//!
//! ```bash
//! shelfwise --config ./config/shelfwise.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `shelfwise init` | Create the SQLite database and run schema migrations |
//! | `shelfwise import <file>` | Load media records from a JSON array |
//! | `shelfwise serve` | Start the HTTP server |
//! | `shelfwise recommend "<prompt>"` | Stream recommendations from a running server |
//!
//! Logs go to stderr and follow `RUST_LOG` (default `info`).

use std::io::Write;
use std::path::PathBuf;

use anyhow::bail;
use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};
use tracing_subscriber::EnvFilter;

use shelfwise::client::StreamConsumer;
use shelfwise::{config, import, migrate, server};
use shelfwise_core::consumer::{ConsumerState, ConsumerStatus};

/// Shelfwise: streamed AI recommendations for a library catalog.
#[derive(Parser)]
#[command(name = "shelfwise", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/shelfwise.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// This command is idempotent; running it multiple times is safe.
    Init,

    /// Import media records from a JSON file.
    Import {
        /// Path to a JSON array of media records.
        file: PathBuf,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,

    /// Ask a running server for recommendations and print the summary as
    /// it streams. Ctrl-C cancels.
    Recommend {
        prompt: String,

        #[arg(long)]
        media_type: Option<String>,

        #[arg(long)]
        media_format: Option<String>,

        #[arg(long)]
        age_group: Option<String>,

        #[arg(long)]
        limit: Option<u32>,

        /// Server base URL. Defaults to `http://<server.bind>` from config.
        #[arg(long)]
        url: Option<String>,

        /// Value for the `x-user-id` header.
        #[arg(long)]
        user: Option<String>,

        /// Value for the `x-user-role` header.
        #[arg(long)]
        role: Option<String>,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    // `recommend --url` talks to a server and needs no local config.
    if let Commands::Recommend { url: Some(url), .. } = &cli.command {
        let url = url.clone();
        return run_recommend(cli.command, &url).await;
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Import { file } => {
            import::run_import(&cfg, &file).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        command @ Commands::Recommend { .. } => {
            let url = format!("http://{}", cfg.server.bind);
            run_recommend(command, &url).await?;
        }
    }

    Ok(())
}

async fn run_recommend(command: Commands, base_url: &str) -> anyhow::Result<()> {
    let Commands::Recommend {
        prompt,
        media_type,
        media_format,
        age_group,
        limit,
        user,
        role,
        ..
    } = command
    else {
        bail!("not a recommend command");
    };

    let mut filters = Map::new();
    for (key, value) in [
        ("mediaType", media_type),
        ("mediaFormat", media_format),
        ("ageGroup", age_group),
    ] {
        if let Some(value) = value {
            filters.insert(key.to_string(), Value::String(value));
        }
    }
    if let Some(limit) = limit {
        filters.insert("limit".to_string(), json!(limit));
    }
    let filters = (!filters.is_empty()).then_some(Value::Object(filters));

    let mut consumer = StreamConsumer::new(base_url)?;
    if let Some(user) = user {
        consumer = consumer.with_user(&user, role.as_deref())?;
    }

    let cancel = consumer.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let mut printed = 0;
    let mut listed = false;
    let state = consumer
        .send_prompt(&prompt, filters, |state: &ConsumerState| {
            let mut out = std::io::stdout().lock();
            if !listed {
                if let Some(items) = state
                    .metadata
                    .as_ref()
                    .and_then(|m| m["items"].as_array())
                {
                    listed = true;
                    for item in items {
                        let _ = writeln!(
                            out,
                            "- {} ({})",
                            item["title"].as_str().unwrap_or("untitled"),
                            item["author"].as_str().unwrap_or("unknown")
                        );
                    }
                    let _ = writeln!(out);
                }
            }
            if state.summary.len() > printed {
                let _ = write!(out, "{}", &state.summary[printed..]);
                printed = state.summary.len();
            }
            let _ = out.flush();
        })
        .await;
    println!();

    match state.status {
        ConsumerStatus::Error => bail!(state
            .error
            .unwrap_or_else(|| "recommendation failed".to_string())),
        ConsumerStatus::Idle if state.is_cancelled() => {
            eprintln!("Cancelled.");
        }
        _ => {}
    }
    Ok(())
}
