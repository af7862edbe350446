//! CLI entry point for the hyperlens-explore snapshot explorer.
//!
//! Results are written to stdout as JSON; logs go to stderr.

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use hyperlens_core::config::{load_section, SyncConfig};
use hyperlens_core::VisibilityMode;
use hyperlens_explore::commands::{self, ListRequest};
use hyperlens_explore::config::ExploreConfig;

#[derive(Parser)]
#[command(name = "hyperlens-explore")]
#[command(about = "Explore, create, and publish entities in a Hyperlens knowledge-graph snapshot")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Config file prefix (default: hyperlens).
    #[arg(short, long, default_value = "hyperlens", global = true)]
    config: String,

    /// Override the snapshot file.
    #[arg(long, global = true)]
    snapshot: Option<String>,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Command {
    /// List the registered entity types.
    Types,
    /// List the spaces visible to the session.
    Spaces {
        /// List private spaces instead of public ones.
        #[arg(long)]
        private: bool,
    },
    /// List entities of a type in a public space (or a private space).
    List {
        /// Entity type, e.g. Project.
        #[arg(long = "type")]
        entity_type: String,
        /// Public space id. Omit to read a private space.
        #[arg(long)]
        space: Option<String>,
        /// Private space id. Omit for the session's own.
        #[arg(long, conflicts_with = "space")]
        private_space: Option<String>,
        /// Case-sensitive substring of the name.
        #[arg(long)]
        search: Option<String>,
        /// Equality condition `field=value` (repeatable).
        #[arg(long = "where")]
        conditions: Vec<String>,
        #[arg(long)]
        limit: Option<u32>,
        /// Relation to load (repeatable).
        #[arg(long)]
        include: Vec<String>,
    },
    /// Create an entity in the private space.
    Create {
        #[arg(long = "type")]
        entity_type: String,
        /// Private space id. Omit for the session's own.
        #[arg(long)]
        space: Option<String>,
        /// Field values as `field=value`.
        fields: Vec<String>,
    },
    /// Publish a copy of an entity to a public space.
    Publish {
        #[arg(long = "type")]
        entity_type: String,
        /// Id of the entity to copy.
        #[arg(long)]
        id: String,
        /// Public source space. Omit for the private space.
        #[arg(long)]
        from: Option<String>,
        /// Target public space.
        #[arg(long)]
        to: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    if cli.json {
        fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
    }

    let sync_config: SyncConfig = load_section(&cli.config, "sync")?;
    let mut explore_config: ExploreConfig = load_section(&cli.config, "explore")?;
    if let Some(path) = cli.snapshot {
        explore_config.snapshot_path = path;
    }

    let client = commands::open_client(&sync_config, &explore_config)?;

    match cli.command {
        Command::Types => {
            println!("{}", serde_json::to_string_pretty(&commands::types(&client))?);
        }
        Command::Spaces { private } => {
            let mode = if private {
                VisibilityMode::Private
            } else {
                VisibilityMode::Public
            };
            let spaces = commands::spaces(&client, mode).await?;
            println!("{}", serde_json::to_string_pretty(&spaces)?);
        }
        Command::List {
            entity_type,
            space,
            private_space,
            search,
            conditions,
            limit,
            include,
        } => {
            let request = ListRequest {
                entity_type,
                space,
                private_space,
                search,
                conditions,
                limit,
                include,
            };
            let query = commands::build_query(&client, &request)?;
            let entities = commands::list(&client, &query).await?;
            println!("{}", serde_json::to_string_pretty(&entities)?);
        }
        Command::Create {
            entity_type,
            space,
            fields,
        } => {
            let entity =
                commands::create(&client, &entity_type, &fields, space.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&entity)?);
        }
        Command::Publish {
            entity_type,
            id,
            from,
            to,
        } => {
            let entity =
                commands::publish(&client, &entity_type, &id, from.as_deref(), &to).await?;
            println!("{}", serde_json::to_string_pretty(&entity)?);
        }
    }

    client.shutdown();
    Ok(())
}
