//! taxa: operator tool for taxonomy databases.
//!
//! Applies migrations, prints vocabulary trees, and checks or rebuilds
//! nested-set boundaries after the tables were edited by hand.

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use taxa_db::{Database, PoolConfig, TreeOptions};

#[derive(Parser)]
#[command(name = "taxa")]
#[command(author, version, about = "Maintenance CLI for taxa vocabularies")]
#[command(propagate_version = true)]
struct Cli {
    /// PostgreSQL connection URL
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending schema migrations
    Migrate,

    /// List vocabularies
    Vocabularies,

    /// Print the tree of a vocabulary, one indented line per term
    Tree {
        /// Vocabulary alias
        alias: String,

        /// Show taxonomy ids instead of term ids
        #[arg(long)]
        taxonomy_keys: bool,

        /// Print the nodes as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check the nested-set boundaries of a vocabulary
    Verify {
        /// Vocabulary alias
        alias: String,
    },

    /// Rebuild the boundaries of a vocabulary from its parent links
    Recover {
        /// Vocabulary alias
        alias: String,
    },
}

/// Logs go to stderr so command output stays pipeable.
///
/// Environment variables:
///   LOG_FORMAT - "json" or "text" (default: "text")
///   RUST_LOG   - standard env filter (default: "taxa_db=info,taxa_core=info")
fn init_tracing() {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "taxa_db=info,taxa_core=info".into());
    let registry = tracing_subscriber::registry().with(env_filter);

    if log_format == "json" {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = PoolConfig::from_env()?;
    let db = Database::connect_with_config(&cli.database_url, config)
        .await
        .context("connecting to database")?;

    run(&db, cli.command).await
}

async fn run(db: &Database, command: Commands) -> anyhow::Result<()> {
    let service = db.service();

    match command {
        Commands::Migrate => {
            db.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Vocabularies => {
            for vocabulary in service.vocabularies().list().await? {
                println!(
                    "{}\t{}\t{}",
                    vocabulary.alias,
                    vocabulary.title,
                    vocabulary.types.join(",")
                );
            }
        }
        Commands::Tree {
            alias,
            taxonomy_keys,
            json,
        } => {
            let options = TreeOptions {
                taxonomy_id_as_key: taxonomy_keys,
            };
            let nodes = service
                .tree()
                .get_tree(&alias, options)
                .await
                .with_context(|| format!("loading tree of '{}'", alias))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&nodes)?);
                return Ok(());
            }
            for node in nodes {
                println!("{}{}  [{}]", "  ".repeat(node.depth), node.name, node.id);
            }
        }
        Commands::Verify { alias } => {
            let vocabulary = service.vocabularies().get_by_alias(&alias).await?;
            service
                .tree()
                .verify(vocabulary.id)
                .await
                .with_context(|| format!("vocabulary '{}' failed verification", alias))?;
            println!("{}: ok", alias);
        }
        Commands::Recover { alias } => {
            let vocabulary = service.vocabularies().get_by_alias(&alias).await?;
            let rows = service.tree().recover(vocabulary.id).await?;
            info!(vocabulary_alias = %alias, rows_changed = rows, "Recovery finished");
            println!("{}: {} rows renumbered", alias, rows);
        }
    }
    Ok(())
}
