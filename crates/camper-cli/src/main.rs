use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use camper_core::EntityType;
use camper_storage::{run_migrations, PgStoreFactory, StoreFactory};
use camper_sync::{import_payload, importer_from_config, ImportReport, SyncConfig};
use camper_web::JwtKeys;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "camper-cli")]
#[command(about = "Camper partner import command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import one partner, or one entity type of it.
    Import {
        partner: String,
        entity: Option<String>,
        /// Reconcile a saved partner response instead of calling the partner API.
        #[arg(long, requires = "entity")]
        from_file: Option<PathBuf>,
    },
    Migrate,
    Serve,
    /// Mint an admin bearer token. The role is still checked against the database per request.
    IssueToken {
        #[arg(long)]
        user_id: i64,
        #[arg(long, default_value_t = 3600)]
        ttl_secs: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Import {
            partner,
            entity,
            from_file,
        } => {
            let entity_type = entity
                .as_deref()
                .map(EntityType::from_str)
                .transpose()?;
            let stores = PgStoreFactory::connect(&config.database_url, 1).await?;
            let mut store = stores.acquire().await?;

            let reports = match (from_file, entity_type) {
                (Some(path), Some(entity_type)) => {
                    let adapter = camper_adapters::adapter_for_partner(&partner)
                        .with_context(|| format!("no adapter registered for {partner}"))?;
                    let payload = camper_adapters::load_payload_file(&path)?;
                    vec![import_payload(&mut *store, adapter.as_ref(), entity_type, payload, Uuid::new_v4()).await?]
                }
                (Some(_), None) => bail!("--from-file needs an entity type"),
                (None, Some(entity_type)) => {
                    let importer = importer_from_config(&config).await?;
                    vec![importer.import_entity(&mut *store, &partner, entity_type).await?]
                }
                (None, None) => {
                    let importer = importer_from_config(&config).await?;
                    importer.import_partner(&mut *store, &partner).await?
                }
            };
            print_reports(&reports);
        }
        Commands::Migrate => {
            let stores = PgStoreFactory::connect(&config.database_url, 1).await?;
            run_migrations(stores.pool()).await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            camper_web::serve_from_env().await?;
        }
        Commands::IssueToken { user_id, ttl_secs } => {
            let secret = std::env::var("CAMPER_JWT_SECRET").context("CAMPER_JWT_SECRET must be set")?;
            let token = JwtKeys::new(&secret).issue(user_id, ttl_secs)?;
            println!("{token}");
        }
    }

    Ok(())
}

fn print_reports(reports: &[ImportReport]) {
    for report in reports {
        for change in &report.changes {
            println!("{change}");
        }
        println!("import complete: run_id={} {}", report.run_id, report.summary());
    }
}
