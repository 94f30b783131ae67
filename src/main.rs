use clap::Parser;
use madprops::entities::{User, UserPreference};
use madprops::{settings, storage, web, OwnerSchema, PropertySetConfig};
use miette::{IntoDiagnostic, Result};
use migration::MigratorTrait;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "madprops",
    version,
    about = "Property table API server"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    // load settings
    let settings = settings::Settings::load(&cli.config)?;
    tracing::info!(?settings, "Loaded configuration");

    // init storage (database)
    let db = storage::init(&settings.database).await?;
    migration::Migrator::up(&db, None).await.into_diagnostic()?;

    let preferences = settings
        .preferences
        .apply(PropertySetConfig::for_entity::<UserPreference>())?;
    let users = OwnerSchema::for_entity::<User>()
        .property_set("preferences", preferences)
        .build()?;

    web::serve(&settings.listen_addr(), db, vec![Arc::new(users)]).await?;
    Ok(())
}
