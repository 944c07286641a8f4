//! The Maestro daemon: wire the catalog and capabilities together,
//! boot the core, run until interrupted.

mod rest;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use maestro_catalog::{Catalog, PgCatalog, PgCatalogConfig};
use maestro_core::{Model, ModelConfig, NullAlerts, NullSheets, SlackAlerts};
use maestro_logging::{init_logging, LogConfig};

use rest::{token_source_from_env, RestObjectStore, RestWarehouse, Tokens};

#[derive(Parser, Debug)]
#[command(name = "maestrod", about = "Data warehouse orchestration daemon")]
struct Args {
    /// Catalog database URL (postgres://...)
    #[arg(long, env = "MAESTRO_DB_URL")]
    db_url: String,

    /// Secret used to encrypt stored credentials (min 8 chars)
    #[arg(long, env = "MAESTRO_SECRET")]
    secret: String,

    /// OAuth users must belong to this domain
    #[arg(long, env = "MAESTRO_ALLOWED_DOMAIN", default_value = "")]
    allowed_domain: String,

    /// Import worker pool size
    #[arg(long, default_value_t = 6)]
    import_workers: usize,

    /// Log everything to the console too
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(LogConfig {
        app_name: "maestrod",
        verbose: args.verbose,
    })?;

    let catalog = PgCatalog::open(PgCatalogConfig::new(&args.db_url, &args.secret))
        .await
        .context("opening the catalog")?;

    let warehouse_conf = catalog
        .select_warehouse_conf()
        .await?
        .context("no warehouse configuration in the catalog")?;
    rest::validate_conf(
        &warehouse_conf.project_id,
        &warehouse_conf.bucket,
        &warehouse_conf.email,
    )?;

    let tokens = Arc::new(Tokens::new(token_source_from_env()?));
    let warehouse = Arc::new(RestWarehouse::new(
        &warehouse_conf.project_id,
        &warehouse_conf.bucket,
        &warehouse_conf.email,
        maestro_warehouse::DEFAULT_URL_EXPIRY_SECS,
        tokens.clone(),
    ));
    let store = Arc::new(RestObjectStore::new(&warehouse_conf.bucket, tokens));

    let alerts: Arc<dyn maestro_core::AlertSink> = match catalog.select_slack_conf().await? {
        Some(conf) if !conf.url.is_empty() => Arc::new(SlackAlerts::new(conf)),
        _ => Arc::new(NullAlerts),
    };

    let allowed_domain = if !args.allowed_domain.is_empty() {
        args.allowed_domain.clone()
    } else {
        catalog
            .select_oauth_conf()
            .await?
            .map(|c| c.allowed_domain)
            .unwrap_or_default()
    };

    let model = Model::new(
        Arc::new(catalog),
        warehouse,
        store,
        alerts,
        Arc::new(NullSheets),
        ModelConfig {
            allowed_domain,
            import_workers: args.import_workers,
            ..Default::default()
        },
    );

    model.start().await.context("starting the core")?;
    info!("maestrod up");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutting down...");
    model.stop().await;

    Ok(())
}
