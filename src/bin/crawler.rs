use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use doccrawl::config::{init_tracing, IndexArgs, StoreArgs};
use doccrawl::search::schema::default_schema;
use doccrawl::{
    CanonicalOnly, CrawlArgs, Crawler, DualPersister, ElasticIndex, PageSink, PgStore,
    SearchIndex,
};

#[derive(Parser, Debug)]
#[command(
    name = "doccrawl-crawler",
    about = "Crawl documentation sites into Postgres and mirror pages into the search index"
)]
struct CrawlerCli {
    /// Seed URLs to start crawling from.
    #[arg(default_value = "https://go.dev/doc/tutorial/getting-started")]
    seeds: Vec<String>,

    /// Write to Postgres only, skipping the search index.
    #[arg(long, env = "DOCCRAWL_NO_INDEX")]
    no_index: bool,

    #[command(flatten)]
    crawl: CrawlArgs,

    #[command(flatten)]
    store: StoreArgs,

    #[command(flatten)]
    index: IndexArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = CrawlerCli::parse();
    let controls = cli.crawl.build_controls();
    controls.validate().context("invalid crawl settings")?;

    let store = Arc::new(
        PgStore::connect(&cli.store.database_url, cli.store.pg_connections)
            .await
            .context("failed to connect to Postgres")?,
    );
    store
        .ensure_schema()
        .await
        .context("failed to prepare Postgres schema")?;

    let sink: Arc<dyn PageSink> = if cli.no_index {
        tracing::info!("search index disabled; writing canonical store only");
        Arc::new(CanonicalOnly::new(store.clone()))
    } else {
        let index = Arc::new(
            ElasticIndex::new(&cli.index.elasticsearch_url, &cli.index.index)
                .context("invalid search index settings")?,
        );
        if let Err(err) = index.ensure_index(&default_schema()).await {
            tracing::warn!(
                error = %err,
                "search index unavailable at startup; pages will be indexed on the next sync"
            );
        }
        Arc::new(DualPersister::new(store.clone(), index))
    };

    let crawler = Crawler::new(controls, sink).context("failed to build crawler")?;
    tracing::info!(seeds = cli.seeds.len(), "starting crawl");
    let report = crawler.run(&cli.seeds).await;
    tracing::info!(
        pages_saved = report.pages_saved,
        elapsed_secs = report.elapsed.as_secs_f64(),
        "crawler done"
    );

    drop(crawler);
    if let Ok(store) = Arc::try_unwrap(store) {
        store.close();
    }
    Ok(())
}
