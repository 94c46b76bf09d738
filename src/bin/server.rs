use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use doccrawl::config::{init_tracing, IndexArgs, RankerArgs};
use doccrawl::query::DEFAULT_CANDIDATE_LIMIT;
use doccrawl::{api, ElasticIndex, HttpRanker, QueryConfig, QueryService};

#[derive(Parser, Debug)]
#[command(
    name = "doccrawl-server",
    about = "HTTP search endpoint backed by the search index and the ranking service"
)]
struct ServerCli {
    /// Host interface to bind.
    #[arg(long, env = "DOCCRAWL_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on.
    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// Index candidates fetched per query.
    #[arg(long, env = "DOCCRAWL_CANDIDATE_LIMIT", default_value_t = DEFAULT_CANDIDATE_LIMIT)]
    candidate_limit: usize,

    #[command(flatten)]
    index: IndexArgs,

    #[command(flatten)]
    ranker: RankerArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = ServerCli::parse();

    let config = QueryConfig {
        candidate_limit: cli.candidate_limit,
        rank_timeout: Duration::from_millis(cli.ranker.rank_timeout_ms),
        request_timeout: Duration::from_millis(cli.ranker.request_timeout_ms),
    };
    config.validate().context("invalid query settings")?;

    let index = ElasticIndex::new(&cli.index.elasticsearch_url, &cli.index.index)
        .context("invalid search index settings")?;
    let ranker = HttpRanker::new(&cli.ranker.ranker_url).context("invalid ranker settings")?;
    let service = QueryService::new(Arc::new(index), Arc::new(ranker), config);

    let addr: SocketAddr = format!("{}:{}", cli.host, cli.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", cli.host, cli.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "doccrawl-server listening");

    axum::serve(listener, api::router(Arc::new(service)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
    tracing::info!("shutting down");
}
