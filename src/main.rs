use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Args as ClapArgs, Parser, Subcommand};
use serde_json::{Map, Value};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kibana_es_proxy::config::{parse_duration_flag, parse_header_flag, Config};
use kibana_es_proxy::observability;
use kibana_es_proxy::proxy::{ReqwestExecutor, ReverseProxy, TunnelingTransport};
use kibana_es_proxy::search::{search_once, PaginationController, SearchClient, SearchOptions};

#[derive(Parser, Debug)]
#[command(name = "kibana-es-proxy")]
#[command(about = "Send Elasticsearch requests through the Kibana console proxy")]
struct Args {
    /// Optional YAML configuration file; flags override its values
    #[arg(long, global = true)]
    config: Option<String>,

    /// Cookie header forwarded to Kibana, e.g. a session cookie
    #[arg(short = 'c', long, global = true)]
    cookie: Option<String>,

    /// Dump every request before and after rewriting
    #[arg(short = 'D', long, global = true)]
    debug: bool,

    /// Kibana base URL
    #[arg(short = 'u', long = "url", global = true)]
    kibana_url: Option<String>,

    /// Extra header in `Name: value` form, repeatable
    #[arg(short = 'H', long = "header", global = true, value_parser = parse_header_flag)]
    headers: Vec<(String, String)>,

    /// Upstream request timeout, e.g. 30s or 2m. In proxy mode it bounds
    /// each read of a relayed response rather than the whole transfer
    #[arg(long, global = true, value_parser = parse_duration_flag)]
    timeout: Option<Duration>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve a local Elasticsearch-compatible endpoint backed by Kibana
    Proxy {
        /// Listen address
        #[arg(long)]
        addr: Option<String>,
    },
    /// Run a search, optionally paginating with a point in time
    #[command(alias = "kq")]
    Search(SearchArgs),
}

#[derive(ClapArgs, Debug)]
struct SearchArgs {
    /// Elasticsearch index pattern, comma separated
    #[arg(long)]
    index: Option<String>,

    /// Query document, or `-` to read it from stdin
    #[arg(short = 'q', long)]
    query: Option<String>,

    /// Result pages. 0 or 1 return the first page, more open a PIT
    #[arg(short = 'p', long, default_value_t = 0)]
    pages: usize,

    /// Track total hits
    #[arg(long)]
    track_hits: bool,

    /// filter_path for responses. Include pit_id when paginating
    #[arg(short = 'f', long)]
    filter_path: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args).await?;

    observability::init_tracing(config.debug);

    match args.command {
        Command::Proxy { addr } => {
            let addr = addr.unwrap_or_else(|| config.listen.clone());
            run_proxy(&config, &addr).await
        }
        Command::Search(search) => run_search(&config, search).await,
    }
}

/// Merge the optional config file with command line overrides.
async fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path).await?,
        None => Config::default(),
    };

    if let Some(url) = &args.kibana_url {
        config.kibana_url = url.clone();
    }
    if let Some(cookie) = &args.cookie {
        config.cookie = Some(cookie.clone());
    }
    if args.debug {
        config.debug = true;
    }
    if let Some(timeout) = args.timeout {
        config.request_timeout = timeout;
    }
    for (name, value) in &args.headers {
        config
            .headers
            .entry(name.clone())
            .or_default()
            .push(value.clone());
    }

    config.validate()?;
    Ok(config)
}

fn build_transport(config: &Config, executor: ReqwestExecutor) -> Result<Arc<TunnelingTransport>> {
    let transport = TunnelingTransport::builder()
        .url(config.base_url()?)
        .headers(config.extra_headers()?)
        .debug(config.debug)
        .executor(Arc::new(executor))
        .build()?;

    Ok(Arc::new(transport))
}

async fn run_proxy(config: &Config, addr: &str) -> Result<()> {
    let executor = ReqwestExecutor::relaying(config.request_timeout, config.connect_timeout)?;
    let transport = build_transport(config, executor)?;
    let host = transport.rule().authority();
    info!("Tunneling to {}", transport.rule().url());

    let proxy = Arc::new(
        ReverseProxy::new(transport, &host)?.with_max_body_bytes(config.max_body_bytes),
    );
    proxy.start(addr, shutdown_signal()).await?;

    info!("Proxy shutdown complete");
    Ok(())
}

async fn run_search(config: &Config, args: SearchArgs) -> Result<()> {
    let executor = ReqwestExecutor::new(config.request_timeout, config.connect_timeout)?;
    let transport = build_transport(config, executor)?;
    let client = Arc::new(SearchClient::new(transport));
    let query = read_query(args.query.as_deref()).await?;
    let options = SearchOptions {
        index: args.index.clone(),
        track_total_hits: args.track_hits,
        filter_path: args.filter_path.clone(),
    };
    let mut stdout = tokio::io::stdout();

    if args.pages <= 1 {
        search_once(client.as_ref(), query, &options, &mut stdout).await?;
        return Ok(());
    }

    let query = query.context("no query to paginate over")?;
    let query: Map<String, Value> =
        serde_json::from_slice(&query).context("while parsing query")?;
    let indices: Vec<String> = args
        .index
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        on_signal.cancel();
    });

    let summary = PaginationController::new(client)
        .with_keep_alive(config.pit_keep_alive)
        .with_options(options)
        .with_cancellation(cancel)
        .run(query, &indices, args.pages, &mut stdout)
        .await?;

    info!(
        pages = summary.pages,
        pit_rotations = summary.pit_rotations,
        "Pagination finished"
    );
    Ok(())
}

/// Literal query, `-` for stdin, or none.
async fn read_query(query: Option<&str>) -> Result<Option<Bytes>> {
    match query {
        None | Some("") => Ok(None),
        Some("-") => {
            let mut buf = Vec::new();
            tokio::io::stdin()
                .read_to_end(&mut buf)
                .await
                .context("while reading query from stdin")?;
            Ok(Some(Bytes::from(buf)))
        }
        Some(literal) => Ok(Some(Bytes::from(literal.to_string()))),
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => {
            warn!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await
        }
    }
}
