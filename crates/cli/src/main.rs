use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use ordo_api::{OrdoApi, SearchOutcome, Session};
use ordo_core::{FulfillmentStatus, Millis, OrderFilter, OrderRecord, PaymentStatus, Settings, StatusKey};
use ordo_gateway::{MemoryDirectory, MemoryGateway};
use ordo_persist::{KvStore, MemoryKv, SqliteKv};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "ordoctl", version, about = "Ordo CLI: order cache and hybrid search")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// JSON file of raw orders served as the remote source
    #[arg(long = "fixture", global = true, env = "ORDO_FIXTURE")]
    fixture: Option<String>,

    /// Newest fixture orders to load into the local collection (default: collection capacity)
    #[arg(long = "prime", global = true)]
    prime: Option<usize>,

    /// Persist customer counts in SQLite (ORDO_DB_PATH, default ~/.ordo/ordo.db)
    #[arg(long = "persist", global = true, action = ArgAction::SetTrue)]
    persist: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Free-text search: order number, customer name, email, phone or company
    Search {
        query: String,
        /// Fulfillment status filter, e.g. NOT_FULFILLED
        #[arg(long = "status")]
        status: Option<String>,
        /// Created on or after (RFC 3339 or epoch ms)
        #[arg(long = "from")]
        from: Option<String>,
        /// Created on or before (RFC 3339 or epoch ms)
        #[arg(long = "to")]
        to: Option<String>,
        #[arg(long = "limit", default_value_t = 20)]
        limit: usize,
        /// Print how the result was produced
        #[arg(long = "explain", action = ArgAction::SetTrue)]
        explain: bool,
    },
    /// All orders with a fulfillment or payment status
    Status {
        /// "fulfillment" or "payment"
        kind: String,
        /// e.g. FULFILLED, PAID
        value: String,
        /// Remote pages to fetch
        #[arg(long = "pages", default_value_t = 1)]
        pages: usize,
    },
    /// Resolve order counts per customer email
    Count {
        emails: Vec<String>,
        /// Every customer in the local collection
        #[arg(long = "all", action = ArgAction::SetTrue)]
        all: bool,
    },
    /// Derived views of the local collection
    Views {
        /// Only orders still to ship
        #[arg(long = "unfulfilled", action = ArgAction::SetTrue)]
        unfulfilled: bool,
        /// Only orders with this payment status
        #[arg(long = "payment")]
        payment: Option<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("ORDO_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("ORDO_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid ORDO_METRICS_ADDR; expected host:port");
        }
    }
}

fn parse_when(s: &str) -> Result<Millis> {
    let s = s.trim();
    if let Ok(ms) = s.parse::<Millis>() { return Ok(ms); }
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.timestamp_millis())
        .with_context(|| format!("invalid timestamp {:?}; expected RFC 3339 or epoch ms", s))
}

fn load_fixture(path: Option<&str>) -> Result<Vec<OrderRecord>> {
    let Some(path) = path else {
        warn!("no --fixture given; remote source is empty");
        return Ok(Vec::new());
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("reading fixture {}", path))?;
    let raw: serde_json::Value = serde_json::from_str(&text).with_context(|| format!("parsing fixture {}", path))?;
    let gw = MemoryGateway::from_json(&raw).with_context(|| format!("decoding orders in {}", path))?;
    Ok(gw.records())
}

async fn open_session(cli: &Cli, settings: Settings) -> Result<Arc<Session>> {
    let records = load_fixture(cli.fixture.as_deref())?;
    let kv: Arc<dyn KvStore> = if cli.persist {
        Arc::new(SqliteKv::open_default().context("opening count store")?)
    } else {
        Arc::new(MemoryKv::new())
    };
    let directory = Arc::new(MemoryDirectory::from_records(&records));
    let gateway = Arc::new(MemoryGateway::new(records.clone()));
    let prime = cli.prime.unwrap_or(settings.collection_cap);
    let session = Session::builder(gateway).resolver(directory).kv(kv).settings(settings).build();

    let mut newest = records;
    newest.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    newest.truncate(prime);
    let loaded = session.upsert_many(newest).into_iter().filter(|r| r.is_ok()).count();
    info!(loaded, session = %session.id(), "local collection primed");
    Ok(session)
}

fn render_created(ms: Millis) -> String {
    if ms <= 0 { return "-".to_string(); }
    chrono::DateTime::<chrono::Utc>::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn render_total(o: &OrderRecord) -> String {
    if o.total.currency.is_empty() { format!("{:.2}", o.total.amount) } else { format!("{:.2} {}", o.total.amount, o.total.currency) }
}

fn print_orders(output: Output, orders: &[OrderRecord]) -> Result<()> {
    match output {
        Output::Human => {
            println!("{:<10} {:<17} {:<20} {:<18} {:>14}  CUSTOMER", "NUMBER", "CREATED", "STATUS", "PAYMENT", "TOTAL");
            for o in orders {
                let who = o.customer.name.as_deref().or(o.email()).unwrap_or("-");
                println!(
                    "{:<10} {:<17} {:<20} {:<18} {:>14}  {}",
                    o.number,
                    render_created(o.created_at),
                    o.status.as_str(),
                    o.payment_status.as_str(),
                    render_total(o),
                    who
                );
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(orders)?),
    }
    Ok(())
}

fn print_outcome(output: Output, out: &SearchOutcome, limit: usize, explain: bool) -> Result<()> {
    let shown = &out.records[..out.records.len().min(limit)];
    match output {
        Output::Human => {
            print_orders(output, shown)?;
            if out.meta.partial { eprintln!("warning: remote source unavailable; showing local results only"); }
            if out.has_more() { eprintln!("more results available remotely"); }
        }
        Output::Json if explain => {
            #[derive(serde::Serialize)]
            struct Explain<'a> { orders: &'a [OrderRecord], meta: &'a ordo_api::SearchMeta, has_more: bool }
            println!("{}", serde_json::to_string_pretty(&Explain { orders: shown, meta: &out.meta, has_more: out.has_more() })?);
        }
        Output::Json => print_orders(output, shown)?,
    }
    if explain && matches!(output, Output::Human) {
        let m = &out.meta;
        eprintln!(
            "explain: cache_hit={} incremental={} partial={} remote_queried={} local={} remote={} merged={}",
            m.cache_hit, m.incremental, m.partial, m.remote_queried, m.local, m.remote, m.merged
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let settings = Settings::from_env();
    let session = open_session(&cli, settings).await?;

    match &cli.command {
        Commands::Search { query, status, from, to, limit, explain } => {
            let filters = OrderFilter {
                status: status.as_deref().map(FulfillmentStatus::from_str).transpose()?,
                created_from: from.as_deref().map(parse_when).transpose()?,
                created_to: to.as_deref().map(parse_when).transpose()?,
            };
            info!(query = %query, filters = %filters.signature(), "search invoked");
            let preview = session.preview(query, &filters);
            info!(local_preview = preview.len(), "local preview ready");
            let out = session.search(query, &filters).await?;
            print_outcome(cli.output, &out, *limit, *explain)?;
        }
        Commands::Status { kind, value, pages } => {
            let key = StatusKey::parse(kind, value)?;
            info!(status = %key, pages, "status search invoked");
            let mut out = session.search_status(key).await?;
            for _ in 1..(*pages).max(1) {
                if !out.has_more() { break; }
                out = session.load_more(key).await?;
            }
            print_outcome(cli.output, &out, usize::MAX, false)?;
        }
        Commands::Count { emails, all } => {
            if *all {
                let n = session.precompute_counts().await;
                info!(resolved = n, "precomputed customer counts");
            }
            let mut targets: Vec<String> = emails.clone();
            if *all {
                let mut seen: Vec<String> = session.snapshot().items.iter().filter_map(|o| o.email().map(String::from)).collect();
                seen.sort();
                seen.dedup();
                targets.extend(seen);
            }
            if targets.is_empty() { return Err(anyhow!("no emails given (pass emails or --all)")); }
            let rows: Vec<(String, u64)> = futures::future::join_all(targets.into_iter().map(|e| {
                let session = Arc::clone(&session);
                async move {
                    let n = match session.counts().status(&e) {
                        Some(s) if !s.in_flight && s.resolved_at.is_some() => s.count,
                        _ => session.refresh_customer_count(&e).await,
                    };
                    (e, n)
                }
            }))
            .await;
            match cli.output {
                Output::Human => {
                    println!("{:<32} ORDERS", "EMAIL");
                    for (e, n) in &rows { println!("{:<32} {}", e, n); }
                }
                Output::Json => {
                    let map: serde_json::Map<String, serde_json::Value> =
                        rows.into_iter().map(|(e, n)| (e, serde_json::Value::from(n))).collect();
                    println!("{}", serde_json::to_string_pretty(&map)?);
                }
            }
        }
        Commands::Views { unfulfilled, payment } => {
            if *unfulfilled {
                print_orders(cli.output, &session.unfulfilled())?;
            } else if let Some(p) = payment {
                let p = PaymentStatus::from_str(p)?;
                print_orders(cli.output, &session.by_payment_status(p))?;
            } else {
                let summary = session.summary();
                let stats = session.stats();
                match cli.output {
                    Output::Human => {
                        println!("orders: {} (cap {})", stats.orders, stats.collection_cap);
                        for s in FulfillmentStatus::ALL {
                            println!("  {:<20} {}", s.as_str(), session.by_status(s).len());
                        }
                        println!("unfulfilled: {}", session.unfulfilled().len());
                        for (cur, amount) in summary.revenue.iter() {
                            let cur = if cur.is_empty() { "-" } else { cur.as_str() };
                            println!("revenue {}: {:.2}", cur, amount);
                        }
                    }
                    Output::Json => {
                        #[derive(serde::Serialize)]
                        struct Views<'a> { stats: &'a ordo_api::Stats, summary: &'a ordo_api::OrderSummary }
                        println!("{}", serde_json::to_string_pretty(&Views { stats: &stats, summary: &summary })?);
                    }
                }
            }
        }
    }

    Ok(())
}
