use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use servermap_core::storage::TransactionStore;
use servermap_core::trace::Transaction;
use servermap_map::{
    CancelHandle, FilteredMapQuery, FilteredMapResponse, FilteredMapService, FilteredServerMap,
    LastFilteredMapQuery, LimitConfig, MapConfig, MapError, cancellation,
};
use servermap_storage::FjallTraceStore;

// ─────────────────────────────────────────────────────────────────────────────
// CLI
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "servermap",
    about = "Filtered application maps from distributed traces",
    version
)]
struct Cli {
    /// Directory for trace storage.
    #[arg(short, long, global = true, env = "SERVERMAP_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Deadline for one map query, scan through aggregation.
    #[arg(long, global = true, env = "SERVERMAP_TIMEOUT_MS", default_value_t = 30_000)]
    timeout_ms: u64,

    /// Fetch/aggregate workers per query. Defaults to the available
    /// parallelism, at most 8.
    #[arg(long, global = true, env = "SERVERMAP_WORKERS")]
    workers: Option<usize>,

    /// Upper bound on the number of transactions one query may scan.
    #[arg(long, global = true, env = "SERVERMAP_MAX_LIMIT", default_value_t = 10_000)]
    max_limit: usize,

    /// How far behind now `last` queries end.
    #[arg(long, global = true, env = "SERVERMAP_CLOCK_SKEW_MS", default_value_t = 3_000)]
    clock_skew_ms: i64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load transactions, one JSON object per line, into the store.
    Ingest {
        /// JSON Lines file of transactions.
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Build the map of an application over an explicit time range.
    Map(MapArgs),
    /// Build the map of an application over the last N milliseconds.
    Last(LastArgs),
}

#[derive(Args)]
struct TargetArgs {
    /// Application whose trace index is scanned.
    #[arg(short, long)]
    application: String,

    #[arg(short = 't', long, default_value = "TOMCAT")]
    service_type: String,

    /// Filter text: clause DSL or JSON descriptors.
    ///
    /// Example: `fromApplication=web; elapsed>=500; errorOnly`
    #[arg(long)]
    filter: Option<String>,
}

#[derive(Args)]
struct MapArgs {
    #[command(flatten)]
    target: TargetArgs,

    /// Range start, epoch milliseconds.
    #[arg(long)]
    from: i64,

    /// Range end (inclusive), epoch milliseconds.
    #[arg(long)]
    to: i64,

    #[arg(long, default_value_t = 10_000)]
    limit: i64,
}

#[derive(Args)]
struct LastArgs {
    #[command(flatten)]
    target: TargetArgs,

    /// Window width in milliseconds.
    #[arg(long)]
    period: i64,

    #[arg(long, default_value_t = 1_000_000)]
    limit: i64,
}

impl Cli {
    fn map_config(&self) -> MapConfig {
        let defaults = MapConfig::default();
        MapConfig {
            limit: LimitConfig {
                max: self.max_limit,
                ..defaults.limit
            },
            clock_skew_ms: self.clock_skew_ms,
            workers: self.workers.unwrap_or(defaults.workers),
            query_timeout: Duration::from_millis(self.timeout_ms),
            ..defaults
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("servermap")
        .join("data")
}

// ─────────────────────────────────────────────────────────────────────────────
// Ingest
// ─────────────────────────────────────────────────────────────────────────────

/// Insert every transaction of a JSON Lines file. Blank lines are skipped;
/// a malformed line aborts the load.
fn ingest_file(store: &dyn TransactionStore, path: &Path) -> anyhow::Result<usize> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;

    let mut count = 0;
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let transaction: Transaction = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid transaction", path.display(), index + 1))?;
        store.insert(&transaction)?;
        count += 1;
    }
    Ok(count)
}

// ─────────────────────────────────────────────────────────────────────────────
// Queries
// ─────────────────────────────────────────────────────────────────────────────

/// Drive a map query to completion. Ctrl-C fires `handle`, after which the
/// query resolves to [`MapError::Cancelled`].
async fn with_ctrl_c<F>(handle: &CancelHandle, query: F) -> Result<FilteredServerMap, MapError>
where
    F: Future<Output = Result<FilteredServerMap, MapError>>,
{
    tokio::pin!(query);
    tokio::select! {
        result = &mut query => result,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("servermap: cancelling query");
            handle.cancel();
            query.await
        }
    }
}

fn print_response(result: &FilteredServerMap) -> anyhow::Result<()> {
    match result.remainder() {
        Some(remainder) => eprintln!(
            "servermap: scan limit {} reached; {} not scanned",
            result.limit, remainder
        ),
        None if result.scan.truncated => eprintln!(
            "servermap: scan limit {} reached; transactions at {} dropped",
            result.limit,
            result.range.from()
        ),
        None => {}
    }
    let response = FilteredMapResponse::from(result);
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("servermap=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    std::fs::create_dir_all(&data_dir)?;
    let store = Arc::new(FjallTraceStore::open(&data_dir)?);
    let config = cli.map_config();

    match cli.command {
        Command::Ingest { file } => {
            let loader = Arc::clone(&store);
            let count =
                tokio::task::spawn_blocking(move || ingest_file(loader.as_ref(), &file)).await??;
            store.persist()?;
            eprintln!(
                "servermap: ingested {count} transactions into {} (~{} stored)",
                data_dir.display(),
                store.count()?
            );
            Ok(())
        }
        Command::Map(args) => {
            let service = FilteredMapService::new(store.clone(), store, &config);
            let query = FilteredMapQuery {
                filter: args.target.filter,
                limit: args.limit,
                ..FilteredMapQuery::new(
                    args.target.application,
                    &args.target.service_type,
                    args.from,
                    args.to,
                )
            };
            let (handle, signal) = cancellation();
            let result =
                with_ctrl_c(&handle, service.get_filtered_server_map(&query, &signal)).await?;
            print_response(&result)
        }
        Command::Last(args) => {
            let service = FilteredMapService::new(store.clone(), store, &config);
            let query = LastFilteredMapQuery {
                filter: args.target.filter,
                limit: args.limit,
                ..LastFilteredMapQuery::new(
                    args.target.application,
                    &args.target.service_type,
                    args.period,
                )
            };
            let (handle, signal) = cancellation();
            let result =
                with_ctrl_c(&handle, service.get_last_filtered_server_map(&query, &signal))
                    .await?;
            print_response(&result)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use servermap_core::range::Range;
    use servermap_core::storage::TraceIndex;
    use servermap_storage::MemoryTraceStore;

    use super::*;

    const LINES: &str = r#"
{"transactionId":{"agentId":"agent","agentStartTime":1,"sequence":1},"startTime":1000,"spans":[{"caller":{"application":"USER","serviceType":"USER"},"callee":{"application":"web","serviceType":"TOMCAT"},"timestamp":1000,"elapsedMs":40}]}

{"transactionId":{"agentId":"agent","agentStartTime":1,"sequence":2},"startTime":2000,"spans":[{"caller":{"application":"web","serviceType":"TOMCAT"},"callee":{"application":"db","serviceType":"MYSQL"},"timestamp":2000,"elapsedMs":7,"error":true}]}
"#;

    #[test]
    fn test_ingest_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transactions.jsonl");
        File::create(&path)
            .unwrap()
            .write_all(LINES.as_bytes())
            .unwrap();

        let data = tempfile::tempdir().unwrap();
        let store = FjallTraceStore::open(data.path()).unwrap();
        assert_eq!(ingest_file(&store, &path).unwrap(), 2);

        let range = Range::new(0, 10_000).unwrap();
        assert_eq!(store.scan("web", &range, 10).unwrap().data.len(), 1);
        assert_eq!(store.scan("db", &range, 10).unwrap().data.len(), 1);
    }

    #[test]
    fn test_ingest_updates_store_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transactions.jsonl");
        std::fs::write(&path, LINES).unwrap();

        let store = MemoryTraceStore::new();
        assert_eq!(store.count().unwrap(), 0);
        assert_eq!(ingest_file(&store, &path).unwrap(), 2);
        assert_eq!(store.count().unwrap(), 2);

        // Reloading the same file trips over the stored ids.
        assert!(ingest_file(&store, &path).is_err());
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn test_ingest_rejects_malformed_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.jsonl");
        std::fs::write(&path, "{\"startTime\":1000}\n").unwrap();

        let data = tempfile::tempdir().unwrap();
        let store = FjallTraceStore::open(data.path()).unwrap();
        let err = ingest_file(&store, &path).unwrap_err();
        assert!(err.to_string().contains(":1: invalid transaction"));
    }

    #[test]
    fn test_cli_overrides_config() {
        let cli = Cli::parse_from([
            "servermap",
            "--max-limit",
            "500",
            "--workers",
            "2",
            "--timeout-ms",
            "1000",
            "map",
            "-a",
            "web",
            "--from",
            "0",
            "--to",
            "10",
        ]);
        let config = cli.map_config();
        assert_eq!(config.limit.max, 500);
        assert_eq!(config.limit.min, 1);
        assert_eq!(config.workers, 2);
        assert_eq!(config.query_timeout, Duration::from_millis(1_000));
        assert_eq!(config.clock_skew_ms, 3_000);
    }
}
