use clap::{Parser, Subcommand};
use color_eyre::{eyre::Report, Result};
use revalidate::event::{Event, EventHandler};
use revalidate::http::{describe, HttpSource};
use revalidate::{
  Cacheable, Config, HttpStatusError, Query, QueryClient, QueryOptions, QuerySnapshot,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "revalidate")]
#[command(about = "Stale-while-revalidate query cache, driven from the terminal")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/revalidate/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Log to stderr instead of the log file
  #[arg(long)]
  log_stderr: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Subscribe to a simulated backend and print every state change
  Simulate {
    #[arg(long, default_value = "dashboard-tickets")]
    key: String,
    /// Staleness class of the key
    #[arg(long, default_value = "tickets")]
    class: String,
    /// Simulated response latency
    #[arg(long, default_value_t = 50)]
    latency_ms: u64,
    /// Fail every Nth call (1 = always)
    #[arg(long)]
    fail_every: Option<u32>,
    /// Status used for simulated failures
    #[arg(long, default_value_t = 500)]
    status: u16,
    /// Number of items a successful call returns
    #[arg(long, default_value_t = 5)]
    items: usize,
    #[arg(long, default_value_t = 1_000)]
    tick_ms: u64,
    /// Stop after this many ticks
    #[arg(long, default_value_t = 10)]
    ticks: u32,
  },
  /// Watch a JSON endpoint through the cache
  Watch {
    url: Url,
    #[arg(long)]
    class: Option<String>,
    #[arg(long, default_value_t = 1_000)]
    tick_ms: u64,
    /// Warm the cache with a prefetch before subscribing
    #[arg(long)]
    prefetch: bool,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_tracing(args.log_stderr)?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let client = QueryClient::from_config(&config);

  match args.command {
    Command::Simulate {
      key,
      class,
      latency_ms,
      fail_every,
      status,
      items,
      tick_ms,
      ticks,
    } => {
      let calls = Arc::new(AtomicU32::new(0));
      let fetcher = move || {
        let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
          tokio::time::sleep(Duration::from_millis(latency_ms)).await;
          if fail_every.is_some_and(|n| n > 0 && call % n == 0) {
            return Err(Report::new(HttpStatusError::new(
              status,
              format!("simulated failure #{}", call),
            )));
          }
          Ok(
            (1..=items)
              .map(|n| format!("item-{}-{}", call, n))
              .collect::<Vec<String>>(),
          )
        }
      };

      info!(%key, %class, "starting simulation");
      let query = client.query(QueryOptions::new(key, Vec::new(), fetcher).class(class));
      drive(&client, query, tick_ms, Some(ticks), |data| {
        format!("{} items", data.len())
      })
      .await
    }
    Command::Watch {
      url,
      class,
      tick_ms,
      prefetch,
    } => {
      let defaults = client.defaults();
      let http = HttpSource::new(defaults.fetch_timeout * 4)?;
      let key = url.to_string();

      if prefetch {
        let http = http.clone();
        let url = url.clone();
        client
          .prefetch(&key, move || async move { http.get_json(&url).await }, None)
          .await;
      }

      let mut options = QueryOptions::new(key.clone(), serde_json::Value::Null, move || {
        let http = http.clone();
        let url = url.clone();
        async move { http.get_json(&url).await }
      });
      if let Some(class) = class {
        options = options.class(class);
      }

      info!(%key, "watching");
      let query = client.query(options);
      drive(&client, query, tick_ms, None, describe).await
    }
  }
}

/// Tick loop: print state changes, refresh stale entries, collect garbage.
async fn drive<T, F>(
  client: &QueryClient,
  mut query: Query<T>,
  tick_ms: u64,
  max_ticks: Option<u32>,
  summarize: F,
) -> Result<()>
where
  T: Cacheable,
  F: Fn(&T) -> String,
{
  let mut events = EventHandler::new(Duration::from_millis(tick_ms));
  let mut ticks = 0;

  print_state(&query.key(), &query.snapshot(), &summarize);

  while let Some(event) = events.next().await {
    match event {
      Event::Shutdown => break,
      Event::Tick => {
        if query.poll() {
          print_state(&query.key(), &query.snapshot(), &summarize);
        }

        let snapshot = query.snapshot();
        if !snapshot.is_loading && !snapshot.is_refreshing && query.needs_refresh() {
          query.refetch();
        }

        let collected = client.collect_garbage();
        if collected > 0 {
          info!(collected, "collected unused cache entries");
        }

        ticks += 1;
        if max_ticks.is_some_and(|max| ticks >= max) {
          break;
        }
      }
    }
  }

  Ok(())
}

fn print_state<T, F>(key: &str, snapshot: &QuerySnapshot<T>, summarize: &F)
where
  F: Fn(&T) -> String,
{
  let mut flags = Vec::new();
  if snapshot.is_loading {
    flags.push("loading");
  }
  if snapshot.is_refreshing {
    flags.push("refreshing");
  }
  if snapshot.is_stale {
    flags.push("stale");
  }
  if snapshot.is_fallback {
    flags.push("showing cached data");
  }

  let mut line = format!(
    "[{}] {}: {} ({:?})",
    chrono::Local::now().format("%H:%M:%S%.3f"),
    key,
    summarize(&snapshot.data),
    snapshot.source
  );
  if !flags.is_empty() {
    line.push_str(&format!(" [{}]", flags.join(", ")));
  }
  if let Some(error) = &snapshot.error {
    line.push_str(&format!(" error: {}", error));
  }
  println!("{}", line);
}

/// Log to a file under the data directory, or stderr when asked or when no
/// data directory is available.
fn init_tracing(to_stderr: bool) -> Result<Option<WorkerGuard>> {
  let filter =
    EnvFilter::try_from_env("REVALIDATE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  let log_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .map(|p| p.join("revalidate"));

  match log_dir {
    Some(dir) if !to_stderr => {
      std::fs::create_dir_all(&dir)?;
      let appender = tracing_appender::rolling::never(&dir, "revalidate.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
      Ok(Some(guard))
    }
    _ => {
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
      Ok(None)
    }
  }
}
