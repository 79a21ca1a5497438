mod cache;
mod classify;
mod config;
mod error;
mod event;
mod http;
mod lifecycle;
mod net;
mod notify;
mod profile;
mod synth;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use url::Url;

use crate::cache::{Caches, SqliteStorage};
use crate::config::Config;
use crate::event::{Effect, Event};
use crate::http::{Destination, Request};
use crate::net::HttpNetwork;
use crate::profile::{Profile, Site};
use crate::worker::Registration;

#[derive(Parser, Debug)]
#[command(name = "outpost")]
#[command(about = "An offline-tolerant caching proxy with standard, economy and full-offline profiles")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/outpost/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Profile to run instead of the configured one
  #[arg(short, long, value_enum)]
  profile: Option<Profile>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Bring the configured generation up, installing it if needed
  Start,
  /// Install a generation and switch to it
  Install {
    /// Store generation (default: from config)
    #[arg(short, long)]
    generation: Option<u32>,
  },
  /// Fetch a URL through the proxy
  Fetch {
    url: String,
    /// Issue as a page navigation
    #[arg(long)]
    navigate: bool,
    #[arg(long, value_enum)]
    destination: Option<Destination>,
    #[arg(long, default_value = "GET")]
    method: String,
  },
  /// List stores and their entry counts
  Stores,
  /// Fire a background-sync tag
  Sync { tag: String },
  /// Deliver a push message
  Push { data: Option<String> },
  /// Read JSON events from stdin, one per line, and print effects
  Events,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;
  if let Some(profile) = args.profile {
    config.profile = profile;
  }

  let _guard = init_tracing(&config)?;
  let site = config.site()?;

  let storage = SqliteStorage::open(config.cache.path.as_deref())?.with_quota(config.cache.quota_bytes);
  let network = HttpNetwork::new(
    site.origin.clone(),
    Duration::from_secs(config.network.timeout_secs),
  )?;
  let registration = Arc::new(
    Registration::new(Caches::new(storage), Arc::new(network))
      .with_dynamic_budget(config.cache.dynamic_budget_bytes),
  );

  info!(
    version = env!("CARGO_PKG_VERSION"),
    profile = %config.profile,
    generation = config.generation,
    origin = %site.origin,
    "Starting"
  );

  match args.command {
    Command::Start => {
      let activation = start(&registration, &site, &config).await?;
      print_effect(&Effect::Activated {
        worker: activation.worker,
        purged: activation.purged,
        clients: activation.clients,
      })?;
    }
    Command::Install { generation } => {
      let generation = generation.unwrap_or(config.generation);
      let effect = event::dispatch(
        &registration,
        &site,
        Event::Install {
          profile: config.profile,
          generation,
        },
      )
      .await;
      print_effect(&effect)?;
    }
    Command::Fetch {
      url,
      navigate,
      destination,
      method,
    } => {
      start(&registration, &site, &config).await?;

      let url = Url::parse(&url).or_else(|_| site.origin.join(&url))?;
      let mut request = Request::new(&method.to_uppercase(), url);
      if navigate {
        request = request.navigate();
      }
      if let Some(destination) = destination {
        request = request.with_destination(destination);
      }

      match registration.fetch(&request).await {
        Some(mut outcome) => {
          print_effect(&Effect::respond(request.url.as_str(), &outcome))?;
          // Let the write-through land before the process exits
          if outcome.write_settled().await == Some(false) {
            warn!(url = %request.url, "Response was not stored");
          }
        }
        None => print_effect(&Effect::PassThrough {
          url: request.url.to_string(),
        })?,
      }
    }
    Command::Stores => {
      let caches = registration.caches();
      for name in caches.list()? {
        let entries = caches.handle(&name).keys()?.len();
        println!("{}\t{}", name, entries);
      }
    }
    Command::Sync { tag } => {
      start(&registration, &site, &config).await?;
      let effect = event::dispatch(&registration, &site, Event::Sync { tag }).await;
      print_effect(&effect)?;
    }
    Command::Push { data } => {
      start(&registration, &site, &config).await?;
      let effect = event::dispatch(&registration, &site, Event::Push { data }).await;
      print_effect(&effect)?;
    }
    Command::Events => run_events(registration, site).await?,
  }

  Ok(())
}

async fn start(
  registration: &Registration,
  site: &Site,
  config: &Config,
) -> Result<worker::Activation> {
  registration
    .start(site.profile_config(config.profile, config.generation))
    .await
    .map_err(|e| eyre!("Failed to start {} profile: {}", config.profile, e))
}

/// Pump stdin through the event loop until EOF.
async fn run_events(registration: Arc<Registration>, site: Site) -> Result<()> {
  let (event_tx, event_rx) = mpsc::unbounded_channel();
  let (effect_tx, mut effect_rx) = mpsc::unbounded_channel();

  let event_loop = tokio::spawn(event::run(registration, site, event_rx, effect_tx));
  let printer = tokio::spawn(async move {
    while let Some(effect) = effect_rx.recv().await {
      if let Err(e) = print_effect(&effect) {
        warn!(error = %e, "Failed to print effect");
      }
    }
  });

  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  while let Some(line) = lines.next_line().await? {
    if line.trim().is_empty() {
      continue;
    }
    match serde_json::from_str::<Event>(&line) {
      Ok(event) => {
        if event_tx.send(event).is_err() {
          break;
        }
      }
      Err(e) => warn!(error = %e, "Skipping malformed event"),
    }
  }
  drop(event_tx);

  event_loop.await?;
  printer.await?;
  Ok(())
}

fn print_effect(effect: &Effect) -> Result<()> {
  println!("{}", serde_json::to_string(effect)?);
  Ok(())
}

/// Logs go to stderr, or to `log_file` when set; stdout carries effects.
fn init_tracing(config: &Config) -> Result<Option<WorkerGuard>> {
  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

  match &config.log_file {
    Some(path) => {
      let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
      let file_name = path
        .file_name()
        .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;
      std::fs::create_dir_all(dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

      let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
      tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .init();
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
      Ok(None)
    }
  }
}
