use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chanplay::config::Prefs;
use chanplay::constants::constants;
use chanplay::remote::{ChannelMeta, VideoPage, VideoSource, normalize_handle};
use chanplay::store::blocking;
use chanplay::videos::FetchOutcome;
use chanplay::youtube::{Auth, YoutubeClient};
use chanplay::{ChannelCache, SyncError, SyncEvent, SyncResult};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

// --- CLI ---

#[derive(Parser, Debug)]
#[command(author, version = env!("CARGO_PKG_VERSION"), about = "Local-first channel and video cache", long_about = None)]
struct Args {
  /// Also log to stderr
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Reconcile the configured handles and list the cached channels
  Channels,
  /// List a channel's cached videos, fetching the first page when none are cached
  Videos {
    /// Channel handle (@name) or channel id
    channel: String,
  },
  /// Fetch the next page of a channel's videos
  More {
    channel: String,
  },
  /// Drop a channel's cached videos and fetch them again
  Reload {
    channel: String,
  },
  /// Ban a cached video so it never shows up again
  Ban {
    video_id: String,
  },
  /// List banned videos
  Bans,
  /// Show watch history, newest first
  History,
  /// Print the resume position of a video and record a view
  Watch {
    video_id: String,
    /// Playback position to save, in seconds (defaults to the saved one)
    #[arg(short, long)]
    position: Option<u32>,
  },
  /// Print shell completions
  Completions {
    shell: Shell,
  },
}

// --- Main ---

#[tokio::main]
async fn main() -> Result<()> {
  let args = Args::parse();

  if let Command::Completions { shell } = args.command {
    let mut cmd = Args::command();
    let name = cmd.get_name().to_string();
    clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
    return Ok(());
  }

  let _log_guard = init_logging(args.verbose);
  let prefs = Prefs::load();
  let cache = ChannelCache::open(&prefs, source_from(&prefs)?)?;
  let mut events = cache.subscribe_events();

  let result = run(&cache, args.command).await;
  report_auth_events(&mut events);
  result
}

/// File logging in the data dir (daily rotation); `--verbose` adds stderr.
fn init_logging(verbose: bool) -> Option<WorkerGuard> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chanplay=info"));

  let (file_layer, guard) = match Prefs::log_dir() {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, &constants().log_file_prefix);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
    }
    None => (None, None),
  };
  let stderr_layer = verbose.then(|| fmt::layer().with_writer(std::io::stderr).with_target(false));

  tracing_subscriber::registry().with(filter).with(file_layer).with(stderr_layer).init();
  guard
}

fn source_from(prefs: &Prefs) -> Result<Arc<dyn VideoSource>> {
  let auth = match (&prefs.access_token, prefs.api_key()) {
    (Some(token), _) if !token.is_empty() => Auth::Bearer(token.clone()),
    (_, Some(key)) => Auth::ApiKey(key),
    _ => return Ok(Arc::new(NoCredentials)),
  };
  Ok(Arc::new(YoutubeClient::new(auth).context("Failed to build HTTP client")?))
}

/// Stands in for the API client until a key or token is configured, so the
/// offline commands still work and network ones raise the auth prompt.
struct NoCredentials;

impl NoCredentials {
  fn missing<T>() -> SyncResult<T> {
    Err(SyncError::AuthRequired("no API key or access token configured (set YOUTUBE_API_KEY or prefs.toml)".into()))
  }
}

#[async_trait]
impl VideoSource for NoCredentials {
  async fn resolve_handle(&self, _handle: &str) -> SyncResult<Option<String>> {
    Self::missing()
  }

  async fn channel_metadata(&self, _channel_id: &str) -> SyncResult<Option<ChannelMeta>> {
    Self::missing()
  }

  async fn list_videos(&self, _channel_id: &str, _page_token: Option<&str>) -> SyncResult<VideoPage> {
    Self::missing()
  }
}

fn report_auth_events(events: &mut broadcast::Receiver<SyncEvent>) {
  while let Ok(event) = events.try_recv() {
    match event {
      SyncEvent::AuthRequired { operation, message } => {
        eprintln!("Authorization required ({}): {}. Re-run after refreshing credentials.", operation, message);
      }
    }
  }
}

// --- Commands ---

async fn run(cache: &ChannelCache, command: Command) -> Result<()> {
  match command {
    Command::Channels => {
      cache.reconcile().await;
      let store = cache.context().store.clone();
      for channel in blocking(move || store.channels()).await? {
        println!("{:<26} {:<24} {}", channel.channel_id, channel.handle, channel.title);
      }
    }
    Command::Videos { channel } => {
      let channel_id = resolve_channel(cache, &channel).await?;
      let store = cache.context().store.clone();
      let id = channel_id.clone();
      if blocking(move || store.count_videos_for_channel(&id)).await? == 0 {
        print_outcome(&channel_id, cache.fetch_next_page(&channel_id).await);
      }
      print_videos(cache, &channel_id).await?;
    }
    Command::More { channel } => {
      let channel_id = resolve_channel(cache, &channel).await?;
      print_outcome(&channel_id, cache.fetch_next_page(&channel_id).await);
    }
    Command::Reload { channel } => {
      let channel_id = resolve_channel(cache, &channel).await?;
      print_outcome(&channel_id, cache.reload_channel(&channel_id).await);
      print_videos(cache, &channel_id).await?;
    }
    Command::Ban { video_id } => {
      if !cache.ban_video(&video_id).await {
        bail!("{} is not a cached video", video_id);
      }
      println!("Banned {}", video_id);
    }
    Command::Bans => {
      for (video_id, description) in cache.context().config.banned_videos() {
        println!("{:<14} {}", video_id, description);
      }
    }
    Command::History => {
      for record in cache.history().await {
        let viewed = chrono::DateTime::from_timestamp_millis(record.view_timestamp)
          .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
          .unwrap_or_default();
        println!("{:<16} {:<14} {:>6}s  {}", viewed, record.video_id, record.position, record.title());
      }
    }
    Command::Watch { video_id, position } => {
      let saved = cache.find_by_video_id(&video_id).await;
      println!("Resume {} at {}", video_id, format_position(saved));
      cache.record_view_now(&video_id, position.unwrap_or(saved)).await;
    }
    Command::Completions { .. } => {}
  }
  Ok(())
}

/// Accept a cached handle (with or without `@`) or a raw channel id.
async fn resolve_channel(cache: &ChannelCache, arg: &str) -> Result<String> {
  let store = cache.context().store.clone();
  let handle = normalize_handle(arg);
  let cached = blocking(move || store.get_channel_by_handle(&handle)).await?;
  match cached {
    Some(channel) => Ok(channel.channel_id),
    None if arg.trim().starts_with('@') => bail!("{} is not a cached channel; run `channels` first", arg),
    None => Ok(arg.trim().to_string()),
  }
}

async fn print_videos(cache: &ChannelCache, channel_id: &str) -> Result<()> {
  let store = cache.context().store.clone();
  let id = channel_id.to_string();
  let videos = blocking(move || store.videos_for_channel(&id)).await?;
  for video in videos.iter().rev() {
    let published = chrono::DateTime::from_timestamp_millis(video.fetched_at)
      .map(|at| at.format("%Y-%m-%d").to_string())
      .unwrap_or_default();
    println!("{:<11} {:<14} {}", published, video.video_id, video.description);
  }
  Ok(())
}

fn print_outcome(channel_id: &str, outcome: FetchOutcome) {
  match outcome {
    FetchOutcome::Stored { stored, banned, exhausted } => {
      let tail = if exhausted { ", no more pages" } else { "" };
      println!("{}: stored {} videos ({} banned skipped){}", channel_id, stored, banned, tail);
    }
    FetchOutcome::Exhausted => println!("{}: all pages already fetched", channel_id),
    FetchOutcome::AlreadyCached => println!("{}: videos already cached, use `reload` to refresh", channel_id),
    FetchOutcome::InFlight => println!("{}: a fetch is already running", channel_id),
    FetchOutcome::Failed => eprintln!("{}: fetch failed, see the log for details", channel_id),
  }
}

fn format_position(secs: u32) -> String {
  let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
  if h > 0 { format!("{}:{:02}:{:02}", h, m, s) } else { format!("{}:{:02}", m, s) }
}
