mod app;
mod backend;
mod config;
mod constants;
mod credential;
mod error;
mod gateway;
mod model;
mod registry;
mod selector;
mod session;
mod sync;
#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use directories::ProjectDirs;
use std::path::PathBuf;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use app::App;
use config::Config;
use constants::constants;
use model::{Category, UploadMetadata, UserId};

// --- CLI ---

#[derive(Parser, Debug)]
#[command(author, version = env!("CARGO_PKG_VERSION"), about, long_about = None)]
struct Args {
  /// Backend API base URL (overrides prefs.toml and VIDSYNC_API_URL)
  #[arg(long, global = true)]
  api_url: Option<String>,

  /// Push channel base URL (default: derived from the API URL)
  #[arg(long, global = true)]
  push_url: Option<String>,

  /// Use this bearer token instead of the stored credential
  #[arg(long, global = true)]
  token: Option<String>,

  /// Write the URL overrides back to prefs.toml
  #[arg(long, global = true)]
  save: bool,

  /// Mirror logs to stderr
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Sign in and store the issued token
  Login {
    email: String,
    /// Read from stdin when omitted
    #[arg(long)]
    password: Option<String>,
  },
  /// Create an account
  Register {
    email: String,
    #[arg(long)]
    password: Option<String>,
  },
  /// Forget the stored token
  Logout,
  /// Show the current session and its privilege tier
  Whoami,
  /// List your videos (every video, for admins)
  Library {
    /// Keep polling until every video has finished processing
    #[arg(short, long)]
    watch: bool,
  },
  /// List shared videos
  Feed {
    #[arg(short, long)]
    query: Option<String>,
    /// All, Tech, Gaming, Music, Other, or any custom category
    #[arg(short, long)]
    category: Option<String>,
    #[arg(long, default_value_t = 0)]
    skip: usize,
    #[arg(short, long)]
    watch: bool,
  },
  /// Show the processing status of one video
  Status { id: String },
  /// Upload a video file
  Upload {
    path: PathBuf,
    #[arg(short, long)]
    title: String,
    #[arg(short, long)]
    description: Option<String>,
    #[arg(short, long)]
    category: Option<String>,
    /// Publish to the public feed
    #[arg(long)]
    shared: bool,
    #[arg(long)]
    resolution: Option<String>,
    /// Follow processing until the video is ready
    #[arg(short, long)]
    watch: bool,
  },
  /// Delete a video
  Delete { id: String },
  /// List user accounts (admin)
  Users,
  /// Grant admin rights (admin)
  Promote { id: UserId },
  /// Deactivate an account (admin)
  Ban { id: UserId },
  /// Permanently delete an account (admin)
  RemoveUser { id: UserId },
  /// Print shell completions
  Completions { shell: Shell },
}

// --- Logging ---

fn log_dir() -> Option<PathBuf> {
  ProjectDirs::from("", "", &constants().app_name).map(|dirs| dirs.data_dir().to_path_buf())
}

/// File logging always; stderr too with `--verbose`. `VIDSYNC_LOG` beats prefs.toml.
fn init_logging(config: &Config, verbose: bool) -> Option<WorkerGuard> {
  let filter = EnvFilter::try_from_env("VIDSYNC_LOG")
    .or_else(|_| EnvFilter::try_new(config.log_level()))
    .unwrap_or_else(|_| EnvFilter::new("info"));

  let (file_layer, guard) = match log_dir().filter(|dir| std::fs::create_dir_all(dir).is_ok()) {
    Some(dir) => {
      let appender = tracing_appender::rolling::never(dir, &constants().log_file);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
    }
    None => (None, None),
  };
  let stderr_layer = verbose.then(|| fmt::layer().with_writer(std::io::stderr).with_target(false));

  tracing_subscriber::registry().with(filter).with(file_layer).with(stderr_layer).init();
  guard
}

// --- Main ---

#[tokio::main]
async fn main() -> Result<()> {
  let args = Args::parse();

  if let Command::Completions { shell } = args.command {
    clap_complete::generate(shell, &mut Args::command(), constants().app_name.as_str(), &mut std::io::stdout());
    return Ok(());
  }

  let mut config = Config::load().with_env();
  if args.api_url.is_some() {
    config.api_url = args.api_url.clone();
  }
  if args.push_url.is_some() {
    config.push_url = args.push_url.clone();
  }
  if args.save {
    config.save().context("Failed to save preferences")?;
  }

  let _guard = init_logging(&config, args.verbose);
  info!(version = env!("CARGO_PKG_VERSION"), api = config.api_url(), "vidsync: starting");

  let app = App::new(config, args.token)?;
  run(&app, args.command).await
}

async fn run(app: &App, command: Command) -> Result<()> {
  match command {
    Command::Login { email, password } => app.login(&email, password).await,
    Command::Register { email, password } => app.register(&email, password).await,
    Command::Logout => app.logout(),
    Command::Whoami => app.whoami().await,
    Command::Library { watch } => app.library(watch).await,
    Command::Feed { query, category, skip, watch } => {
      let category = category.map(Category::new).unwrap_or_else(Category::all);
      app.feed(query, category, skip, watch).await
    }
    Command::Status { id } => app.status(&id).await,
    Command::Upload { path, title, description, category, shared, resolution, watch } => {
      let mut metadata = UploadMetadata::titled(title);
      metadata.description = description;
      metadata.shared = shared;
      if let Some(category) = category {
        metadata.category = Category::new(category);
      }
      if let Some(resolution) = resolution {
        metadata.resolution = resolution;
      }
      app.upload(&path, metadata, watch).await
    }
    Command::Delete { id } => app.delete(&id).await,
    Command::Users => app.users().await,
    Command::Promote { id } => app.promote(id).await,
    Command::Ban { id } => app.ban(id).await,
    Command::RemoveUser { id } => app.remove_user(id).await,
    Command::Completions { .. } => Ok(()),
  }
}
