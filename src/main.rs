use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use perch::config::Config;
use perch::notice::{drain, NoticeReceiver};
use perch::session::SqliteCredentialStore;
use perch::Core;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "perch")]
#[command(about = "Command-line client for the perch feed core")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/perch/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Also log to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Log in; the password is read from PERCH_PASSWORD
  Login { email: String },
  Logout,
  /// Check the stored token against the server
  Verify,
  /// Print the home feed
  Feed {
    #[arg(short, long, default_value_t = 1)]
    pages: u32,
  },
  Notifications,
  /// Stream push notices until interrupted
  Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_logging(args.verbose)?;

  let config = Config::load(args.config.as_deref())?;
  let store = SqliteCredentialStore::open()?;
  let (core, mut notices) = Core::new(config, Box::new(store))?;

  match args.command {
    Command::Login { email } => {
      let password =
        std::env::var("PERCH_PASSWORD").map_err(|_| eyre!("PERCH_PASSWORD is not set"))?;
      let grant = core.login(&email, &password).await?;
      match grant.user {
        Some(user) => println!("Logged in as @{}", user.handle),
        None => println!("Logged in"),
      }
    }
    Command::Logout => core.logout().await,
    Command::Verify => {
      let user = core.verify().await?;
      println!("Token valid for @{}", user.handle);
    }
    Command::Feed { pages } => {
      for _ in 0..pages.max(1) {
        core.feed().fetch_next_page().await?;
        if !core.feed().has_more() {
          break;
        }
      }
      for item in core.feed().items() {
        println!(
          "@{}: {}  [{} likes, {} retweets, {} comments]",
          item.author_handle.as_deref().unwrap_or("?"),
          item.content,
          item.like_count,
          item.retweet_count,
          item.comment_count,
        );
      }
    }
    Command::Notifications => {
      core.inbox().fetch_next_page().await?;
      for n in core.inbox().items() {
        let marker = if n.read { ' ' } else { '*' };
        println!("{} [{}] {}", marker, n.kind, n.message);
      }
    }
    Command::Watch => {
      if !core.is_authenticated() {
        return Err(eyre!("Not logged in"));
      }
      core.connect_push().await?;
      println!("Watching for events, Ctrl-C to stop");
      watch(&mut notices).await;
      core.push().disconnect();
    }
  }

  for notice in drain(&mut notices) {
    eprintln!("{}", notice.message());
  }
  Ok(())
}

async fn watch(notices: &mut NoticeReceiver) {
  loop {
    tokio::select! {
      notice = notices.recv() => match notice {
        Some(notice) => println!("{}", notice.message()),
        None => break,
      },
      _ = tokio::signal::ctrl_c() => break,
    }
  }
}

/// File logging under the data directory, filtered by `PERCH_LOG`.
fn init_logging(verbose: bool) -> Result<WorkerGuard> {
  let log_dir = perch::db::data_dir()?.join("logs");
  std::fs::create_dir_all(&log_dir)?;

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "perch.log"));
  let stderr = verbose.then(|| fmt::layer().with_writer(std::io::stderr));

  tracing_subscriber::registry()
    .with(EnvFilter::try_from_env("PERCH_LOG").unwrap_or_else(|_| EnvFilter::new("info")))
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .with(stderr)
    .init();

  Ok(guard)
}
