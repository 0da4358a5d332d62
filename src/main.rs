//! Linkshelf CLI
//!
//! Command-line interface for Linkshelf:
//! - Sign in with Google and out again
//! - List, add and delete bookmarks
//! - Watch the dashboard update live

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use linkshelf::config::{generate_default_config, LoggingConfig};
use linkshelf::dashboard::normalize_url;
use linkshelf::render::{render_dashboard, render_landing};
use linkshelf::{
    watch, Backend, CallbackServer, Config, Dashboard, LocalStore, MemoryBackend, NewBookmark,
    Route, Session, SystemClock, User, WatchExit,
};

/// How long `login` waits for the browser to come back
const LOGIN_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Parser)]
#[command(name = "linkshelf")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Personal bookmarks with Google sign-in and live updates")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ~/.config/linkshelf/config.toml or ./linkshelf.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use an in-process backend with a demo user instead of the hosted project
    #[arg(long, global = true)]
    offline: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in with the configured OAuth provider
    Login,

    /// Sign out and clear local state
    Logout,

    /// Show the signed-in user
    Whoami,

    /// List bookmarks, newest first
    List,

    /// Save a bookmark
    Add {
        /// Title shown in the list
        title: String,
        /// URL; https:// is assumed when no scheme is given
        url: String,
    },

    /// Delete a bookmark
    Delete {
        /// Position in `list` (1 = newest) or bookmark id
        target: String,
    },

    /// Live dashboard with an interactive prompt
    Watch,

    /// Configuration helpers
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Generate a default config file
    Init {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (config, config_path) = match &cli.config {
        Some(path) => (Config::load_with_env(path)?, Some(path.clone())),
        None => Config::load_first(&Config::default_paths())?,
    };
    init_tracing(&config.logging);
    match &config_path {
        Some(path) => tracing::debug!("Loaded config from {:?}", path),
        None => tracing::debug!("Using default config with environment overrides"),
    }

    if let Commands::Config {
        action: ConfigAction::Init { output },
    } = &cli.command
    {
        return write_config(output.as_ref());
    }

    let data_dir = config.storage.data_path();
    let local = Arc::new(
        LocalStore::open(&data_dir)
            .with_context(|| format!("Failed to open local store in {:?}", data_dir))?,
    );
    tracing::debug!(data_dir = ?data_dir, offline = cli.offline, "Starting");

    let backend = if cli.offline {
        offline_backend().await
    } else {
        config.supabase.require()?;
        linkshelf::supabase::connect(&config, Arc::clone(&local))?
    };

    let mut dashboard = Dashboard::new(
        backend.clone(),
        Arc::clone(&local),
        Arc::new(SystemClock),
        config.dashboard.clone(),
    )
    .refresh_margin(config.auth.refresh_margin_secs);

    match cli.command {
        Commands::Login => {
            if cli.offline {
                println!("Offline mode is always signed in as the demo user.");
                return Ok(());
            }
            login(&backend, &config).await?;
        }

        Commands::Logout => {
            dashboard.sign_out().await;
            println!("Signed out.");
        }

        Commands::Whoami => {
            let session = backend.auth.get_session().await?;
            print!("{}", describe_session(session.as_ref())?);
        }

        Commands::List => {
            let mut dashboard = dashboard.without_feed();
            require_session(&mut dashboard).await?;
            print!("{}", render_dashboard(&dashboard));
        }

        Commands::Add { title, url } => {
            let mut dashboard = dashboard.without_feed();
            require_session(&mut dashboard).await?;
            if !dashboard.add(&title, &url).await {
                bail!(dashboard.error().unwrap_or("Failed to add bookmark.").to_string());
            }
            println!("Saved {}", normalize_url(&url));
        }

        Commands::Delete { target } => {
            let mut dashboard = dashboard.without_feed();
            require_session(&mut dashboard).await?;
            let Some(bookmark) = dashboard.resolve(&target).cloned() else {
                bail!("No bookmark matches {}", target);
            };
            dashboard
                .delete(&bookmark.id)
                .await
                .context("Failed to delete bookmark")?;
            println!("Deleted {}", bookmark.title);
        }

        Commands::Watch => {
            require_session(&mut dashboard).await?;
            let input = tokio::io::BufReader::new(tokio::io::stdin());
            let mut output = tokio::io::stdout();
            match watch::run(&mut dashboard, input, &mut output).await? {
                WatchExit::SignedOut => print!("{}", render_landing()),
                WatchExit::Quit | WatchExit::EndOfInput => println!(),
            }
        }

        // Handled before the backend is built
        Commands::Config { .. } => {}
    }

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let directive = if logging.level.contains('=') {
        logging.level.clone()
    } else {
        format!("linkshelf={}", logging.level)
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn write_config(output: Option<&PathBuf>) -> anyhow::Result<()> {
    let config = generate_default_config();

    match output {
        Some(path) => {
            // Create parent directory if needed
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, &config)?;
            println!("Config written to {:?}", path);
        }
        None => {
            print!("{}", config);
        }
    }
    Ok(())
}

/// The `whoami` report; an error when nobody is signed in
fn describe_session(session: Option<&Session>) -> anyhow::Result<String> {
    let Some(session) = session else {
        bail!("Not signed in");
    };

    let user = &session.user;
    let mut out = format!("{}\n", user.display_name());
    if let Some(email) = &user.email {
        out.push_str(&format!("  Email: {}\n", email));
    }
    out.push_str(&format!("  User id: {}\n", user.id));
    if let Some(expires) = chrono::DateTime::from_timestamp(session.expires_at, 0) {
        out.push_str(&format!(
            "  Session expires: {}\n",
            expires.format("%Y-%m-%d %H:%M UTC")
        ));
    }
    Ok(out)
}

/// Activate the dashboard or explain how to sign in
async fn require_session(dashboard: &mut Dashboard) -> anyhow::Result<()> {
    if dashboard.activate().await == Route::Dashboard {
        return Ok(());
    }
    if let Some(reason) = dashboard.last_error() {
        eprintln!("Could not check the session: {}", reason);
    }
    print!("{}", render_landing());
    bail!("Not signed in");
}

async fn login(backend: &Backend, config: &Config) -> anyhow::Result<()> {
    let server = CallbackServer::bind(config.auth.callback_port).await?;
    let request = backend.auth.authorize(&config.auth.redirect_uri())?;

    println!("Open this URL in your browser to sign in:");
    println!();
    println!("  {}", request.url);
    println!();

    let code = tokio::time::timeout(LOGIN_TIMEOUT, server.wait())
        .await
        .context("Timed out waiting for the sign-in callback")??;
    let session = backend
        .auth
        .exchange_code(&code, &request.code_verifier)
        .await?;

    println!("Signed in as {}", session.user.display_name());
    Ok(())
}

/// In-process backend seeded with a demo user and a few bookmarks
async fn offline_backend() -> Backend {
    let user = User::new("demo-user")
        .email("demo@linkshelf.local")
        .full_name("Demo User");
    let memory = Arc::new(MemoryBackend::with_user(user.clone()));

    for (title, url) in [
        ("The Rust Programming Language", "https://doc.rust-lang.org/book/"),
        ("Tokio", "https://tokio.rs"),
        ("Supabase Docs", "https://supabase.com/docs"),
    ] {
        memory
            .insert_row(NewBookmark {
                url: url.to_string(),
                title: title.to_string(),
                user_id: user.id.clone(),
            })
            .await;
    }

    Backend::in_memory(memory)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_session() {
        let session = Session {
            access_token: "a".into(),
            token_type: "bearer".into(),
            refresh_token: "r".into(),
            expires_at: 1_700_000_000,
            user: User::new("u1").email("u1@example.com").full_name("Ada"),
        };

        let report = describe_session(Some(&session)).unwrap();
        assert!(report.starts_with("Ada\n"));
        assert!(report.contains("  Email: u1@example.com\n"));
        assert!(report.contains("  User id: u1\n"));
        assert!(report.contains("Session expires: 2023-11-14 22:13 UTC"));
    }

    #[test]
    fn test_describe_without_session_is_an_error() {
        let err = describe_session(None).unwrap_err();
        assert_eq!(err.to_string(), "Not signed in");
    }
}
