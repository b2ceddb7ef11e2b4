use anyhow::Result;
use clap::{Parser, Subcommand};
use shared::Theme;
use std::sync::Arc;
use tasklist_sync::{MemoryBackend, Preferences, RemoteStore, SyncEngine};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;
mod prefs;
mod remote;
mod render;
mod repl;

use prefs::FilePreferences;

#[derive(Parser)]
#[command(name = "tasklists")]
#[command(about = "Shared todo lists in the terminal, kept in sync across devices")]
#[command(version)]
struct Cli {
    /// Keep everything in memory for this session; nothing is synced
    #[arg(long, visible_alias = "local")]
    offline: bool,

    /// Platform URL (overrides config)
    #[arg(long)]
    url: Option<String>,

    /// Access token (overrides config)
    #[arg(long)]
    token: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Join a shared list with an invite token, then start
    Accept {
        /// Invite token
        token: String,
    },
    /// Show or set the colour theme
    Theme {
        /// mono, natural or brutal
        name: Option<String>,
    },
    /// Show the user id of the configured token
    Whoami,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Set a configuration value
    Set {
        /// Configuration key (url, anon_key, token)
        key: String,
        /// Configuration value
        value: String,
    },
    /// Get a configuration value
    Get {
        /// Configuration key
        key: String,
    },
    /// Show all configuration
    Show,
    /// Get the config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tasklists=info,tasklist_sync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut prefs = FilePreferences::load(FilePreferences::default_path()?);
    let mut accept = None;

    if let Some(command) = cli.command {
        match command {
            Commands::Config { action } => return handle_config_command(action),
            Commands::Theme { name: None } => {
                println!("{}", prefs.theme());
                return Ok(());
            }
            Commands::Theme { name: Some(name) } => {
                let theme = name
                    .parse::<Theme>()
                    .map_err(|_| anyhow::anyhow!("Unknown theme: {}. Valid themes: mono, natural, brutal", name))?;
                prefs.set_theme(theme);
                println!("Theme set to {}", theme);
                return Ok(());
            }
            Commands::Whoami => {
                let config = config::Config::load()?.with_env();
                match cli.token.or(config.remote.token) {
                    Some(token) => println!("{}", remote::user_id_from_token(&token)?),
                    None => eprintln!("Not logged in. Run: tasklists config set token <TOKEN>"),
                }
                return Ok(());
            }
            Commands::Accept { token } => accept = Some(token),
        }
    }

    let store: Arc<dyn RemoteStore> = if cli.offline {
        tracing::info!("Starting in offline mode (nothing is synced)");
        let backend = MemoryBackend::new();
        let user = backend.add_user("me@localhost");
        Arc::new(backend.session(user))
    } else {
        let mut config = config::Config::load()?.with_env();
        if let Some(url) = cli.url {
            config.remote.url = Some(url);
        }
        if let Some(token) = cli.token {
            config.remote.token = Some(token);
        }
        if config.remote.token.is_none() {
            eprintln!("\x1b[33mNot logged in; lists are read-only.\x1b[0m");
            eprintln!("   Run '\x1b[1mtasklists config set token <TOKEN>\x1b[0m' to sign in.");
        }
        Arc::new(remote::HostedStore::connect(&config.remote)?)
    };

    let mut engine = SyncEngine::new(store, Box::new(prefs));
    engine.start().await?;

    if let Some(token) = accept {
        match engine.accept_invite(&token).await {
            Ok(list_id) => tracing::info!("Joined list {}", list_id),
            Err(e) => eprintln!("Error: {}", e),
        }
    }

    repl::Repl::new(engine).run().await
}

fn handle_config_command(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Set { key, value } => {
            let mut config = config::Config::load().unwrap_or_default();
            config.set(&key, value)?;
            config.save()?;
            println!("Configuration saved");
        }
        ConfigAction::Get { key } => {
            let config = config::Config::load()?;
            println!("{}", config.get(&key)?);
        }
        ConfigAction::Show => {
            let config = config::Config::load()?;
            for key in config::KEYS {
                println!("{}: {}", key, config.get(key)?);
            }
        }
        ConfigAction::Path => {
            let path = config::Config::config_path()?;
            println!("{}", path.display());
        }
    }
    Ok(())
}
