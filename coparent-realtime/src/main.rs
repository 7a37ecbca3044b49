#![cfg_attr(not(test), forbid(unsafe_code))]

//! `coparent` command line: run a realtime hub or install its database triggers.

use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use realtime::{
    PgNotifyTransport, PgUnreadCountStore, RealtimeHub,
    consumers::attach_log_consumers,
    db::{bootstrap, create_database_pool},
    tracer::initialize_tracing,
};
use shared::config::{Config, ConfigOverrides};
use tracing::{info, warn};
use uuid::Uuid;

/// Command line for the realtime hub.
#[derive(Debug, Parser)]
#[command(name = "coparent")]
#[command(about = "Realtime unread-count hub for the coparent platform", long_about = None)]
pub struct Cli {
    /// Path to the configuration file (TOML, YAML or JSON).
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Overrides `database.url`.
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Overrides `logging.level`.
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run a hub for one user and log everything it dispatches until Ctrl-C.
    Watch {
        /// Viewing user.
        #[arg(long)]
        user: Uuid,
    },
    /// Install the `pg_notify` triggers the hub listens to.
    InstallTriggers,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            database_url: self.database_url.clone(),
            log_level: self.log_level.clone(),
        }
    }
}

async fn watch(config: &Config, user: Uuid) -> anyhow::Result<()> {
    let pool = create_database_pool(&config.database)
        .await
        .context("failed to connect to the database")?;

    let store = Arc::new(PgUnreadCountStore::new(pool.clone()));
    let transport = Arc::new(PgNotifyTransport::new(pool, &config.realtime));
    let hub = RealtimeHub::new(user, &config.realtime, store, transport);

    let consumers = attach_log_consumers(&hub);
    hub.start().await.context("failed to start realtime hub")?;
    info!(user = %user, consumers = consumers.len(), "watching; press Ctrl-C to stop");

    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for Ctrl-C; stopping");
    }

    for consumer in &consumers {
        consumer.dispose();
    }
    hub.stop();
    Ok(())
}

async fn install_triggers(config: &Config) -> anyhow::Result<()> {
    let pool = create_database_pool(&config.database)
        .await
        .context("failed to connect to the database")?;
    bootstrap::install_notify_triggers(&pool).await?;
    Ok(())
}

/// Parses the command line, resolves configuration and runs the command.
///
/// # Errors
/// Returns an error if configuration is invalid or the command fails.
pub async fn run_app() -> anyhow::Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    let config = Config::load_config(cli.config.clone(), &cli.overrides())?;
    let level = initialize_tracing(&config.logging);
    info!(profile = ?config.profile, level = %level, "configuration loaded");

    match cli.command {
        Commands::Watch { user } => watch(&config, user).await,
        Commands::InstallTriggers => install_triggers(&config).await,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    run_app().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_requires_user() {
        assert!(Cli::try_parse_from(["coparent", "watch"]).is_err());
    }

    #[test]
    fn watch_parses_user_and_global_flags() {
        let user = Uuid::new_v4();
        let cli = Cli::try_parse_from([
            "coparent",
            "watch",
            "--user",
            &user.to_string(),
            "--config",
            "hub.toml",
            "--log-level",
            "trace",
        ])
        .unwrap();

        assert!(matches!(cli.command, Commands::Watch { user: parsed } if parsed == user));
        assert_eq!(cli.config, Some(PathBuf::from("hub.toml")));
        assert_eq!(
            cli.overrides(),
            ConfigOverrides {
                database_url: None,
                log_level: Some("trace".into()),
            }
        );
    }

    #[test]
    fn install_triggers_parses() {
        let cli = Cli::try_parse_from([
            "coparent",
            "--database-url",
            "postgres://localhost/test",
            "install-triggers",
        ])
        .unwrap();

        assert!(matches!(cli.command, Commands::InstallTriggers));
        assert_eq!(
            cli.overrides().database_url.as_deref(),
            Some("postgres://localhost/test")
        );
    }
}
