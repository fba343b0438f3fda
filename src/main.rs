//! sigline: keeps a terminal chat client in sync with the signal-cli daemon.

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, bail, eyre};
use sigline::daemon::{self, config::DaemonConfig};
use sigline::state::{ConversationState, history, transcript};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sigline", version, about)]
struct Cli {
    /// Config file (defaults to ~/.config/sigline/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Append logs to this file instead of stderr.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the signal-cli daemon and stay in sync with it.
    Run,

    /// Print saved conversation history.
    History {
        /// Only this conversation (phone number or group id).
        #[arg(long)]
        contact: Option<String>,

        /// Messages to show per conversation.
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Print where the config file is looked up.
    ConfigPath,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => daemon::config::default_path()
            .ok_or_else(|| eyre!("no config directory on this platform; pass --config"))?,
    };

    match cli.command {
        Command::ConfigPath => {
            println!("{}", config_path.display());
            Ok(())
        }
        Command::Run => {
            let config = DaemonConfig::load(&config_path)?;
            init_logging(cli.log_file.as_deref().or(config.log_file.as_deref()))?;
            daemon::run(config).await
        }
        Command::History { contact, limit } => {
            let config = DaemonConfig::load(&config_path)?;
            init_logging(cli.log_file.as_deref().or(config.log_file.as_deref()))?;
            cmd_history(&config, contact.as_deref(), limit)
        }
    }
}

/// Logs go to stderr, or without colours to `log_file`. The filter comes
/// from `SIGLINE_LOG`, then `RUST_LOG`, then defaults to `info`.
fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_env("SIGLINE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match log_file {
        Some(path) => {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)
                    .wrap_err_with(|| format!("failed to create {}", dir.display()))?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .wrap_err_with(|| format!("failed to open log file {}", path.display()))?;
            builder
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

fn cmd_history(config: &DaemonConfig, contact: Option<&str>, limit: usize) -> Result<()> {
    let Some(path) = &config.history_file else {
        bail!("history_file is not set in the config");
    };
    let Some(doc) = history::read(path)
        .wrap_err_with(|| format!("failed to read history from {}", path.display()))?
    else {
        println!("No history at {}.", path.display());
        return Ok(());
    };

    let mut state = ConversationState::new(
        &config.username,
        config.typing_ttl(),
        config.notify_on_reactions,
    );
    state.restore(doc);
    let lines = transcript::render(&state, contact, limit);
    if lines.is_empty() {
        match contact {
            Some(contact) => println!("No messages with {contact}."),
            None => println!("No messages."),
        }
    }
    for line in lines {
        println!("{line}");
    }
    Ok(())
}
