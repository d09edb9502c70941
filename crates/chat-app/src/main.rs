use std::path::PathBuf;

use chatline::error::{ServiceSnafu, SettingsSnafu};
use chatline::settings::{SettingsOverrides, SettingsStore};
use chatline::{AppResult, TerminalApp};
use chatline_assistant::create_service;
use chatline_core::Session;
use clap::Parser;
use snafu::ResultExt;
use tokio::io::BufReader;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const VERBOSE_LOG_FILTER: &str = "info,chatline=debug,chatline_core=debug,chatline_assistant=debug";

/// Terminal chat client for a streaming assistant backend
#[derive(Parser, Debug)]
#[command(name = "chatline")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Backend base URL, e.g. http://localhost:8000
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Settings file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Greeting shown at the start of every conversation
    #[arg(long)]
    greeting: Option<String>,

    /// Write the effective settings to the settings file and exit
    #[arg(long)]
    write_config: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool, configured_filter: &str) {
    let filter = if verbose {
        EnvFilter::new(VERBOSE_LOG_FILTER)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(configured_filter))
    };

    // Chat output owns stdout.
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(error) = run(args).await {
        tracing::error!(error = %error, "chatline exited with an error");
        eprintln!("chatline: {error}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> AppResult<()> {
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(SettingsStore::default_config_path);
    let overrides = SettingsOverrides {
        endpoint: args.endpoint.clone(),
        greeting: args.greeting.clone(),
    };
    let store = SettingsStore::open(config_path, &overrides).context(SettingsSnafu {
        stage: "load-settings",
    })?;
    let settings = store.settings();
    init_tracing(args.verbose, &settings.log_filter);
    tracing::debug!(path = ?store.config_path(), ?settings, "settings loaded");

    if args.write_config {
        store
            .update(settings.as_ref().clone())
            .context(SettingsSnafu {
                stage: "write-settings",
            })?;
        println!("settings written to {}", store.config_path().display());
        return Ok(());
    }

    let service = create_service(settings.service_config()).context(ServiceSnafu {
        stage: "create-service",
    })?;
    let (session, events) = Session::new(service, settings.session_config());

    let mut app = TerminalApp::new(session, events, std::io::stdout());
    app.run(BufReader::new(tokio::io::stdin())).await
}
