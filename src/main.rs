use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;
use url::Url;

use clepho_dbserver::config::ConfigStore;
use clepho_dbserver::db::ConnectionParameters;
use clepho_dbserver::logging;
use clepho_dbserver::server::{ControlConnector, ServerUpdate, Supervisor};

const DEFAULT_URL_BASE: &str = "clepho:/database";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Run,
    Show { json: bool },
    Url { base: Option<String> },
    Migrate { suggested_path: Option<String> },
}

struct CliArgs {
    config_path: Option<PathBuf>,
    command: Command,
}

fn parse_args() -> CliArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = None;
    let mut command = None;
    let mut json = false;
    let mut positional = None;
    let mut suggested_path = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("clepho-dbserver {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--json" => {
                json = true;
            }
            "--suggested-path" => {
                if i + 1 < args.len() {
                    suggested_path = Some(args[i + 1].clone());
                    i += 1;
                } else {
                    eprintln!("Error: --suggested-path requires a path argument");
                    std::process::exit(1);
                }
            }
            "run" | "show" | "url" | "migrate" if command.is_none() => {
                command = Some(args[i].clone());
            }
            other if command.as_deref() == Some("url") && positional.is_none() => {
                positional = Some(other.to_string());
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    let command = match command.as_deref() {
        Some("run") => Command::Run,
        Some("url") => Command::Url { base: positional },
        Some("migrate") => Command::Migrate { suggested_path },
        Some("show") | None => Command::Show { json },
        Some(other) => {
            eprintln!("Unknown command: {}", other);
            std::process::exit(1);
        }
    };

    CliArgs {
        config_path,
        command,
    }
}

fn print_help() {
    println!(
        r#"clepho-dbserver - Internal database server for Clepho

USAGE:
    clepho-dbserver [OPTIONS] [COMMAND]

COMMANDS:
    run                 Start the internal server and keep it running until Ctrl-C
    show                Print the resolved connection parameters (default)
    url [BASE]          Print the connection parameters as a URL
    migrate             Convert legacy album settings into database settings

OPTIONS:
    --config, -c PATH       Path to config file
    --json                  Print parameters as JSON (show)
    --suggested-path PATH   Database folder to use when nothing is configured (migrate)
    --version, -V           Show version
    --help, -h              Show this help message

ENVIRONMENT:
    CLEPHO_CONFIG       Path to config file (overrides default location)
    CLEPHO_LOG          Log level (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/clepho/config.toml"#
    );
}

fn load_store(config_path: Option<&PathBuf>) -> Result<ConfigStore> {
    match config_path {
        Some(path) => ConfigStore::load_from(path),
        None => ConfigStore::load(),
    }
}

fn resolve_parameters(store: &ConfigStore, suggested_path: Option<&str>) -> ConnectionParameters {
    let mut params = ConnectionParameters::load_from_config(store);
    params.legacy_and_default_checks(store, suggested_path);
    params
}

#[cfg(feature = "mysql")]
fn control_connector() -> Result<Box<dyn ControlConnector>> {
    Ok(Box::new(clepho_dbserver::server::MysqlConnector))
}

#[cfg(not(feature = "mysql"))]
fn control_connector() -> Result<Box<dyn ControlConnector>> {
    bail!("clepho-dbserver was built without MySQL support (enable the `mysql` feature)")
}

fn report_updates(receiver: mpsc::Receiver<ServerUpdate>) {
    for update in receiver {
        match update {
            ServerUpdate::Stage(stage) => tracing::info!("{}", stage.display_name()),
            ServerUpdate::Busy { message } => println!("{}", message),
            ServerUpdate::Idle => {}
            ServerUpdate::Alive { seconds } => tracing::debug!("Alive for {} seconds", seconds),
            ServerUpdate::Stopped => println!("Database server stopped"),
        }
    }
}

async fn run_server(params: ConnectionParameters) -> Result<()> {
    if !params.is_mysql() || !params.internal_server {
        bail!("The internal database server is not enabled in the configuration");
    }

    let (tx, rx) = mpsc::channel();
    let reporter = thread::spawn(move || report_updates(rx));

    let supervisor = Supervisor::new(params, control_connector()?).with_updates(tx);

    let mut supervisor = tokio::task::spawn_blocking(move || {
        let mut supervisor = supervisor;
        supervisor.start_server().map(|_| supervisor)
    })
    .await
    .context("Server start task failed")??;

    println!("Database server running at {}", supervisor.endpoint());
    println!("Press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    tracing::info!("Interrupted, stopping database server");

    tokio::task::spawn_blocking(move || {
        let result = supervisor.stop_server();
        drop(supervisor);
        result
    })
    .await
    .context("Server stop task failed")??;

    let _ = reporter.join();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();

    // Initialize logging (uses journald on Linux, file fallback otherwise)
    let _ = logging::init(None);

    let mut store = load_store(args.config_path.as_ref())?;

    match args.command {
        Command::Run => {
            let params = resolve_parameters(&store, None);
            run_server(params).await?;
        }
        Command::Show { json } => {
            let params = resolve_parameters(&store, None);
            if json {
                println!("{}", serde_json::to_string_pretty(&params)?);
            } else {
                println!("{:#?}", params);
            }
            println!("Valid: {}", params.is_valid());
            println!("Fingerprint: {}", params.fingerprint());
        }
        Command::Url { base } => {
            let params = resolve_parameters(&store, None);
            let base = base.as_deref().unwrap_or(DEFAULT_URL_BASE);
            let base = Url::parse(base).with_context(|| format!("Invalid base URL: {}", base))?;
            println!("{}", params.to_url(&base));
        }
        Command::Migrate { suggested_path } => {
            let params = resolve_parameters(&store, suggested_path.as_deref());
            if !params.is_valid() {
                bail!("No database location found to migrate");
            }

            params.save_to_config(&mut store)?;
            if ConnectionParameters::remove_legacy_config(&mut store) {
                tracing::info!("Removed legacy album settings");
            }
            store.save()?;

            match store.path() {
                Some(path) => println!("Database settings written to {}", path.display()),
                None => println!("Database settings migrated"),
            }
        }
    }

    Ok(())
}
