//! lxd-client - command line front end for the LXD daemon

use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lxd_client::{Client, ClientConfig, ExecOptions, Named};

#[derive(Parser, Debug)]
#[command(name = "lxd-client")]
#[command(about = "Manage containers on an LXD daemon")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "LXD_CONFIG")]
    config: Option<PathBuf>,

    /// Daemon endpoint (overrides config file), e.g. unix:///var/lib/lxd/unix.socket
    #[arg(long, env = "LXD_ENDPOINT")]
    endpoint: Option<String>,

    /// Skip TLS certificate verification
    #[arg(long, env = "LXD_INSECURE", default_value = "false")]
    insecure: bool,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the server description
    Info,
    /// List containers with their status
    List,
    /// Show one container's record
    Show { name: String },
    Start { name: String },
    Stop { name: String },
    /// Stop (if running) and delete a container
    Delete { name: String },
    /// Run a command in a container and print its output
    Exec {
        name: String,
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// List images
    Images,
    /// List profiles
    Profiles,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("lxd_client={}", cli.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = match &cli.config {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::default(),
    };
    if let Some(endpoint) = &cli.endpoint {
        config.endpoint = endpoint.clone();
    }
    if cli.insecure {
        config.accept_invalid_certs = true;
    }
    debug!(endpoint = %config.endpoint, "Configuration loaded");

    let client = Client::connect(config)?;
    let mut stdout = std::io::stdout();

    match cli.command {
        Command::Info => {
            let info = client.info().await?;
            writeln!(stdout, "{}", serde_json::to_string_pretty(&info)?)?;
        }
        Command::List => {
            for container in client.containers().await? {
                writeln!(
                    stdout,
                    "{:<24} {:<10} {}",
                    container.name(),
                    container.status(),
                    container.ipv4().unwrap_or_default()
                )?;
            }
        }
        Command::Show { name } => {
            let record = client
                .request(lxd_client::LogicalRequest::get(format!("/containers/{}", name)))
                .await?
                .into_value();
            writeln!(stdout, "{}", serde_json::to_string_pretty(&record)?)?;
        }
        Command::Start { name } => {
            client.container(&name).await?.start().await?;
            info!(container = %name, "Started");
        }
        Command::Stop { name } => {
            client.container(&name).await?.stop().await?;
            info!(container = %name, "Stopped");
        }
        Command::Delete { name } => {
            client.container(&name).await?.destroy().await?;
            info!(container = %name, "Deleted");
        }
        Command::Exec { name, command } => {
            let container = client.container(&name).await?;
            let output = container.run(ExecOptions::new(command)).await?;
            stdout.write_all(&output.stdout)?;
            std::io::stderr().write_all(&output.stderr)?;
            let code = output.exit_code.unwrap_or(0);
            if code != 0 {
                std::process::exit(i32::try_from(code).unwrap_or(1));
            }
        }
        Command::Images => {
            for image in client.images().await? {
                let alias = image
                    .aliases()
                    .first()
                    .map(|a| a.name.clone())
                    .unwrap_or_default();
                let short: String = image.fingerprint().chars().take(12).collect();
                writeln!(stdout, "{:<14} {:<24} {}", short, alias, image.size())?;
            }
        }
        Command::Profiles => {
            for profile in client.profiles().await? {
                writeln!(stdout, "{:<24} {}", profile.name(), profile.description())?;
            }
        }
    }

    Ok(())
}
