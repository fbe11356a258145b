//! vaultsign - keeps a short-lived, Vault-signed SSH certificate fresh
//! before connecting.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use vaultsign_common::{init_tracing, LogFormat};
use vaultsign_config::{Config, ConnectionContext, SignerConfig};
use vaultsign_signer::ssh::private_key_for;
use vaultsign_signer::{
    CertifiedTransport, ConnectError, ConnectionSession, LifecycleManager, SshTarget, SshTransport,
    SystemRunner,
};

/// Exit code for lifecycle failures, matching ssh's own connection failure code
const EXIT_LIFECYCLE_FAILURE: u8 = 255;

/// vaultsign - short-lived SSH certificates from Vault
#[derive(Parser, Debug)]
#[command(name = "vaultsign")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "VAULTSIGN_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Log output format (pretty or json)
    #[arg(long = "log-format", default_value = "pretty", global = true)]
    log_format: LogFormat,

    /// Renew even if the certificate is still fresh
    #[arg(long = "force-refresh", global = true)]
    force_refresh: bool,

    /// Minimum remaining validity in seconds before renewal
    #[arg(long = "min-ttl", global = true)]
    min_ttl: Option<i64>,

    /// Vault SSH signing path
    #[arg(long = "sign-path", global = true)]
    sign_path: Option<String>,

    /// Comma-separated principals to request
    #[arg(long = "principals", global = true)]
    principals: Option<String>,

    /// Public key to be signed
    #[arg(long = "public-key", global = true)]
    public_key: Option<String>,

    /// Where the signed certificate is stored
    #[arg(long = "signed-key", global = true)]
    signed_key: Option<String>,

    /// Remote user, used as the default principal
    #[arg(short = 'u', long = "user", global = true)]
    user: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Make sure a fresh certificate is in place
    Ensure,
    /// Show the current certificate and renewal decision
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Ensure a fresh certificate, then run ssh with it
    Ssh {
        /// Port to connect to
        #[arg(short = 'p', long = "port")]
        port: Option<u16>,

        /// Destination host
        host: String,

        /// Remote command and extra ssh arguments
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Print the effective configuration
    Config,
}

impl Cli {
    fn overrides(&self) -> SignerConfig {
        SignerConfig {
            sign_path: self.sign_path.clone(),
            public_key_path: self.public_key.clone(),
            signed_key_path: self.signed_key.clone(),
            valid_principals: self.principals.clone(),
            min_ttl_seconds: self.min_ttl,
            force_refresh: self.force_refresh.then_some(true),
            ..Default::default()
        }
    }

    fn host(&self) -> Option<String> {
        match &self.command {
            Commands::Ssh { host, .. } => Some(host.clone()),
            _ => None,
        }
    }
}

/// How `main` should exit
enum Exit {
    Success,
    Lifecycle,
    Code(u8),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(cli.verbose, cli.log_format) {
        eprintln!("vaultsign: {e}");
    }

    match run(cli) {
        Ok(Exit::Success) => ExitCode::SUCCESS,
        Ok(Exit::Lifecycle) => ExitCode::from(EXIT_LIFECYCLE_FAILURE),
        Ok(Exit::Code(code)) => ExitCode::from(code),
        Err(e) => {
            eprintln!("vaultsign: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<Exit> {
    let mut config =
        Config::load_with_env(cli.config.as_deref()).context("Failed to load configuration")?;
    config.signer.merge(cli.overrides());

    let warnings = config
        .validate()
        .into_result()
        .context("Configuration validation failed")?;
    for warning in &warnings {
        warn!("{}", warning.message);
    }

    let ctx = ConnectionContext::new(cli.host(), cli.user.clone());
    let settings = config
        .resolve(&ctx)
        .context("Failed to resolve signer settings")?;

    match cli.command {
        Commands::Config => {
            let json = serde_json::to_string_pretty(&settings)
                .context("Failed to serialize settings")?;
            println!("{json}");
            Ok(Exit::Success)
        }
        Commands::Status { json } => {
            let manager = LifecycleManager::new(settings, Arc::new(SystemRunner));
            print_status(&manager, json)?;
            Ok(Exit::Success)
        }
        Commands::Ensure => {
            let manager = LifecycleManager::new(settings, Arc::new(SystemRunner));
            let mut session = ConnectionSession::new();
            match manager.ensure_certificate(&mut session) {
                Ok(outcome) => {
                    info!(
                        renewed = outcome.renewed,
                        reason = %outcome.decision.reason,
                        remaining_secs = ?outcome.remaining_ttl_seconds,
                        "SSH certificate ready"
                    );
                    Ok(Exit::Success)
                }
                Err(e) => {
                    eprintln!("vaultsign: {e}");
                    Ok(Exit::Lifecycle)
                }
            }
        }
        Commands::Ssh { port, host, args } => {
            let certificate = settings
                .signed_key_path
                .clone()
                .context("No signed key path configured")?;
            let identity = settings.public_key_path.as_deref().and_then(private_key_for);

            let mut ssh = SshTransport::new(
                SshTarget {
                    host,
                    user: cli.user,
                    port,
                    command: args,
                },
                certificate,
            );
            if let Some(identity) = identity {
                ssh = ssh.identity(identity);
            }

            let manager = Arc::new(LifecycleManager::new(settings, Arc::new(SystemRunner)));
            let mut transport = CertifiedTransport::new(manager, ssh);
            match transport.connect() {
                Ok(status) => Ok(status
                    .code()
                    .and_then(|c| u8::try_from(c).ok())
                    .map_or(Exit::Lifecycle, Exit::Code)),
                Err(ConnectError::Certificate(e)) => {
                    eprintln!("vaultsign: {e}");
                    Ok(Exit::Lifecycle)
                }
                Err(ConnectError::Transport(e)) => Err(e).context("Failed to launch ssh"),
            }
        }
    }
}

fn print_status(manager: &LifecycleManager, json: bool) -> Result<()> {
    let (record, decision) = manager.evaluate();
    let settings = manager.settings();

    if json {
        let value = serde_json::json!({
            "certificate": record,
            "decision": decision,
            "min_ttl_seconds": settings.min_ttl_seconds,
            "sign_path": settings.sign_path,
        });
        let text = serde_json::to_string_pretty(&value).context("Failed to serialize status")?;
        println!("{text}");
        return Ok(());
    }

    match &record {
        Some(record) => {
            println!("certificate: {}", record.file_path.display());
            println!("status:      {}", record.status.as_str());
            if let Some(expires_at) = record.expires_at {
                println!("expires:     {}", expires_at.to_rfc3339());
            }
            if let Some(ttl) = record.remaining_ttl_seconds {
                println!("remaining:   {}", format_ttl(ttl));
            }
        }
        None => println!("certificate: (no signed key path configured)"),
    }
    println!("sign path:   {}", settings.sign_path);
    println!(
        "decision:    {} ({})",
        if decision.needs_renewal() { "renew" } else { "skip" },
        decision.reason
    );
    Ok(())
}

fn format_ttl(seconds: i64) -> String {
    if seconds < 0 {
        return format!("expired {} ago", format_ttl(-seconds));
    }
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {secs}s")
    } else {
        format!("{secs}s")
    }
}
