//! wecom-bridge: WeCom secure webhook callback bridge.
//!
//! `serve` runs the callback server with a demo echo pipeline; the other
//! subcommands are offline helpers for signing, encrypting and checking
//! configuration.

mod config;
mod echo;

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use wecom_channels::crypto::CallbackCrypto;
use wecom_channels::dispatcher::WebhookDispatcher;
use wecom_channels::outbound::{DirectPush, WecomOutbound};
use wecom_channels::push::ResponseUrlPush;
use wecom_channels::{server, signature};
use wecom_types::config::{AccountConfig, WecomConfig};
use wecom_types::error::{WecomError, WecomResult};

const ECHO_DELAY: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(name = "wecom-bridge", version, about = "WeCom secure webhook callback bridge")]
struct Cli {
    /// Path to the config file (default: ~/.wecom-bridge/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the webhook callback server.
    Serve {
        /// Override `[server] listen_addr`.
        #[arg(long)]
        listen: Option<String>,
    },
    /// Compute a callback signature.
    Sign {
        #[arg(long)]
        token: String,
        /// Seconds since the epoch (default: now).
        #[arg(long)]
        timestamp: Option<String>,
        #[arg(long)]
        nonce: String,
        /// The `encrypt` field or `echostr`.
        encrypted: String,
    },
    /// Encrypt a payload with an account's key.
    Encrypt {
        #[arg(long)]
        account: String,
        plaintext: String,
    },
    /// Decrypt a payload with an account's key.
    Decrypt {
        #[arg(long)]
        account: String,
        ciphertext: String,
    },
    /// Load and validate the configuration.
    CheckConfig,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let result = match cli.command {
        Commands::Serve { listen } => cmd_serve(cli.config, listen),
        Commands::Sign {
            token,
            timestamp,
            nonce,
            encrypted,
        } => {
            let timestamp =
                timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp().to_string());
            println!("timestamp={timestamp}");
            println!("msg_signature={}", signature::sign(&token, &timestamp, &nonce, &encrypted));
            Ok(())
        }
        Commands::Encrypt { account, plaintext } => {
            account_crypto(cli.config, &account)
                .and_then(|crypto| crypto.encrypt(&plaintext))
                .map(|ciphertext| println!("{ciphertext}"))
        }
        Commands::Decrypt { account, ciphertext } => {
            account_crypto(cli.config, &account)
                .and_then(|crypto| crypto.decrypt(&ciphertext))
                .map(|plaintext| println!("{plaintext}"))
        }
        Commands::CheckConfig => cmd_check_config(cli.config),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn load_valid_config(path: Option<PathBuf>) -> WecomResult<WecomConfig> {
    let config = config::load_config(path.as_deref())?;
    config.validate()?;
    Ok(config)
}

fn find_account<'a>(config: &'a WecomConfig, account_id: &str) -> WecomResult<&'a AccountConfig> {
    config
        .accounts
        .iter()
        .find(|a| a.account_id == account_id)
        .ok_or_else(|| WecomError::UnknownAccount(account_id.to_string()))
}

fn account_crypto(path: Option<PathBuf>, account_id: &str) -> WecomResult<CallbackCrypto> {
    let config = load_valid_config(path)?;
    let account = find_account(&config, account_id)?;
    CallbackCrypto::new(&account.encoding_aes_key, &account.receive_id)
}

fn cmd_check_config(path: Option<PathBuf>) -> WecomResult<()> {
    let config = load_valid_config(path)?;
    println!("listen_addr: {}", config.server.listen_addr);
    println!(
        "stream: ttl={}s sweep={}s max_content={}B",
        config.stream.ttl_secs, config.stream.sweep_interval_secs, config.stream.max_content_bytes
    );
    for account in &config.accounts {
        // Catches keys that pass the length check but do not decode.
        CallbackCrypto::new(&account.encoding_aes_key, &account.receive_id)?;
        println!(
            "account {} -> {}{}",
            account.account_id,
            account.webhook_path,
            if account.enabled { "" } else { " (disabled)" }
        );
    }
    println!("OK");
    Ok(())
}

fn cmd_serve(path: Option<PathBuf>, listen: Option<String>) -> WecomResult<()> {
    let config = load_valid_config(path)?;
    let addr: SocketAddr = listen
        .as_deref()
        .unwrap_or(config.server.listen_addr.as_str())
        .parse()
        .map_err(|e| WecomError::Config(format!("invalid listen address: {e}")))?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let dispatcher = Arc::new(WebhookDispatcher::new(
            config.stream.clone(),
            &config.security,
        ));
        let push = Arc::new(ResponseUrlPush::default());
        let outbound = WecomOutbound::new(
            dispatcher.bridge(),
            Some(push.clone() as Arc<dyn DirectPush>),
        );
        let handler = Arc::new(echo::EchoHandler::new(outbound, push.clone(), ECHO_DELAY));

        let mut registrations = Vec::new();
        for account in config.enabled_accounts() {
            registrations.push(dispatcher.register_target(account, handler.clone(), None)?);
        }
        if registrations.is_empty() {
            warn!("No enabled accounts configured; every callback will be rejected");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweep_interval = Duration::from_secs(config.stream.sweep_interval_secs);
        let maintenance = dispatcher.spawn_maintenance(sweep_interval, shutdown_rx.clone());
        let purger = push.spawn_purger(sweep_interval, shutdown_rx.clone());
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received, shutting down");
            }
            let _ = shutdown_tx.send(true);
        });

        server::serve(addr, Arc::clone(&dispatcher), shutdown_rx).await?;
        let _ = maintenance.await;
        let _ = purger.await;
        for registration in registrations {
            registration.unregister();
        }
        Ok::<(), WecomError>(())
    })
}
