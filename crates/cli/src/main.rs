mod relay;

use std::path::PathBuf;

use {
    anyhow::{Context, Result},
    clap::{Parser, Subcommand},
    tokio::sync::broadcast,
    tracing::{info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
    zalo_accounts::{AccountManager, LoginProgress, StatusChange},
    zalo_config::RelayConfig,
};

#[derive(Parser)]
#[command(name = "zalo-relay", version, about = "Multi-account Zalo relay")]
struct Cli {
    /// Path to zalo-relay.toml.
    #[arg(short, long, global = true, env = "ZALO_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Restore saved accounts and relay their events until Ctrl-C.
    Serve,
    /// Restore saved accounts, log in a new one by QR code, then keep serving.
    Login {
        /// Route this account through a specific proxy.
        #[arg(long)]
        proxy: Option<String>,
        /// Where to write the QR code PNG.
        #[arg(long, default_value = "qr.png")]
        qr_out: PathBuf,
    },
    /// Manage the proxy list.
    Proxies {
        #[command(subcommand)]
        action: ProxyAction,
    },
    /// List accounts with saved credentials.
    Accounts,
}

#[derive(Subcommand)]
enum ProxyAction {
    List,
    Add { url: String },
    Remove { url: String },
}

fn init_logging(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let registry = tracing_subscriber::registry().with(filter);
    if cli.json_logs {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_logging(&cli);

    let config = zalo_config::load_config(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(&config).await,
        Commands::Login { proxy, qr_out } => login(&config, proxy, qr_out).await,
        Commands::Proxies { action } => proxies(&config, action),
        Commands::Accounts => {
            for own_id in relay::known_accounts(&config).await? {
                println!("{own_id}");
            }
            Ok(())
        },
    }
}

async fn serve(config: &RelayConfig) -> Result<()> {
    let manager = relay::build_manager(config)?;
    relay::restore(&manager).await?;
    run_until_ctrl_c(&manager).await
}

async fn login(config: &RelayConfig, proxy: Option<String>, qr_out: PathBuf) -> Result<()> {
    let manager = relay::build_manager(config)?;
    relay::restore(&manager).await?;
    let mut ticket = manager.login_account(proxy, None);

    let summary = match ticket.progress().await? {
        LoginProgress::Challenge(challenge) => {
            relay::write_qr(&qr_out, &challenge)?;
            info!(path = %qr_out.display(), "QR code written, scan it with the Zalo app");
            ticket.outcome().await?
        },
        LoginProgress::Completed(summary) => summary,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    run_until_ctrl_c(&manager).await
}

fn proxies(config: &RelayConfig, action: ProxyAction) -> Result<()> {
    let pool = relay::open_proxy_pool(config)?;
    match action {
        ProxyAction::List => {
            for entry in pool.list_proxies() {
                println!("{}", entry.url);
            }
        },
        ProxyAction::Add { url } => {
            let entry = pool
                .add_proxy(&url)
                .with_context(|| format!("Failed to add proxy {url}"))?;
            println!("added {}", entry.url);
        },
        ProxyAction::Remove { url } => {
            let entry = pool
                .remove_proxy(&url)
                .with_context(|| format!("Failed to remove proxy {url}"))?;
            println!("removed {}", entry.url);
        },
    }
    Ok(())
}

async fn run_until_ctrl_c(manager: &AccountManager) -> Result<()> {
    let mut changes = manager.subscribe_status();
    let watcher = tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(StatusChange { own_id, from, to }) => {
                    info!(own_id = %own_id, %from, %to, "account status changed");
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "status watcher lagged");
                },
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("shutting down");
    manager.shutdown().await;
    watcher.abort();
    Ok(())
}
