//! token-store - maintenance CLI
//!
//! Inspects and maintains a token file using the same configuration as the
//! application that owns it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use token_store::{secrets, StoreConfig, TokenStore};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "token-store")]
#[command(about = "Inspect and maintain an encrypted token file")]
struct Cli {
    /// Token file (overrides TOKEN_FILE_PATH)
    #[arg(short, long)]
    file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List identities with live tokens
    List,
    /// Show token metadata for an identity
    Info { identity: String },
    /// Delete the token for an identity
    Delete { identity: String },
    /// Remove expired tokens
    Purge,
    /// Remove every token
    Clear,
    /// Print a fresh random key for TOKEN_ENCRYPTION_KEY
    GenerateKey,
    /// Sweep expired tokens periodically until interrupted
    Watch {
        /// Seconds between sweeps
        #[arg(long, default_value_t = 60)]
        interval: u64,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "token_store=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = StoreConfig::from_env()?;
    if let Some(file) = cli.file {
        config.file_path = file;
    }
    let open = || {
        info!("Using token file {}", config.file_path.display());
        TokenStore::open(&config)
            .with_context(|| format!("Failed to open {}", config.file_path.display()))
    };

    match cli.command {
        Command::List => {
            for identity in open()?.list_identities() {
                println!("{}", identity);
            }
        }
        Command::Info { identity } => {
            let Some(info) = open()?.get_info(&identity) else {
                bail!("No token stored for {}", identity);
            };
            println!("created_at:   {}", info.created_at.to_rfc3339());
            println!(
                "expires_at:   {}",
                info.expires_at
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string())
            );
            println!("last_used_at: {}", info.last_used_at.to_rfc3339());
            println!("expired:      {}", info.is_expired);
        }
        Command::Delete { identity } => {
            if !open()?.try_delete(&identity)? {
                bail!("No token stored for {}", identity);
            }
            println!("Deleted {}", identity);
        }
        Command::Purge => {
            println!("Purged {} expired token(s)", open()?.purge_expired());
        }
        Command::Clear => {
            open()?.try_clear_all()?;
            println!("Cleared all tokens");
        }
        Command::GenerateKey => {
            println!("{}", hex::encode(secrets::generate_key()));
        }
        Command::Watch { interval } => {
            let store = Arc::new(open()?);
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            let store = runtime.block_on(watch(store, Duration::from_secs(interval)))?;
            store.shutdown();
        }
    }

    Ok(())
}

/// Sweep on a fixed interval until Ctrl-C, then hand the store back for shutdown.
async fn watch(store: Arc<TokenStore>, interval: Duration) -> anyhow::Result<TokenStore> {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
    info!("Watching for expired tokens every {:?}", interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let sweeper = Arc::clone(&store);
                let purged = tokio::task::spawn_blocking(move || sweeper.purge_expired()).await?;
                if purged > 0 {
                    info!("Sweep removed {} token(s)", purged);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    Arc::try_unwrap(store).map_err(|_| anyhow::anyhow!("token store still in use at shutdown"))
}
