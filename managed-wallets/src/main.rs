use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};
use managed_wallets::ledger::rest::RestLedger;
use managed_wallets::trace::init_tracing;
use managed_wallets::{Config, Environment, GroupConfig, ManagedWallets};
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;
use url::Url;

#[derive(Parser)]
#[command(name = "managed-wallets")]
#[command(about = "Maintenance for the pool of managed test wallets")]
#[command(version)]
#[command(group(ArgGroup::new("action").required(true).args(["cleanup", "reset"])))]
struct Args {
    #[arg(long, default_value = "test")]
    #[arg(help = "Environment the wallets live in (test or dev)")]
    env: Environment,

    #[arg(long = "pool-size", alias = "poolSize")]
    #[arg(help = "Number of wallets in the pool, overrides MANAGED_WALLETS_POOL_SIZE")]
    pool_size: Option<usize>,

    #[arg(long)]
    #[arg(help = "Wallet group: pure-p2sh, pure-p2sh-p2wsh, pure-p2wsh or mixed")]
    group: String,

    #[arg(long)]
    #[arg(help = "Sweep and remove wallets outside the pool")]
    cleanup: bool,

    #[arg(long)]
    #[arg(help = "Reset every pool wallet")]
    reset: bool,

    #[arg(long, default_value = "managed-wallets")]
    #[arg(help = "Name of the suite owning the pool, used in logs")]
    client_id: String,

    #[arg(long, env = "MANAGED_WALLETS_ACCESS_TOKEN", hide_env_values = true)]
    #[arg(help = "Access token for the ledger API")]
    access_token: String,

    #[arg(long)]
    #[arg(help = "Ledger API base url, defaults to the environment's url")]
    base_url: Option<Url>,

    #[arg(short, long)]
    #[arg(help = "Enable verbose logging")]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let level = if args.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    if let Err(e) = init_tracing(level) {
        eprintln!("{:#}", e);
    }

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let group = GroupConfig::preset(&args.group)?;

    let mut config = Config::new(args.env, args.client_id, group).with_env_overrides()?;
    if let Some(pool_size) = args.pool_size {
        config.pool_size = pool_size;
    }

    let base_url = match args.base_url {
        Some(url) => url,
        None => args.env.base_url()?,
    };
    let ledger = RestLedger::new(base_url, args.env.coin(), args.access_token)?;

    let mut pool = ManagedWallets::create(config, ledger)
        .await
        .context("Failed to open managed wallet pool")?;

    let faucet = pool.faucet_status().await?;
    info!(
        faucet = %faucet.label,
        balance = %faucet.balance,
        spendable = %faucet.spendable_balance,
        address = %faucet.receive_address,
        "Faucet status"
    );

    if args.cleanup {
        let summary = pool.cleanup().await?;
        info!(
            swept = summary.swept.len(),
            removed = summary.removed.len(),
            "Cleanup finished"
        );
    } else {
        let summary = pool.reset_wallets().await?;
        info!(
            healthy = summary.healthy,
            self_reset = summary.self_reset,
            swept = summary.swept,
            funded = summary.funded_recipients,
            "Reset finished"
        );
    }

    Ok(())
}
