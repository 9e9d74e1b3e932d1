use anyhow::{anyhow, Result};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::FmtSubscriber;

pub fn init_tracing(level: LevelFilter) -> Result<()> {
    if level == LevelFilter::OFF {
        return Ok(());
    }

    let is_terminal = atty::is(atty::Stream::Stderr);

    // Upstream crates log through `log`, only their warnings are of interest
    let builder = FmtSubscriber::builder()
        .with_env_filter(format!("warn,managed_wallets={}", level))
        .with_writer(std::io::stderr)
        .with_ansi(is_terminal)
        .with_target(false);

    let initialized = if !is_terminal {
        builder.without_time().try_init()
    } else {
        builder.try_init()
    };
    initialized.map_err(|e| anyhow!("Failed to initialize tracing: {}", e))?;

    tracing::info!(%level, "Initialized tracing");

    Ok(())
}
