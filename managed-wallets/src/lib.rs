#![warn(
    unused_extern_crates,
    missing_debug_implementations,
    rust_2018_idioms,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::fallible_impl_from,
    clippy::cast_precision_loss,
    clippy::cast_possible_wrap,
    clippy::dbg_macro
)]
#![forbid(unsafe_code)]

//! # managed-wallets
//! A pool of pre-funded test wallets that integration suites borrow from
//! instead of funding fresh wallets on every run.
//!
//! Wallets are handed out once per pool instance by [`ManagedWallets::get_next_wallet`]
//! and brought back into shape by [`ManagedWallets::reset_wallets`], which
//! lets wealthy wallets reset themselves and tops up the rest from a shared
//! faucet wallet.
//!
//! ```no_run
//! use managed_wallets::ledger::rest::RestLedger;
//! use managed_wallets::{Config, Environment, GroupConfig, ManagedWallets};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let env = Environment::Test;
//! let ledger = RestLedger::new(env.base_url()?, env.coin(), "access-token")?;
//! let config = Config::new(env, "walletUnspents", GroupConfig::pure_p2wsh()).with_env_overrides()?;
//!
//! let mut pool = ManagedWallets::create(config, ledger).await?;
//! let wallet = pool.get_any_wallet().await?;
//! // ... spend from `wallet` ...
//! pool.reset_wallets().await?;
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod batch;
pub mod chain;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod health;
pub mod inventory;
pub mod ledger;
pub mod pool;
pub mod replenish;
pub mod trace;
pub mod unspent;

pub use crate::allocator::{AnyWallet, FnPredicate, MoreUnspentsThan, UnspentsConfirmed, WalletPredicate};
pub use crate::config::{Config, Environment};
pub use crate::error::{Error, ErrorKind, ReplenishmentError};
pub use crate::health::{GroupConfig, WalletHealthPolicy, WalletLimits};
pub use crate::inventory::Freshness;
pub use crate::pool::ManagedWallets;
pub use crate::replenish::ReplenishmentSummary;
pub use crate::unspent::{ChainCodeGroup, Unspent};
