use crate::allocator::{self, AnyWallet, Candidate, ScanCounts, Skip, WalletPredicate};
use crate::batch::BatchRunner;
use crate::chain::ChainView;
use crate::config::{wallet_passphrase, Config};
use crate::error::{Error, Result};
use crate::health::{Classification, ResetReasons, TopUp, WalletHealthPolicy, WalletLimits};
use crate::inventory::{Freshness, UnspentInventory};
use crate::ledger::{self, Ledger, Wallet, WalletSummary};
use crate::unspent::{total_value, Unspent};
use bitcoin::Amount;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, trace, warn};

/// A pool member and whether it has been handed out by this pool instance.
#[derive(Debug)]
pub struct ManagedWallet<W> {
    pub(crate) wallet: Arc<W>,
    pub(crate) index: usize,
    pub(crate) used: bool,
}

impl<W: Wallet> ManagedWallet<W> {
    pub fn wallet(&self) -> &Arc<W> {
        &self.wallet
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_used(&self) -> bool {
        self.used
    }
}

/// Health of a single wallet as seen through the cached inventory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthReport {
    pub label: String,
    pub unspents: usize,
    pub total: Amount,
    pub reset: Option<ResetReasons>,
    pub ready: bool,
    pub classification: Classification,
    pub top_ups: Vec<TopUp>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FaucetStatus {
    pub label: String,
    pub balance: Amount,
    pub spendable_balance: Amount,
    pub receive_address: String,
}

/// A fixed-size pool of pre-funded wallets shared by a test suite.
///
/// Not safe for concurrent callers, every operation takes `&mut self`.
#[derive(Debug)]
pub struct ManagedWallets<L: Ledger> {
    pub(crate) ledger: Arc<L>,
    pub(crate) config: Config,
    pub(crate) policy: WalletHealthPolicy,
    pub(crate) chain: ChainView,
    pub(crate) passphrase: String,
    pub(crate) wallet_list: Vec<WalletSummary>,
    pub(crate) faucet: Arc<L::Wallet>,
    pub(crate) members: Vec<ManagedWallet<L::Wallet>>,
    pub(crate) materialized: bool,
    pub(crate) inventory: UnspentInventory,
}

impl<L: Ledger> ManagedWallets<L> {
    /// Connects the pool to `ledger`.
    ///
    /// Reads the chain tip and the wallet list and opens the faucet, pool
    /// members are only resolved on first use.
    #[instrument(level = "debug", skip_all, fields(client = %config.client_id, group = %config.group.name()))]
    pub async fn create(config: Config, ledger: L) -> Result<Self> {
        config.validate()?;
        let policy = WalletHealthPolicy::new(config.group.clone(), config.min_unspent_balance)?;
        let ledger = Arc::new(ledger);
        let timeout = config.call_timeout;

        let tip = ledger::call("chainHead", "ledger", timeout, ledger.chain_head()).await?;
        let chain = ChainView::new(tip, config.env.network());
        let mut wallet_list = ledger::list_all_wallets(ledger.as_ref(), timeout).await?;
        let passphrase = wallet_passphrase();

        let resolution = resolve_label(&wallet_list, &config.faucet_label, None)?;
        let (faucet, opened) = open_wallet(
            ledger.as_ref(),
            &config.faucet_label,
            resolution,
            &passphrase,
            timeout,
        )
        .await?;
        if opened == Opened::Generated {
            warn!(address = %faucet.receive_address(), "Generated a new faucet wallet, it has to be funded before wallets can be reset");
            wallet_list.push(summary_of(&faucet));
        }

        info!(
            tip,
            wallets = wallet_list.len(),
            faucet = %faucet.label(),
            pool_size = config.pool_size,
            "Connected managed wallet pool"
        );

        Ok(Self {
            ledger,
            config,
            policy,
            chain,
            passphrase,
            wallet_list,
            faucet: Arc::new(faucet),
            members: Vec::new(),
            materialized: false,
            inventory: UnspentInventory::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn chain(&self) -> &ChainView {
        &self.chain
    }

    pub fn faucet(&self) -> &Arc<L::Wallet> {
        &self.faucet
    }

    pub fn wallet_limits(&self) -> &WalletLimits {
        self.policy.limits()
    }

    pub fn members(&self) -> &[ManagedWallet<L::Wallet>] {
        &self.members
    }

    /// Re-reads the chain tip, used by readiness checks from now on.
    pub async fn refresh_chain(&mut self) -> Result<u32> {
        let tip = ledger::call(
            "chainHead",
            "ledger",
            self.config.call_timeout,
            self.ledger.chain_head(),
        )
        .await?;
        self.chain = ChainView::new(tip, self.chain.network());

        Ok(tip)
    }

    /// Hands out the first unused, healthy and ready wallet accepted by `predicate`.
    ///
    /// The wallet stays marked as used for the lifetime of this pool.
    #[instrument(level = "debug", skip(self, predicate), fields(client = %self.config.client_id))]
    pub async fn get_next_wallet<P>(&mut self, predicate: &P) -> Result<Arc<L::Wallet>>
    where
        P: WalletPredicate<L::Wallet> + ?Sized,
    {
        self.ensure_pool().await?;

        let Self {
            members,
            inventory,
            policy,
            chain,
            config,
            ..
        } = self;
        let (policy, chain, config) = (&*policy, &*chain, &*config);
        let mut counts = ScanCounts::default();

        for member in members.iter_mut() {
            let skip = if member.used {
                Some(Skip::Used)
            } else {
                let unspents = inventory
                    .get(member.wallet.as_ref(), Freshness::Cached, config.call_timeout)
                    .await?;

                match allocator::screen(unspents, policy, chain) {
                    Some(skip) => Some(skip),
                    None => {
                        let candidate = Candidate {
                            wallet: member.wallet.as_ref(),
                            unspents,
                            chain,
                        };
                        (!predicate.matches(candidate).await).then_some(Skip::Rejected)
                    }
                }
            };

            match skip {
                Some(skip) => {
                    trace!(wallet = %member.wallet.label(), ?skip, "Skipping wallet");
                    counts.record(skip);
                }
                None => {
                    member.used = true;
                    info!(wallet = %member.wallet.label(), "Handing out managed wallet");
                    return Ok(member.wallet.clone());
                }
            }
        }

        warn!(
            used = counts.used,
            needs_reset = counts.needs_reset,
            not_ready = counts.not_ready,
            rejected = counts.rejected,
            "No managed wallet available"
        );

        Err(counts.into_error())
    }

    pub async fn get_any_wallet(&mut self) -> Result<Arc<L::Wallet>> {
        self.get_next_wallet(&AnyWallet).await
    }

    pub async fn get_unspents(&mut self, wallet: &L::Wallet, freshness: Freshness) -> Result<Vec<Unspent>> {
        let unspents = self
            .inventory
            .get(wallet, freshness, self.config.call_timeout)
            .await?;

        Ok(unspents.to_vec())
    }

    pub async fn health_report(&mut self, wallet: &L::Wallet) -> Result<HealthReport> {
        let unspents = self.get_unspents(wallet, Freshness::Cached).await?;

        Ok(HealthReport {
            label: wallet.label().to_owned(),
            unspents: unspents.len(),
            total: total_value(&unspents),
            reset: self.policy.needs_reset(&unspents),
            ready: self.policy.is_ready(&unspents, &self.chain),
            classification: self.policy.classify(&unspents),
            top_ups: self.policy.required_top_ups(&unspents),
        })
    }

    /// Current faucet balances, read from the ledger.
    pub async fn faucet_status(&self) -> Result<FaucetStatus> {
        let faucet = ledger::call(
            "getWallet",
            self.faucet.label(),
            self.config.call_timeout,
            self.ledger.get_wallet(self.faucet.id()),
        )
        .await?;

        Ok(FaucetStatus {
            label: faucet.label().to_owned(),
            balance: faucet.balance(),
            spendable_balance: faucet.spendable_balance(),
            receive_address: faucet.receive_address().to_owned(),
        })
    }

    /// Runs `f` against the pool, then always resets the pool.
    ///
    /// An error from `f` is returned in preference to a reset error.
    pub async fn run_then_reset<F, T>(&mut self, f: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a mut Self) -> BoxFuture<'a, Result<T>>,
    {
        let outcome = f(self).await;
        let reset = self.reset_wallets().await;

        match (outcome, reset) {
            (Err(error), Err(reset_error)) => {
                warn!(error = %reset_error, "Reset after a failed run failed as well");
                Err(error)
            }
            (Err(error), Ok(_)) => Err(error),
            (Ok(_), Err(reset_error)) => Err(reset_error),
            (Ok(value), Ok(_)) => Ok(value),
        }
    }

    /// Resolves every pool label to a wallet, creating or renaming as needed.
    #[instrument(level = "debug", skip(self), fields(pool_size = self.config.pool_size))]
    pub(crate) async fn ensure_pool(&mut self) -> Result<()> {
        if self.materialized {
            return Ok(());
        }

        let plans = (0..self.config.pool_size)
            .map(|index| {
                let label = self.config.label_for_index(index);
                let legacy = Config::legacy_label_for_index(index);
                let resolution = resolve_label(&self.wallet_list, &label, Some(&legacy))?;

                Ok((index, label, resolution))
            })
            .collect::<Result<Vec<_>>>()?;

        let ledger = self.ledger.as_ref();
        let passphrase = self.passphrase.as_str();
        let timeout = self.config.call_timeout;
        let results = BatchRunner::new(self.config.concurrency)
            .run(plans, |(_, label, resolution)| async move {
                open_wallet(ledger, &label, resolution, passphrase, timeout).await
            })
            .await;

        let mut members = Vec::with_capacity(results.len());
        let mut first_error = None;
        for ((index, label, _), result) in results {
            match result {
                Ok((wallet, opened)) => {
                    match opened {
                        Opened::Existing => {}
                        Opened::Renamed => {
                            if let Some(entry) = self
                                .wallet_list
                                .iter_mut()
                                .find(|entry| entry.id == wallet.id())
                            {
                                entry.label = label;
                            }
                        }
                        Opened::Generated => {
                            self.inventory.insert(wallet.id(), Vec::new());
                            self.wallet_list.push(summary_of(&wallet));
                        }
                    }
                    members.push(ManagedWallet {
                        wallet: Arc::new(wallet),
                        index,
                        used: false,
                    });
                }
                Err(error) => {
                    warn!(%label, %error, "Failed to open pool wallet");
                    first_error.get_or_insert(error);
                }
            }
        }

        if let Some(error) = first_error {
            return Err(error);
        }

        debug!(members = members.len(), "Materialized wallet pool");
        self.members = members;
        self.materialized = true;

        Ok(())
    }
}

/// How a label maps onto the existing wallets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Resolution {
    Existing(String),
    Rename { id: String, from: String },
    Create,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Opened {
    Existing,
    Renamed,
    Generated,
}

pub(crate) fn resolve_label(
    wallets: &[WalletSummary],
    label: &str,
    legacy: Option<&str>,
) -> Result<Resolution> {
    let unique = |label: &str| -> Result<Option<String>> {
        let matching = wallets
            .iter()
            .filter(|wallet| wallet.label == label)
            .collect::<Vec<_>>();

        match matching.as_slice() {
            [] => Ok(None),
            [wallet] => Ok(Some(wallet.id.clone())),
            _ => Err(Error::DuplicateLabel {
                label: label.to_owned(),
                count: matching.len(),
            }),
        }
    };

    if let Some(id) = unique(label)? {
        return Ok(Resolution::Existing(id));
    }

    if let Some(legacy) = legacy {
        if let Some(id) = unique(legacy)? {
            return Ok(Resolution::Rename {
                id,
                from: legacy.to_owned(),
            });
        }
    }

    Ok(Resolution::Create)
}

pub(crate) async fn open_wallet<L: Ledger>(
    ledger: &L,
    label: &str,
    resolution: Resolution,
    passphrase: &str,
    timeout: Duration,
) -> Result<(L::Wallet, Opened)> {
    match resolution {
        Resolution::Existing(id) => {
            let wallet = ledger::call("getWallet", label, timeout, ledger.get_wallet(&id)).await?;
            Ok((wallet, Opened::Existing))
        }
        Resolution::Rename { id, from } => {
            info!(%from, to = %label, "Renaming legacy wallet");
            ledger::call("renameWallet", label, timeout, ledger.rename_wallet(&id, label)).await?;

            let wallet = ledger::call("getWallet", label, timeout, ledger.get_wallet(&id)).await?;
            if wallet.label() != label {
                return Err(Error::LabelMismatch {
                    id,
                    expected: label.to_owned(),
                    found: wallet.label().to_owned(),
                });
            }

            Ok((wallet, Opened::Renamed))
        }
        Resolution::Create => {
            info!(%label, "Generating wallet");
            let wallet = ledger::call(
                "generateWallet",
                label,
                timeout,
                ledger.generate_wallet(label, passphrase),
            )
            .await?;

            Ok((wallet, Opened::Generated))
        }
    }
}

fn summary_of<W: Wallet>(wallet: &W) -> WalletSummary {
    WalletSummary {
        id: wallet.id().to_owned(),
        label: wallet.label().to_owned(),
    }
}
