//! Selection criteria for handing out pool wallets.

use crate::chain::ChainView;
use crate::error::Error;
use crate::health::WalletHealthPolicy;
use crate::ledger::Wallet;
use crate::unspent::Unspent;
use async_trait::async_trait;
use std::fmt;

/// A wallet under consideration together with its cached inventory.
pub struct Candidate<'a, W> {
    pub wallet: &'a W,
    pub unspents: &'a [Unspent],
    pub chain: &'a ChainView,
}

impl<W: fmt::Debug> fmt::Debug for Candidate<'_, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Candidate")
            .field("wallet", &self.wallet)
            .field("unspents", &self.unspents.len())
            .field("tip", &self.chain.tip())
            .finish()
    }
}

/// Caller supplied criterion a wallet must meet to be handed out.
///
/// Only consulted for wallets that are unused, healthy and ready.
#[async_trait]
pub trait WalletPredicate<W: Wallet>: Send + Sync {
    async fn matches(&self, candidate: Candidate<'_, W>) -> bool;
}

/// Accepts every healthy wallet.
#[derive(Clone, Copy, Debug, Default)]
pub struct AnyWallet;

#[async_trait]
impl<W: Wallet> WalletPredicate<W> for AnyWallet {
    async fn matches(&self, _: Candidate<'_, W>) -> bool {
        true
    }
}

/// Accepts wallets holding more than the given number of unspents.
#[derive(Clone, Copy, Debug)]
pub struct MoreUnspentsThan(pub usize);

#[async_trait]
impl<W: Wallet> WalletPredicate<W> for MoreUnspentsThan {
    async fn matches(&self, candidate: Candidate<'_, W>) -> bool {
        candidate.unspents.len() > self.0
    }
}

/// Accepts wallets whose unspents all have at least the given confirmations.
#[derive(Clone, Copy, Debug)]
pub struct UnspentsConfirmed(pub u32);

#[async_trait]
impl<W: Wallet> WalletPredicate<W> for UnspentsConfirmed {
    async fn matches(&self, candidate: Candidate<'_, W>) -> bool {
        candidate
            .unspents
            .iter()
            .all(|unspent| candidate.chain.confirmations(unspent) >= self.0)
    }
}

/// Adapts a synchronous closure into a [`WalletPredicate`].
#[derive(Clone, Copy)]
pub struct FnPredicate<F>(pub F);

impl<F> fmt::Debug for FnPredicate<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnPredicate")
    }
}

#[async_trait]
impl<W, F> WalletPredicate<W> for FnPredicate<F>
where
    W: Wallet,
    F: Fn(&W, &[Unspent]) -> bool + Send + Sync,
{
    async fn matches(&self, candidate: Candidate<'_, W>) -> bool {
        (self.0)(candidate.wallet, candidate.unspents)
    }
}

/// Why a wallet was passed over during a scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Skip {
    Used,
    NeedsReset,
    NotReady,
    Rejected,
}

/// Tally of skipped wallets, reported when no wallet qualifies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScanCounts {
    pub used: usize,
    pub needs_reset: usize,
    pub not_ready: usize,
    pub rejected: usize,
}

impl ScanCounts {
    pub fn record(&mut self, skip: Skip) {
        match skip {
            Skip::Used => self.used += 1,
            Skip::NeedsReset => self.needs_reset += 1,
            Skip::NotReady => self.not_ready += 1,
            Skip::Rejected => self.rejected += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.used + self.needs_reset + self.not_ready + self.rejected
    }

    pub fn into_error(self) -> Error {
        Error::NoWalletAvailable {
            used: self.used,
            needs_reset: self.needs_reset,
            not_ready: self.not_ready,
            rejected: self.rejected,
        }
    }
}

/// Health screening applied before the predicate, in priority order.
pub fn screen(unspents: &[Unspent], policy: &WalletHealthPolicy, chain: &ChainView) -> Option<Skip> {
    if policy.needs_reset(unspents).is_some() {
        return Some(Skip::NeedsReset);
    }
    if !policy.is_ready(unspents, chain) {
        return Some(Skip::NotReady);
    }

    None
}
