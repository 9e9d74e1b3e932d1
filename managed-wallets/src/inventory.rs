use crate::error::Result;
use crate::ledger::{self, Wallet, WalletAddress, PAGE_LIMIT};
use crate::unspent::{ChainCode, Unspent};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, instrument};

/// Whether a cached inventory may be used.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Freshness {
    Cached,
    ForceRefresh,
}

/// Per-wallet cache of unspents and known addresses.
///
/// Entries are replaced wholesale, never merged.
#[derive(Debug, Default)]
pub struct UnspentInventory {
    unspents: HashMap<String, Vec<Unspent>>,
    addresses: HashMap<String, Vec<WalletAddress>>,
}

impl UnspentInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached(&self, wallet_id: &str) -> Option<&[Unspent]> {
        self.unspents.get(wallet_id).map(Vec::as_slice)
    }

    pub fn needs_fetch(&self, wallet_id: &str, freshness: Freshness) -> bool {
        freshness == Freshness::ForceRefresh || !self.unspents.contains_key(wallet_id)
    }

    pub fn insert(&mut self, wallet_id: impl Into<String>, unspents: Vec<Unspent>) {
        self.unspents.insert(wallet_id.into(), unspents);
    }

    pub fn invalidate(&mut self, wallet_id: &str) {
        self.unspents.remove(wallet_id);
        self.addresses.remove(wallet_id);
    }

    /// Returns the wallet's unspents, fetching them when required.
    pub async fn get<W>(&mut self, wallet: &W, freshness: Freshness, timeout: Duration) -> Result<&[Unspent]>
    where
        W: Wallet + ?Sized,
    {
        if self.needs_fetch(wallet.id(), freshness) {
            let unspents = fetch_unspents(wallet, timeout).await?;
            self.insert(wallet.id(), unspents);
        }

        Ok(self.cached(wallet.id()).unwrap_or_default())
    }

    pub fn insert_addresses(&mut self, wallet_id: impl Into<String>, addresses: Vec<WalletAddress>) {
        self.addresses.insert(wallet_id.into(), addresses);
    }

    pub fn has_addresses(&self, wallet_id: &str) -> bool {
        self.addresses.contains_key(wallet_id)
    }

    /// Known addresses on `chain` that never received funds and that no
    /// cached unspent pays to.
    pub fn unused_addresses(&self, wallet_id: &str, chain: ChainCode) -> Vec<String> {
        let paid = self
            .cached(wallet_id)
            .unwrap_or_default()
            .iter()
            .map(|unspent| unspent.address.as_str())
            .collect::<HashSet<_>>();

        self.addresses
            .get(wallet_id)
            .into_iter()
            .flatten()
            .filter(|address| address.chain == chain && address.is_unused())
            .filter(|address| !paid.contains(address.address.as_str()))
            .map(|address| address.address.clone())
            .collect()
    }
}

/// Pages through all unspents of a wallet.
#[instrument(level = "debug", skip(wallet, timeout), fields(wallet = %wallet.label()))]
pub async fn fetch_unspents<W>(wallet: &W, timeout: Duration) -> Result<Vec<Unspent>>
where
    W: Wallet + ?Sized,
{
    let mut unspents = Vec::new();
    let mut prev_id = None;

    loop {
        let page = ledger::call(
            "unspents",
            wallet.label(),
            timeout,
            wallet.unspents(prev_id.take(), PAGE_LIMIT),
        )
        .await?;
        unspents.extend(page.unspents);

        match page.next_batch_prev_id {
            Some(next) => prev_id = Some(next),
            None => break,
        }
    }

    debug!(count = unspents.len(), "Fetched unspents");

    Ok(unspents)
}

pub async fn fetch_addresses<W>(wallet: &W, timeout: Duration) -> Result<Vec<WalletAddress>>
where
    W: Wallet + ?Sized,
{
    ledger::call("addresses", wallet.label(), timeout, wallet.addresses(PAGE_LIMIT)).await
}
