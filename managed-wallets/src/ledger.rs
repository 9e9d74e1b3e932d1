//! The remote wallet service the pool is built on.
//!
//! Everything the pool knows about wallets comes through [`Ledger`] and
//! [`Wallet`]. Their methods return `anyhow::Result`, the pool wraps
//! failures into [`Error::Remote`] with the operation and wallet attached.

pub mod rest;

use crate::error::Error;
use crate::unspent::{ChainCode, Unspent};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bitcoin::{Amount, FeeRate, Transaction};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

/// Page size used when walking paginated listings.
pub const PAGE_LIMIT: usize = 500;

#[async_trait]
pub trait Ledger: Send + Sync + 'static {
    type Wallet: Wallet;

    /// Height of the current chain tip.
    async fn chain_head(&self) -> Result<u32>;
    async fn list_wallets(&self, prev_id: Option<String>, limit: usize) -> Result<WalletPage>;
    async fn get_wallet(&self, id: &str) -> Result<Self::Wallet>;
    async fn generate_wallet(&self, label: &str, passphrase: &str) -> Result<Self::Wallet>;
    async fn rename_wallet(&self, id: &str, label: &str) -> Result<()>;
    async fn remove_wallet(&self, id: &str) -> Result<()>;
}

/// Handle to a single wallet.
///
/// Balances are a snapshot taken when the handle was fetched.
#[async_trait]
pub trait Wallet: Debug + Send + Sync + 'static {
    fn id(&self) -> &str;
    fn label(&self) -> &str;
    fn balance(&self) -> Amount;
    fn spendable_balance(&self) -> Amount;
    fn receive_address(&self) -> &str;

    async fn create_address(&self, chain: ChainCode) -> Result<WalletAddress>;
    async fn unspents(&self, prev_id: Option<String>, limit: usize) -> Result<UnspentPage>;
    async fn addresses(&self, limit: usize) -> Result<Vec<WalletAddress>>;
    async fn send_many(&self, request: SendMany) -> Result<SendResult>;
    async fn sweep(&self, request: Sweep) -> Result<SendResult>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletSummary {
    pub id: String,
    pub label: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletPage {
    pub wallets: Vec<WalletSummary>,
    #[serde(default)]
    pub next_batch_prev_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnspentPage {
    pub unspents: Vec<Unspent>,
    #[serde(default)]
    pub next_batch_prev_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletAddress {
    pub address: String,
    pub chain: ChainCode,
    #[serde(default)]
    pub index: u32,
    /// Reported by address listings, absent on freshly created addresses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance: Option<AddressBalance>,
}

impl WalletAddress {
    /// Whether the ledger reports that this address never received funds.
    ///
    /// Addresses without a reported balance are assumed used.
    pub fn is_unused(&self) -> bool {
        self.balance
            .is_some_and(|balance| balance.total_received == Amount::ZERO)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressBalance {
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub total_received: Amount,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub address: String,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub amount: Amount,
}

impl Recipient {
    pub fn new(address: impl Into<String>, amount: Amount) -> Self {
        Self {
            address: address.into(),
            amount,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMany {
    pub recipients: Vec<Recipient>,
    /// Inputs to spend, the ledger selects them when `None`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unspents: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_address: Option<String>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_fee_rate"
    )]
    pub fee_rate: Option<FeeRate>,
    pub wallet_passphrase: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Sweep {
    pub address: String,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_fee_rate"
    )]
    pub fee_rate: Option<FeeRate>,
    pub wallet_passphrase: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResult {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub txid: String,
    /// Hex encoded transaction, if the ledger returned it.
    #[serde(default)]
    pub tx: Option<String>,
}

impl SendResult {
    pub fn transaction(&self) -> Result<Transaction> {
        let hex = self
            .tx
            .as_deref()
            .with_context(|| format!("ledger did not return the transaction {}", self.txid))?;
        let bytes = hex::decode(hex).context("transaction is not valid hex")?;

        bitcoin::consensus::deserialize(&bytes).context("failed to decode transaction")
    }
}

/// The ledger expresses fee rates in satoshi per 1000 virtual bytes.
fn serialize_fee_rate<S>(fee_rate: &Option<FeeRate>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match fee_rate {
        Some(fee_rate) => serializer.serialize_some(&(fee_rate.to_sat_per_kwu() * 4)),
        None => serializer.serialize_none(),
    }
}

/// Awaits a ledger call, bounding it by `timeout`.
pub(crate) async fn call<T, F>(
    operation: &'static str,
    subject: &str,
    timeout: Duration,
    future: F,
) -> std::result::Result<T, Error>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) => Err(Error::Remote {
            operation,
            subject: subject.to_owned(),
            source,
        }),
        Err(_) => Err(Error::Timeout {
            operation,
            subject: subject.to_owned(),
            timeout,
        }),
    }
}

/// Pages through every wallet visible to the ledger.
pub(crate) async fn list_all_wallets<L: Ledger + ?Sized>(
    ledger: &L,
    timeout: Duration,
) -> std::result::Result<Vec<WalletSummary>, Error> {
    let mut wallets = Vec::new();
    let mut prev_id = None;

    loop {
        let page = call(
            "listWallets",
            "ledger",
            timeout,
            ledger.list_wallets(prev_id.take(), PAGE_LIMIT),
        )
        .await?;
        wallets.extend(page.wallets);

        match page.next_batch_prev_id {
            Some(next) => prev_id = Some(next),
            None => return Ok(wallets),
        }
    }
}
