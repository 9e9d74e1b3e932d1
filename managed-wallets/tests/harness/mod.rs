use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::{Amount, ScriptBuf, Transaction, TxIn, TxOut};
use managed_wallets::ledger::{
    AddressBalance, Ledger, Recipient, SendMany, SendResult, Sweep, UnspentPage, Wallet,
    WalletAddress, WalletPage, WalletSummary,
};
use managed_wallets::unspent::ChainCode;
use managed_wallets::{ChainCodeGroup, Config, Environment, GroupConfig, ManagedWallets, Unspent};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::util::SubscriberInitExt;

pub const TIP: u32 = 1_000;

/// Flat fee the simulated ledger charges per transaction.
pub const FEE: Amount = Amount::from_sat(1_000);

/// Leftovers at or below this value are added to the fee instead of paid as change.
pub const DUST: Amount = Amount::from_sat(5_000);

pub async fn setup_test<T, F>(testfn: T)
where
    T: FnOnce(TestContext) -> F,
    F: Future<Output = Result<()>>,
{
    let _guard = tracing_subscriber::fmt()
        .with_env_filter("warn,managed_wallets=debug")
        .with_test_writer()
        .set_default();

    let ctx = TestContext {
        ledger: MemoryLedger::new(TIP),
    };

    testfn(ctx).await.unwrap();
}

pub struct TestContext {
    pub ledger: MemoryLedger,
}

impl TestContext {
    pub fn config(&self, group: GroupConfig, pool_size: usize) -> Config {
        Config {
            pool_size,
            call_timeout: Duration::from_secs(5),
            concurrency: 2,
            ..Config::new(Environment::Test, "harness", group)
        }
    }

    pub async fn pool(&self, config: Config) -> Result<ManagedWallets<MemoryLedger>> {
        Ok(ManagedWallets::create(config, self.ledger.clone()).await?)
    }

    pub fn faucet_with(&self, config: &Config, sats: u64) -> String {
        let id = self.ledger.add_wallet(&config.faucet_label);
        self.ledger.deposit(&id, 0, sats, true);
        id
    }

    /// Adds pool wallet `index` holding one unspent per `(chain, sats, confirmed)`.
    pub fn pool_wallet(&self, config: &Config, index: usize, unspents: &[(ChainCode, u64, bool)]) -> String {
        self.wallet_with(&config.label_for_index(index), unspents)
    }

    pub fn wallet_with(&self, label: &str, unspents: &[(ChainCode, u64, bool)]) -> String {
        let id = self.ledger.add_wallet(label);
        for (chain, sats, confirmed) in unspents {
            self.ledger.deposit(&id, *chain, *sats, *confirmed);
        }
        id
    }
}

/// Pool wallets hold at least two p2wsh unspents and nothing else.
pub fn pair_p2wsh() -> GroupConfig {
    GroupConfig::new("pair-p2wsh")
        .with_limits(ChainCodeGroup::P2sh, 0, Some(0))
        .with_limits(ChainCodeGroup::P2shP2wsh, 0, Some(0))
        .with_limits(ChainCodeGroup::P2wsh, 2, None)
}

pub const HEALTHY: &[(ChainCode, u64, bool)] = &[(20, 200_000, true), (20, 200_000, true)];

/// A transaction accepted by the [`MemoryLedger`].
#[derive(Clone, Debug)]
pub struct Submitted {
    pub txid: String,
    pub wallet: String,
    pub kind: &'static str,
    pub inputs: Vec<String>,
    pub recipients: Vec<Recipient>,
    pub change_address: Option<String>,
    pub outputs: usize,
}

#[derive(Clone, Debug)]
struct WalletRecord {
    id: String,
    label: String,
    unspents: Vec<Unspent>,
    addresses: Vec<WalletAddress>,
    receive_address: String,
}

#[derive(Debug, Default)]
struct State {
    tip: u32,
    page_size: usize,
    wallets: Vec<WalletRecord>,
    next_wallet: u64,
    next_tx: u64,
    transactions: Vec<Submitted>,
    renames: Vec<(String, String)>,
    removed: Vec<String>,
    received: HashMap<String, Amount>,
    failing_sends: HashSet<String>,
    slow_unspents: HashMap<String, Duration>,
    extra_change_output: bool,
}

impl State {
    fn wallet(&self, id: &str) -> Result<&WalletRecord> {
        self.wallets
            .iter()
            .find(|wallet| wallet.id == id)
            .with_context(|| format!("unknown wallet {}", id))
    }

    fn wallet_mut(&mut self, id: &str) -> Result<&mut WalletRecord> {
        self.wallets
            .iter_mut()
            .find(|wallet| wallet.id == id)
            .with_context(|| format!("unknown wallet {}", id))
    }

    fn new_address(&mut self, id: &str, chain: ChainCode) -> Result<WalletAddress> {
        let wallet = self.wallet_mut(id)?;
        let index = wallet
            .addresses
            .iter()
            .filter(|address| address.chain == chain)
            .count() as u32;
        let address = WalletAddress {
            address: format!("{}-{}-{}", wallet.id, chain, index),
            chain,
            index,
            balance: None,
        };
        wallet.addresses.push(address.clone());

        Ok(address)
    }

    fn add_wallet(&mut self, label: &str) -> String {
        self.next_wallet += 1;
        let id = format!("w{}", self.next_wallet);
        self.wallets.push(WalletRecord {
            id: id.clone(),
            label: label.to_owned(),
            unspents: Vec::new(),
            addresses: Vec::new(),
            receive_address: String::new(),
        });
        let receive = self
            .new_address(&id, 0)
            .map(|address| address.address)
            .unwrap_or_default();
        if let Ok(wallet) = self.wallet_mut(&id) {
            wallet.receive_address = receive;
        }

        id
    }

    fn credit(&mut self, address: &str, amount: Amount) {
        *self.received.entry(address.to_owned()).or_insert(Amount::ZERO) += amount;
    }

    fn owner_of(&self, address: &str) -> Option<(usize, ChainCode, u32)> {
        self.wallets.iter().enumerate().find_map(|(i, wallet)| {
            wallet
                .addresses
                .iter()
                .find(|known| known.address == address)
                .map(|known| (i, known.chain, known.index))
        })
    }

    fn submit(
        &mut self,
        id: &str,
        kind: &'static str,
        recipients: Vec<Recipient>,
        inputs: Option<Vec<String>>,
        change_address: Option<String>,
    ) -> Result<SendResult> {
        let wallet = self.wallet(id)?.clone();
        if self.failing_sends.contains(&wallet.label) {
            bail!("simulated failure submitting from {}", wallet.label);
        }

        let paid = sum(recipients.iter().map(|recipient| recipient.amount));
        let spent = match inputs {
            Some(ids) => ids
                .iter()
                .map(|input| {
                    wallet
                        .unspents
                        .iter()
                        .find(|unspent| unspent.id == *input)
                        .cloned()
                        .with_context(|| format!("unknown unspent {}", input))
                })
                .collect::<Result<Vec<_>>>()?,
            None => {
                let mut taken = Vec::new();
                for unspent in &wallet.unspents {
                    if sum(taken.iter().map(|u: &Unspent| u.value)) >= paid + FEE {
                        break;
                    }
                    taken.push(unspent.clone());
                }
                taken
            }
        };

        let available = sum(spent.iter().map(|unspent| unspent.value));
        let Some(leftover) = available.checked_sub(paid + FEE) else {
            bail!("insufficient funds: {} available, {} needed", available, paid + FEE);
        };

        let mut outputs = recipients.clone();
        if leftover > DUST || self.extra_change_output {
            let change = change_address
                .clone()
                .unwrap_or_else(|| wallet.receive_address.clone());
            outputs.push(Recipient::new(change, leftover));
        }

        self.next_tx += 1;
        let txid = format!("tx{}", self.next_tx);
        let spent_ids = spent.iter().map(|unspent| unspent.id.clone()).collect::<HashSet<_>>();
        self.wallet_mut(id)?
            .unspents
            .retain(|unspent| !spent_ids.contains(&unspent.id));

        for (vout, output) in outputs.iter().enumerate() {
            if let Some((owner, chain, index)) = self.owner_of(&output.address) {
                self.credit(&output.address, output.amount);
                self.wallets[owner].unspents.push(Unspent {
                    id: format!("{}:{}", txid, vout),
                    address: output.address.clone(),
                    value: output.amount,
                    block_height: None,
                    chain,
                    index,
                });
            }
        }

        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn::default(); spent.len().max(1)],
            output: outputs
                .iter()
                .map(|output| TxOut {
                    value: output.amount,
                    script_pubkey: ScriptBuf::new(),
                })
                .collect(),
        };

        self.transactions.push(Submitted {
            txid: txid.clone(),
            wallet: wallet.label.clone(),
            kind,
            inputs: spent.iter().map(|unspent| unspent.id.clone()).collect(),
            recipients,
            change_address,
            outputs: outputs.len(),
        });

        Ok(SendResult {
            status: "signed".to_owned(),
            txid,
            tx: Some(bitcoin::consensus::encode::serialize_hex(&tx)),
        })
    }
}

fn sum(amounts: impl Iterator<Item = Amount>) -> Amount {
    amounts.fold(Amount::ZERO, |total, amount| total + amount)
}

fn paginate<T: Clone>(items: &[T], key: impl Fn(&T) -> &str, prev_id: Option<String>, limit: usize) -> (Vec<T>, Option<String>) {
    let start = match prev_id {
        Some(prev_id) => items
            .iter()
            .position(|item| key(item) == prev_id)
            .map(|position| position + 1)
            .unwrap_or(items.len()),
        None => 0,
    };
    let page = items.iter().skip(start).take(limit).cloned().collect::<Vec<_>>();
    let next = (start + page.len() < items.len())
        .then(|| page.last().map(|item| key(item).to_owned()))
        .flatten();

    (page, next)
}

/// An in-memory ledger that settles transactions instantly.
///
/// Outputs paying a known address are credited to its wallet as unconfirmed
/// unspents, [`MemoryLedger::mine`] confirms them.
#[derive(Clone, Debug)]
pub struct MemoryLedger {
    state: Arc<Mutex<State>>,
}

impl MemoryLedger {
    pub fn new(tip: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                tip,
                page_size: 2,
                ..State::default()
            })),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn add_wallet(&self, label: &str) -> String {
        self.with_state(|state| state.add_wallet(label))
    }

    pub fn add_address(&self, id: &str, chain: ChainCode) -> String {
        self.with_state(|state| state.new_address(id, chain).unwrap().address)
    }

    /// Pays `sats` to a fresh address of `chain`, mined 10 blocks deep when `confirmed`.
    pub fn deposit(&self, id: &str, chain: ChainCode, sats: u64, confirmed: bool) -> Unspent {
        self.with_state(|state| {
            let address = state.new_address(id, chain).unwrap();
            state.next_tx += 1;
            let unspent = Unspent {
                id: format!("deposit{}:0", state.next_tx),
                address: address.address,
                value: Amount::from_sat(sats),
                block_height: confirmed.then_some(state.tip - 10),
                chain,
                index: address.index,
            };
            state.credit(&unspent.address, unspent.value);
            state.wallet_mut(id).unwrap().unspents.push(unspent.clone());
            unspent
        })
    }

    /// Drops an unspent as if a transaction outside the pool had spent it.
    pub fn spend_elsewhere(&self, id: &str, unspent_id: &str) {
        self.with_state(|state| {
            state
                .wallet_mut(id)
                .unwrap()
                .unspents
                .retain(|unspent| unspent.id != unspent_id)
        })
    }

    pub fn mine(&self, blocks: u32) {
        self.with_state(|state| {
            let height = state.tip + 1;
            for wallet in &mut state.wallets {
                for unspent in &mut wallet.unspents {
                    unspent.block_height.get_or_insert(height);
                }
            }
            state.tip += blocks;
        })
    }

    pub fn transactions(&self) -> Vec<Submitted> {
        self.with_state(|state| state.transactions.clone())
    }

    pub fn renames(&self) -> Vec<(String, String)> {
        self.with_state(|state| state.renames.clone())
    }

    pub fn removed(&self) -> Vec<String> {
        self.with_state(|state| state.removed.clone())
    }

    pub fn labels(&self) -> Vec<String> {
        self.with_state(|state| state.wallets.iter().map(|wallet| wallet.label.clone()).collect())
    }

    pub fn unspents_of(&self, id: &str) -> Vec<Unspent> {
        self.with_state(|state| state.wallet(id).unwrap().unspents.clone())
    }

    pub fn addresses_of(&self, id: &str) -> Vec<WalletAddress> {
        self.with_state(|state| state.wallet(id).unwrap().addresses.clone())
    }

    pub fn receive_address_of(&self, id: &str) -> String {
        self.with_state(|state| state.wallet(id).unwrap().receive_address.clone())
    }

    pub fn fail_sends_from(&self, label: &str) {
        self.with_state(|state| state.failing_sends.insert(label.to_owned()));
    }

    pub fn delay_unspents_of(&self, id: &str, delay: Duration) {
        self.with_state(|state| state.slow_unspents.insert(id.to_owned(), delay));
    }

    /// Makes every following transaction carry a change output.
    pub fn add_change_outputs(&self) {
        self.with_state(|state| state.extra_change_output = true);
    }

    fn handle(&self, id: &str) -> Result<MemoryWallet> {
        self.with_state(|state| {
            let wallet = state.wallet(id)?;
            let balance = sum(wallet.unspents.iter().map(|unspent| unspent.value));

            Ok(MemoryWallet {
                id: wallet.id.clone(),
                label: wallet.label.clone(),
                balance,
                receive_address: wallet.receive_address.clone(),
                ledger: self.clone(),
            })
        })
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    type Wallet = MemoryWallet;

    async fn chain_head(&self) -> Result<u32> {
        Ok(self.with_state(|state| state.tip))
    }

    async fn list_wallets(&self, prev_id: Option<String>, limit: usize) -> Result<WalletPage> {
        Ok(self.with_state(|state| {
            let summaries = state
                .wallets
                .iter()
                .map(|wallet| WalletSummary {
                    id: wallet.id.clone(),
                    label: wallet.label.clone(),
                })
                .collect::<Vec<_>>();
            let (wallets, next_batch_prev_id) =
                paginate(&summaries, |summary| summary.id.as_str(), prev_id, limit.min(state.page_size));

            WalletPage {
                wallets,
                next_batch_prev_id,
            }
        }))
    }

    async fn get_wallet(&self, id: &str) -> Result<MemoryWallet> {
        self.handle(id)
    }

    async fn generate_wallet(&self, label: &str, _passphrase: &str) -> Result<MemoryWallet> {
        let id = self.add_wallet(label);
        self.handle(&id)
    }

    async fn rename_wallet(&self, id: &str, label: &str) -> Result<()> {
        self.with_state(|state| {
            state.wallet_mut(id)?.label = label.to_owned();
            state.renames.push((id.to_owned(), label.to_owned()));
            Ok(())
        })
    }

    async fn remove_wallet(&self, id: &str) -> Result<()> {
        self.with_state(|state| {
            if !state.wallet(id)?.unspents.is_empty() {
                bail!("wallet {} still holds funds", id);
            }
            state.wallets.retain(|wallet| wallet.id != id);
            state.removed.push(id.to_owned());
            Ok(())
        })
    }
}

#[derive(Clone, Debug)]
pub struct MemoryWallet {
    id: String,
    label: String,
    balance: Amount,
    receive_address: String,
    ledger: MemoryLedger,
}

#[async_trait]
impl Wallet for MemoryWallet {
    fn id(&self) -> &str {
        &self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn balance(&self) -> Amount {
        self.balance
    }

    fn spendable_balance(&self) -> Amount {
        self.balance
    }

    fn receive_address(&self) -> &str {
        &self.receive_address
    }

    async fn create_address(&self, chain: ChainCode) -> Result<WalletAddress> {
        self.ledger.with_state(|state| state.new_address(&self.id, chain))
    }

    async fn unspents(&self, prev_id: Option<String>, limit: usize) -> Result<UnspentPage> {
        let delay = self
            .ledger
            .with_state(|state| state.slow_unspents.get(&self.id).copied());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.ledger.with_state(|state| {
            let unspents = state.wallet(&self.id)?.unspents.clone();
            let (unspents, next_batch_prev_id) =
                paginate(&unspents, |unspent| unspent.id.as_str(), prev_id, limit.min(state.page_size));

            Ok(UnspentPage {
                unspents,
                next_batch_prev_id,
            })
        })
    }

    async fn addresses(&self, limit: usize) -> Result<Vec<WalletAddress>> {
        self.ledger.with_state(|state| {
            Ok(state
                .wallet(&self.id)?
                .addresses
                .iter()
                .take(limit)
                .map(|address| WalletAddress {
                    balance: Some(AddressBalance {
                        total_received: state
                            .received
                            .get(&address.address)
                            .copied()
                            .unwrap_or(Amount::ZERO),
                    }),
                    ..address.clone()
                })
                .collect())
        })
    }

    async fn send_many(&self, request: SendMany) -> Result<SendResult> {
        self.ledger.with_state(|state| {
            state.submit(
                &self.id,
                "sendMany",
                request.recipients,
                request.unspents,
                request.change_address,
            )
        })
    }

    async fn sweep(&self, request: Sweep) -> Result<SendResult> {
        self.ledger.with_state(|state| {
            let wallet = state.wallet(&self.id)?;
            let total = sum(wallet.unspents.iter().map(|unspent| unspent.value));
            let inputs = wallet.unspents.iter().map(|unspent| unspent.id.clone()).collect();
            let amount = total
                .checked_sub(FEE)
                .context("wallet cannot cover the sweep fee")?;

            state.submit(
                &self.id,
                "sweep",
                vec![Recipient::new(request.address, amount)],
                Some(inputs),
                None,
            )
        })
    }
}
