//! Restores every pool wallet to its configured unspent shape.
//!
//! A run refreshes inventories, lets wallets with enough value reset
//! themselves, sweeps surplus unspents of the others back to the faucet and
//! finally tops them up with a single faucet payment. Per-wallet failures are
//! collected and reported together once the run is over.

use crate::batch::{partition, BatchRunner};
use crate::chain::ChainView;
use crate::error::{Error, Failure, ReplenishmentError, Result};
use crate::health::{Classification, ResetReasons, TopUp};
use crate::inventory::{fetch_addresses, fetch_unspents, Freshness};
use crate::ledger::{self, Ledger, Recipient, SendMany, SendResult, Wallet};
use crate::pool::ManagedWallets;
use crate::unspent::{ChainCode, Unspent};
use bitcoin::{Amount, FeeRate};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// What a successful reset run did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplenishmentSummary {
    pub healthy: usize,
    pub self_reset: usize,
    pub swept: usize,
    pub funded_recipients: usize,
    /// Ids of every submitted transaction, in submission order.
    pub txids: Vec<String>,
}

/// A self-reset transaction ready for submission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelfResetPlan {
    pub recipients: Vec<Recipient>,
    pub change_address: String,
}

impl SelfResetPlan {
    /// Splits off the change output.
    ///
    /// Change goes to `refund_address` when given, otherwise the last
    /// recipient's address becomes the change address.
    pub fn new(wallet: &str, mut recipients: Vec<Recipient>, refund_address: Option<&str>) -> Result<Self> {
        if recipients.len() < 2 {
            return Err(Error::InsufficientRecipients {
                wallet: wallet.to_owned(),
                count: recipients.len(),
            });
        }

        let change_address = match refund_address {
            Some(address) => address.to_owned(),
            None => recipients
                .pop()
                .map(|recipient| recipient.address)
                .ok_or_else(|| Error::InsufficientRecipients {
                    wallet: wallet.to_owned(),
                    count: 0,
                })?,
        };

        Ok(Self {
            recipients,
            change_address,
        })
    }
}

/// Split of faucet recipients into what the faucet can and cannot afford.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FaucetBudget {
    pub funded: Vec<Recipient>,
    pub unfunded: Vec<Recipient>,
    pub total: Amount,
}

/// Accepts recipients in order while their running sum stays within `budget`.
///
/// Stops at the first recipient that does not fit, later recipients are not
/// considered even if they would.
pub fn select_fundable(mut recipients: Vec<Recipient>, budget: Amount) -> FaucetBudget {
    let mut total = Amount::ZERO;
    let mut accepted = 0;

    for recipient in &recipients {
        match total.checked_add(recipient.amount) {
            Some(next) if next <= budget => {
                total = next;
                accepted += 1;
            }
            _ => break,
        }
    }

    let unfunded = recipients.split_off(accepted);

    FaucetBudget {
        funded: recipients,
        unfunded,
        total,
    }
}

/// What the faucet can pay out to `recipients` outputs.
///
/// Reserves the fee of a transaction spending all of `unspents` with a change
/// output, capped by the ledger's spendable balance.
pub fn faucet_allowance(
    chain: &ChainView,
    unspents: &[Unspent],
    spendable: Amount,
    recipients: usize,
    fee_rate: FeeRate,
) -> Amount {
    chain
        .max_spendable(unspents, recipients + 1, fee_rate)
        .min(spendable)
}

/// Where a reset recipient's address comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AddressSlot {
    Known(String),
    Create(ChainCode),
}

/// Lays out one address slot per required unspent, reusing `known`
/// addresses of the matching chain before creating new ones.
pub fn plan_addresses<F>(top_ups: &[TopUp], mut known: F) -> Vec<AddressSlot>
where
    F: FnMut(ChainCode) -> Vec<String>,
{
    let mut slots = Vec::new();

    for top_up in top_ups.iter().filter(|top_up| top_up.count > 0) {
        let chain = top_up.group.external();
        let mut reusable = known(chain).into_iter();

        for _ in 0..top_up.count {
            match reusable.next() {
                Some(address) => slots.push(AddressSlot::Known(address)),
                None => slots.push(AddressSlot::Create(chain)),
            }
        }
    }

    slots
}

struct Target<W> {
    wallet: Arc<W>,
    unspents: Vec<Unspent>,
    reasons: ResetReasons,
}

impl<L: Ledger> ManagedWallets<L> {
    /// Brings every pool wallet back into shape.
    ///
    /// Fails with [`Error::Replenishment`] listing every failed step if any
    /// wallet could not be reset or the faucet could not cover all top-ups.
    #[instrument(level = "debug", skip(self), fields(client = %self.config.client_id, group = %self.config.group.name()))]
    pub async fn reset_wallets(&mut self) -> Result<ReplenishmentSummary> {
        self.ensure_pool().await?;

        let mut failures = Vec::new();
        let mut summary = ReplenishmentSummary::default();

        let snapshots = self.refresh_inventories(&mut failures).await;

        let mut self_resets = Vec::new();
        let mut faucet_dependent = Vec::new();
        for (wallet, unspents) in snapshots {
            let classification = self.policy.classify(&unspents);
            debug!(wallet = %wallet.label(), ?classification, unspents = unspents.len(), "Classified wallet");

            match classification {
                Classification::Healthy => summary.healthy += 1,
                Classification::SelfResettable(reasons) => self_resets.push(Target {
                    wallet,
                    unspents,
                    reasons,
                }),
                Classification::FaucetDependent(reasons) => faucet_dependent.push(Target {
                    wallet,
                    unspents,
                    reasons,
                }),
            }
        }

        info!(
            healthy = summary.healthy,
            self_resettable = self_resets.len(),
            faucet_dependent = faucet_dependent.len(),
            "Classified pool wallets"
        );

        self.self_reset_all(&self_resets, &mut summary, &mut failures)
            .await;
        let swept = self
            .sweep_excess(&faucet_dependent, &mut summary, &mut failures)
            .await;
        self.fund_from_faucet(&faucet_dependent, &swept, &mut summary, &mut failures)
            .await;

        for target in self_resets.iter().chain(faucet_dependent.iter()) {
            self.inventory.invalidate(target.wallet.id());
        }

        if !failures.is_empty() {
            warn!(failures = failures.len(), "Resetting managed wallets failed");
            return Err(ReplenishmentError::new(failures, "Failed to reset managed wallets").into());
        }

        info!(transactions = summary.txids.len(), "Reset managed wallets");

        Ok(summary)
    }

    /// Fetches inventories, always refetching wallets handed out by this pool.
    ///
    /// Returns the wallets whose inventory is known, in pool order.
    async fn refresh_inventories(&mut self, failures: &mut Vec<Failure>) -> Vec<(Arc<L::Wallet>, Vec<Unspent>)> {
        let stale = self
            .members
            .iter()
            .filter(|member| {
                let freshness = if member.used {
                    Freshness::ForceRefresh
                } else {
                    Freshness::Cached
                };
                self.inventory.needs_fetch(member.wallet.id(), freshness)
            })
            .map(|member| member.wallet.clone())
            .collect::<Vec<_>>();

        let timeout = self.config.call_timeout;
        let results = BatchRunner::new(self.config.concurrency)
            .run(stale, |wallet| async move { fetch_unspents(wallet.as_ref(), timeout).await })
            .await;

        let mut unavailable = HashSet::new();
        for (wallet, result) in results {
            match result {
                Ok(unspents) => self.inventory.insert(wallet.id(), unspents),
                Err(error) => {
                    unavailable.insert(wallet.id().to_owned());
                    failures.push(Failure::new(wallet.label(), error));
                }
            }
        }

        self.members
            .iter()
            .filter(|member| !unavailable.contains(member.wallet.id()))
            .filter_map(|member| {
                self.inventory
                    .cached(member.wallet.id())
                    .map(|unspents| (member.wallet.clone(), unspents.to_vec()))
            })
            .collect()
    }

    async fn self_reset_all(
        &mut self,
        targets: &[Target<L::Wallet>],
        summary: &mut ReplenishmentSummary,
        failures: &mut Vec<Failure>,
    ) {
        if targets.is_empty() {
            return;
        }

        let runner = BatchRunner::new(self.config.concurrency);
        let timeout = self.config.call_timeout;

        // Known addresses are loaded up front so reuse is decided before fan-out
        let missing = targets
            .iter()
            .filter(|target| !self.inventory.has_addresses(target.wallet.id()))
            .map(|target| target.wallet.clone())
            .collect::<Vec<_>>();
        let results = runner
            .run(missing, |wallet| async move { fetch_addresses(wallet.as_ref(), timeout).await })
            .await;
        let mut unavailable = HashSet::new();
        for (wallet, result) in results {
            match result {
                Ok(addresses) => self.inventory.insert_addresses(wallet.id(), addresses),
                Err(error) => {
                    unavailable.insert(wallet.id().to_owned());
                    failures.push(Failure::new(wallet.label(), error));
                }
            }
        }

        // All unspents are spent by a self-reset, so every group is rebuilt from scratch
        let top_ups = self.policy.required_top_ups(&[]);
        let planned = targets
            .iter()
            .enumerate()
            .filter(|(_, target)| !unavailable.contains(target.wallet.id()))
            .map(|(i, target)| {
                let slots = plan_addresses(&top_ups, |chain| {
                    self.inventory.unused_addresses(target.wallet.id(), chain)
                });
                (i, slots)
            })
            .collect::<Vec<_>>();

        let this = &*self;
        let results = runner
            .run(planned, |(i, slots)| async move {
                this.self_reset(&targets[i], slots).await
            })
            .await;

        let (succeeded, failed) = partition(results);
        for ((i, _), error) in failed {
            failures.push(Failure::new(targets[i].wallet.label(), error));
        }
        for (_, result) in succeeded {
            summary.self_reset += 1;
            summary.txids.push(result.txid);
        }
    }

    #[instrument(level = "debug", skip_all, fields(wallet = %target.wallet.label()))]
    async fn self_reset(&self, target: &Target<L::Wallet>, slots: Vec<AddressSlot>) -> Result<SendResult> {
        let wallet = target.wallet.as_ref();
        let refund = self.policy.should_refund_to_faucet(&target.unspents);

        let mut recipients = Vec::with_capacity(slots.len());
        for slot in slots {
            let address = self.resolve_slot(wallet, slot).await?;
            recipients.push(Recipient::new(address, self.policy.limits().reset_unspent_balance));
        }

        let plan = SelfResetPlan::new(
            wallet.label(),
            recipients,
            refund.then(|| self.faucet.receive_address()),
        )?;

        let request = SendMany {
            recipients: plan.recipients,
            unspents: Some(target.unspents.iter().map(|unspent| unspent.id.clone()).collect()),
            change_address: Some(plan.change_address),
            fee_rate: Some(self.config.fee_rate),
            wallet_passphrase: self.passphrase.clone(),
        };
        let result = ledger::call(
            "sendMany",
            wallet.label(),
            self.config.call_timeout,
            wallet.send_many(request),
        )
        .await?;

        info!(
            txid = %result.txid,
            reasons = ?target.reasons,
            refund,
            "Submitted self-reset transaction"
        );

        Ok(result)
    }

    /// Returns the positions of the targets that were swept.
    async fn sweep_excess(
        &self,
        targets: &[Target<L::Wallet>],
        summary: &mut ReplenishmentSummary,
        failures: &mut Vec<Failure>,
    ) -> HashSet<usize> {
        let sweeps = targets
            .iter()
            .enumerate()
            .filter(|(_, target)| target.reasons.excess_unspents)
            .map(|(i, _)| i)
            .collect::<Vec<_>>();
        if sweeps.is_empty() {
            return HashSet::new();
        }

        let results = BatchRunner::new(self.config.concurrency)
            .run(sweeps, |i| self.sweep(&targets[i]))
            .await;

        let (succeeded, failed) = partition(results);
        for (i, error) in failed {
            failures.push(Failure::new(targets[i].wallet.label(), error));
        }
        let mut swept = HashSet::new();
        for (i, result) in succeeded {
            summary.swept += 1;
            summary.txids.push(result.txid);
            swept.insert(i);
        }

        swept
    }

    #[instrument(level = "debug", skip_all, fields(wallet = %target.wallet.label()))]
    async fn sweep(&self, target: &Target<L::Wallet>) -> Result<SendResult> {
        let wallet = target.wallet.as_ref();
        let excess = self.policy.excess_unspents(&target.unspents);
        let amount = self
            .chain
            .max_spendable(&excess, 1, self.config.fee_rate);
        if amount == Amount::ZERO {
            return Err(Error::UnspendableExcess {
                wallet: wallet.label().to_owned(),
            });
        }

        let request = SendMany {
            recipients: vec![Recipient::new(self.faucet.receive_address(), amount)],
            unspents: Some(excess.iter().map(|unspent| unspent.id.clone()).collect()),
            change_address: None,
            fee_rate: Some(self.config.fee_rate),
            wallet_passphrase: self.passphrase.clone(),
        };
        let result = ledger::call(
            "sendMany",
            wallet.label(),
            self.config.call_timeout,
            wallet.send_many(request),
        )
        .await?;

        let outputs = result
            .transaction()
            .map_err(|source| Error::Remote {
                operation: "decodeTransaction",
                subject: wallet.label().to_owned(),
                source,
            })?
            .output
            .len();
        if outputs != 1 {
            return Err(Error::UnexpectedChange {
                wallet: wallet.label().to_owned(),
                outputs,
            });
        }

        info!(txid = %result.txid, unspents = excess.len(), %amount, "Swept excess unspents to faucet");

        Ok(result)
    }

    async fn fund_from_faucet(
        &self,
        targets: &[Target<L::Wallet>],
        swept: &HashSet<usize>,
        summary: &mut ReplenishmentSummary,
        failures: &mut Vec<Failure>,
    ) {
        // Swept unspents are gone, they no longer count towards a group's minimum
        let funded = targets
            .iter()
            .enumerate()
            .map(|(i, target)| {
                let remaining = if swept.contains(&i) {
                    self.remaining_after_sweep(target)
                } else {
                    target.unspents.clone()
                };
                (i, remaining)
            })
            .filter(|(_, remaining)| {
                self.policy
                    .required_top_ups(remaining)
                    .iter()
                    .any(|top_up| top_up.count > 0)
            })
            .collect::<Vec<_>>();
        if funded.is_empty() {
            return;
        }

        let results = BatchRunner::new(self.config.concurrency)
            .run(funded, |(i, remaining)| async move {
                self.faucet_recipients(&targets[i], &remaining).await
            })
            .await;

        let mut recipients = Vec::new();
        for ((i, _), result) in results {
            match result {
                Ok(wallet_recipients) => recipients.extend(wallet_recipients),
                Err(error) => failures.push(Failure::new(targets[i].wallet.label(), error)),
            }
        }
        if recipients.is_empty() {
            return;
        }

        let faucet_label = self.faucet.label();
        let faucet = match ledger::call(
            "getWallet",
            faucet_label,
            self.config.call_timeout,
            self.ledger.get_wallet(self.faucet.id()),
        )
        .await
        {
            Ok(faucet) => faucet,
            Err(error) => {
                failures.push(Failure::new(faucet_label, error));
                return;
            }
        };

        let faucet_unspents = match fetch_unspents(&faucet, self.config.call_timeout).await {
            Ok(unspents) => unspents,
            Err(error) => {
                failures.push(Failure::new(faucet_label, error));
                return;
            }
        };

        let balance = faucet.spendable_balance();
        let allowance = faucet_allowance(
            &self.chain,
            &faucet_unspents,
            balance,
            recipients.len(),
            self.config.fee_rate,
        );
        let budget = select_fundable(recipients, allowance);
        info!(
            %balance,
            %allowance,
            funded = budget.funded.len(),
            unfunded = budget.unfunded.len(),
            total = %budget.total,
            "Computed faucet budget"
        );

        if !budget.funded.is_empty() {
            let count = budget.funded.len();
            let request = SendMany {
                recipients: budget.funded,
                unspents: None,
                change_address: None,
                fee_rate: Some(self.config.fee_rate),
                wallet_passphrase: self.passphrase.clone(),
            };

            match ledger::call(
                "sendMany",
                faucet_label,
                self.config.call_timeout,
                faucet.send_many(request),
            )
            .await
            {
                Ok(result) => {
                    info!(txid = %result.txid, recipients = count, "Submitted faucet transaction");
                    summary.funded_recipients += count;
                    summary.txids.push(result.txid);
                }
                Err(error) => failures.push(Failure::new(faucet_label, error)),
            }
        }

        if !budget.unfunded.is_empty() {
            warn!(
                %balance,
                address = %faucet.receive_address(),
                unfunded = budget.unfunded.len(),
                "Faucet has run dry"
            );
            failures.push(Failure::new(
                faucet_label,
                Error::FaucetDry {
                    balance,
                    address: faucet.receive_address().to_owned(),
                    unfunded: budget.unfunded.len(),
                },
            ));
        }
    }

    fn remaining_after_sweep(&self, target: &Target<L::Wallet>) -> Vec<Unspent> {
        let excess = self
            .policy
            .excess_unspents(&target.unspents)
            .into_iter()
            .map(|unspent| unspent.id)
            .collect::<HashSet<_>>();

        target
            .unspents
            .iter()
            .filter(|unspent| !excess.contains(&unspent.id))
            .cloned()
            .collect()
    }

    async fn faucet_recipients(&self, target: &Target<L::Wallet>, unspents: &[Unspent]) -> Result<Vec<Recipient>> {
        let slots = plan_addresses(&self.policy.required_top_ups(unspents), |_| Vec::new());

        let mut recipients = Vec::with_capacity(slots.len());
        for slot in slots {
            let address = self.resolve_slot(target.wallet.as_ref(), slot).await?;
            recipients.push(Recipient::new(address, self.policy.limits().reset_unspent_balance));
        }

        Ok(recipients)
    }

    async fn resolve_slot(&self, wallet: &L::Wallet, slot: AddressSlot) -> Result<String> {
        match slot {
            AddressSlot::Known(address) => Ok(address),
            AddressSlot::Create(chain) => {
                let address = ledger::call(
                    "createAddress",
                    wallet.label(),
                    self.config.call_timeout,
                    wallet.create_address(chain),
                )
                .await?;
                if address.chain != chain {
                    return Err(Error::UnexpectedChain {
                        expected: chain,
                        actual: address.chain,
                    });
                }

                Ok(address.address)
            }
        }
    }
}
