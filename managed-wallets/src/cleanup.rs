use crate::batch::{partition, BatchRunner};
use crate::error::{Failure, ReplenishmentError, Result};
use crate::ledger::{self, Ledger, Sweep, Wallet, WalletSummary};
use crate::pool::ManagedWallets;
use tracing::{info, instrument};

/// What a cleanup run did with stray wallets.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CleanupSummary {
    pub swept: Vec<String>,
    pub removed: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Disposal {
    Swept,
    Removed,
}

impl<L: Ledger> ManagedWallets<L> {
    /// Wallets labelled for this group whose index lies outside the pool.
    pub fn stray_wallets(&self) -> Vec<WalletSummary> {
        self.wallet_list
            .iter()
            .filter(|wallet| match self.config.index_from_label(&wallet.label) {
                Some(Some(index)) => index >= self.config.pool_size,
                Some(None) => true,
                None => false,
            })
            .cloned()
            .collect()
    }

    /// Empties stray wallets into the faucet and deletes the empty ones.
    #[instrument(level = "debug", skip(self), fields(client = %self.config.client_id, group = %self.config.group.name()))]
    pub async fn cleanup(&mut self) -> Result<CleanupSummary> {
        let strays = self.stray_wallets();
        info!(strays = strays.len(), "Cleaning up stray wallets");

        let this = &*self;
        let results = BatchRunner::new(self.config.concurrency)
            .run(strays, |stray| this.dispose(stray))
            .await;
        let (succeeded, failed) = partition(results);

        let mut summary = CleanupSummary::default();
        for (stray, disposal) in succeeded {
            match disposal {
                Disposal::Swept => summary.swept.push(stray.label),
                Disposal::Removed => {
                    self.wallet_list.retain(|wallet| wallet.id != stray.id);
                    summary.removed.push(stray.label);
                }
            }
        }

        if !failed.is_empty() {
            let failures = failed
                .into_iter()
                .map(|(stray, error)| Failure::new(stray.label, error))
                .collect();
            return Err(ReplenishmentError::new(failures, "Failed to clean up stray wallets").into());
        }

        Ok(summary)
    }

    /// A wallet holding value is swept, it is removed on a later run once empty.
    async fn dispose(&self, stray: WalletSummary) -> Result<Disposal> {
        let timeout = self.config.call_timeout;
        let wallet = ledger::call("getWallet", &stray.label, timeout, self.ledger.get_wallet(&stray.id)).await?;

        if wallet.balance() > bitcoin::Amount::ZERO {
            let request = Sweep {
                address: self.faucet.receive_address().to_owned(),
                fee_rate: Some(self.config.fee_rate),
                wallet_passphrase: self.passphrase.clone(),
            };
            let result = ledger::call("sweep", &stray.label, timeout, wallet.sweep(request)).await?;
            info!(wallet = %stray.label, txid = %result.txid, "Swept stray wallet to faucet");

            return Ok(Disposal::Swept);
        }

        ledger::call("removeWallet", &stray.label, timeout, self.ledger.remove_wallet(&stray.id)).await?;
        info!(wallet = %stray.label, "Removed stray wallet");

        Ok(Disposal::Removed)
    }
}
