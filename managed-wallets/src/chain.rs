use crate::unspent::{total_value, ChainCodeGroup, Unspent};
use bitcoin::{Amount, FeeRate, Network};

/// Confirmations an unspent needs before a wallet holding it is considered ready.
pub const READY_CONFIRMATIONS: u32 = 3;

const TX_OVERHEAD_VSIZE: u64 = 11;
const OUTPUT_VSIZE: u64 = 43;

/// Read-only view of the ledger's chain as observed when the pool was created.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChainView {
    tip: u32,
    network: Network,
}

impl ChainView {
    pub fn new(tip: u32, network: Network) -> Self {
        Self { tip, network }
    }

    pub fn tip(&self) -> u32 {
        self.tip
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Number of blocks mined on top of the block containing `unspent`.
    ///
    /// Unmined outputs and outputs reported above the observed tip have zero
    /// confirmations.
    pub fn confirmations(&self, unspent: &Unspent) -> u32 {
        match unspent.block_height {
            Some(height) if height <= self.tip => self.tip - height,
            _ => 0,
        }
    }

    pub fn is_confirmed(&self, unspent: &Unspent) -> bool {
        self.confirmations(unspent) >= READY_CONFIRMATIONS
    }

    /// Value left over after spending all of `unspents` to `recipients`
    /// outputs at `fee_rate`, never below zero.
    pub fn max_spendable(&self, unspents: &[Unspent], recipients: usize, fee_rate: FeeRate) -> Amount {
        let vsize = estimate_vsize(unspents, recipients);
        let fee = fee_rate.fee_vb(vsize).unwrap_or(Amount::MAX_MONEY);

        total_value(unspents).checked_sub(fee).unwrap_or(Amount::ZERO)
    }
}

fn input_vsize(unspent: &Unspent) -> u64 {
    match unspent.group() {
        Some(ChainCodeGroup::P2shP2wsh) => 140,
        Some(ChainCodeGroup::P2wsh) => 105,
        Some(ChainCodeGroup::P2sh) | None => 298,
    }
}

fn estimate_vsize(unspents: &[Unspent], recipients: usize) -> u64 {
    let inputs: u64 = unspents.iter().map(input_vsize).sum();
    TX_OVERHEAD_VSIZE + inputs + OUTPUT_VSIZE * recipients as u64
}
