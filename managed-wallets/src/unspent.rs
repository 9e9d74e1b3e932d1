use bitcoin::Amount;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Chain code of a wallet address as reported by the ledger.
///
/// Even codes are external (receive) chains, odd codes the matching
/// internal (change) chains.
pub type ChainCode = u32;

/// A spendable output owned by a wallet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Unspent {
    pub id: String,
    pub address: String,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub value: Amount,
    /// Height of the block that mined this output, `None` while in the mempool.
    #[serde(default)]
    pub block_height: Option<u32>,
    pub chain: ChainCode,
    #[serde(default)]
    pub index: u32,
}

impl Unspent {
    pub fn group(&self) -> Option<ChainCodeGroup> {
        ChainCodeGroup::of(self.chain)
    }
}

/// Script type family of a set of chain codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChainCodeGroup {
    P2sh,
    P2shP2wsh,
    P2wsh,
}

impl ChainCodeGroup {
    pub const ALL: [ChainCodeGroup; 3] = [
        ChainCodeGroup::P2sh,
        ChainCodeGroup::P2shP2wsh,
        ChainCodeGroup::P2wsh,
    ];

    pub fn external(self) -> ChainCode {
        match self {
            ChainCodeGroup::P2sh => 0,
            ChainCodeGroup::P2shP2wsh => 10,
            ChainCodeGroup::P2wsh => 20,
        }
    }

    pub fn internal(self) -> ChainCode {
        self.external() + 1
    }

    pub fn contains(self, chain: ChainCode) -> bool {
        chain == self.external() || chain == self.internal()
    }

    /// Returns the group a chain code belongs to, if any.
    pub fn of(chain: ChainCode) -> Option<Self> {
        Self::ALL.into_iter().find(|group| group.contains(chain))
    }
}

impl fmt::Display for ChainCodeGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChainCodeGroup::P2sh => "p2sh",
            ChainCodeGroup::P2shP2wsh => "p2shP2wsh",
            ChainCodeGroup::P2wsh => "p2wsh",
        };
        f.write_str(name)
    }
}

pub fn total_value<'a>(unspents: impl IntoIterator<Item = &'a Unspent>) -> Amount {
    Amount::from_sat(
        unspents
            .into_iter()
            .map(|unspent| unspent.value.to_sat())
            .fold(0u64, u64::saturating_add),
    )
}
