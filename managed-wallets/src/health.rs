//! Pure health checks deciding whether a wallet can be handed out, needs a
//! reset, and who pays for that reset.

use crate::chain::ChainView;
use crate::error::{Error, Result};
use crate::unspent::{total_value, ChainCodeGroup, Unspent};
use bitcoin::Amount;
use std::collections::BTreeMap;

pub const DEFAULT_MIN_UNSPENT_BALANCE: Amount = Amount::from_sat(100_000);

/// Unspent count bounds of a single chain code group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GroupLimits {
    pub min: usize,
    /// `None` means unlimited.
    pub max: Option<usize>,
}

impl Default for GroupLimits {
    fn default() -> Self {
        Self { min: 0, max: None }
    }
}

/// Named set of per-group unspent count bounds a managed wallet should hold.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupConfig {
    name: String,
    limits: BTreeMap<ChainCodeGroup, GroupLimits>,
}

impl GroupConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            limits: BTreeMap::new(),
        }
    }

    pub fn with_limits(mut self, group: ChainCodeGroup, min: usize, max: Option<usize>) -> Self {
        self.limits.insert(group, GroupLimits { min, max });
        self
    }

    /// Wallets holding unspents of `group` only.
    pub fn single_group(name: impl Into<String>, group: ChainCodeGroup) -> Self {
        ChainCodeGroup::ALL
            .into_iter()
            .fold(Self::new(name), |config, candidate| {
                if candidate == group {
                    config.with_limits(candidate, 1, None)
                } else {
                    config.with_limits(candidate, 0, Some(0))
                }
            })
    }

    pub fn pure_p2sh() -> Self {
        Self::single_group("pure-p2sh", ChainCodeGroup::P2sh)
    }

    pub fn pure_p2sh_p2wsh() -> Self {
        Self::single_group("pure-p2sh-p2wsh", ChainCodeGroup::P2shP2wsh)
    }

    pub fn pure_p2wsh() -> Self {
        Self::single_group("pure-p2wsh", ChainCodeGroup::P2wsh)
    }

    pub fn mixed() -> Self {
        ChainCodeGroup::ALL
            .into_iter()
            .fold(Self::new("mixed"), |config, group| {
                config.with_limits(group, 1, None)
            })
    }

    /// Looks up one of the named presets.
    pub fn preset(name: &str) -> Result<Self> {
        match name {
            "pure-p2sh" => Ok(Self::pure_p2sh()),
            "pure-p2sh-p2wsh" => Ok(Self::pure_p2sh_p2wsh()),
            "pure-p2wsh" => Ok(Self::pure_p2wsh()),
            "mixed" => Ok(Self::mixed()),
            other => Err(Error::UnknownGroup(other.to_owned())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limits(&self, group: ChainCodeGroup) -> GroupLimits {
        self.limits.get(&group).copied().unwrap_or_default()
    }

    pub fn min_unspents(&self, group: ChainCodeGroup) -> usize {
        self.limits(group).min
    }

    pub fn max_unspents(&self, group: ChainCodeGroup) -> Option<usize> {
        self.limits(group).max
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains('/') {
            return Err(Error::InvalidConfig(format!(
                "group name `{}` must be non-empty and must not contain `/`",
                self.name
            )));
        }

        if ChainCodeGroup::ALL
            .into_iter()
            .all(|group| self.min_unspents(group) == 0)
        {
            return Err(Error::InvalidConfig(format!(
                "group `{}` requires no unspents at all",
                self.name
            )));
        }

        // A reset tops a group up to twice its minimum, which must stay within the maximum
        for group in ChainCodeGroup::ALL {
            let GroupLimits { min, max } = self.limits(group);
            if let Some(max) = max {
                if max < 2 * min {
                    return Err(Error::InvalidConfig(format!(
                        "group `{}` allows at most {} {} unspents but resets to {}",
                        self.name,
                        max,
                        group,
                        2 * min
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Balance thresholds derived from a [`GroupConfig`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WalletLimits {
    /// Unspents at or below this value do not count towards a group's minimum.
    pub min_unspent_balance: Amount,
    /// Value of each unspent created by a reset.
    pub reset_unspent_balance: Amount,
    /// Wallets holding more than this can fund their own reset.
    pub min_self_reset_balance: Amount,
    /// Wallets holding more than this need a reset and refund the surplus.
    pub max_total_balance: Amount,
}

impl WalletLimits {
    pub fn derive(config: &GroupConfig, min_unspent_balance: Amount) -> Self {
        let n_min_total: u64 = ChainCodeGroup::ALL
            .into_iter()
            .map(|group| config.min_unspents(group) as u64)
            .sum();
        let n_reset_total = 2 * n_min_total;
        let reset = min_unspent_balance.to_sat().saturating_mul(2);
        let reset_all = reset.saturating_mul(n_reset_total);

        Self {
            min_unspent_balance,
            reset_unspent_balance: Amount::from_sat(reset),
            min_self_reset_balance: Amount::from_sat(reset_all.saturating_mul(11) / 10),
            max_total_balance: Amount::from_sat(reset_all.saturating_mul(2)),
        }
    }
}

/// Number of unspents a group needs to be topped up by.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TopUp {
    pub group: ChainCodeGroup,
    pub count: usize,
}

/// Why a wallet needs a reset. At least one flag is set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResetReasons {
    pub excess_balance: bool,
    pub excess_unspents: bool,
    pub missing_unspent: bool,
}

/// Outcome of inspecting a wallet during replenishment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Classification {
    Healthy,
    SelfResettable(ResetReasons),
    FaucetDependent(ResetReasons),
}

#[derive(Clone, Debug)]
pub struct WalletHealthPolicy {
    config: GroupConfig,
    limits: WalletLimits,
}

impl WalletHealthPolicy {
    pub fn new(config: GroupConfig, min_unspent_balance: Amount) -> Result<Self> {
        config.validate()?;
        if min_unspent_balance == Amount::ZERO {
            return Err(Error::InvalidConfig(
                "minimum unspent balance must be positive".to_owned(),
            ));
        }

        let limits = WalletLimits::derive(&config, min_unspent_balance);
        if limits.min_self_reset_balance >= limits.max_total_balance {
            return Err(Error::InvalidConfig(format!(
                "self-reset threshold {} must stay below the maximum total balance {}",
                limits.min_self_reset_balance, limits.max_total_balance
            )));
        }

        Ok(Self { config, limits })
    }

    pub fn config(&self) -> &GroupConfig {
        &self.config
    }

    pub fn limits(&self) -> &WalletLimits {
        &self.limits
    }

    /// Per group, how many unspents a reset has to create.
    ///
    /// A group holding fewer qualifying unspents than its minimum is topped up
    /// to twice the minimum. Always yields one entry per group.
    pub fn required_top_ups(&self, unspents: &[Unspent]) -> Vec<TopUp> {
        ChainCodeGroup::ALL
            .into_iter()
            .map(|group| {
                let min = self.config.min_unspents(group);
                let count = unspents
                    .iter()
                    .filter(|unspent| {
                        group.contains(unspent.chain)
                            && unspent.value > self.limits.min_unspent_balance
                    })
                    .count();
                let count = if count < min { 2 * min - count } else { 0 };

                TopUp { group, count }
            })
            .collect()
    }

    pub fn needs_reset(&self, unspents: &[Unspent]) -> Option<ResetReasons> {
        let reasons = ResetReasons {
            excess_balance: total_value(unspents) > self.limits.max_total_balance,
            excess_unspents: ChainCodeGroup::ALL
                .into_iter()
                .any(|group| self.group_excess(unspents, group) > 0),
            missing_unspent: self
                .required_top_ups(unspents)
                .iter()
                .any(|top_up| top_up.count > 0),
        };

        (reasons != ResetReasons::default()).then_some(reasons)
    }

    pub fn can_self_reset(&self, unspents: &[Unspent]) -> bool {
        total_value(unspents) > self.limits.min_self_reset_balance
    }

    pub fn should_refund_to_faucet(&self, unspents: &[Unspent]) -> bool {
        total_value(unspents) > self.limits.max_total_balance
    }

    /// Whether the confirmed part of the inventory satisfies every group minimum.
    pub fn is_ready(&self, unspents: &[Unspent], chain: &ChainView) -> bool {
        let confirmed = unspents
            .iter()
            .filter(|unspent| chain.is_confirmed(unspent))
            .cloned()
            .collect::<Vec<_>>();

        self.required_top_ups(&confirmed)
            .iter()
            .all(|top_up| top_up.count == 0)
    }

    /// Unspents above each group's maximum count, oldest first.
    ///
    /// Within a group the oldest unspents are the ones selected as excess,
    /// unmined unspents come last in inventory order.
    pub fn excess_unspents(&self, unspents: &[Unspent]) -> Vec<Unspent> {
        ChainCodeGroup::ALL
            .into_iter()
            .flat_map(|group| {
                let excess = self.group_excess(unspents, group);
                let mut members = unspents
                    .iter()
                    .filter(|unspent| group.contains(unspent.chain))
                    .collect::<Vec<_>>();
                members.sort_by_key(|unspent| unspent.block_height.unwrap_or(u32::MAX));
                members.into_iter().take(excess).cloned().collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn classify(&self, unspents: &[Unspent]) -> Classification {
        match self.needs_reset(unspents) {
            None => Classification::Healthy,
            Some(reasons) if self.can_self_reset(unspents) => {
                Classification::SelfResettable(reasons)
            }
            Some(reasons) => Classification::FaucetDependent(reasons),
        }
    }

    fn group_excess(&self, unspents: &[Unspent], group: ChainCodeGroup) -> usize {
        let Some(max) = self.config.max_unspents(group) else {
            return 0;
        };
        let count = unspents
            .iter()
            .filter(|unspent| group.contains(unspent.chain))
            .count();

        count.saturating_sub(max)
    }
}
