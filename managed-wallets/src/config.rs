use crate::error::{Error, Result};
use crate::health::{GroupConfig, DEFAULT_MIN_UNSPENT_BALANCE};
use bitcoin::{Amount, FeeRate, Network};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

pub const DEFAULT_POOL_SIZE: usize = 32;
pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_FAUCET_LABEL: &str = "managed-faucet";
pub const POOL_SIZE_ENV_VAR: &str = "MANAGED_WALLETS_POOL_SIZE";

const LABEL_ROOT: &str = "managed";

/// Deployment the pool's ledger lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Environment {
    Test,
    Dev,
}

impl Environment {
    pub fn base_url(&self) -> Result<Url> {
        let url = match self {
            Environment::Test => "https://app.bitgo-test.com/",
            Environment::Dev => "https://app.bitgo-dev.com/",
        };

        Url::parse(url).map_err(|e| Error::InvalidConfig(format!("bad base url {url}: {e}")))
    }

    pub fn network(&self) -> Network {
        Network::Testnet
    }

    /// Ticker the ledger uses for this environment's coin.
    pub fn coin(&self) -> &'static str {
        "tbtc"
    }
}

impl FromStr for Environment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "test" => Ok(Environment::Test),
            "dev" => Ok(Environment::Dev),
            other => Err(Error::UnsupportedEnvironment(other.to_owned())),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Test => f.write_str("test"),
            Environment::Dev => f.write_str("dev"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub env: Environment,
    /// Identifies the test suite owning the pool, used in log output.
    pub client_id: String,
    pub group: GroupConfig,
    pub pool_size: usize,
    pub call_timeout: Duration,
    pub concurrency: usize,
    pub fee_rate: FeeRate,
    pub min_unspent_balance: Amount,
    pub faucet_label: String,
}

impl Config {
    pub fn new(env: Environment, client_id: impl Into<String>, group: GroupConfig) -> Self {
        Self {
            env,
            client_id: client_id.into(),
            group,
            pool_size: DEFAULT_POOL_SIZE,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            concurrency: DEFAULT_CONCURRENCY,
            fee_rate: FeeRate::from_sat_per_vb_unchecked(10),
            min_unspent_balance: DEFAULT_MIN_UNSPENT_BALANCE,
            faucet_label: DEFAULT_FAUCET_LABEL.to_owned(),
        }
    }

    /// Applies the pool size override from the environment, if set.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        let value = std::env::var(POOL_SIZE_ENV_VAR).ok();
        if let Some(pool_size) = parse_pool_size(value.as_deref())? {
            self.pool_size = pool_size;
        }

        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(Error::InvalidConfig("pool size must be positive".to_owned()));
        }
        if self.faucet_label.starts_with(&self.label_prefix()) {
            return Err(Error::InvalidConfig(format!(
                "faucet label {} collides with the pool's labels",
                self.faucet_label
            )));
        }

        self.group.validate()
    }

    /// Prefix shared by every pool wallet label of this group.
    pub fn label_prefix(&self) -> String {
        format!("{}/{}/", LABEL_ROOT, self.group.name())
    }

    pub fn label_for_index(&self, index: usize) -> String {
        format!("{}{}", self.label_prefix(), index)
    }

    /// Label pool wallets carried before they were namespaced by group.
    pub fn legacy_label_for_index(index: usize) -> String {
        format!("{}-{}", LABEL_ROOT, index)
    }

    /// Index encoded in a pool wallet label.
    ///
    /// `None` for labels outside this group, `Some(None)` for pool labels
    /// whose suffix is not an index in its canonical form.
    pub fn index_from_label(&self, label: &str) -> Option<Option<usize>> {
        label.strip_prefix(&self.label_prefix()).map(|suffix| {
            suffix
                .parse()
                .ok()
                .filter(|index| self.label_for_index(*index) == label)
        })
    }
}

/// Parses the pool size override, `None` when unset or empty.
pub fn parse_pool_size(value: Option<&str>) -> Result<Option<usize>> {
    match value.map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => match value.parse::<usize>() {
            Ok(size) if size > 0 => Ok(Some(size)),
            _ => Err(Error::InvalidConfig(format!(
                "{POOL_SIZE_ENV_VAR} must be a positive integer, got `{value}`"
            ))),
        },
    }
}

/// Passphrase every managed wallet is generated with.
pub fn wallet_passphrase() -> String {
    hex::encode(Sha256::digest(LABEL_ROOT.as_bytes()))
}
