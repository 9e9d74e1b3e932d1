use bitcoin::Amount;
use std::error::Error as _;
use std::fmt;
use std::time::Duration;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Coarse classification of [`Error`]s for callers that only care about
/// the category of a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    ResourceExhaustion,
    NoAvailableResource,
    RemoteOperation,
    AggregateReplenishment,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unsupported environment `{0}`, expected one of `test`, `dev`")]
    UnsupportedEnvironment(String),
    #[error("unknown wallet group `{0}`")]
    UnknownGroup(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("found {count} wallets labelled {label}, remove the duplicates")]
    DuplicateLabel { label: String, count: usize },
    #[error("wallet {id} is labelled {found} after rename, expected {expected}")]
    LabelMismatch {
        id: String,
        expected: String,
        found: String,
    },
    #[error("address for chain {expected} came back on chain {actual}")]
    UnexpectedChain { expected: u32, actual: u32 },
    #[error("cannot reset {wallet}: need at least 2 recipients, got {count}")]
    InsufficientRecipients { wallet: String, count: usize },
    #[error("excess unspents of {wallet} do not cover the sweep fee")]
    UnspendableExcess { wallet: String },
    #[error("faucet has run dry (faucet balance={balance}, {unfunded} recipients unfunded), please deposit at {address}")]
    FaucetDry {
        balance: Amount,
        address: String,
        unfunded: usize,
    },
    #[error("no wallet matching criteria found (used={used}, needs reset={needs_reset}, not ready={not_ready}, rejected={rejected})")]
    NoWalletAvailable {
        used: usize,
        needs_reset: usize,
        not_ready: usize,
        rejected: usize,
    },
    #[error("{operation} failed for {subject}")]
    Remote {
        operation: &'static str,
        subject: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("{operation} for {subject} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        subject: String,
        timeout: Duration,
    },
    #[error("sweep transaction of {wallet} has {outputs} outputs, expected exactly one")]
    UnexpectedChange { wallet: String, outputs: usize },
    #[error(transparent)]
    Replenishment(#[from] ReplenishmentError),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::UnsupportedEnvironment(_)
            | Error::UnknownGroup(_)
            | Error::InvalidConfig(_)
            | Error::DuplicateLabel { .. }
            | Error::LabelMismatch { .. } => ErrorKind::Configuration,
            Error::InsufficientRecipients { .. }
            | Error::UnspendableExcess { .. }
            | Error::FaucetDry { .. } => ErrorKind::ResourceExhaustion,
            Error::NoWalletAvailable { .. } => ErrorKind::NoAvailableResource,
            Error::Remote { .. }
            | Error::Timeout { .. }
            | Error::UnexpectedChain { .. }
            | Error::UnexpectedChange { .. } => ErrorKind::RemoteOperation,
            Error::Replenishment(_) => ErrorKind::AggregateReplenishment,
        }
    }
}

/// A failed per-wallet step of a maintenance run.
#[derive(Debug)]
pub struct Failure {
    /// Label of the wallet (or `faucet`) the step was operating on.
    pub subject: String,
    pub error: Error,
}

impl Failure {
    pub fn new(subject: impl Into<String>, error: Error) -> Self {
        Self {
            subject: subject.into(),
            error,
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.subject, self.error)?;

        let mut source = self.error.source();
        while let Some(cause) = source {
            write!(f, ": {}", cause)?;
            source = cause.source();
        }

        Ok(())
    }
}

/// Every failure collected while resetting or cleaning up the pool.
///
/// Maintenance runs keep going after individual wallets fail, this error
/// is raised at the end when at least one step did not succeed.
#[derive(Debug)]
pub struct ReplenishmentError {
    pub failures: Vec<Failure>,
    pub context: String,
}

impl ReplenishmentError {
    pub fn new(failures: Vec<Failure>, context: impl Into<String>) -> Self {
        Self {
            failures,
            context: context.into(),
        }
    }

    /// Get the number of failures
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Failure> {
        self.failures.iter()
    }

    /// Check if any failure matches a predicate
    pub fn any<F>(&self, predicate: F) -> bool
    where
        F: Fn(&Failure) -> bool,
    {
        self.failures.iter().any(predicate)
    }

    /// Recipients the faucet could not afford during this run.
    pub fn unfunded_recipients(&self) -> usize {
        self.failures
            .iter()
            .map(|failure| match failure.error {
                Error::FaucetDry { unfunded, .. } => unfunded,
                _ => 0,
            })
            .sum()
    }
}

impl fmt::Display for ReplenishmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} errors occurred", self.context, self.failures.len())?;
        for (i, failure) in self.failures.iter().enumerate() {
            write!(f, "\n  {}: {}", i + 1, failure)?;
        }
        Ok(())
    }
}

impl std::error::Error for ReplenishmentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.failures
            .first()
            .map(|failure| &failure.error as &(dyn std::error::Error + 'static))
    }
}
