//! Collaborators the pipeline drives: the three data channels, the record
//! converters and the currency-movement tracker.

use async_trait::async_trait;
use models::{
    Account, AccountBucket, AccountSnapshot, DateWindow, InstrumentRef, NormalizedTransaction, RawTransaction,
    RestoreResult, SourceAccount,
};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Fast summary channel; also lists the holder's accounts.
    Summary,
    /// Detailed personal-finance-management channel (card instruments only).
    Detailed,
    /// Slow web channel, authoritative over settlement status.
    Settlement,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Summary => write!(f, "summary"),
            Self::Detailed => write!(f, "detailed"),
            Self::Settlement => write!(f, "settlement"),
        }
    }
}

#[async_trait]
pub trait SummaryChannel: Send + Sync {
    async fn fetch_accounts(&self) -> Result<Vec<SourceAccount>>;
    async fn fetch_transactions(&self, instrument: &InstrumentRef, window: &DateWindow) -> Result<Vec<RawTransaction>>;
}

#[async_trait]
pub trait DetailedChannel: Send + Sync {
    async fn fetch_transactions(&self, instrument_ids: &[String], window: &DateWindow) -> Result<Vec<RawTransaction>>;
}

#[async_trait]
pub trait SettlementChannel: Send + Sync {
    /// Log in once per run before any settlement fetch.
    async fn authenticate(&self) -> Result<()>;
    async fn fetch_transactions(&self, instrument: &InstrumentRef, window: &DateWindow) -> Result<Vec<RawTransaction>>;
}

/// Turns channel records into `NormalizedTransaction`s.
///
/// `None` from a summary or loan conversion means "not a reportable
/// transaction" and is not an error.
pub trait Converters: Send + Sync {
    fn convert_summary(&self, raw: &RawTransaction) -> Option<NormalizedTransaction>;
    fn convert_loan(&self, raw: &RawTransaction) -> Option<NormalizedTransaction>;
    fn convert_detailed(&self, raw: &RawTransaction) -> Result<NormalizedTransaction>;
    fn convert_settlement(&self, raw: &RawTransaction) -> Result<NormalizedTransaction>;

    /// Merge `incoming` into `existing` by source identity. See `merge_by_identity`.
    fn merge_transactions(
        &self,
        existing: &mut Vec<NormalizedTransaction>,
        incoming: Vec<NormalizedTransaction>,
        overwrite: bool,
    ) {
        merge_by_identity(existing, incoming, overwrite);
    }

    /// Account-tagged form of a converted transaction: an empty side is the account itself.
    fn tag_account(&self, account: &Account, mut transaction: NormalizedTransaction) -> NormalizedTransaction {
        if transaction.income_account.is_empty() {
            transaction.income_account = account.id.clone();
        }
        if transaction.outcome_account.is_empty() {
            transaction.outcome_account = account.id.clone();
        }
        transaction
    }
}

/// Resolves a raw account reference (card number, IBAN...) that none of the
/// discovered accounts claims.
pub trait AccountResolver: Send + Sync {
    fn resolve(&self, reference: &str) -> Option<Account>;
}

/// Settlement bookkeeping for PFM accounts. Implementations keep their
/// running state in the account's `AccountSnapshot`.
pub trait CurrencyTracker: Send + Sync {
    fn initial_snapshot(&self, _account: &Account) -> AccountSnapshot {
        AccountSnapshot::default()
    }

    fn track_movement(
        &self,
        transaction: &mut NormalizedTransaction,
        snapshot: &mut AccountSnapshot,
        previous: Option<&AccountSnapshot>,
    );

    fn track_last_seen(&self, transaction: &NormalizedTransaction, snapshot: &mut AccountSnapshot);

    fn restore_settlement(
        &self,
        account: &Account,
        bucket: &mut AccountBucket,
        previous: &AccountSnapshot,
    ) -> RestoreResult;

    fn apply_carry_forward_delta(
        &self,
        account: &Account,
        snapshot: &mut AccountSnapshot,
        previous: &AccountSnapshot,
        assembled: &mut [NormalizedTransaction],
    );
}

/// Tracker for callers without settlement bookkeeping.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCurrencyTracker;

impl CurrencyTracker for NoopCurrencyTracker {
    fn track_movement(&self, _: &mut NormalizedTransaction, _: &mut AccountSnapshot, _: Option<&AccountSnapshot>) {}

    fn track_last_seen(&self, _: &NormalizedTransaction, _: &mut AccountSnapshot) {}

    fn restore_settlement(&self, _: &Account, _: &mut AccountBucket, _: &AccountSnapshot) -> RestoreResult {
        RestoreResult::Changed
    }

    fn apply_carry_forward_delta(
        &self,
        _: &Account,
        _: &mut AccountSnapshot,
        _: &AccountSnapshot,
        _: &mut [NormalizedTransaction],
    ) {
    }
}

/// Merges records from a more authoritative pass into an instrument's list.
///
/// Records are matched by `id`; records without an id never match.
/// Unmatched incoming records are appended. For a matched pair, the additive
/// mode only fills what the existing record lacks, while overwrite lets the
/// incoming record win on every field it carries (posting status included).
pub fn merge_by_identity(
    existing: &mut Vec<NormalizedTransaction>,
    incoming: Vec<NormalizedTransaction>,
    overwrite: bool,
) {
    for record in incoming {
        let slot = record
            .id
            .as_ref()
            .and_then(|id| existing.iter().position(|t| t.id.as_ref() == Some(id)));

        let Some(slot) = slot else {
            existing.push(record);
            continue;
        };

        let current = &mut existing[slot];
        if overwrite {
            let mut merged = record;
            fill_missing(&mut merged, current);
            *current = merged;
        } else {
            fill_missing(current, &record);
        }
    }
}

fn fill_missing(target: &mut NormalizedTransaction, source: &NormalizedTransaction) {
    if target.payee.is_none() {
        target.payee = source.payee.clone();
    }
    if target.transfer_id.is_none() && target.transfer_type.is_none() {
        target.transfer_id = source.transfer_id.clone();
        target.transfer_type = source.transfer_type.clone();
    }
    for (key, value) in &source.extra {
        if !target.extra.contains_key(key) {
            target.extra.insert(key.clone(), value.clone());
        }
    }
}
