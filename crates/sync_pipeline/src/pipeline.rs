//! Three-stage enrichment: summary fetch for every instrument, detailed (PFM)
//! pass for card accounts, and a best-effort settlement pass for instruments
//! that still hold unsettled transactions on the first run.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use models::{
    AccountBucket, AccountSnapshot, DateWindow, NormalizedTransaction, RestoreResult, SourceAccount, SyncOutput,
};
use serde::Serialize;
use tracing::{debug, info, warn};
use utils::{
    account_map_from_sources, build_account_map, combine_transfers_by_id, filter_duplicates,
    map_transaction_accounts, sort_transactions_by_date,
};

use crate::channels::{AccountResolver, Converters, CurrencyTracker, DetailedChannel, SettlementChannel, SummaryChannel};
use crate::error::{Result, SyncError};
use crate::repository::SnapshotStore;

/// What happened during one run, next to the output itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    pub first_run: bool,
    pub accounts: usize,
    pub skipped_accounts: usize,
    pub pfm_accounts: usize,
    /// `account/instrument` pairs that produced nothing this run.
    pub failed_instruments: Vec<String>,
    /// `account/instrument` pairs queued for the settlement channel.
    pub escalated_instruments: Vec<String>,
    pub settlement_aborted: bool,
    pub withheld_unsettled: usize,
}

#[derive(Debug, Clone)]
pub struct SyncRun {
    pub output: SyncOutput,
    pub report: SyncReport,
}

/// Enrichment state of one PFM-eligible account.
struct PfmAccount {
    source: SourceAccount,
    bucket: AccountBucket,
    previous: Option<AccountSnapshot>,
    failed: HashSet<String>,
    escalate: Vec<String>,
    restore: Option<RestoreResult>,
}

impl PfmAccount {
    fn id(&self) -> &str {
        &self.source.account.id
    }

    fn live_instruments(&self) -> Vec<String> {
        self.source
            .instrument_ids
            .iter()
            .filter(|id| !self.failed.contains(*id))
            .cloned()
            .collect()
    }
}

type InstrumentResult = (String, Result<Vec<NormalizedTransaction>>);

pub struct EnrichmentPipeline {
    summary: Arc<dyn SummaryChannel>,
    detailed: Arc<dyn DetailedChannel>,
    settlement: Arc<dyn SettlementChannel>,
    converters: Arc<dyn Converters>,
    tracker: Arc<dyn CurrencyTracker>,
    store: Arc<dyn SnapshotStore>,
    resolver: Option<Arc<dyn AccountResolver>>,
    skipped_accounts: HashSet<String>,
}

impl EnrichmentPipeline {
    pub fn new(
        summary: Arc<dyn SummaryChannel>,
        detailed: Arc<dyn DetailedChannel>,
        settlement: Arc<dyn SettlementChannel>,
        converters: Arc<dyn Converters>,
        tracker: Arc<dyn CurrencyTracker>,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self {
            summary,
            detailed,
            settlement,
            converters,
            tracker,
            store,
            resolver: None,
            skipped_accounts: HashSet::new(),
        }
    }

    /// Fallback for account references the discovered accounts do not cover.
    pub fn with_account_resolver(mut self, resolver: Arc<dyn AccountResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Accounts listed in the output but never fetched.
    pub fn with_skipped_accounts<I: IntoIterator<Item = String>>(mut self, account_ids: I) -> Self {
        self.skipped_accounts.extend(account_ids);
        self
    }

    pub async fn run(&self, window: &DateWindow) -> Result<SyncRun> {
        let sources = self.summary.fetch_accounts().await?;
        let (active, skipped): (Vec<&SourceAccount>, Vec<&SourceAccount>) = sources
            .iter()
            .partition(|source| !self.skipped_accounts.contains(&source.account.id));

        let mut report = SyncReport {
            accounts: sources.len(),
            skipped_accounts: skipped.len(),
            ..Default::default()
        };
        info!(accounts = sources.len(), skipped = skipped.len(), from = %window.from, to = %window.to, "fetching summary transactions");

        // Stage 1: every instrument of every account, all in parallel.
        let fetched = join_all(active.iter().map(|source| self.fetch_summary(source, window))).await;

        let mut reported = Vec::new();
        let mut pfm_accounts = Vec::new();
        for (source, instruments) in active.into_iter().zip(fetched) {
            if source.account.kind.supports_pfm() {
                pfm_accounts.push(self.seed_pfm_account(source, instruments));
                continue;
            }
            for (instrument_id, result) in instruments {
                match result {
                    Ok(transactions) => reported.extend(
                        transactions
                            .into_iter()
                            .map(|txn| self.converters.tag_account(&source.account, txn)),
                    ),
                    Err(err) => {
                        warn!(account = %source.account.id, instrument = %instrument_id, error = %err, "summary fetch failed");
                        report.failed_instruments.push(format!("{}/{instrument_id}", source.account.id));
                    }
                }
            }
        }

        report.pfm_accounts = pfm_accounts.len();
        if !pfm_accounts.is_empty() {
            let first_run = self.load_previous_snapshots(&mut pfm_accounts, &mut report).await?;
            report.first_run = first_run;

            // Stage 2: accounts and their instruments in parallel.
            info!(accounts = pfm_accounts.len(), first_run, "fetching detailed transactions");
            join_all(
                pfm_accounts
                    .iter_mut()
                    .map(|account| self.enrich_detailed(account, window, first_run)),
            )
            .await;

            // Stage 3 only starts once every account has decided what to escalate.
            let queued: Vec<usize> = (0..pfm_accounts.len())
                .filter(|&idx| !pfm_accounts[idx].escalate.is_empty())
                .collect();
            if !queued.is_empty() {
                for &idx in &queued {
                    let account = &pfm_accounts[idx];
                    report
                        .escalated_instruments
                        .extend(account.escalate.iter().map(|id| format!("{}/{id}", account.id())));
                }
                info!(instruments = report.escalated_instruments.len(), "escalating to settlement channel");
                match self.settlement.authenticate().await {
                    Ok(()) => {
                        for idx in queued {
                            self.escalate(&mut pfm_accounts[idx], window).await;
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "settlement login failed, keeping detailed results");
                        report.settlement_aborted = true;
                    }
                }
            }

            for account in pfm_accounts {
                let assembled = self.assemble(account, first_run, &mut report).await;
                reported.extend(assembled);
            }
        }

        let transactions = finalize_transactions(&sources, self.resolver.as_deref(), reported);

        // A run with failed instruments must not end the first-run state, or
        // pending records it never escalated would stay withheld for good.
        if !report.failed_instruments.is_empty() {
            warn!(failed = report.failed_instruments.len(), "not recording a successful run");
        } else if let Err(err) = self.store.mark_success(window.to).await {
            warn!(error = %err, "could not record last successful run");
        }

        info!(
            transactions = transactions.len(),
            withheld = report.withheld_unsettled,
            failed = report.failed_instruments.len(),
            escalated = report.escalated_instruments.len(),
            "sync finished"
        );

        Ok(SyncRun {
            output: SyncOutput {
                accounts: sources.into_iter().map(|source| source.account).collect(),
                transactions,
            },
            report,
        })
    }

    async fn fetch_summary(&self, source: &SourceAccount, window: &DateWindow) -> Vec<InstrumentResult> {
        let fetches = source.instrument_ids.iter().map(|instrument_id| async move {
            let instrument = source.instrument(instrument_id);
            let raws = self.summary.fetch_transactions(&instrument, window).await?;
            let transactions: Vec<NormalizedTransaction> = raws
                .iter()
                .filter_map(|raw| {
                    if instrument.kind.is_loan() {
                        self.converters.convert_loan(raw)
                    } else {
                        self.converters.convert_summary(raw)
                    }
                })
                .collect();
            Ok::<_, SyncError>(transactions)
        });
        let results = join_all(fetches).await;
        source.instrument_ids.iter().cloned().zip(results).collect()
    }

    fn seed_pfm_account(&self, source: &SourceAccount, instruments: Vec<InstrumentResult>) -> PfmAccount {
        let snapshot = self.tracker.initial_snapshot(&source.account);
        let mut account = PfmAccount {
            source: source.clone(),
            bucket: AccountBucket::new(&source.instrument_ids, snapshot),
            previous: None,
            failed: HashSet::new(),
            escalate: Vec::new(),
            restore: None,
        };
        for (instrument_id, result) in instruments {
            match result {
                Ok(transactions) => account.bucket.instrument_mut(&instrument_id).extend(transactions),
                Err(err) => {
                    warn!(account = %source.account.id, instrument = %instrument_id, error = %err, "summary fetch failed");
                    account.failed.insert(instrument_id);
                }
            }
        }
        account
    }

    /// Loads each account's previous snapshot and decides whether this is the
    /// first run. Accounts whose snapshot cannot be read are dropped from the run.
    async fn load_previous_snapshots(&self, accounts: &mut Vec<PfmAccount>, report: &mut SyncReport) -> Result<bool> {
        let loaded = join_all(accounts.iter().map(|account| self.store.load_snapshot(account.id()))).await;

        let mut kept = Vec::with_capacity(accounts.len());
        for (mut account, result) in accounts.drain(..).zip(loaded) {
            match result {
                Ok(previous) => {
                    account.previous = previous;
                    kept.push(account);
                }
                Err(err) => {
                    warn!(account = %account.id(), error = %err, "cannot read previous snapshot, skipping account");
                    report.failed_instruments.extend(
                        account
                            .source
                            .instrument_ids
                            .iter()
                            .map(|id| format!("{}/{id}", account.id())),
                    );
                }
            }
        }
        *accounts = kept;

        let last_success = self.store.last_success().await?;
        Ok(last_success.is_none() && accounts.iter().all(|account| account.previous.is_none()))
    }

    async fn enrich_detailed(&self, account: &mut PfmAccount, window: &DateWindow, first_run: bool) {
        let instrument_ids = account.live_instruments();
        let fetched = join_all(instrument_ids.iter().map(|instrument_id| async move {
            let raws = self
                .detailed
                .fetch_transactions(std::slice::from_ref(instrument_id), window)
                .await?;
            raws.iter()
                .map(|raw| self.converters.convert_detailed(raw))
                .collect::<Result<Vec<_>>>()
        }))
        .await;

        // Tracking keeps a running accumulator per account, so it runs here in
        // list order rather than inside the parallel fetches.
        for (instrument_id, result) in instrument_ids.iter().zip(fetched) {
            let incoming = match result {
                Ok(incoming) => incoming,
                Err(err) => {
                    warn!(account = %account.source.account.id, instrument = %instrument_id, error = %err, "detailed fetch failed");
                    account.failed.insert(instrument_id.clone());
                    continue;
                }
            };

            let AccountBucket { transactions, snapshot } = &mut account.bucket;
            let list = transactions.entry(instrument_id.clone()).or_default();
            let tracked = list.len();
            self.converters.merge_transactions(list, incoming, false);

            if first_run && list.iter().any(|txn| !txn.posted) {
                account.escalate.push(instrument_id.clone());
            }

            let previous = if first_run { None } else { account.previous.as_ref() };
            for txn in list.iter_mut().take(tracked) {
                self.tracker.track_movement(txn, snapshot, previous);
            }
        }

        if first_run || !account.failed.is_empty() {
            return;
        }
        if let Some(previous) = account.previous.as_ref() {
            let result = self
                .tracker
                .restore_settlement(&account.source.account, &mut account.bucket, previous);
            debug!(account = %account.source.account.id, ?result, "restored settlement state");
            account.restore = Some(result);
        }
    }

    async fn escalate(&self, account: &mut PfmAccount, window: &DateWindow) {
        for instrument_id in account.escalate.clone() {
            let instrument = account.source.instrument(&instrument_id);
            let incoming = match self.settlement.fetch_transactions(&instrument, window).await {
                Ok(raws) => raws
                    .iter()
                    .map(|raw| self.converters.convert_settlement(raw))
                    .collect::<Result<Vec<_>>>(),
                Err(err) => Err(err),
            };
            match incoming {
                Ok(incoming) => {
                    let list = account.bucket.instrument_mut(&instrument_id);
                    self.converters.merge_transactions(list, incoming, true);
                }
                Err(err) => {
                    warn!(account = %account.id(), instrument = %instrument_id, error = %err, "settlement fetch failed, keeping detailed results");
                }
            }
        }
    }

    async fn assemble(&self, account: PfmAccount, first_run: bool, report: &mut SyncReport) -> Vec<NormalizedTransaction> {
        let PfmAccount {
            source,
            mut bucket,
            previous,
            failed,
            restore,
            ..
        } = account;

        let mut assembled = Vec::new();
        for instrument_id in &source.instrument_ids {
            if failed.contains(instrument_id) {
                report.failed_instruments.push(format!("{}/{instrument_id}", source.account.id));
                continue;
            }
            let Some(transactions) = bucket.transactions.get(instrument_id) else {
                continue;
            };
            for txn in transactions {
                let tagged = self.converters.tag_account(&source.account, txn.clone());
                self.tracker.track_last_seen(&tagged, &mut bucket.snapshot);
                if !tagged.posted {
                    debug!(account = %source.account.id, instrument = %instrument_id, id = ?tagged.id, "skipping not restored transaction");
                    report.withheld_unsettled += 1;
                    continue;
                }
                assembled.push(tagged);
            }
        }

        if !first_run && restore == Some(RestoreResult::Unchanged) {
            if let Some(previous) = previous.as_ref() {
                self.tracker
                    .apply_carry_forward_delta(&source.account, &mut bucket.snapshot, previous, &mut assembled);
            }
        }

        bucket.snapshot.clear_scratch();
        if !failed.is_empty() {
            warn!(account = %source.account.id, "keeping previous snapshot, some instruments failed");
        } else if let Err(err) = self.store.save_snapshot(&source.account.id, &bucket.snapshot).await {
            warn!(account = %source.account.id, error = %err, "could not persist snapshot");
        }
        assembled
    }
}

/// Canonical account ids, merged transfers, no duplicates, oldest first.
///
/// References the discovered accounts do not claim go to `resolver`.
/// Transfers are combined before duplicates are filtered: several legs that
/// share one transfer id are surfaced individually and exact copies among
/// them are then caught by the duplicate pass.
pub fn finalize_transactions(
    sources: &[SourceAccount],
    resolver: Option<&dyn AccountResolver>,
    transactions: Vec<NormalizedTransaction>,
) -> Vec<NormalizedTransaction> {
    let mut accounts = account_map_from_sources(sources);
    if let Some(resolver) = resolver {
        let unclaimed: Vec<&str> = transactions
            .iter()
            .flat_map(|txn| [txn.income_account.as_str(), txn.outcome_account.as_str()])
            .filter(|reference| !accounts.contains_key(*reference))
            .collect();
        let resolved = build_account_map(unclaimed, |reference| resolver.resolve(reference));
        accounts.extend(resolved);
    }
    let mapped = map_transaction_accounts(transactions, &accounts);
    let combined = combine_transfers_by_id(mapped);
    let mut unique = filter_duplicates(combined);
    sort_transactions_by_date(&mut unique);
    unique
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::{Account, AccountKind};
    use serde_json::json;

    fn source(id: &str, instrument: &str) -> SourceAccount {
        SourceAccount {
            account: Account {
                id: id.to_string(),
                kind: AccountKind::Card,
                title: None,
                sync_ids: vec!["4111".to_string()],
            },
            instrument_ids: vec![instrument.to_string()],
        }
    }

    fn txn(value: serde_json::Value) -> NormalizedTransaction {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn finalize_maps_merges_dedups_and_sorts() {
        let sources = vec![source("card-1", "inst-1")];
        let transactions = vec![
            txn(json!({"date": "2024-01-03", "incomeAccount": "card-1", "income": 0, "outcomeAccount": "card-1", "outcome": 5})),
            txn(json!({"date": "2024-01-01", "incomeAccount": "4111", "income": 0, "outcomeAccount": "4111", "outcome": 100,
                       "transferId": "T1", "transferType": "card", "card": "4111"})),
            txn(json!({"date": "2024-01-01", "incomeAccount": "card-1", "income": 0, "outcomeAccount": "card-1", "outcome": 100,
                       "transferId": "T1", "transferType": "account", "account": "40817"})),
            txn(json!({"date": "2024-01-03", "incomeAccount": "inst-1", "income": 0, "outcomeAccount": "inst-1", "outcome": 5})),
            txn(json!({"date": "2024-01-02", "incomeAccount": "nobody", "income": 1, "outcomeAccount": "else", "outcome": 0})),
        ];

        let out = finalize_transactions(&sources, None, transactions);

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].income_account, "card-1");
        assert_eq!(out[0].extra["account"], json!("40817"));
        assert!(!out[0].has_transfer_marker());
        assert_eq!(out[1].outcome, 5.0);
    }

    struct Iban;

    impl AccountResolver for Iban {
        fn resolve(&self, reference: &str) -> Option<Account> {
            reference.starts_with("DE").then(|| Account {
                id: "savings".to_string(),
                kind: AccountKind::Deposit,
                title: None,
                sync_ids: vec![],
            })
        }
    }

    #[test]
    fn resolver_claims_references_no_source_account_knows() {
        let sources = vec![source("card-1", "inst-1")];
        let transactions = vec![
            txn(json!({"date": "2024-01-03", "incomeAccount": "DE8937", "income": 50, "outcomeAccount": "card-1", "outcome": 50})),
            txn(json!({"date": "2024-01-04", "incomeAccount": "FR7630", "income": 20, "outcomeAccount": "shop", "outcome": 20})),
        ];

        let without = finalize_transactions(&sources, None, transactions.clone());
        assert_eq!(without.len(), 1);
        assert_eq!(without[0].income_account, "DE8937");

        let with = finalize_transactions(&sources, Some(&Iban as &dyn AccountResolver), transactions);
        assert_eq!(with.len(), 1);
        assert_eq!(with[0].income_account, "savings");
        assert_eq!(with[0].outcome_account, "card-1");
    }
}
