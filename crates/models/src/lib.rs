
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;

// Settings models
#[derive(Debug, Clone, Deserialize)]
pub struct SyncSettings {
	pub from_date: NaiveDate,
	#[serde(default)]
	pub to_date: Option<NaiveDate>,
	#[serde(default)]
	pub skipped_accounts: Vec<String>,
	#[serde(default = "default_state_dir")]
	pub state_dir: PathBuf,
	#[serde(default)]
	pub output_file: Option<PathBuf>,
	#[serde(default)]
	pub log_filter: Option<String>,
}

fn default_state_dir() -> PathBuf {
	PathBuf::from("state")
}

impl SyncSettings {
	/// Window covered by a run. `to_date` is included in full; a missing
	/// `to_date` means "up to now".
	pub fn window(&self, now: DateTime<Utc>) -> DateWindow {
		let from = start_of_day(self.from_date);
		let to = match self.to_date {
			Some(day) => start_of_day(day) + chrono::Duration::days(1),
			None => now,
		};
		DateWindow { from, to }
	}
}

fn start_of_day(day: NaiveDate) -> DateTime<Utc> {
	Utc.from_utc_datetime(&day.and_time(NaiveTime::default()))
}

/// Half-open fetch window: `from` is included, `to` is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
	pub from: DateTime<Utc>,
	pub to: DateTime<Utc>,
}

impl DateWindow {
	pub fn contains(&self, at: DateTime<Utc>) -> bool {
		self.from <= at && at < self.to
	}
}

// Transaction dates

/// A transaction date is either a precise instant or a calendar day; sources
/// differ in what they report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransactionDate {
	Instant(DateTime<Utc>),
	Day(NaiveDate),
}

impl TransactionDate {
	/// Textual form used in duplicate fingerprints: epoch millis for instants,
	/// `YYYY-MM-DD` for calendar days.
	pub fn fingerprint(&self) -> String {
		match self {
			Self::Instant(at) => at.timestamp_millis().to_string(),
			Self::Day(day) => day.format("%Y-%m-%d").to_string(),
		}
	}

	/// Calendar days sort as midnight UTC.
	pub fn sort_instant(&self) -> DateTime<Utc> {
		match self {
			Self::Instant(at) => *at,
			Self::Day(day) => start_of_day(*day),
		}
	}
}

// Transactions

/// Source-specific record as handed over by a channel fetcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawTransaction(pub Value);

fn posted_by_default() -> bool {
	true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedTransaction {
	/// Source identity used when merging records from different channels.
	#[serde(default, skip_serializing)]
	pub id: Option<String>,
	pub date: TransactionDate,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub payee: Option<String>,
	pub income_account: String,
	pub income: f64,
	pub outcome_account: String,
	pub outcome: f64,
	#[serde(default = "posted_by_default", skip_serializing)]
	pub posted: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub transfer_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub transfer_type: Option<String>,
	/// Counterpart details (`card`, `cardAccount`, `accountBankID`, comments...).
	#[serde(flatten)]
	pub extra: Map<String, Value>,
}

impl NormalizedTransaction {
	pub fn is_internal_movement(&self) -> bool {
		self.income_account == self.outcome_account
	}

	pub fn strip_transfer_marker(&mut self) {
		self.transfer_id = None;
		self.transfer_type = None;
	}

	pub fn has_transfer_marker(&self) -> bool {
		self.transfer_id.is_some() || self.transfer_type.is_some()
	}
}

// Accounts

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountKind {
	Card,
	Checking,
	Deposit,
	Loan,
	Investment,
}

impl AccountKind {
	/// Only card instruments are served by the detailed (PFM) channel.
	pub fn supports_pfm(&self) -> bool {
		matches!(self, Self::Card)
	}

	pub fn is_loan(&self) -> bool {
		matches!(self, Self::Loan)
	}
}

impl std::fmt::Display for AccountKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Card => write!(f, "card"),
			Self::Checking => write!(f, "checking"),
			Self::Deposit => write!(f, "deposit"),
			Self::Loan => write!(f, "loan"),
			Self::Investment => write!(f, "investment"),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
	pub id: String,
	#[serde(rename = "type")]
	pub kind: AccountKind,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub title: Option<String>,
	/// Raw references (card numbers, IBANs...) that identify this account in transactions.
	#[serde(default, rename = "syncIds", skip_serializing_if = "Vec::is_empty")]
	pub sync_ids: Vec<String>,
}

/// An account as listed by the summary channel, with the instrument ids its
/// transactions are fetched by.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceAccount {
	pub account: Account,
	pub instrument_ids: Vec<String>,
}

impl SourceAccount {
	pub fn instrument(&self, instrument_id: &str) -> InstrumentRef {
		InstrumentRef {
			id: instrument_id.to_string(),
			kind: self.account.kind,
		}
	}
}

/// What a channel needs to address one instrument (card, account...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstrumentRef {
	pub id: String,
	#[serde(rename = "type")]
	pub kind: AccountKind,
}

// Settlement state

/// Per-account state owned by the currency-movement tracker and persisted
/// between runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
	/// Transient scratch used while tracking; never persisted.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub currency_movements: Option<Value>,
	#[serde(flatten)]
	pub fields: Map<String, Value>,
}

impl AccountSnapshot {
	pub fn clear_scratch(&mut self) {
		self.currency_movements = None;
	}
}

/// Working state for one account during enrichment: its transactions per
/// instrument plus the snapshot being built for this run.
#[derive(Debug, Clone, Default)]
pub struct AccountBucket {
	pub transactions: HashMap<String, Vec<NormalizedTransaction>>,
	pub snapshot: AccountSnapshot,
}

impl AccountBucket {
	pub fn new(instrument_ids: &[String], snapshot: AccountSnapshot) -> Self {
		let transactions = instrument_ids.iter().map(|id| (id.clone(), Vec::new())).collect();
		Self { transactions, snapshot }
	}

	pub fn instrument(&self, instrument_id: &str) -> &[NormalizedTransaction] {
		self.transactions.get(instrument_id).map(Vec::as_slice).unwrap_or(&[])
	}

	pub fn instrument_mut(&mut self, instrument_id: &str) -> &mut Vec<NormalizedTransaction> {
		self.transactions.entry(instrument_id.to_string()).or_default()
	}

	pub fn has_unsettled(&self, instrument_id: &str) -> bool {
		self.instrument(instrument_id).iter().any(|t| !t.posted)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RestoreResult {
	Changed,
	Unchanged,
}

// Output models
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncOutput {
	pub accounts: Vec<Account>,
	pub transactions: Vec<NormalizedTransaction>,
}
