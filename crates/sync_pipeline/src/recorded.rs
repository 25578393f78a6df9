//! Channels replayed from JSON recordings on disk.
//!
//! Layout of a recordings directory:
//!
//! ```text
//! accounts.json                 list of SourceAccount
//! summary/<instrument>.json     raw records per instrument
//! detailed/<instrument>.json
//! settlement/<instrument>.json
//! settlement/AUTH_FAILED        present => settlement login fails
//! ```
//!
//! A missing instrument file is an instrument without transactions. Instrument
//! ids other than ASCII letters, digits and `-` are escaped in file names as
//! `_XX` hex bytes (`card/1` is `card_2F1.json`).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use models::{DateWindow, InstrumentRef, NormalizedTransaction, RawTransaction, SourceAccount, TransactionDate};
use tracing::debug;

use crate::channels::{Channel, Converters, DetailedChannel, SettlementChannel, SummaryChannel};
use crate::error::{Result, SyncError};
use crate::repository::file_stem;

pub struct RecordedChannels {
    root: PathBuf,
}

impl RecordedChannels {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn instrument_path(&self, channel: Channel, instrument_id: &str) -> PathBuf {
        self.root
            .join(channel.to_string())
            .join(format!("{}.json", file_stem(instrument_id)))
    }

    async fn load_records(
        &self,
        channel: Channel,
        instrument_id: &str,
        window: &DateWindow,
    ) -> Result<Vec<RawTransaction>> {
        let path = self.instrument_path(channel, instrument_id);
        let records: Option<Vec<RawTransaction>> =
            tokio::task::spawn_blocking(move || utils::read_optional_json_file(path))
                .await
                .map_err(|e| SyncError::fetch(channel, instrument_id, e.to_string()))?
                .map_err(|e| SyncError::fetch(channel, instrument_id, format!("{e:#}")))?;

        let records: Vec<RawTransaction> = records
            .unwrap_or_default()
            .into_iter()
            .filter(|raw| within(window, raw))
            .collect();
        debug!(%channel, instrument = instrument_id, records = records.len(), "loaded recorded transactions");
        Ok(records)
    }
}

/// Records whose date cannot be read are kept; the converter decides about them.
fn within(window: &DateWindow, raw: &RawTransaction) -> bool {
    raw.0
        .get("date")
        .and_then(|date| serde_json::from_value::<TransactionDate>(date.clone()).ok())
        .map(|date| window.contains(date.sort_instant()))
        .unwrap_or(true)
}

#[async_trait]
impl SummaryChannel for RecordedChannels {
    async fn fetch_accounts(&self) -> Result<Vec<SourceAccount>> {
        let path = self.root.join("accounts.json");
        tokio::task::spawn_blocking(move || utils::read_json_file(path))
            .await
            .map_err(|e| SyncError::fetch(Channel::Summary, "accounts", e.to_string()))?
            .map_err(|e| SyncError::fetch(Channel::Summary, "accounts", format!("{e:#}")))
    }

    async fn fetch_transactions(&self, instrument: &InstrumentRef, window: &DateWindow) -> Result<Vec<RawTransaction>> {
        self.load_records(Channel::Summary, &instrument.id, window).await
    }
}

#[async_trait]
impl DetailedChannel for RecordedChannels {
    async fn fetch_transactions(&self, instrument_ids: &[String], window: &DateWindow) -> Result<Vec<RawTransaction>> {
        let mut records = Vec::new();
        for instrument_id in instrument_ids {
            records.extend(self.load_records(Channel::Detailed, instrument_id, window).await?);
        }
        Ok(records)
    }
}

#[async_trait]
impl SettlementChannel for RecordedChannels {
    async fn authenticate(&self) -> Result<()> {
        let marker = self.root.join(Channel::Settlement.to_string()).join("AUTH_FAILED");
        if tokio::fs::try_exists(&marker).await? {
            return Err(SyncError::Auth {
                channel: Channel::Settlement,
                message: format!("login refused ({} present)", marker.display()),
            });
        }
        Ok(())
    }

    async fn fetch_transactions(&self, instrument: &InstrumentRef, window: &DateWindow) -> Result<Vec<RawTransaction>> {
        self.load_records(Channel::Settlement, &instrument.id, window).await
    }
}

/// Converters for recordings that already hold normalized records.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonConverters;

impl JsonConverters {
    fn parse(channel: Channel, raw: &RawTransaction) -> Result<NormalizedTransaction> {
        serde_json::from_value(raw.0.clone()).map_err(|e| SyncError::Conversion {
            channel,
            message: e.to_string(),
        })
    }
}

impl Converters for JsonConverters {
    fn convert_summary(&self, raw: &RawTransaction) -> Option<NormalizedTransaction> {
        match Self::parse(Channel::Summary, raw) {
            Ok(transaction) => Some(transaction),
            Err(err) => {
                debug!(error = %err, "skipping summary record");
                None
            }
        }
    }

    /// Loan statements list scheduled entries too; only actual movements count.
    fn convert_loan(&self, raw: &RawTransaction) -> Option<NormalizedTransaction> {
        let transaction = self.convert_summary(raw)?;
        (transaction.income != 0.0 || transaction.outcome != 0.0).then_some(transaction)
    }

    fn convert_detailed(&self, raw: &RawTransaction) -> Result<NormalizedTransaction> {
        Self::parse(Channel::Detailed, raw)
    }

    fn convert_settlement(&self, raw: &RawTransaction) -> Result<NormalizedTransaction> {
        Self::parse(Channel::Settlement, raw)
    }
}
