pub mod channels;
pub mod error;
pub mod pipeline;
pub mod recorded;
pub mod repository;

pub use channels::{
    merge_by_identity, AccountResolver, Channel, Converters, CurrencyTracker, DetailedChannel, NoopCurrencyTracker, SettlementChannel,
    SummaryChannel,
};
pub use error::{Result, SyncError};
pub use pipeline::{finalize_transactions, EnrichmentPipeline, SyncReport, SyncRun};
pub use recorded::{JsonConverters, RecordedChannels};
pub use repository::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore};
