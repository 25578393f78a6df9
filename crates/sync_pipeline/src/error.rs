use thiserror::Error;

use crate::channels::Channel;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{channel} fetch failed for {instrument}: {message}")]
    Fetch {
        channel: Channel,
        instrument: String,
        message: String,
    },

    #[error("{channel} authentication failed: {message}")]
    Auth { channel: Channel, message: String },

    #[error("{channel} record could not be converted: {message}")]
    Conversion { channel: Channel, message: String },

    #[error("Snapshot store error: {0}")]
    Snapshot(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    pub fn fetch(channel: Channel, instrument: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fetch {
            channel,
            instrument: instrument.into(),
            message: message.into(),
        }
    }
}
