//! 💀 ConnectorError — every way a pull can go sideways, each with its own name tag.
//!
//! 🧠 Knowledge graph:
//! - Collaborators (storage, notifications, codecs) speak `anyhow`; we wrap them at the
//!   connector boundary so callers get one typed enum.
//! - `EndOfStream`, `Timeout`, `NotConnected` are control signals, not tragedies. Callers
//!   branch on them: exhausted bucket vs "try again later" vs "the subscription is gone".

use thiserror::Error;

/// 💀 The typed failure surface of the connector.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// 🔧 Bad configuration. Fatal at construction.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// 📜 Listing the bucket failed. Not retried here; retry is the caller's business.
    #[error("failed to list objects")]
    Listing(#[source] anyhow::Error),

    /// 📨 A notification did not describe a real, finished upload. It has been acked and dropped.
    #[error("rejected notification: {0}")]
    InvalidNotification(String),

    /// 🪣 Fetching attributes or opening the byte stream failed.
    #[error("storage request for '{bucket}/{key}' failed")]
    Storage {
        bucket: String,
        key: String,
        #[source]
        source: anyhow::Error,
    },

    /// 🔒 The object changed since the notification was issued.
    #[error("object generation mismatch for '{bucket}/{key}': expected {expected}, found {actual}")]
    GenerationMismatch {
        bucket: String,
        key: String,
        expected: i64,
        actual: i64,
    },

    /// 🕳️ The decoder hit end-of-input before it could even start.
    #[error("encountered an empty file for key '{key}'")]
    EmptyObject { key: String },

    /// 🧩 Decoder construction or decoding failed.
    #[error("failed to decode object")]
    Decode(#[source] anyhow::Error),

    /// 📬 Resolving an acknowledgment failed. Delivery guarantees may be wobbly.
    #[error("failed to acknowledge")]
    Ack(#[source] anyhow::Error),

    /// 🧹 Releasing a client or the subscriber task failed. Calling `close` again resumes.
    #[error("failed to close connector")]
    Close(#[source] anyhow::Error),

    /// 🏁 Every target has been consumed.
    #[error("end of stream")]
    EndOfStream,

    /// ⏱️ The caller cancelled while we were waiting. Transient.
    #[error("timed out waiting for a target")]
    Timeout,

    /// 🔌 Not connected, or the notification feed closed for good.
    #[error("not connected")]
    NotConnected,

    /// 🗑️ The connector has been closed and will not reconnect.
    #[error("connector is closed")]
    Closed,
}
