//! 🎯 Targets — which object to read next, and what "done with it" means.
//!
//! 🧠 Knowledge graph:
//! - [`ObjectTarget`]: bucket + key + fencing generation + the [`AckChain`] to run when the
//!   object has been fully handled (or abandoned).
//! - [`TargetReader`]: `pop` the next target. Two flavors, dispatched through
//!   [`TargetReaderBackend`]:
//!   - [`ListingTargetReader`]: walks a bucket listing page by page. Finite.
//!   - [`NotificationTargetReader`]: drains the subscriber's queue. Infinite, until it isn't.
//! - `Ok(None)` from `pop` means "no more targets, ever". Waiting and hang-ups are errors
//!   (`Timeout`, `NotConnected`) so nobody mistakes a quiet subscription for an empty bucket.
//!
//! 🦆 The duck pops targets too. Mostly bread.

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ConnectorError;

mod ack_chain;
mod listing_reader;
mod notification_reader;

pub use ack_chain::{AckChain, ObjectDeletion};
pub use listing_reader::{LISTING_PAGE_SIZE, ListingTargetReader};
pub use notification_reader::NotificationTargetReader;

/// 🎯 One object to consume.
#[derive(Debug)]
pub struct ObjectTarget {
    pub key: String,
    pub bucket: String,
    /// 🔒 Expected generation. 0 = don't check.
    pub generation: i64,
    /// 📬 Runs once, when the object is done with. Consumed by [`ObjectTarget::ack`].
    pub chain: AckChain,
}

impl ObjectTarget {
    /// ✅ Resolve this target. `failure` = why it could not be processed, if it couldn't.
    pub async fn ack(self, failure: Option<&anyhow::Error>) -> Result<()> {
        self.chain.resolve(failure).await
    }
}

/// 🎯 A source of targets.
#[async_trait]
pub trait TargetReader: Send + std::fmt::Debug {
    /// 📤 Next target, or `None` when there will never be another one.
    async fn pop(&mut self, cancel: &CancellationToken)
    -> Result<Option<ObjectTarget>, ConnectorError>;
}

/// 🎭 The two discovery modes behind one `pop`.
#[derive(Debug)]
pub enum TargetReaderBackend {
    Listing(ListingTargetReader),
    Notification(NotificationTargetReader),
}

#[async_trait]
impl TargetReader for TargetReaderBackend {
    async fn pop(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<ObjectTarget>, ConnectorError> {
        match self {
            TargetReaderBackend::Listing(reader) => reader.pop(cancel).await,
            TargetReaderBackend::Notification(reader) => reader.pop(cancel).await,
        }
    }
}
