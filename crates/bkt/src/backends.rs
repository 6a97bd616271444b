//! 🔌 Backends — where the real I/O happens.
//!
//! 🪣 Object stores hold the bytes. 📨 Notification clients tell us which bytes just landed.
//! The connector never constructs either of them; they are handed in, already configured,
//! like a rental car with the seat adjusted for someone else.
//!
//! 🧠 Knowledge graph:
//! - [`ObjectStoreClient`]: paginated prefix listing, attribute fetch, read stream, delete, close.
//! - [`NotificationClient`]: a receive loop that calls a [`MessageHandler`] per message and
//!   returns `Ok(())` when its cancellation token fires.
//! - [`Notification`]: one message with attributes, payload, and one-shot `ack`/`nack`.
//! - Implementations: [`in_mem`] (tests, local dev) and [`object_storage`] (GCS / local disk
//!   through the `object_store` crate).
//!
//! 🦆 The duck is here because every file must have one. This is law.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

pub mod in_mem;
pub mod object_storage;

pub use self::in_mem::{InMemoryNotifications, InMemoryObjectStore, NotificationOutcome};
pub use self::object_storage::{ObjectStoreBackend, StoreKind};

// 🧠 The byte stream handed to decoders. Boxed because every backend has its own opaque
// reader type, and struct fields can't hold `impl AsyncRead`.
pub type ObjectStream = Box<dyn AsyncRead + Send + Unpin>;

// ===== Object store =====

/// 📜 One object as seen by a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedObject {
    pub bucket: String,
    pub key: String,
}

/// 📄 One page of a listing, plus where to resume.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<ListedObject>,
    /// 🔖 Exclusive start-after cursor for the next page. `None` = the listing is exhausted.
    pub next_cursor: Option<String>,
}

/// 🏷️ Attribute snapshot of one object, taken when we open it.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectAttributes {
    pub bucket: String,
    pub key: String,
    pub content_type: String,
    pub content_encoding: String,
    pub updated: DateTime<Utc>,
    /// 🧾 User-defined metadata, verbatim.
    pub metadata: BTreeMap<String, String>,
    /// 🔒 Fencing generation. 0 when the store doesn't version objects.
    pub generation: i64,
    pub size: u64,
}

/// 🪣 The object store as far as the connector is concerned.
///
/// # Contract 📜
/// - `list_page` returns at most `max_results` objects whose keys start with `prefix`
///   (when given) and sort strictly after `cursor` (when given), in key order.
/// - `close` releases the client. Calls after `close` may fail; the connector won't make them.
#[async_trait]
pub trait ObjectStoreClient: Send + Sync + std::fmt::Debug {
    async fn list_page(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        cursor: Option<&str>,
        max_results: usize,
    ) -> Result<ListPage>;

    async fn attributes(&self, bucket: &str, key: &str) -> Result<ObjectAttributes>;

    async fn open_reader(&self, bucket: &str, key: &str) -> Result<ObjectStream>;

    async fn delete(&self, bucket: &str, key: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

// ===== Notifications =====

/// 📬 The thing a notification transport must be able to do to a delivered message.
pub trait NotificationHandle: Send + Sync + std::fmt::Debug {
    fn ack(&self) -> Result<()>;
    fn nack(&self) -> Result<()>;
}

/// 📨 One delivered notification.
///
/// Cloning shares the underlying delivery; `ack`/`nack` are one-shot across all clones.
/// Whichever resolution lands first wins, the rest are ignored and return `Ok`.
#[derive(Debug, Clone)]
pub struct Notification {
    pub id: String,
    pub attributes: HashMap<String, String>,
    pub data: Vec<u8>,
    handle: Arc<dyn NotificationHandle>,
    resolved: Arc<AtomicBool>,
}

impl Notification {
    pub fn new(
        id: impl Into<String>,
        attributes: HashMap<String, String>,
        data: Vec<u8>,
        handle: Arc<dyn NotificationHandle>,
    ) -> Self {
        Self {
            id: id.into(),
            attributes,
            data,
            handle,
            resolved: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// ✅ Done with it, don't send it again.
    pub fn ack(&self) -> Result<()> {
        if self.resolved.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.handle.ack()
    }

    /// 🔄 Couldn't handle it, please redeliver.
    pub fn nack(&self) -> Result<()> {
        if self.resolved.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.handle.nack()
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }
}

/// 🎛️ Flow-control knobs for a subscription receive loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveSettings {
    pub max_outstanding_messages: usize,
    pub max_outstanding_bytes: usize,
    pub synchronous: bool,
}

/// 🧭 Which subscription to receive from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRef {
    pub project: String,
    pub subscription: String,
}

/// 🤲 Per-message callback invoked by a receive loop.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Notification);
}

/// 📨 A subscription client.
///
/// # Contract 📜
/// - `receive` runs until `cancel` fires (returns `Ok(())`) or the subscription fails (`Err`).
/// - Messages are handed to `handler` in delivery order; the handler resolves them eventually.
#[async_trait]
pub trait NotificationClient: Send + Sync + std::fmt::Debug {
    async fn receive(
        &self,
        subscription: &SubscriptionRef,
        settings: ReceiveSettings,
        cancel: CancellationToken,
        handler: &dyn MessageHandler,
    ) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Default)]
    struct CountingHandle {
        acks: AtomicUsize,
        nacks: AtomicUsize,
    }

    impl NotificationHandle for CountingHandle {
        fn ack(&self) -> Result<()> {
            self.acks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn nack(&self) -> Result<()> {
            self.nacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn the_one_where_the_first_resolution_wins_across_clones() -> Result<()> {
        let handle = Arc::new(CountingHandle::default());
        let message = Notification::new("1", HashMap::new(), Vec::new(), handle.clone());
        let twin = message.clone();

        message.nack()?;
        twin.ack()?;
        message.nack()?;

        assert!(twin.is_resolved());
        assert_eq!(handle.nacks.load(Ordering::SeqCst), 1);
        assert_eq!(handle.acks.load(Ordering::SeqCst), 0);
        Ok(())
    }
}
