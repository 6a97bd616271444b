//! # Previously, on bkt...
//!
//! 🎬 The bucket was in the cloud. The tests were on a laptop on a train with no WiFi.
//! Someone had to bring the bucket to the laptop. Someone had to write a backend so simple
//! it lives entirely in RAM, gone the moment you blink.
//!
//! That someone was this module.
//!
//! `in_mem` provides an [`InMemoryObjectStore`] and an [`InMemoryNotifications`] feed for
//! tests and local development. Both keep receipts: deletions, closes, acks, nacks. Great
//! for assertions, great for trust issues, great for both.
//!
//! ⚠️ This is NOT for production. This is for tests. If you're deploying this
//! to prod, please also deploy a therapist.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    ListPage, ListedObject, MessageHandler, Notification, NotificationClient, NotificationHandle,
    ObjectAttributes, ObjectStoreClient, ObjectStream, ReceiveSettings, SubscriptionRef,
};

// -- 🔒 A poisoned mutex in a test double means a test already panicked. Keep going.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================
//  🪣 InMemoryObjectStore
// ============================================================

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    attributes: ObjectAttributes,
}

#[derive(Debug, Default)]
struct StoreState {
    // 🧠 keyed by (bucket, key) so a range over one bucket comes back in key order for free
    objects: BTreeMap<(String, String), StoredObject>,
    deletions: Vec<(String, String)>,
    list_failure: Option<String>,
    close_failure: Option<String>,
    list_calls: usize,
    close_calls: usize,
    next_generation: i64,
}

/// 📦 A bucket that never forgets. Unless you ask it to delete something. Then it forgets.
///
/// Every `put` bumps a store-wide generation counter, so overwriting a key changes its
/// generation exactly like a real versioned store would.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    state: Mutex<StoreState>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 📥 Store (or overwrite) an object. Returns its new generation.
    pub fn put(&self, bucket: &str, key: &str, data: impl Into<Vec<u8>>) -> i64 {
        let data = data.into();
        let mut state = lock(&self.state);
        state.next_generation += 1;
        let generation = state.next_generation;
        let attributes = ObjectAttributes {
            bucket: bucket.to_string(),
            key: key.to_string(),
            content_type: "application/octet-stream".to_string(),
            content_encoding: String::new(),
            updated: DateTime::<Utc>::from_timestamp(1_700_000_000 + generation, 0)
                .unwrap_or_default(),
            metadata: BTreeMap::new(),
            generation,
            size: data.len() as u64,
        };
        state.objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject { data, attributes },
        );
        generation
    }

    /// 🔧 Tweak the attributes of a stored object (content type, metadata, generation...).
    /// Returns false when there is no such object.
    pub fn update_attributes(
        &self,
        bucket: &str,
        key: &str,
        update: impl FnOnce(&mut ObjectAttributes),
    ) -> bool {
        let mut state = lock(&self.state);
        match state.objects.get_mut(&(bucket.to_string(), key.to_string())) {
            Some(object) => {
                update(&mut object.attributes);
                true
            }
            None => false,
        }
    }

    /// 💀 Make every following `list_page` call fail with `reason`.
    pub fn fail_listing(&self, reason: &str) {
        lock(&self.state).list_failure = Some(reason.to_string());
    }

    /// 🩹 Let listing work again after [`InMemoryObjectStore::fail_listing`].
    pub fn heal_listing(&self) {
        lock(&self.state).list_failure = None;
    }

    /// 💀 Make the next `close` fail with `reason`. The one after that works.
    pub fn fail_next_close(&self, reason: &str) {
        lock(&self.state).close_failure = Some(reason.to_string());
    }

    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        lock(&self.state)
            .objects
            .contains_key(&(bucket.to_string(), key.to_string()))
    }

    /// 🧾 Every successful deletion, in order.
    pub fn deletions(&self) -> Vec<(String, String)> {
        lock(&self.state).deletions.clone()
    }

    pub fn list_calls(&self) -> usize {
        lock(&self.state).list_calls
    }

    pub fn close_calls(&self) -> usize {
        lock(&self.state).close_calls
    }

    fn stored(&self, bucket: &str, key: &str) -> Result<StoredObject> {
        lock(&self.state)
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| anyhow!("💀 object '{bucket}/{key}' not found. It was here a second ago. Probably."))
    }
}

#[async_trait]
impl ObjectStoreClient for InMemoryObjectStore {
    async fn list_page(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        cursor: Option<&str>,
        max_results: usize,
    ) -> Result<ListPage> {
        let mut state = lock(&self.state);
        state.list_calls += 1;
        if let Some(reason) = &state.list_failure {
            bail!("{reason}");
        }

        let mut matching = state
            .objects
            .keys()
            .filter(|(b, k)| {
                b == bucket
                    && prefix.is_none_or(|p| k.starts_with(p))
                    && cursor.is_none_or(|c| k.as_str() > c)
            })
            .map(|(b, k)| ListedObject {
                bucket: b.clone(),
                key: k.clone(),
            });

        let objects: Vec<ListedObject> = matching.by_ref().take(max_results).collect();
        let has_more = matching.next().is_some();
        let next_cursor = match (has_more, objects.last()) {
            (true, Some(last)) => Some(last.key.clone()),
            _ => None,
        };
        Ok(ListPage {
            objects,
            next_cursor,
        })
    }

    async fn attributes(&self, bucket: &str, key: &str) -> Result<ObjectAttributes> {
        Ok(self.stored(bucket, key)?.attributes)
    }

    async fn open_reader(&self, bucket: &str, key: &str) -> Result<ObjectStream> {
        let object = self.stored(bucket, key)?;
        Ok(Box::new(std::io::Cursor::new(object.data)))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let mut state = lock(&self.state);
        let id = (bucket.to_string(), key.to_string());
        if state.objects.remove(&id).is_none() {
            bail!("💀 cannot delete '{bucket}/{key}': no such object");
        }
        state.deletions.push(id);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = lock(&self.state);
        state.close_calls += 1;
        if let Some(reason) = state.close_failure.take() {
            bail!("{reason}");
        }
        Ok(())
    }
}

// ============================================================
//  📨 InMemoryNotifications
// ============================================================

/// 📬 How a published notification was eventually resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationOutcome {
    Acked,
    Nacked,
}

#[derive(Debug, Default)]
struct LedgerState {
    outcomes: Vec<(String, NotificationOutcome)>,
    // -- 💀 when set, every ack/nack fails with this and records nothing
    resolve_failure: Option<String>,
}

type Ledger = Arc<Mutex<LedgerState>>;

#[derive(Debug)]
struct LedgerHandle {
    id: String,
    ledger: Ledger,
}

impl LedgerHandle {
    fn record(&self, outcome: NotificationOutcome) -> Result<()> {
        let mut ledger = lock(&self.ledger);
        if let Some(reason) = &ledger.resolve_failure {
            bail!("{reason}");
        }
        ledger.outcomes.push((self.id.clone(), outcome));
        Ok(())
    }
}

impl NotificationHandle for LedgerHandle {
    fn ack(&self) -> Result<()> {
        self.record(NotificationOutcome::Acked)
    }

    fn nack(&self) -> Result<()> {
        self.record(NotificationOutcome::Nacked)
    }
}

#[derive(Debug)]
enum Feed {
    Message(Notification),
    HangUp(String),
}

/// 📨 A subscription that lives in RAM. Publish into it, receive out of it, read the receipts.
#[derive(Debug)]
pub struct InMemoryNotifications {
    tx: async_channel::Sender<Feed>,
    rx: async_channel::Receiver<Feed>,
    ledger: Ledger,
    next_id: AtomicU64,
    last_settings: Mutex<Option<ReceiveSettings>>,
    closed: AtomicBool,
}

impl Default for InMemoryNotifications {
    fn default() -> Self {
        let (tx, rx) = async_channel::unbounded();
        Self {
            tx,
            rx,
            ledger: Arc::new(Mutex::new(LedgerState::default())),
            next_id: AtomicU64::new(1),
            last_settings: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }
}

impl InMemoryNotifications {
    pub fn new() -> Self {
        Self::default()
    }

    /// 📨 Mint a ledger-tracked message without queueing it. Handy for handing a
    /// notification straight to the code under test.
    pub fn message(&self, attributes: HashMap<String, String>, data: impl Into<Vec<u8>>) -> Notification {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let handle = Arc::new(LedgerHandle {
            id: id.clone(),
            ledger: self.ledger.clone(),
        });
        Notification::new(id, attributes, data.into(), handle)
    }

    /// 📤 Queue a message for delivery. Returns its id.
    pub fn publish(&self, attributes: HashMap<String, String>, data: impl Into<Vec<u8>>) -> String {
        let message = self.message(attributes, data);
        let id = message.id.clone();
        if self.tx.try_send(Feed::Message(message)).is_err() {
            warn!("📪 in-memory feed refused notification {id}; nobody will ever read it");
        }
        id
    }

    /// 💀 After every message queued so far, the receive loop fails with `reason`.
    pub fn hang_up(&self, reason: &str) {
        if self.tx.try_send(Feed::HangUp(reason.to_string())).is_err() {
            warn!("📪 in-memory feed refused to hang up. Rude.");
        }
    }

    /// 💀 Make every following ack/nack fail with `reason`.
    pub fn fail_resolutions(&self, reason: &str) {
        lock(&self.ledger).resolve_failure = Some(reason.to_string());
    }

    /// 🧾 The first resolution recorded for `id`, if any.
    pub fn outcome(&self, id: &str) -> Option<NotificationOutcome> {
        lock(&self.ledger)
            .outcomes
            .iter()
            .find(|(recorded, _)| recorded == id)
            .map(|(_, outcome)| *outcome)
    }

    /// 🧾 Every resolution, in the order they happened.
    pub fn outcomes(&self) -> Vec<(String, NotificationOutcome)> {
        lock(&self.ledger).outcomes.clone()
    }

    pub fn last_settings(&self) -> Option<ReceiveSettings> {
        *lock(&self.last_settings)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationClient for InMemoryNotifications {
    async fn receive(
        &self,
        subscription: &SubscriptionRef,
        settings: ReceiveSettings,
        cancel: CancellationToken,
        handler: &dyn MessageHandler,
    ) -> Result<()> {
        debug!(
            "📡 in-memory receive loop started for projects/{}/subscriptions/{}",
            subscription.project, subscription.subscription
        );
        *lock(&self.last_settings) = Some(settings);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                feed = self.rx.recv() => match feed {
                    Ok(Feed::Message(message)) => handler.handle(message).await,
                    Ok(Feed::HangUp(reason)) => bail!("{reason}"),
                    // -- 🏁 we hold a sender ourselves, so this only happens during teardown
                    Err(_) => return Ok(()),
                },
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
