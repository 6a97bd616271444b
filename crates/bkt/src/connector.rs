//! 🔌 Connector — the front door. `connect`, then `pull` until you're bored, then `close`.
//!
//! 🎬 COLD OPEN: INT. DATA PIPELINE — 2:47AM
//!
//! The downstream consumer asks for one more batch. The connector checks its pockets:
//! an object half-decoded from the last call. It hands over the next line. The consumer
//! asks again. The object runs dry. Without so much as a shrug, the connector closes it,
//! pops the next target, fetches its attributes, checks its generation, opens it, and
//! hands over the first line of *that* one. Same call. The consumer never noticed.
//!
//! 🧠 Knowledge graph:
//! - State machine `Unconnected → Connected(Session) → Closed` behind one async mutex.
//!   Every `pull` holds the lock for its whole duration, so pulls never interleave.
//! - A `Session` owns the [`TargetReaderBackend`], at most one `PendingObject` (the open
//!   decoder), and in subscription mode the [`SubscriberWorker`] task feeding the queue.
//! - Failures before a decoder exists (attributes, fencing, open, decoder construction)
//!   resolve the target's ack with that failure right here. After that, the decoder's
//!   [`AckTracker`] owns the ack.
//! - `close` tears down step by step: pending decoder, storage client, subscriber task,
//!   notification client. A failed step stops the teardown; calling `close` again resumes.
//!
//! ⚠️ A pull cancelled (or dropped) mid-decode leaves the pending object where it was. The
//! next pull picks up from the same decoder.

use std::fmt;
use std::sync::Arc;

use anyhow::anyhow;
use chrono::SecondsFormat;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::app_config::ConnectorConfig;
use crate::backends::{
    NotificationClient, ObjectAttributes, ObjectStoreClient, ReceiveSettings, SubscriptionRef,
};
use crate::codecs::{
    AckTracker, BuiltinCodec, CodecSpec, Decoder, DecoderFactory, Interrupted, UnitAck,
    is_empty_input,
};
use crate::common::MessageBatch;
use crate::error::ConnectorError;
use crate::targets::{
    ListingTargetReader, NotificationTargetReader, ObjectTarget, TargetReader,
    TargetReaderBackend,
};
use crate::workers::{SubscriberWorker, Worker};

/// 📖 The object currently being decoded.
struct PendingObject {
    key: String,
    bucket: String,
    generation: i64,
    attributes: ObjectAttributes,
    decoder: Box<dyn Decoder>,
    extracted: usize,
}

// -- 🎭 manual Debug: `dyn Decoder` has no opinion on how it should be printed
impl fmt::Debug for PendingObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingObject")
            .field("key", &self.key)
            .field("bucket", &self.bucket)
            .field("generation", &self.generation)
            .field("extracted", &self.extracted)
            .finish_non_exhaustive()
    }
}

impl PendingObject {
    /// 🏷️ Stamp the object's metadata onto every part of a freshly decoded unit.
    fn tag(&self, batch: &mut MessageBatch) {
        let updated = &self.attributes.updated;
        for part in batch.iter_mut() {
            part.set_meta("gcs_key", self.key.as_str());
            part.set_meta("gcs_bucket", self.bucket.as_str());
            part.set_meta(
                "gcs_last_modified",
                updated.to_rfc3339_opts(SecondsFormat::Secs, true),
            );
            part.set_meta("gcs_last_modified_unix", updated.timestamp());
            part.set_meta("gcs_content_type", self.attributes.content_type.as_str());
            part.set_meta(
                "gcs_content_encoding",
                self.attributes.content_encoding.as_str(),
            );
            for (name, value) in &self.attributes.metadata {
                part.set_meta(name.as_str(), value.as_str());
            }
        }
    }

    /// 🧹 Close the decoder at end-of-input. Failures are logged, not returned.
    async fn retire(mut self) {
        if let Err(err) = self.decoder.close().await {
            warn!("⚠️ failed to close decoder for '{}/{}': {err:#}", self.bucket, self.key);
        }
        if self.extracted == 0 {
            debug!("🕳️ extracted zero messages from '{}/{}'", self.bucket, self.key);
        } else {
            trace!(
                "🏁 finished '{}/{}' after {} units",
                self.bucket, self.key, self.extracted
            );
        }
    }
}

/// 📡 The running subscriber task and the client it drives.
#[derive(Debug)]
struct SubscriberHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<anyhow::Result<()>>>,
    client: Arc<dyn NotificationClient>,
    client_open: bool,
}

impl Drop for SubscriberHandle {
    fn drop(&mut self) {
        // -- 🔌 a connector dropped without `close` still stops its receive loop
        self.cancel.cancel();
    }
}

#[derive(Debug)]
struct Session {
    reader: TargetReaderBackend,
    pending: Option<PendingObject>,
    storage_open: bool,
    subscriber: Option<SubscriberHandle>,
}

#[derive(Debug)]
enum ConnectionState {
    Unconnected,
    Connected(Session),
    Closed,
}

/// 🪣 The object-store ingestion connector.
///
/// Collaborators are injected: an [`ObjectStoreClient`] always, a [`NotificationClient`]
/// when `pubsub.subscription` is configured. The decoder factory comes from the `codec`
/// setting unless [`Connector::with_decoder_factory`] overrides it.
pub struct Connector {
    config: ConnectorConfig,
    storage: Arc<dyn ObjectStoreClient>,
    notifications: Option<Arc<dyn NotificationClient>>,
    decoders: Arc<dyn DecoderFactory>,
    state: Mutex<ConnectionState>,
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("bucket", &self.config.bucket)
            .field("subscription", &self.config.pubsub.subscription)
            .field("decoders", &self.decoders)
            .finish_non_exhaustive()
    }
}

impl Connector {
    /// 🏗️ Validate the config and resolve the codec. Nothing touches the network yet.
    pub fn new(
        config: ConnectorConfig,
        storage: Arc<dyn ObjectStoreClient>,
        notifications: Option<Arc<dyn NotificationClient>>,
    ) -> Result<Self, ConnectorError> {
        config.validate()?;
        let spec: CodecSpec = config.codec.parse()?;
        let decoders = Arc::new(BuiltinCodec::new(spec, config.max_buffer));
        Ok(Self {
            config,
            storage,
            notifications,
            decoders,
            state: Mutex::new(ConnectionState::Unconnected),
        })
    }

    /// 🧩 Swap the configured codec for a custom one.
    pub fn with_decoder_factory(mut self, decoders: Arc<dyn DecoderFactory>) -> Self {
        self.decoders = decoders;
        self
    }

    /// 🔌 Start discovering targets. Idempotent while connected; refused after `close`.
    pub async fn connect(&self) -> Result<(), ConnectorError> {
        let mut state = self.state.lock().await;
        match &*state {
            ConnectionState::Connected(_) => return Ok(()),
            ConnectionState::Closed => return Err(ConnectorError::Closed),
            ConnectionState::Unconnected => {}
        }
        let session = self.open_session().await?;
        *state = ConnectionState::Connected(session);
        Ok(())
    }

    async fn open_session(&self) -> Result<Session, ConnectorError> {
        if !self.config.uses_subscription() {
            let prefix = Some(self.config.prefix.clone()).filter(|p| !p.is_empty());
            let reader = ListingTargetReader::new(
                self.storage.clone(),
                self.config.bucket.clone(),
                prefix,
                self.config.delete_objects,
            )
            .await?;
            info!(
                "🚀 connected: listing bucket '{}' (prefix '{}')",
                self.config.bucket, self.config.prefix
            );
            return Ok(Session {
                reader: TargetReaderBackend::Listing(reader),
                pending: None,
                storage_open: true,
                subscriber: None,
            });
        }

        let client = self.notifications.clone().ok_or_else(|| {
            ConnectorError::Config(
                "pubsub.subscription is set but no notification client was provided".to_string(),
            )
        })?;
        let pubsub = &self.config.pubsub;
        let settings = ReceiveSettings {
            max_outstanding_messages: pubsub.max_outstanding_messages,
            max_outstanding_bytes: pubsub.max_outstanding_bytes,
            synchronous: pubsub.sync,
        };
        let subscription = SubscriptionRef {
            project: pubsub.project.clone(),
            subscription: pubsub.subscription.clone(),
        };
        // -- 📬 a zero-capacity async_channel panics; one slot is the floor
        let (tx, rx) = async_channel::bounded(pubsub.max_outstanding_messages.max(1));
        let cancel = CancellationToken::new();
        let task = SubscriberWorker::new(
            client.clone(),
            subscription,
            settings,
            cancel.clone(),
            tx,
        )
        .start();
        info!(
            "🚀 connected: receiving notifications from projects/{}/subscriptions/{}",
            pubsub.project, pubsub.subscription
        );

        Ok(Session {
            reader: TargetReaderBackend::Notification(NotificationTargetReader::new(
                rx,
                self.storage.clone(),
                self.config.delete_objects,
            )),
            pending: None,
            storage_open: true,
            subscriber: Some(SubscriberHandle {
                cancel,
                task: Some(task),
                client,
                client_open: true,
            }),
        })
    }

    /// 📦 The next decoded unit and its ack.
    ///
    /// Crosses object boundaries transparently. `cancel` bounds the wait for a notification
    /// or for object bytes (⇒ [`ConnectorError::Timeout`]). An interrupted decode keeps its
    /// place for the next pull.
    pub async fn pull(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(MessageBatch, UnitAck), ConnectorError> {
        let mut state = self.state.lock().await;
        let session = match &mut *state {
            ConnectionState::Connected(session) => session,
            _ => return Err(ConnectorError::NotConnected),
        };

        loop {
            let pending = match &mut session.pending {
                Some(pending) => pending,
                empty => empty.insert(self.open_next(&mut session.reader, cancel).await?),
            };

            match pending.decoder.next(cancel).await {
                Ok(Some((parts, ack))) => {
                    pending.extracted += 1;
                    let mut batch = MessageBatch::new(parts);
                    pending.tag(&mut batch);
                    return Ok((batch, ack));
                }
                Err(err) if err.is::<Interrupted>() => {
                    trace!("⏱️ pull cancelled mid-object; '{}/{}' stays open", pending.bucket, pending.key);
                    return Err(ConnectorError::Timeout);
                }
                Ok(None) => {
                    if let Some(done) = session.pending.take() {
                        done.retire().await;
                    }
                }
                Err(err) => {
                    if let Some(mut failed) = session.pending.take() {
                        if let Err(close_err) = failed.decoder.close().await {
                            warn!(
                                "⚠️ failed to close decoder for '{}/{}' after a decode error: {close_err:#}",
                                failed.bucket, failed.key
                            );
                        }
                        return Err(ConnectorError::Decode(err.context(format!(
                            "decoding '{}/{}' failed after {} units",
                            failed.bucket, failed.key, failed.extracted
                        ))));
                    }
                    return Err(ConnectorError::Decode(err));
                }
            }
        }
    }

    /// 🎯 Pop a target and open it. Any failure resolves the target's ack with that failure.
    async fn open_next(
        &self,
        reader: &mut TargetReaderBackend,
        cancel: &CancellationToken,
    ) -> Result<PendingObject, ConnectorError> {
        let target = reader.pop(cancel).await?.ok_or(ConnectorError::EndOfStream)?;
        let (bucket, key, generation) = (target.bucket.clone(), target.key.clone(), target.generation);
        trace!("🎯 opening '{bucket}/{key}' (generation {generation})");

        let attributes = match self.storage.attributes(&bucket, &key).await {
            Ok(attributes) => attributes,
            Err(source) => {
                abandon(target, &source).await;
                return Err(ConnectorError::Storage { bucket, key, source });
            }
        };

        if generation != 0 && generation != attributes.generation {
            let mismatch = ConnectorError::GenerationMismatch {
                bucket,
                key,
                expected: generation,
                actual: attributes.generation,
            };
            abandon(target, &anyhow!("{mismatch}")).await;
            return Err(mismatch);
        }

        trace!("📏 '{bucket}/{key}' is {} bytes", attributes.size);
        let stream = match self.storage.open_reader(&bucket, &key).await {
            Ok(stream) => stream,
            Err(source) => {
                abandon(target, &source).await;
                return Err(ConnectorError::Storage { bucket, key, source });
            }
        };

        let ObjectTarget { chain, .. } = target;
        let acks = AckTracker::new(chain);
        let decoder = match self.decoders.open(&key, stream, acks.clone()).await {
            Ok(decoder) => decoder,
            Err(source) => {
                if let Err(ack_err) = acks.fail(&source).await {
                    warn!("⚠️ failed to acknowledge '{bucket}/{key}' after a decoder error: {ack_err:#}");
                }
                // -- 🕳️ end-of-input before the first unit is an empty object, never end-of-stream
                return Err(if is_empty_input(&source) {
                    ConnectorError::EmptyObject { key }
                } else {
                    ConnectorError::Decode(
                        source.context(format!("failed to open decoder for '{bucket}/{key}'")),
                    )
                });
            }
        };

        Ok(PendingObject {
            key,
            bucket,
            generation,
            attributes,
            decoder,
            extracted: 0,
        })
    }

    /// 🧹 Release everything, in order. Safe to call again after a partial failure, and a
    /// no-op once closed.
    pub async fn close(&self) -> Result<(), ConnectorError> {
        let mut state = self.state.lock().await;
        if matches!(*state, ConnectionState::Unconnected) {
            *state = ConnectionState::Closed;
            return Ok(());
        }
        let session = match &mut *state {
            ConnectionState::Connected(session) => session,
            _ => return Ok(()),
        };

        if let Some(mut pending) = session.pending.take() {
            if let Err(err) = pending.decoder.close().await {
                session.pending = Some(pending);
                return Err(ConnectorError::Close(err.context("closing the pending decoder")));
            }
        }

        if session.storage_open {
            self.storage
                .close()
                .await
                .map_err(|err| ConnectorError::Close(err.context("closing the storage client")))?;
            session.storage_open = false;
        }

        if let Some(subscriber) = session.subscriber.as_mut() {
            subscriber.cancel.cancel();
            if let Some(task) = subscriber.task.take() {
                // -- 📡 subscription errors were already logged by the worker
                if let Err(join_err) = task.await {
                    return Err(ConnectorError::Close(
                        anyhow::Error::new(join_err).context("joining the subscriber task"),
                    ));
                }
            }
            if subscriber.client_open {
                subscriber.client.close().await.map_err(|err| {
                    ConnectorError::Close(err.context("closing the notification client"))
                })?;
                subscriber.client_open = false;
            }
        }

        debug!("🗑️ connector closed");
        *state = ConnectionState::Closed;
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        matches!(*self.state.lock().await, ConnectionState::Connected(_))
    }

    pub async fn is_closed(&self) -> bool {
        matches!(*self.state.lock().await, ConnectionState::Closed)
    }
}

/// 💀 Resolve a target that never made it to a decoder. Its own ack failing is logged:
/// the caller needs the reason the target failed, not the reason the cleanup did.
async fn abandon(target: ObjectTarget, failure: &anyhow::Error) {
    let (bucket, key) = (target.bucket.clone(), target.key.clone());
    debug!("🔄 abandoning '{bucket}/{key}': {failure:#}");
    if let Err(err) = target.ack(Some(failure)).await {
        warn!("⚠️ failed to acknowledge abandoned target '{bucket}/{key}': {err:#}");
    }
}
