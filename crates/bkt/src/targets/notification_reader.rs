//! 📨 NotificationTargetReader — turns upload notifications into targets.
//!
//! 🎬 A file lands in a bucket. The bucket tells Pub/Sub. Pub/Sub tells our subscriber
//! task. The subscriber task drops it in a queue. We pick it up here, squint at it, and
//! decide whether it is a real finished upload or just noise.
//!
//! 🧠 Knowledge graph:
//! - Only `OBJECT_FINALIZE` events count.
//! - `JSON_API_V1` payloads carry the object size; size `"0"` is a placeholder object
//!   (gcsfuse loves these) and is skipped. Other payload formats can't be size-checked.
//! - `bucketId`, `objectId` and an integer `objectGeneration` are mandatory.
//! - Rejected notifications are acked so they stop coming back, then reported as
//!   `InvalidNotification`. The caller just pulls again.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{AckChain, ObjectDeletion, ObjectTarget, TargetReader};
use crate::backends::{Notification, ObjectStoreClient};
use crate::error::ConnectorError;

const FINALIZE_EVENT: &str = "OBJECT_FINALIZE";
const JSON_PAYLOAD: &str = "JSON_API_V1";

/// 📨 Infinite target reader over the subscriber's queue.
#[derive(Debug)]
pub struct NotificationTargetReader {
    rx: async_channel::Receiver<Notification>,
    store: Arc<dyn ObjectStoreClient>,
    delete_objects: bool,
}

impl NotificationTargetReader {
    pub fn new(
        rx: async_channel::Receiver<Notification>,
        store: Arc<dyn ObjectStoreClient>,
        delete_objects: bool,
    ) -> Self {
        Self {
            rx,
            store,
            delete_objects,
        }
    }

    fn target_for(&self, message: Notification) -> Result<ObjectTarget, String> {
        let (bucket, key, generation) = validate(&message)?;
        let then_delete = self
            .delete_objects
            .then(|| ObjectDeletion::new(self.store.clone(), bucket.clone(), key.clone()));
        Ok(ObjectTarget {
            key,
            bucket,
            generation,
            chain: AckChain::Notification {
                message,
                then_delete,
            },
        })
    }
}

fn required<'a>(message: &'a Notification, name: &str) -> Result<&'a str, String> {
    message
        .attribute(name)
        .ok_or_else(|| format!("notification is missing the {name} attribute"))
}

/// 🔍 The whole validation pipeline. `Err` carries the human-readable rejection reason.
fn validate(message: &Notification) -> Result<(String, String, i64), String> {
    let event_type = required(message, "eventType")?;
    if event_type != FINALIZE_EVENT {
        return Err(format!("not an \"{FINALIZE_EVENT}\" eventType (got \"{event_type}\")"));
    }

    let payload_format = required(message, "payloadFormat")?;
    if payload_format == JSON_PAYLOAD {
        let payload: serde_json::Value = serde_json::from_slice(&message.data)
            .map_err(|err| format!("notification payload is not valid JSON: {err}"))?;
        let size = payload
            .get("size")
            .ok_or_else(|| "couldn't find size in notification payload json".to_string())?;
        // -- 🕳️ GCS sends the size as a string; be forgiving if someone sends a number
        let empty = match size {
            serde_json::Value::String(size) => size == "0",
            serde_json::Value::Number(size) => size.as_u64() == Some(0),
            _ => false,
        };
        if empty {
            return Err("ignoring notification for object with size 0".to_string());
        }
    } else {
        debug!("📨 notification payload format is '{payload_format}', can't check object size");
    }

    let bucket = required(message, "bucketId")?;
    let key = required(message, "objectId")?;
    let generation = required(message, "objectGeneration")?;
    let generation: i64 = generation
        .parse()
        .map_err(|err| format!("objectGeneration '{generation}' is not an integer: {err}"))?;

    Ok((bucket.to_string(), key.to_string(), generation))
}

#[async_trait]
impl TargetReader for NotificationTargetReader {
    async fn pop(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<ObjectTarget>, ConnectorError> {
        let message = tokio::select! {
            biased;
            received = self.rx.recv() => match received {
                Ok(message) => message,
                Err(_) => {
                    debug!("📪 notification queue closed; the subscriber is gone");
                    return Err(ConnectorError::NotConnected);
                }
            },
            _ = cancel.cancelled() => {
                debug!("⏱️ gave up waiting for a notification");
                return Err(ConnectorError::Timeout);
            }
        };
        debug!("📨 received notification {} {:?}", message.id, message.attributes);

        // -- 🧾 the message moves into the target on success, so keep a handle for rejection
        let receipt = message.clone();
        match self.target_for(message) {
            Ok(target) => Ok(Some(target)),
            Err(reason) => {
                error!("💀 couldn't extract an object target from notification {}: {reason}", receipt.id);
                if let Err(err) = receipt.ack() {
                    warn!("⚠️ failed to ack rejected notification {}: {err:#}", receipt.id);
                }
                Err(ConnectorError::InvalidNotification(reason))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::backends::{InMemoryNotifications, InMemoryObjectStore, NotificationOutcome};

    fn finalize_attributes(bucket: &str, key: &str, generation: &str) -> HashMap<String, String> {
        HashMap::from([
            ("eventType".to_string(), "OBJECT_FINALIZE".to_string()),
            ("payloadFormat".to_string(), "JSON_API_V1".to_string()),
            ("bucketId".to_string(), bucket.to_string()),
            ("objectId".to_string(), key.to_string()),
            ("objectGeneration".to_string(), generation.to_string()),
        ])
    }

    struct Fixture {
        feed: InMemoryNotifications,
        tx: async_channel::Sender<Notification>,
        reader: NotificationTargetReader,
    }

    impl Fixture {
        fn new(delete_objects: bool) -> Self {
            let (tx, rx) = async_channel::bounded(8);
            let store = Arc::new(InMemoryObjectStore::new());
            Self {
                feed: InMemoryNotifications::new(),
                tx,
                reader: NotificationTargetReader::new(rx, store, delete_objects),
            }
        }

        async fn offer(&self, attributes: HashMap<String, String>, data: &str) -> String {
            let message = self.feed.message(attributes, data.to_string());
            let id = message.id.clone();
            self.tx.send(message).await.expect("💀 queue should accept");
            id
        }

        async fn rejection(&mut self, attributes: HashMap<String, String>, data: &str) -> String {
            let id = self.offer(attributes, data).await;
            let result = self.reader.pop(&CancellationToken::new()).await;
            let reason = match result {
                Err(ConnectorError::InvalidNotification(reason)) => reason,
                other => panic!("💀 expected a rejection, got {other:?}"),
            };
            assert_eq!(self.feed.outcome(&id), Some(NotificationOutcome::Acked));
            reason
        }
    }

    #[tokio::test]
    async fn the_one_where_a_real_upload_becomes_a_target() -> anyhow::Result<()> {
        let mut fx = Fixture::new(true);
        let id = fx
            .offer(finalize_attributes("bucket", "a.json", "7"), r#"{"size":"12"}"#)
            .await;

        let target = fx
            .reader
            .pop(&CancellationToken::new())
            .await?
            .expect("💀 a target should come out");
        assert_eq!(target.bucket, "bucket");
        assert_eq!(target.key, "a.json");
        assert_eq!(target.generation, 7);
        assert!(matches!(
            target.chain,
            AckChain::Notification {
                then_delete: Some(_),
                ..
            }
        ));
        // 🧪 nothing resolved until the target is acked
        assert_eq!(fx.feed.outcome(&id), None);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_only_finalize_events_count() {
        let mut fx = Fixture::new(false);
        let mut attributes = finalize_attributes("b", "k", "1");
        attributes.insert("eventType".into(), "OBJECT_DELETE".into());
        let reason = fx.rejection(attributes, r#"{"size":"5"}"#).await;
        assert!(reason.contains("OBJECT_FINALIZE"));
    }

    #[tokio::test]
    async fn the_one_where_empty_objects_are_ignored() {
        let mut fx = Fixture::new(false);
        let reason = fx
            .rejection(finalize_attributes("b", "k", "1"), r#"{"size":"0"}"#)
            .await;
        assert!(reason.contains("size 0"));
    }

    #[tokio::test]
    async fn the_one_where_attributes_go_missing() {
        let mut fx = Fixture::new(false);
        for missing in ["eventType", "payloadFormat", "bucketId", "objectId", "objectGeneration"] {
            let mut attributes = finalize_attributes("b", "k", "1");
            attributes.remove(missing);
            let reason = fx.rejection(attributes, r#"{"size":"5"}"#).await;
            assert!(reason.contains(missing), "reason '{reason}' should name {missing}");
        }
    }

    #[tokio::test]
    async fn the_one_where_the_generation_is_not_a_number() {
        let mut fx = Fixture::new(false);
        let reason = fx
            .rejection(finalize_attributes("b", "k", "seven"), r#"{"size":"5"}"#)
            .await;
        assert!(reason.contains("objectGeneration"));
    }

    #[tokio::test]
    async fn the_one_where_json_without_a_size_is_rejected() {
        let mut fx = Fixture::new(false);
        let reason = fx
            .rejection(finalize_attributes("b", "k", "1"), r#"{"name":"k"}"#)
            .await;
        assert!(reason.contains("size"));
    }

    #[tokio::test]
    async fn the_one_where_other_payload_formats_skip_the_size_check() -> anyhow::Result<()> {
        let mut fx = Fixture::new(false);
        let mut attributes = finalize_attributes("b", "k", "3");
        attributes.insert("payloadFormat".into(), "NONE".into());
        fx.offer(attributes, "").await;

        let target = fx.reader.pop(&CancellationToken::new()).await?;
        assert_eq!(target.map(|t| t.generation), Some(3));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_waiting_is_cut_short() {
        let mut fx = Fixture::new(false);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            fx.reader.pop(&cancel).await,
            Err(ConnectorError::Timeout)
        ));

        fx.tx.close();
        assert!(matches!(
            fx.reader.pop(&CancellationToken::new()).await,
            Err(ConnectorError::NotConnected)
        ));
    }
}
