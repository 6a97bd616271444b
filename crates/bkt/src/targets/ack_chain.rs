//! 📬 AckChain — what acknowledging an object actually does.
//!
//! Upstream first, then (maybe) delete. If upstream refuses the ack we keep the object:
//! deleting something the notification system will redeliver is how you get 404s at 3am.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;

use crate::backends::{Notification, ObjectStoreClient};

/// 🗑️ A deletion waiting to happen.
#[derive(Debug, Clone)]
pub struct ObjectDeletion {
    store: Arc<dyn ObjectStoreClient>,
    bucket: String,
    key: String,
}

impl ObjectDeletion {
    pub fn new(
        store: Arc<dyn ObjectStoreClient>,
        bucket: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    async fn run(self) -> Result<()> {
        debug!("🗑️ deleting consumed object '{}/{}'", self.bucket, self.key);
        self.store
            .delete(&self.bucket, &self.key)
            .await
            .with_context(|| format!("💀 Failed to delete consumed object '{}/{}'", self.bucket, self.key))
    }
}

/// 📬 The acknowledgment bound to a target.
#[derive(Debug)]
pub enum AckChain {
    /// 🤷 Nothing to do.
    Noop,
    /// 🗑️ Delete on success.
    Delete(ObjectDeletion),
    /// 📨 Ack (success) or nack (failure) the notification, then delete on success if asked to.
    Notification {
        message: Notification,
        then_delete: Option<ObjectDeletion>,
    },
}

impl AckChain {
    /// ✅ Run the chain once. `failure` = the object could not be processed.
    pub async fn resolve(self, failure: Option<&anyhow::Error>) -> Result<()> {
        let deletion = match self {
            AckChain::Noop => None,
            AckChain::Delete(deletion) => Some(deletion),
            AckChain::Notification {
                message,
                then_delete,
            } => {
                match failure {
                    Some(failure) => {
                        debug!("🔄 abandoning notification {} due to: {failure:#}", message.id);
                        message.nack().context("💀 Failed to nack notification")?;
                    }
                    None => message.ack().context("💀 Failed to ack notification")?,
                }
                then_delete
            }
        };

        match (failure, deletion) {
            (None, Some(deletion)) => deletion.run().await,
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use anyhow::anyhow;

    use crate::backends::{InMemoryNotifications, InMemoryObjectStore, NotificationOutcome};

    struct Fixture {
        store: Arc<InMemoryObjectStore>,
        feed: InMemoryNotifications,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(InMemoryObjectStore::new());
            store.put("b", "k", "v");
            Self {
                store,
                feed: InMemoryNotifications::new(),
            }
        }

        fn deletion(&self) -> ObjectDeletion {
            ObjectDeletion::new(self.store.clone() as Arc<dyn ObjectStoreClient>, "b", "k")
        }

        fn delivered(&self) -> Notification {
            self.feed.message(HashMap::new(), "payload")
        }
    }

    #[tokio::test]
    async fn the_one_where_success_acks_then_deletes() -> Result<()> {
        let fx = Fixture::new();
        let message = fx.delivered();
        let id = message.id.clone();

        AckChain::Notification {
            message,
            then_delete: Some(fx.deletion()),
        }
        .resolve(None)
        .await?;

        assert_eq!(fx.feed.outcome(&id), Some(NotificationOutcome::Acked));
        assert_eq!(fx.store.deletions().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_failure_nacks_and_keeps_the_object() -> Result<()> {
        let fx = Fixture::new();
        let message = fx.delivered();
        let id = message.id.clone();

        AckChain::Notification {
            message,
            then_delete: Some(fx.deletion()),
        }
        .resolve(Some(&anyhow!("decode went sideways")))
        .await?;

        assert_eq!(fx.feed.outcome(&id), Some(NotificationOutcome::Nacked));
        assert!(fx.store.contains("b", "k"));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_refused_ack_skips_the_deletion() {
        let fx = Fixture::new();
        let message = fx.delivered();
        fx.feed.fail_resolutions("ack deadline exceeded");

        let result = AckChain::Notification {
            message,
            then_delete: Some(fx.deletion()),
        }
        .resolve(None)
        .await;

        assert!(result.is_err());
        assert!(fx.store.contains("b", "k"));
        assert!(fx.store.deletions().is_empty());
    }

    #[tokio::test]
    async fn the_one_where_a_failed_listing_target_is_not_deleted() -> Result<()> {
        let fx = Fixture::new();
        AckChain::Delete(fx.deletion())
            .resolve(Some(&anyhow!("nope")))
            .await?;
        assert!(fx.store.contains("b", "k"));

        AckChain::Delete(fx.deletion()).resolve(None).await?;
        assert!(!fx.store.contains("b", "k"));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_missing_object_fails_the_deletion() {
        let fx = Fixture::new();
        AckChain::Delete(fx.deletion())
            .resolve(None)
            .await
            .expect("💀 first deletion should work");
        assert!(AckChain::Delete(fx.deletion()).resolve(None).await.is_err());
        assert!(AckChain::Noop.resolve(None).await.is_ok());
    }
}
