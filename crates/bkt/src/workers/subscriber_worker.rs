//! 🎬 *[a subscription hums. somewhere, an upload finishes.]*
//! *[a message is born. it has one job: get into the queue before shutdown.]*
//!
//! 📡 The SubscriberWorker module: sole producer of the notification queue.
//!
//! 🧠 Knowledge graph:
//! - Runs `NotificationClient::receive` until the connector's token is cancelled or the
//!   subscription fails.
//! - Each message is forwarded into a bounded `async_channel`. A full queue applies
//!   backpressure to the receive loop, which is exactly what flow control wants.
//! - A message that can't be queued (cancelled while waiting, or the queue is gone) is
//!   nacked so the subscription redelivers it.
//! - Whatever happens, the queue is closed on the way out so the reader sees `NotConnected`
//!   instead of waiting forever.

use std::sync::Arc;

use anyhow::Result;
use async_channel::Sender;
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::Worker;
use crate::backends::{
    MessageHandler, Notification, NotificationClient, ReceiveSettings, SubscriptionRef,
};

/// 📡 Drives one subscription receive loop into one queue.
#[derive(Debug)]
pub(crate) struct SubscriberWorker {
    client: Arc<dyn NotificationClient>,
    subscription: SubscriptionRef,
    settings: ReceiveSettings,
    cancel: CancellationToken,
    tx: Sender<Notification>,
}

impl SubscriberWorker {
    pub(crate) fn new(
        client: Arc<dyn NotificationClient>,
        subscription: SubscriptionRef,
        settings: ReceiveSettings,
        cancel: CancellationToken,
        tx: Sender<Notification>,
    ) -> Self {
        Self {
            client,
            subscription,
            settings,
            cancel,
            tx,
        }
    }
}

/// 📮 The per-message callback: queue it, or nack it trying.
struct QueueForwarder {
    tx: Sender<Notification>,
    cancel: CancellationToken,
}

impl QueueForwarder {
    fn nack(message: &Notification, why: &str) {
        debug!("🔄 nacking notification {}: {why}", message.id);
        if let Err(err) = message.nack() {
            warn!("⚠️ failed to nack notification {}: {err:#}", message.id);
        }
    }
}

#[async_trait]
impl MessageHandler for QueueForwarder {
    async fn handle(&self, message: Notification) {
        // -- 🧾 `send` consumes the message, keep a twin for the nack path
        let twin = message.clone();
        tokio::select! {
            biased;
            sent = self.tx.send(message) => {
                if sent.is_err() {
                    Self::nack(&twin, "notification queue is closed");
                }
            }
            _ = self.cancel.cancelled() => Self::nack(&twin, "shutting down before it was queued"),
        }
    }
}

impl Worker for SubscriberWorker {
    fn start(self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            debug!(
                "📡 SubscriberWorker receiving from projects/{}/subscriptions/{}",
                self.subscription.project, self.subscription.subscription
            );
            let forwarder = QueueForwarder {
                tx: self.tx.clone(),
                cancel: self.cancel.clone(),
            };
            let received = self
                .client
                .receive(&self.subscription, self.settings, self.cancel.clone(), &forwarder)
                .await;

            match &received {
                Ok(()) => debug!("🏁 SubscriberWorker: receive loop ended. Shutting down."),
                Err(_) if self.cancel.is_cancelled() => {
                    debug!("🏁 SubscriberWorker: receive loop cancelled. Shutting down.")
                }
                Err(err) => error!("💀 Subscription error: {err:#}"),
            }
            self.tx.close();
            received
        })
    }
}
