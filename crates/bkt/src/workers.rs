//! 🧵 Workers: the background tasks that keep the connector fed while the caller
//! takes all the credit in the sprint retro.
//!
//! 🚀 Right now there is exactly one: the [`SubscriberWorker`], which runs the
//! notification receive loop and forwards every message into the connector's queue.
//!
//! ⚠️ "If you're reading this, the code review went poorly."

use anyhow::Result;
use tokio::task::JoinHandle;

mod subscriber_worker;
pub(crate) use subscriber_worker::SubscriberWorker;

/// 🏗️ A background worker, that does work. duh.
///
/// 🎯 `start` consumes the worker and hands back the task. Join it to find out how it went.
pub(crate) trait Worker {
    fn start(self) -> JoinHandle<Result<()>>;
}
