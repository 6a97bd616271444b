//! 📬 AckTracker — many units in, one acknowledgment out.
//!
//! 🧠 Knowledge graph:
//! - One tracker per opened object, wrapping that object's [`AckChain`].
//! - Every decoded unit gets a [`UnitAck`] from [`AckTracker::issue`].
//! - The chain resolves exactly once: when the decoder is exhausted (finished, failed,
//!   or closed early) **and** no issued unit is still waiting for its ack.
//! - The first failure wins. Later failures are dropped on the floor, politely.
//!
//! ⚠️ A `UnitAck` that is dropped without `ack` keeps the chain open forever. The object
//! is then redelivered (notification) or left in the bucket (listing). At-least-once,
//! not at-most-whatever.

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, anyhow};
use tracing::trace;

use crate::targets::AckChain;

#[derive(Debug)]
struct TrackerState {
    chain: Option<AckChain>,
    outstanding: usize,
    exhausted: bool,
    failure: Option<anyhow::Error>,
}

/// 📬 Shared bookkeeping between a decoder and the units it emitted.
#[derive(Debug)]
pub struct AckTracker {
    state: Mutex<TrackerState>,
}

impl AckTracker {
    pub fn new(chain: AckChain) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TrackerState {
                chain: Some(chain),
                outstanding: 0,
                exhausted: false,
                failure: None,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 🎫 Hand out an ack for one freshly decoded unit.
    pub fn issue(self: &Arc<Self>) -> UnitAck {
        self.state().outstanding += 1;
        UnitAck {
            tracker: Arc::clone(self),
        }
    }

    /// 🏁 The decoder reached end-of-input cleanly.
    pub async fn finish(&self) -> Result<()> {
        self.state().exhausted = true;
        self.resolve_if_settled().await
    }

    /// 💀 The decoder gave up (or never started). `failure` becomes the object's failure
    /// unless an earlier one already claimed the spot.
    pub async fn fail(&self, failure: &anyhow::Error) -> Result<()> {
        {
            let mut state = self.state();
            state.exhausted = true;
            if state.failure.is_none() {
                state.failure = Some(anyhow!("{failure:#}"));
            }
        }
        self.resolve_if_settled().await
    }

    /// ✅ True once the wrapped chain has been resolved.
    pub fn is_resolved(&self) -> bool {
        self.state().chain.is_none()
    }

    async fn settle_unit(&self, failure: Option<&anyhow::Error>) -> Result<()> {
        {
            let mut state = self.state();
            state.outstanding = state.outstanding.saturating_sub(1);
            if let Some(failure) = failure {
                if state.failure.is_none() {
                    state.failure = Some(anyhow!("{failure:#}"));
                }
            }
        }
        self.resolve_if_settled().await
    }

    async fn resolve_if_settled(&self) -> Result<()> {
        // -- 🔒 take the chain under the lock, resolve it outside. the chain does network I/O.
        let (chain, failure) = {
            let mut state = self.state();
            if !state.exhausted || state.outstanding > 0 {
                return Ok(());
            }
            match state.chain.take() {
                Some(chain) => (chain, state.failure.take()),
                None => return Ok(()),
            }
        };
        trace!(
            "📬 every unit accounted for, resolving object ack (failed: {})",
            failure.is_some()
        );
        chain.resolve(failure.as_ref()).await
    }
}

/// 🎫 The acknowledgment for one decoded unit. Consume it exactly once.
#[derive(Debug)]
pub struct UnitAck {
    tracker: Arc<AckTracker>,
}

impl UnitAck {
    /// 📬 Report how downstream handled this unit. `None` = success.
    ///
    /// When this was the last thing the object was waiting on, the object's own
    /// acknowledgment runs here, and its error (if any) is returned.
    pub async fn ack(self, failure: Option<&anyhow::Error>) -> Result<()> {
        self.tracker.settle_unit(failure).await
    }
}
