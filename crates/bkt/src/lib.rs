//! 🪣 bkt — turns a bucket full of opaque objects into an ordered stream of decoded batches.
//!
//! 🎬 *[a bucket. thousands of objects. nobody has read them. nobody has deleted them.]*
//! *[somewhere, a Pub/Sub topic whispers "OBJECT_FINALIZE" into the void.]*
//! *[one connector answers.]*
//!
//! 🧠 Knowledge graph:
//! - [`connector::Connector`] is the front door: `connect` → `pull` (repeat) → `close`.
//! - Targets are discovered by listing a bucket ([`targets`] listing reader) or by draining
//!   notifications that a background [`workers`] task forwards from a subscription.
//! - Bytes become units through a [`codecs::DecoderFactory`]; every unit carries a
//!   [`codecs::UnitAck`] that eventually resolves the object's [`targets::AckChain`].
//! - Storage and notifications are traits in [`backends`], injected by the caller. No registry.
//!
//! 🦆 The duck watches the bucket. The bucket does not watch back.

pub mod app_config;
pub mod backends;
pub mod codecs;
pub mod common;
pub mod connector;
pub mod error;
pub mod targets;
mod workers;

pub use app_config::{AppConfig, ConnectorConfig, PubSubConfig, StoreConfig, load_config};
pub use common::{MessageBatch, Part};
pub use connector::Connector;
pub use error::ConnectorError;
