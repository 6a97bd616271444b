//! 🔧 App Configuration — the sacred TOML-to-struct pipeline.
//!
//! 📡 "Config not found: We looked everywhere. Under the couch. Behind the fridge.
//! In the bucket. Nothing." — every developer at 3am 🦆
//!
//! 🧠 Knowledge graph:
//! - [`ConnectorConfig`] is the connector's whole surface: bucket, prefix, codec, deletion,
//!   decoder buffer cap, and the optional [`PubSubConfig`] block.
//! - [`AppConfig`] wraps it for the CLI together with a [`StoreConfig`] that picks the
//!   storage backend (GCS from the environment, or a local directory of buckets).
//! - Validation lives on `ConnectorConfig::validate` so library callers who skip figment
//!   still get the same rules.
//!
//! 🏗️ Powered by Figment, because manually parsing env vars is a form of
//! self-harm that even the borrow checker wouldn't approve of.

use std::path::Path;

use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use tracing::info;

use crate::error::ConnectorError;

/// 📦 The AppConfig: what the CLI needs to know about itself.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// 🪣 The connector itself.
    pub input: ConnectorConfig,
    /// 🗄️ Where objects physically live. Defaults to GCS.
    #[serde(default)]
    pub store: StoreConfig,
}

/// 🗄️ Storage backend selection for the CLI.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct StoreConfig {
    /// 📁 When set, buckets are sub-directories of this root on local disk.
    /// When unset, we talk to Google Cloud Storage with credentials from the environment.
    #[serde(default)]
    pub local_root: Option<String>,
}

/// 🪣 Everything the connector is allowed to be told.
#[derive(Debug, Deserialize, Clone)]
pub struct ConnectorConfig {
    /// 🪣 The bucket to walk. Optional when a subscription names the buckets for us.
    #[serde(default)]
    pub bucket: String,
    /// 🔍 Only keys starting with this are consumed. Listing mode only.
    #[serde(default)]
    pub prefix: String,
    /// 🧩 How bytes become units. See `codecs::CodecSpec`.
    #[serde(default = "default_codec")]
    pub codec: String,
    /// 🗑️ Delete objects once every unit of them has been acked successfully.
    #[serde(default)]
    pub delete_objects: bool,
    /// 📏 Largest token a delimiter codec will buffer before giving up.
    #[serde(default = "default_max_buffer")]
    pub max_buffer: usize,
    /// 📨 Stream upload notifications instead of listing the bucket.
    #[serde(default)]
    pub pubsub: PubSubConfig,
}

/// 📨 Subscription settings for notification-driven mode.
#[derive(Debug, Deserialize, Clone)]
pub struct PubSubConfig {
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub subscription: String,
    /// 🐢 Synchronous pull mode.
    #[serde(default)]
    pub sync: bool,
    /// 📬 Flow control: how many unacked notifications may be outstanding. Also sizes the queue.
    #[serde(default = "default_max_outstanding_messages")]
    pub max_outstanding_messages: usize,
    /// 📦 Flow control: outstanding notification bytes.
    #[serde(default = "default_max_outstanding_bytes")]
    pub max_outstanding_bytes: usize,
}

fn default_codec() -> String {
    "all-bytes".to_string()
}

// -- 📏 1MB tokens. If your single log line is bigger, we need to talk.
fn default_max_buffer() -> usize {
    1_000_000
}

fn default_max_outstanding_messages() -> usize {
    1000
}

// -- 📦 1GB of outstanding notifications. The notifications are tiny. This is a vibe, not a plan.
fn default_max_outstanding_bytes() -> usize {
    1_000_000_000
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            project: String::new(),
            subscription: String::new(),
            sync: false,
            max_outstanding_messages: default_max_outstanding_messages(),
            max_outstanding_bytes: default_max_outstanding_bytes(),
        }
    }
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            prefix: String::new(),
            codec: default_codec(),
            delete_objects: false,
            max_buffer: default_max_buffer(),
            pubsub: PubSubConfig::default(),
        }
    }
}

impl ConnectorConfig {
    /// 🪣 Listing-mode config for one bucket. Mostly for tests and quick scripts.
    pub fn for_bucket(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            ..Self::default()
        }
    }

    /// 📨 True when targets come from notifications rather than listing.
    pub fn uses_subscription(&self) -> bool {
        !self.pubsub.subscription.is_empty()
    }

    /// 🔒 The three commandments of connector configuration.
    pub fn validate(&self) -> Result<(), ConnectorError> {
        if self.bucket.is_empty() && self.pubsub.subscription.is_empty() {
            return Err(ConnectorError::Config(
                "either a bucket or a pubsub.subscription must be specified".to_string(),
            ));
        }
        if !self.prefix.is_empty() && !self.pubsub.subscription.is_empty() {
            return Err(ConnectorError::Config(
                "cannot specify both a prefix and pubsub.subscription".to_string(),
            ));
        }
        if self.pubsub.project.is_empty() && !self.pubsub.subscription.is_empty() {
            return Err(ConnectorError::Config(
                "pubsub.project must be specified with pubsub.subscription".to_string(),
            ));
        }
        Ok(())
    }
}

/// 🚀 Load the config — from a file, from env vars, or from the sheer power of hoping.
///
/// 🔧 Merges environment variables (`BKT_*`, nested keys split on `__`, so
/// `BKT_INPUT__PUBSUB__PROJECT` lands in `input.pubsub.project`) with an optional TOML file.
/// TOML wins on conflicts. The loaded connector config is validated before it is returned.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {:#?}",
        config_file_name.unwrap_or(Path::new(""))
    );

    let config = Figment::new().merge(Env::prefixed("BKT_").split("__"));
    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables (BKT_*). \
             The file exists in our hearts, but apparently not on disk.",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables (BKT_*). \
                 No file was provided — this one's all on the environment. Classic."
            .to_string(),
    };

    let app_config: AppConfig = config.extract().context(context_msg)?;
    app_config
        .input
        .validate()
        .context("💀 Configuration parsed, but the connector refuses to work like this")?;
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_test_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("💀 Failed to create a temp config. The filesystem said 'new phone who dis'.");
        file.write_all(contents.as_bytes())
            .expect("💀 Failed to write test config.");
        file
    }

    #[test]
    fn the_one_where_defaults_show_up_uninvited_but_helpful() {
        let config: ConnectorConfig = toml::from_str(r#"bucket = "logs""#)
            .expect("💀 A bucket-only config should parse.");

        assert_eq!(config.bucket, "logs");
        assert_eq!(config.codec, "all-bytes");
        assert!(!config.delete_objects);
        assert_eq!(config.max_buffer, 1_000_000);
        assert_eq!(config.pubsub.max_outstanding_messages, 1000);
        assert_eq!(config.pubsub.max_outstanding_bytes, 1_000_000_000);
        assert!(!config.pubsub.sync);
        assert!(!config.uses_subscription());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn the_one_where_nobody_said_where_to_read_from() {
        let config = ConnectorConfig::default();
        assert!(matches!(config.validate(), Err(ConnectorError::Config(_))));
    }

    #[test]
    fn the_one_where_prefix_and_subscription_cannot_share_a_room() {
        let config: ConnectorConfig = toml::from_str(
            r#"
            prefix = "logs/"
            [pubsub]
            project = "p"
            subscription = "s"
            "#,
        )
        .expect("💀 should parse");
        let err = config.validate().expect_err("prefix + subscription must be rejected");
        assert!(err.to_string().contains("prefix"));
    }

    #[test]
    fn the_one_where_a_subscription_without_a_project_is_homeless() {
        let config: ConnectorConfig = toml::from_str(
            r#"
            [pubsub]
            subscription = "s"
            "#,
        )
        .expect("💀 should parse");
        let err = config.validate().expect_err("subscription without project must be rejected");
        assert!(err.to_string().contains("pubsub.project"));
    }

    #[test]
    fn the_one_where_a_full_file_loads_through_figment() {
        let file = write_test_config(
            r#"
            [input]
            codec = "lines"
            delete_objects = true
            max_buffer = 4096

            [input.pubsub]
            project = "my-project"
            subscription = "uploads"
            sync = true
            max_outstanding_messages = 8

            [store]
            local_root = "/tmp/buckets"
            "#,
        );

        let app_config = load_config(Some(file.path())).expect("💀 full config should load");

        assert_eq!(app_config.input.codec, "lines");
        assert!(app_config.input.delete_objects);
        assert_eq!(app_config.input.max_buffer, 4096);
        assert_eq!(app_config.input.pubsub.project, "my-project");
        assert!(app_config.input.pubsub.sync);
        assert_eq!(app_config.input.pubsub.max_outstanding_messages, 8);
        assert!(app_config.input.uses_subscription());
        assert_eq!(app_config.store.local_root.as_deref(), Some("/tmp/buckets"));
    }

    #[test]
    fn the_one_where_figment_refuses_an_invalid_connector() {
        let file = write_test_config(
            r#"
            [input]
            codec = "lines"
            "#,
        );

        assert!(load_config(Some(file.path())).is_err());
    }
}
