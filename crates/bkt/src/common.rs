//! 📦 Common data structures — the things a pull hands back to the caller.
//!
//! A [`MessageBatch`] is what one decoded unit becomes: one or more [`Part`]s, each carrying
//! raw bytes and a bag of metadata stamped on by the connector (key, bucket, timestamps,
//! and whatever user metadata the uploader bothered to attach).
//!
//! 🦆 They don't ask questions. They carry the bytes. Please tip your postal workers.

use std::collections::BTreeMap;

use serde_json::Value;

/// 🎯 A singular `Part` — one chunk of decoded content plus its metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Part {
    /// 📦 The raw content. Bytes in, bytes out. UTF-8 is your problem.
    pub content: Vec<u8>,
    /// 🏷️ Metadata keyed by name. Values are JSON so integers stay integers.
    pub metadata: BTreeMap<String, Value>,
}

impl Part {
    /// 🏗️ A part with content and no metadata yet.
    pub fn new(content: impl Into<Vec<u8>>) -> Self {
        Self {
            content: content.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// 🔧 Set (or overwrite) a metadata value.
    pub fn set_meta(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// 🔍 Metadata value as a string slice, if it is one.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// 📖 Content as UTF-8, lossily. For logs, tests and people who trust their data.
    pub fn content_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.content)
    }
}

/// 📦 A `MessageBatch` — the parts produced by one decoded unit, in order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageBatch {
    pub parts: Vec<Part>,
}

impl MessageBatch {
    pub fn new(parts: Vec<Part>) -> Self {
        Self { parts }
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// 🔄 Visit every part mutably. Used to stamp metadata across the whole batch.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Part> {
        self.parts.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_metadata_keeps_its_types() {
        let mut part = Part::new("hello");
        part.set_meta("gcs_key", "a.json");
        part.set_meta("gcs_last_modified_unix", 1_700_000_000i64);

        assert_eq!(part.meta_str("gcs_key"), Some("a.json"));
        assert_eq!(
            part.metadata.get("gcs_last_modified_unix").and_then(Value::as_i64),
            Some(1_700_000_000)
        );
        // 🧪 integers are not strings. the JSON gods are strict about this.
        assert_eq!(part.meta_str("gcs_last_modified_unix"), None);
        assert_eq!(part.content_lossy(), "hello");
    }

    #[test]
    fn the_one_where_a_batch_stamps_every_part() {
        let mut batch = MessageBatch::new(vec![Part::new("a"), Part::new("b")]);
        for part in batch.iter_mut() {
            part.set_meta("gcs_bucket", "bucket");
        }
        assert_eq!(batch.len(), 2);
        assert!(batch.parts.iter().all(|p| p.meta_str("gcs_bucket") == Some("bucket")));
    }
}
