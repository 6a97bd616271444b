//! 🧩 Codecs — turning one object's bytes into a sequence of units.
//!
//! 🎬 An object arrives. It could be one JSON blob. It could be ten million log lines. It
//! could be gzipped log lines, because someone in platform engineering read a blog post.
//! The codec decides what "one unit" means.
//!
//! 🧠 Knowledge graph:
//! - [`DecoderFactory`] opens a [`Decoder`] over an [`ObjectStream`], handing it the
//!   object's [`AckTracker`].
//! - [`Decoder::next`] yields `(parts, UnitAck)` per unit, `None` at end-of-input.
//!   A cancelled token interrupts the wait for bytes with [`Interrupted`]; the decoder keeps
//!   its place and the next call carries on from there.
//! - A factory that finds nothing to decode says so with [`EmptyInput`]. Only that marker
//!   makes an object "empty"; truncated or corrupt bytes are decode failures.
//! - [`CodecSpec`] is the parsed `codec` config string; [`BuiltinCodec`] is the factory
//!   for it. Anything else implementing [`DecoderFactory`] can be injected instead.
//! - Built-ins split bytes with a `UnitSplitter`; `TrackedDecoder` does the ack bookkeeping
//!   so no splitter ever has to think about acknowledgments.
//!
//! 🦆 A codec walks into a bar. The bar is split on newlines. The codec walks into a bar.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::backends::ObjectStream;
use crate::common::Part;
use crate::error::ConnectorError;

pub mod ack_tracker;
mod all_bytes;
mod chunker;
mod delimited;
mod gzip;

pub use ack_tracker::{AckTracker, UnitAck};

/// 🔄 Streaming decoder for one object.
#[async_trait]
pub trait Decoder: Send {
    /// Next unit and its ack, or `None` once the object is exhausted. Returns
    /// [`Interrupted`] when `cancel` fires first, without losing its place.
    async fn next(&mut self, cancel: &CancellationToken) -> Result<Option<(Vec<Part>, UnitAck)>>;

    /// 🧹 Release the stream. Closing before end-of-input counts as a failure for the object.
    async fn close(&mut self) -> Result<()>;
}

/// 🏭 Builds decoders. Must not resolve `acks` itself when construction fails; the caller
/// does that with the construction error.
#[async_trait]
pub trait DecoderFactory: Send + Sync + fmt::Debug {
    async fn open(
        &self,
        key: &str,
        stream: ObjectStream,
        acks: Arc<AckTracker>,
    ) -> Result<Box<dyn Decoder>>;
}

/// 🕳️ The object ended before its first unit. Return this from [`DecoderFactory::open`]
/// to have the object reported as empty.
#[derive(Debug, thiserror::Error)]
#[error("object ended before its first unit")]
pub struct EmptyInput;

/// ⏱️ [`Decoder::next`] gave up waiting because its token was cancelled.
#[derive(Debug, thiserror::Error)]
#[error("decoding was interrupted by cancellation")]
pub struct Interrupted;

/// 🕳️ True when a decoder refused to open because there was nothing to decode.
pub fn is_empty_input(err: &anyhow::Error) -> bool {
    err.is::<EmptyInput>()
}

/// 🧩 The built-in codecs, parsed from the `codec` config string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecSpec {
    /// `all-bytes`: the whole object is one unit.
    AllBytes,
    /// `lines`: newline-delimited, `\r\n` tolerated, blank lines skipped.
    Lines,
    /// `delim:<sep>`: like `lines` with a custom separator.
    Delimited(Vec<u8>),
    /// `chunker:<n>`: fixed-size units.
    Chunker(usize),
    /// `gzip/<inner>`: gunzip, then hand the result to `inner`.
    Gzip(Box<CodecSpec>),
    /// `auto`: pick by key extension.
    Auto,
}

impl FromStr for CodecSpec {
    type Err = ConnectorError;

    fn from_str(codec: &str) -> Result<Self, Self::Err> {
        let invalid = |why: &str| ConnectorError::Config(format!("codec '{codec}': {why}"));

        if let Some(inner) = codec.strip_prefix("gzip/") {
            return Ok(CodecSpec::Gzip(Box::new(inner.parse()?)));
        }
        if let Some(sep) = codec.strip_prefix("delim:") {
            if sep.is_empty() {
                return Err(invalid("delimiter must not be empty"));
            }
            return Ok(CodecSpec::Delimited(sep.as_bytes().to_vec()));
        }
        if let Some(size) = codec.strip_prefix("chunker:") {
            return match size.parse::<usize>() {
                Ok(size) if size > 0 => Ok(CodecSpec::Chunker(size)),
                _ => Err(invalid("chunk size must be a positive integer")),
            };
        }
        match codec {
            "all-bytes" => Ok(CodecSpec::AllBytes),
            "lines" => Ok(CodecSpec::Lines),
            "gzip" => Ok(CodecSpec::Gzip(Box::new(CodecSpec::AllBytes))),
            "auto" => Ok(CodecSpec::Auto),
            _ => Err(invalid("unknown codec")),
        }
    }
}

impl CodecSpec {
    /// 🔍 Replace `auto` (anywhere in the chain) with what the key's extension asks for.
    pub fn resolve_for(&self, key: &str) -> CodecSpec {
        match self {
            CodecSpec::Auto => by_extension(key),
            CodecSpec::Gzip(inner) => {
                let stem = strip_gzip_extension(key).unwrap_or(key);
                CodecSpec::Gzip(Box::new(inner.resolve_for(stem)))
            }
            other => other.clone(),
        }
    }
}

fn strip_gzip_extension(key: &str) -> Option<&str> {
    key.strip_suffix(".gz").or_else(|| key.strip_suffix(".gzip"))
}

fn by_extension(key: &str) -> CodecSpec {
    if let Some(stem) = strip_gzip_extension(key) {
        return CodecSpec::Gzip(Box::new(by_extension(stem)));
    }
    let extension = key.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
    match extension.as_deref() {
        Some("jsonl" | "ndjson" | "log" | "txt" | "csv") => CodecSpec::Lines,
        _ => CodecSpec::AllBytes,
    }
}

/// 🏭 [`DecoderFactory`] for the built-in [`CodecSpec`]s.
#[derive(Debug, Clone)]
pub struct BuiltinCodec {
    spec: CodecSpec,
    max_buffer: usize,
}

impl BuiltinCodec {
    pub fn new(spec: CodecSpec, max_buffer: usize) -> Self {
        Self { spec, max_buffer }
    }
}

#[async_trait]
impl DecoderFactory for BuiltinCodec {
    async fn open(
        &self,
        key: &str,
        stream: ObjectStream,
        acks: Arc<AckTracker>,
    ) -> Result<Box<dyn Decoder>> {
        let spec = self.spec.resolve_for(key);
        trace!("🧩 opening '{key}' with codec {spec:?}");
        let splitter = open_splitter(spec, stream, self.max_buffer).await?;
        Ok(Box::new(TrackedDecoder {
            key: key.to_string(),
            splitter,
            acks,
            finished: false,
        }))
    }
}

/// ✂️ Pulls raw units out of a byte stream. Knows nothing about acks.
#[async_trait]
pub(crate) trait UnitSplitter: Send {
    /// Dropping the future between reads must not lose bytes.
    async fn next_unit(&mut self) -> Result<Option<Vec<u8>>>;

    /// 🏁 True when the next `next_unit` is known to return `None` without reading.
    fn is_exhausted(&self) -> bool {
        false
    }
}

pub(crate) fn open_splitter(
    spec: CodecSpec,
    stream: ObjectStream,
    max_buffer: usize,
) -> BoxFuture<'static, Result<Box<dyn UnitSplitter>>> {
    Box::pin(async move {
        let splitter: Box<dyn UnitSplitter> = match spec {
            CodecSpec::AllBytes => Box::new(all_bytes::AllBytes::read(stream).await?),
            CodecSpec::Lines => Box::new(delimited::Delimited::lines(stream, max_buffer)),
            CodecSpec::Delimited(sep) => Box::new(delimited::Delimited::new(stream, sep, max_buffer)),
            CodecSpec::Chunker(size) => Box::new(chunker::Chunker::new(stream, size)),
            CodecSpec::Gzip(inner) => {
                let decompressed = gzip::gunzip(stream).await?;
                open_splitter(*inner, decompressed, max_buffer).await?
            }
            // -- 🔍 `resolve_for` already replaced this; a bare `auto` means "no idea", so whole bytes
            CodecSpec::Auto => Box::new(all_bytes::AllBytes::read(stream).await?),
        };
        Ok(splitter)
    })
}

/// 🎫 Wraps a splitter and keeps the object's [`AckTracker`] honest.
struct TrackedDecoder {
    key: String,
    splitter: Box<dyn UnitSplitter>,
    acks: Arc<AckTracker>,
    finished: bool,
}

#[async_trait]
impl Decoder for TrackedDecoder {
    async fn next(&mut self, cancel: &CancellationToken) -> Result<Option<(Vec<Part>, UnitAck)>> {
        if self.finished {
            return Ok(None);
        }
        // -- 🔒 splitters only commit bytes once a read completes, so walking away is safe
        let unit = tokio::select! {
            biased;
            unit = self.splitter.next_unit() => unit,
            _ = cancel.cancelled() => return Err(Interrupted.into()),
        };
        match unit {
            Ok(Some(unit)) => {
                let ack = self.acks.issue();
                // -- 🏁 last unit out: let its ack settle the object without another pull
                if self.splitter.is_exhausted() {
                    self.finished = true;
                    self.acks.finish().await?;
                }
                Ok(Some((vec![Part::new(unit)], ack)))
            }
            Ok(None) => {
                self.finished = true;
                self.acks.finish().await?;
                Ok(None)
            }
            Err(err) => {
                self.finished = true;
                if let Err(ack_err) = self.acks.fail(&err).await {
                    warn!("⚠️ failed to acknowledge '{}' after a decode error: {ack_err:#}", self.key);
                }
                Err(err)
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let early = anyhow::anyhow!("decoder for '{}' closed before the object was fully consumed", self.key);
        self.acks.fail(&early).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::targets::AckChain;

    fn stream(bytes: &'static [u8]) -> ObjectStream {
        Box::new(std::io::Cursor::new(bytes))
    }

    async fn decode_all(codec: &str, key: &str, bytes: &'static [u8]) -> Result<Vec<String>> {
        let factory = BuiltinCodec::new(codec.parse()?, 1_000_000);
        let acks = AckTracker::new(AckChain::Noop);
        let mut decoder = factory.open(key, stream(bytes), acks.clone()).await?;
        let mut units = Vec::new();
        while let Some((parts, ack)) = decoder.next(&CancellationToken::new()).await? {
            units.extend(parts.iter().map(|p| p.content_lossy().into_owned()));
            ack.ack(None).await?;
        }
        decoder.close().await?;
        assert!(acks.is_resolved());
        Ok(units)
    }

    #[test]
    fn the_one_where_codec_strings_parse_or_get_rejected() {
        assert_eq!("all-bytes".parse::<CodecSpec>().ok(), Some(CodecSpec::AllBytes));
        assert_eq!(
            "gzip/lines".parse::<CodecSpec>().ok(),
            Some(CodecSpec::Gzip(Box::new(CodecSpec::Lines)))
        );
        assert_eq!(
            "delim:||".parse::<CodecSpec>().ok(),
            Some(CodecSpec::Delimited(b"||".to_vec()))
        );
        assert_eq!("chunker:4".parse::<CodecSpec>().ok(), Some(CodecSpec::Chunker(4)));
        assert!(matches!("chunker:0".parse::<CodecSpec>(), Err(ConnectorError::Config(_))));
        assert!(matches!("delim:".parse::<CodecSpec>(), Err(ConnectorError::Config(_))));
        assert!(matches!("csv-but-fancy".parse::<CodecSpec>(), Err(ConnectorError::Config(_))));
    }

    #[test]
    fn the_one_where_auto_reads_the_file_extension() {
        let auto = CodecSpec::Auto;
        assert_eq!(auto.resolve_for("events.jsonl"), CodecSpec::Lines);
        assert_eq!(auto.resolve_for("blob.json"), CodecSpec::AllBytes);
        assert_eq!(
            auto.resolve_for("app.LOG.gz"),
            CodecSpec::Gzip(Box::new(CodecSpec::Lines))
        );
        assert_eq!(
            CodecSpec::Gzip(Box::new(CodecSpec::Auto)).resolve_for("rows.csv.gzip"),
            CodecSpec::Gzip(Box::new(CodecSpec::Lines))
        );
    }

    #[tokio::test]
    async fn the_one_where_lines_skip_the_blank_ones() -> Result<()> {
        let units = decode_all("lines", "a.log", b"first\r\n\nsecond\nthird").await?;
        assert_eq!(units, ["first", "second", "third"]);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_chunks_come_in_fours() -> Result<()> {
        let units = decode_all("chunker:4", "a.bin", b"abcdefghij").await?;
        assert_eq!(units, ["abcd", "efgh", "ij"]);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_all_bytes_refuses_an_empty_object() {
        let factory = BuiltinCodec::new(CodecSpec::AllBytes, 1_000_000);
        let acks = AckTracker::new(AckChain::Noop);
        let err = match factory.open("empty.json", stream(b""), acks).await {
            Ok(_) => panic!("💀 an empty object should not open"),
            Err(err) => err,
        };
        assert!(is_empty_input(&err));
    }

    /// 💀 A stream that dies with UnexpectedEof on the first read.
    struct Severed;

    impl tokio::io::AsyncRead for Severed {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Err(std::io::ErrorKind::UnexpectedEof.into()))
        }
    }

    #[tokio::test]
    async fn the_one_where_a_severed_stream_is_not_an_empty_object() {
        for codec in ["all-bytes", "gzip/lines"] {
            let factory = BuiltinCodec::new(codec.parse().expect("💀 valid codec"), 1_000_000);
            let acks = AckTracker::new(AckChain::Noop);
            let err = match factory.open("k", Box::new(Severed), acks).await {
                Ok(_) => panic!("💀 a broken stream should not open"),
                Err(err) => err,
            };
            assert!(!is_empty_input(&err), "{codec}: {err:#}");
        }
    }

    #[tokio::test]
    async fn the_one_where_a_truncated_gzip_is_corrupt_not_empty() -> Result<()> {
        use flate2::Compression;
        use flate2::write::GzEncoder;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"one\ntwo\nthree\n")?;
        let mut compressed = encoder.finish()?;
        compressed.truncate(compressed.len() / 2);

        let factory = BuiltinCodec::new(CodecSpec::Gzip(Box::new(CodecSpec::Lines)), 1_000_000);
        let acks = AckTracker::new(AckChain::Noop);
        let err = match factory
            .open("a.log.gz", Box::new(std::io::Cursor::new(compressed)), acks)
            .await
        {
            Ok(_) => panic!("💀 half a gzip should not open"),
            Err(err) => err,
        };
        assert!(!is_empty_input(&err));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_cancelled_wait_keeps_the_decoder_in_place() -> Result<()> {
        let (mut writer, reader) = tokio::io::duplex(64);
        let factory = BuiltinCodec::new(CodecSpec::Lines, 1_000_000);
        let acks = AckTracker::new(AckChain::Noop);
        let mut decoder = factory.open("k", Box::new(reader), acks).await?;

        let impatient = CancellationToken::new();
        impatient.cancel();
        let interrupted = decoder.next(&impatient).await;
        assert!(matches!(&interrupted, Err(err) if err.is::<Interrupted>()));

        tokio::io::AsyncWriteExt::write_all(&mut writer, b"hello\n").await?;
        let (parts, ack) = decoder
            .next(&CancellationToken::new())
            .await?
            .expect("💀 the line should still arrive");
        assert_eq!(parts[0].content_lossy(), "hello");
        ack.ack(None).await?;
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_closing_early_fails_the_object() -> Result<()> {
        let store = Arc::new(crate::backends::InMemoryObjectStore::new());
        store.put("b", "k", "one\ntwo\n");
        let chain = AckChain::Delete(crate::targets::ObjectDeletion::new(
            store.clone() as Arc<dyn crate::backends::ObjectStoreClient>,
            "b",
            "k",
        ));
        let acks = AckTracker::new(chain);
        let factory = BuiltinCodec::new(CodecSpec::Lines, 1_000_000);
        let mut decoder = factory.open("k", stream(b"one\ntwo\n"), acks.clone()).await?;

        let (_, ack) = decoder
            .next(&CancellationToken::new())
            .await?
            .expect("💀 first line should decode");
        ack.ack(None).await?;
        decoder.close().await?;

        assert!(acks.is_resolved());
        assert!(store.contains("b", "k"));
        Ok(())
    }
}
