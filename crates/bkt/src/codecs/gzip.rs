//! 🗜️ `gzip/<inner>`: inflate the object, then let the inner codec have at it.
//!
//! The whole object is inflated in memory. Objects that don't fit in RAM compressed
//! probably shouldn't be gzip blobs in the first place.

use std::io::Read;

use anyhow::{Context, Result, anyhow};
use flate2::read::MultiGzDecoder;
use tokio::io::AsyncReadExt;

use super::EmptyInput;
use crate::backends::ObjectStream;

pub(crate) async fn gunzip(mut stream: ObjectStream) -> Result<ObjectStream> {
    let mut compressed = Vec::new();
    stream
        .read_to_end(&mut compressed)
        .await
        .context("💀 reading the compressed object failed")?;
    if compressed.is_empty() {
        return Err(EmptyInput.into());
    }

    let mut inflated = Vec::new();
    // -- 🕳️ a truncated member surfaces as UnexpectedEof; flatten it so nobody mistakes it for empty
    MultiGzDecoder::new(compressed.as_slice())
        .read_to_end(&mut inflated)
        .map_err(|err| anyhow!("💀 gzip stream is corrupt. Or it was never gzip. Both are bad. ({err})"))?;
    Ok(Box::new(std::io::Cursor::new(inflated)))
}
