//! 🔪 `chunker:<n>`: fixed-size slices. The last one gets whatever is left.

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use super::UnitSplitter;
use crate::backends::ObjectStream;

const READ_CHUNK: usize = 64 * 1024;

pub(crate) struct Chunker {
    stream: ObjectStream,
    size: usize,
    // -- 🧺 the chunk being filled; survives an abandoned read
    partial: Vec<u8>,
    eof: bool,
}

impl Chunker {
    pub(crate) fn new(stream: ObjectStream, size: usize) -> Self {
        Self {
            stream,
            size,
            partial: Vec::new(),
            eof: false,
        }
    }
}

#[async_trait]
impl UnitSplitter for Chunker {
    async fn next_unit(&mut self) -> Result<Option<Vec<u8>>> {
        while !self.eof && self.partial.len() < self.size {
            let want = self.size - self.partial.len();
            self.partial.reserve(want.min(READ_CHUNK));
            let read = (&mut self.stream).take(want as u64).read_buf(&mut self.partial).await?;
            if read == 0 {
                self.eof = true;
            }
        }
        if self.partial.is_empty() {
            return Ok(None);
        }
        Ok(Some(std::mem::take(&mut self.partial)))
    }

    fn is_exhausted(&self) -> bool {
        self.eof && self.partial.is_empty()
    }
}
