//! ✂️ `lines` and `delim:<sep>`: split the stream on a separator.
//!
//! 🧠 Knowledge graph:
//! - Bytes are read in chunks into `buffered`; `memmem` finds the next separator.
//! - `scanned` remembers how far we already searched so a long token is not rescanned
//!   from the start on every read.
//! - Empty tokens are skipped. `lines` also strips one trailing `\r`.
//! - A token that grows past `max_buffer` is an error, not an OOM.

use anyhow::{Result, bail};
use async_trait::async_trait;
use memchr::memmem;
use tokio::io::AsyncReadExt;

use super::UnitSplitter;
use crate::backends::ObjectStream;

const READ_CHUNK: usize = 64 * 1024;

pub(crate) struct Delimited {
    stream: ObjectStream,
    separator: Vec<u8>,
    strip_cr: bool,
    max_buffer: usize,
    buffered: Vec<u8>,
    scanned: usize,
    eof: bool,
}

impl Delimited {
    pub(crate) fn new(stream: ObjectStream, separator: Vec<u8>, max_buffer: usize) -> Self {
        Self {
            stream,
            separator,
            strip_cr: false,
            max_buffer,
            buffered: Vec::new(),
            scanned: 0,
            eof: false,
        }
    }

    pub(crate) fn lines(stream: ObjectStream, max_buffer: usize) -> Self {
        Self {
            strip_cr: true,
            ..Self::new(stream, b"\n".to_vec(), max_buffer)
        }
    }

    /// 🔍 Cut the next token out of the buffer, if a whole one is there.
    fn cut_token(&mut self) -> Option<Vec<u8>> {
        let found = memmem::find(&self.buffered[self.scanned..], &self.separator)?;
        let end = self.scanned + found;
        let mut token: Vec<u8> = self.buffered.drain(..end + self.separator.len()).collect();
        token.truncate(end);
        self.scanned = 0;
        Some(token)
    }

    fn tidy(&self, mut token: Vec<u8>) -> Result<Option<Vec<u8>>> {
        if self.strip_cr && token.last() == Some(&b'\r') {
            token.pop();
        }
        if token.len() > self.max_buffer {
            bail!(
                "💀 token of {} bytes exceeds max_buffer ({} bytes)",
                token.len(),
                self.max_buffer
            );
        }
        Ok((!token.is_empty()).then_some(token))
    }
}

#[async_trait]
impl UnitSplitter for Delimited {
    async fn next_unit(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            while let Some(token) = self.cut_token() {
                if let Some(token) = self.tidy(token)? {
                    return Ok(Some(token));
                }
            }

            if self.eof {
                if self.buffered.is_empty() {
                    return Ok(None);
                }
                let rest = std::mem::take(&mut self.buffered);
                self.scanned = 0;
                match self.tidy(rest)? {
                    Some(token) => return Ok(Some(token)),
                    None => return Ok(None),
                }
            }

            // -- 🔒 no separator in sight and already past the cap; reading more won't help
            if self.buffered.len() > self.max_buffer + self.separator.len() {
                bail!(
                    "💀 no separator within max_buffer ({} bytes); this token is too big to hold",
                    self.max_buffer
                );
            }

            // -- 🔍 a separator could straddle the old and new bytes, so back up a little
            self.scanned = self
                .buffered
                .len()
                .saturating_sub(self.separator.len().saturating_sub(1));
            // -- 🔒 read_buf only appends once bytes actually arrived
            self.buffered.reserve(READ_CHUNK);
            let read = self.stream.read_buf(&mut self.buffered).await?;
            if read == 0 {
                self.eof = true;
            }
        }
    }

    fn is_exhausted(&self) -> bool {
        self.eof && self.buffered.is_empty()
    }
}
