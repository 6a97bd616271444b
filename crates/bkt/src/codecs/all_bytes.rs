//! 📦 `all-bytes`: the whole object, one unit, no questions asked.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use super::{EmptyInput, UnitSplitter};
use crate::backends::ObjectStream;

pub(crate) struct AllBytes {
    content: Option<Vec<u8>>,
}

impl AllBytes {
    /// 📖 Reads everything up front. An empty object is an unexpected end-of-input:
    /// there is no unit to hand out, so there is nothing to open.
    pub(crate) async fn read(mut stream: ObjectStream) -> Result<Self> {
        let mut content = Vec::new();
        stream
            .read_to_end(&mut content)
            .await
            .context("💀 reading the object failed")?;
        if content.is_empty() {
            return Err(EmptyInput.into());
        }
        Ok(Self {
            content: Some(content),
        })
    }
}

#[async_trait]
impl UnitSplitter for AllBytes {
    async fn next_unit(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.content.take())
    }

    fn is_exhausted(&self) -> bool {
        self.content.is_none()
    }
}
