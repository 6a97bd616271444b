//! 📜 ListingTargetReader — walks a bucket, one page at a time.
//!
//! 🎬 "How many objects are in the bucket?" "Yes." The listing is paged at
//! [`LISTING_PAGE_SIZE`] so a bucket with a million keys doesn't become a million-entry `Vec`.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{AckChain, ObjectDeletion, ObjectTarget, TargetReader};
use crate::backends::{ListPage, ListedObject, ObjectStoreClient};
use crate::error::ConnectorError;

/// 📄 Objects requested per listing page.
pub const LISTING_PAGE_SIZE: usize = 100;

/// 📜 Finite target reader over a (prefix-filtered) bucket listing.
#[derive(Debug)]
pub struct ListingTargetReader {
    store: Arc<dyn ObjectStoreClient>,
    bucket: String,
    prefix: Option<String>,
    delete_objects: bool,
    pending: VecDeque<ListedObject>,
    cursor: Option<String>,
}

impl ListingTargetReader {
    /// 🏗️ Fetches the first page right away, so an unreachable bucket fails at connect.
    pub async fn new(
        store: Arc<dyn ObjectStoreClient>,
        bucket: impl Into<String>,
        prefix: Option<String>,
        delete_objects: bool,
    ) -> Result<Self, ConnectorError> {
        let mut reader = Self {
            store,
            bucket: bucket.into(),
            prefix: prefix.filter(|p| !p.is_empty()),
            delete_objects,
            pending: VecDeque::new(),
            cursor: None,
        };
        let first = reader.fetch_page(None).await?;
        debug!(
            "📜 first listing page of '{}' holds {} objects",
            reader.bucket,
            first.objects.len()
        );
        reader.absorb(first);
        Ok(reader)
    }

    async fn fetch_page(&self, cursor: Option<&str>) -> Result<ListPage, ConnectorError> {
        self.store
            .list_page(&self.bucket, self.prefix.as_deref(), cursor, LISTING_PAGE_SIZE)
            .await
            .map_err(ConnectorError::Listing)
    }

    // -- 🔖 a cursor only survives when the page actually had something on it
    fn absorb(&mut self, page: ListPage) {
        self.cursor = if page.objects.is_empty() {
            None
        } else {
            page.next_cursor
        };
        self.pending.extend(page.objects);
    }

    fn target_for(&self, object: ListedObject) -> ObjectTarget {
        let chain = if self.delete_objects {
            AckChain::Delete(ObjectDeletion::new(
                self.store.clone(),
                object.bucket.clone(),
                object.key.clone(),
            ))
        } else {
            AckChain::Noop
        };
        ObjectTarget {
            key: object.key,
            bucket: object.bucket,
            generation: 0,
            chain,
        }
    }
}

#[async_trait]
impl TargetReader for ListingTargetReader {
    async fn pop(
        &mut self,
        _cancel: &CancellationToken,
    ) -> Result<Option<ObjectTarget>, ConnectorError> {
        if self.pending.is_empty() {
            if let Some(cursor) = self.cursor.take() {
                trace!("📄 fetching the next listing page after '{cursor}'");
                match self.fetch_page(Some(&cursor)).await {
                    Ok(page) => self.absorb(page),
                    Err(err) => {
                        // -- 🔁 keep the cursor so a retry resumes where we were
                        self.cursor = Some(cursor);
                        return Err(err);
                    }
                }
            }
        }
        Ok(self.pending.pop_front().map(|object| self.target_for(object)))
    }
}
