//! RelayClient -- cursor-driven uplink polling and downlink submission.
//!
//! Overlapping pages are normal: every poll restarts at the watermark, and
//! the relay may hand the same record out on consecutive pages. The client
//! filters those against the [`RelayCursor`] and within the batch, so callers
//! see each record once and in the order the relay stored them.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use imok_core::relay::{Accepted, RelayApi, RelayError, RelayRecord};

use crate::cursor::RelayCursor;

/// Records requested per page.
pub const DEFAULT_PAGE_LIMIT: usize = 100;

/// Pages followed in a single poll.
pub const DEFAULT_MAX_PAGES: usize = 10;

/// Deduplicating front end over a [`RelayApi`].
#[derive(Clone)]
pub struct RelayClient {
    api: Arc<dyn RelayApi>,
    page_limit: usize,
    max_pages: usize,
}

impl RelayClient {
    pub fn new(api: Arc<dyn RelayApi>) -> Self {
        RelayClient {
            api,
            page_limit: DEFAULT_PAGE_LIMIT,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }

    /// Records requested per page (at least 1).
    pub fn page_limit(mut self, limit: usize) -> Self {
        self.page_limit = limit.max(1);
        self
    }

    /// Upper bound on continuation pages followed per poll (at least 1).
    pub fn max_pages(mut self, pages: usize) -> Self {
        self.max_pages = pages.max(1);
        self
    }

    /// Fetch records newer than `cursor`.
    ///
    /// Returns the new records in arrival order and the advanced cursor. On
    /// error nothing is consumed; retrying with the same cursor is safe.
    pub async fn poll_uplink(
        &self,
        cursor: &RelayCursor,
    ) -> Result<(Vec<RelayRecord>, RelayCursor), RelayError> {
        let mut fresh = Vec::new();
        let mut batch_keys = HashSet::new();
        let mut next_key: Option<String> = None;

        for page_no in 0..self.max_pages {
            let page = self
                .api
                .fetch_page(cursor.watermark_ms(), next_key.as_deref(), self.page_limit)
                .await?;
            debug!(
                page = page_no,
                records = page.records.len(),
                more = page.next_key.is_some(),
                "relay page"
            );

            for record in page.records {
                if cursor.has_passed(&record) || !batch_keys.insert(record.key.clone()) {
                    continue;
                }
                fresh.push(record);
            }

            next_key = page.next_key;
            if next_key.is_none() {
                break;
            }
        }
        if next_key.is_some() {
            warn!(max_pages = self.max_pages, "page limit reached, remainder left for next poll");
        }

        let advanced = cursor.advanced(&fresh);
        Ok((fresh, advanced))
    }

    /// Queue one downlink datagram.
    pub async fn submit_downlink(&self, payload: &[u8]) -> Result<Accepted, RelayError> {
        let accepted = self.api.submit(payload).await?;
        debug!(len = accepted.len, "downlink accepted by relay");
        Ok(accepted)
    }
}
