//! Scripted relay for testing the relay client and the messenger.
//!
//! [`MockRelay`] implements [`RelayApi`] by handing out pre-loaded pages in
//! order and recording every fetch and submission. Clones share state, so a
//! test can keep one clone for assertions after moving another into the code
//! under test.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use imok_core::relay::{Accepted, RelayApi, RelayError, RelayPage, RelayRecord};

#[derive(Debug, Default)]
struct State {
    pages: VecDeque<Result<RelayPage, RelayError>>,
    submit_results: VecDeque<Result<Accepted, RelayError>>,
    fetches: Vec<(i64, Option<String>)>,
    submissions: Vec<Vec<u8>>,
}

/// A scripted [`RelayApi`].
///
/// Once the scripted pages run out, fetches return an empty page.
/// Submissions succeed unless a failure was scripted.
#[derive(Debug, Clone, Default)]
pub struct MockRelay {
    state: Arc<Mutex<State>>,
}

impl MockRelay {
    /// An empty relay.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Script the next page (no continuation).
    pub fn push_page(&self, records: Vec<RelayRecord>) {
        self.push_page_with_next(records, None);
    }

    /// Script the next page with a continuation key.
    pub fn push_page_with_next(&self, records: Vec<RelayRecord>, next_key: Option<&str>) {
        self.lock().pages.push_back(Ok(RelayPage {
            records,
            next_key: next_key.map(str::to_string),
        }));
    }

    /// Script the next fetch to fail.
    pub fn push_fetch_error(&self, error: RelayError) {
        self.lock().pages.push_back(Err(error));
    }

    /// Script the next submission to fail.
    pub fn push_submit_error(&self, error: RelayError) {
        self.lock().submit_results.push_back(Err(error));
    }

    /// `(from_ms, next_key)` of every fetch so far.
    pub fn fetches(&self) -> Vec<(i64, Option<String>)> {
        self.lock().fetches.clone()
    }

    /// Payload of every submission so far, including failed ones.
    pub fn submissions(&self) -> Vec<Vec<u8>> {
        self.lock().submissions.clone()
    }

    /// Scripted pages not yet handed out.
    pub fn remaining_pages(&self) -> usize {
        self.lock().pages.len()
    }
}

#[async_trait]
impl RelayApi for MockRelay {
    async fn fetch_page(
        &self,
        from_ms: i64,
        next_key: Option<&str>,
        _limit: usize,
    ) -> Result<RelayPage, RelayError> {
        let mut state = self.lock();
        state.fetches.push((from_ms, next_key.map(str::to_string)));
        state.pages.pop_front().unwrap_or_else(|| Ok(RelayPage::default()))
    }

    async fn submit(&self, payload: &[u8]) -> Result<Accepted, RelayError> {
        let mut state = self.lock();
        state.submissions.push(payload.to_vec());
        state
            .submit_results
            .pop_front()
            .unwrap_or(Ok(Accepted { len: payload.len() }))
    }
}
