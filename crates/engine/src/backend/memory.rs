//! Scripted backend fake for engine tests.
//!
//! Search/count/scroll responses are queued ahead of time and popped in
//! call order; writes are recorded for assertions. An empty queue
//! yields an empty result set, so incidental lookups (silence checks,
//! resume probes) don't need explicit scripting.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use serde_json::{json, Value};

use super::{BackendError, SearchBackend, SearchOptions};

#[derive(Default)]
pub struct FakeBackend {
    search_responses: Mutex<VecDeque<Value>>,
    count_responses: Mutex<VecDeque<u64>>,
    scroll_responses: Mutex<VecDeque<Value>>,
    pub searches: Mutex<Vec<(String, Value)>>,
    pub counts: Mutex<Vec<(String, Value)>>,
    pub indexed: Mutex<Vec<(String, Value)>>,
    pub deleted: Mutex<Vec<(String, String)>>,
    pub cleared_scrolls: Mutex<Vec<String>>,
    next_id: AtomicUsize,
    pub fail_indexing: AtomicBool,
    pub index_missing: AtomicBool,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a raw search response.
    pub fn push_search(&self, response: Value) {
        self.search_responses.lock().unwrap().push_back(response);
    }

    /// Queue a search response wrapping the given hits.
    pub fn push_hits(&self, hits: Vec<Value>) {
        let total = hits.len();
        self.push_search(hits_response(hits, total as u64));
    }

    pub fn push_count(&self, count: u64) {
        self.count_responses.lock().unwrap().push_back(count);
    }

    pub fn push_scroll(&self, response: Value) {
        self.scroll_responses.lock().unwrap().push_back(response);
    }

    pub fn indexed_docs(&self) -> Vec<(String, Value)> {
        self.indexed.lock().unwrap().clone()
    }

    pub fn deleted_docs(&self) -> Vec<(String, String)> {
        self.deleted.lock().unwrap().clone()
    }
}

/// Build a standard search response around `hits`.
pub fn hits_response(hits: Vec<Value>, total: u64) -> Value {
    json!({
        "hits": {
            "total": { "value": total },
            "hits": hits,
        }
    })
}

/// Build one raw hit document.
pub fn hit(id: &str, source: Value) -> Value {
    json!({
        "_id": id,
        "_index": "test-index",
        "_source": source,
    })
}

fn empty_response() -> Value {
    hits_response(Vec::new(), 0)
}

#[async_trait::async_trait]
impl SearchBackend for FakeBackend {
    async fn search(
        &self,
        index: &str,
        body: &Value,
        _opts: SearchOptions,
    ) -> Result<Value, BackendError> {
        self.searches
            .lock()
            .unwrap()
            .push((index.to_string(), body.clone()));
        Ok(self
            .search_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(empty_response))
    }

    async fn count(&self, index: &str, body: &Value) -> Result<u64, BackendError> {
        self.counts
            .lock()
            .unwrap()
            .push((index.to_string(), body.clone()));
        Ok(self.count_responses.lock().unwrap().pop_front().unwrap_or(0))
    }

    async fn scroll(&self, _scroll_id: &str, _keepalive: &str) -> Result<Value, BackendError> {
        Ok(self
            .scroll_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(empty_response))
    }

    async fn clear_scroll(&self, scroll_id: &str) -> Result<(), BackendError> {
        self.cleared_scrolls
            .lock()
            .unwrap()
            .push(scroll_id.to_string());
        Ok(())
    }

    async fn index_document(&self, index: &str, body: &Value) -> Result<String, BackendError> {
        if self.fail_indexing.load(Ordering::SeqCst) {
            return Err(BackendError::Transport("indexing disabled".to_string()));
        }
        self.indexed
            .lock()
            .unwrap()
            .push((index.to_string(), body.clone()));
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(format!("doc-{n}"))
    }

    async fn delete_document(&self, index: &str, id: &str) -> Result<(), BackendError> {
        self.deleted
            .lock()
            .unwrap()
            .push((index.to_string(), id.to_string()));
        Ok(())
    }

    async fn index_exists(&self, _index: &str) -> Result<bool, BackendError> {
        Ok(!self.index_missing.load(Ordering::SeqCst))
    }

    async fn ping(&self) -> bool {
        true
    }
}
