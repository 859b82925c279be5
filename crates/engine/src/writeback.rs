//! Durable writeback persistence.
//!
//! The engine persists small JSON documents (tick status, alerts,
//! silences, errors) to the same search backend it queries, under
//! indices resolved from a base name. In debug mode nothing is written.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error};

use searchlight_core::time::{dt_to_ts, ts_now};

use crate::backend::{SearchBackend, WritebackKind};

#[derive(Clone)]
pub struct WritebackWriter {
    backend: Arc<dyn SearchBackend>,
    base_index: String,
    debug: bool,
}

impl WritebackWriter {
    pub fn new(backend: Arc<dyn SearchBackend>, base_index: &str, debug: bool) -> Self {
        Self {
            backend,
            base_index: base_index.to_string(),
            debug,
        }
    }

    pub fn base_index(&self) -> &str {
        &self.base_index
    }

    pub fn index_for(&self, kind: WritebackKind) -> String {
        self.backend.resolve_writeback_index(&self.base_index, kind)
    }

    /// Persist one document. Returns the document id, or `None` when
    /// running in debug mode or when the write failed (failures are
    /// logged, never fatal; callers fall back to in-memory state).
    pub async fn write(&self, kind: WritebackKind, mut body: Value) -> Option<String> {
        if let Some(obj) = body.as_object_mut() {
            obj.entry("@timestamp")
                .or_insert_with(|| Value::String(dt_to_ts(&ts_now())));
        }

        if self.debug {
            debug!(kind = ?kind, body = %body, "debug mode, skipping writeback");
            return None;
        }

        let index = self.index_for(kind);
        match self.backend.index_document(&index, &body).await {
            Ok(id) => Some(id),
            Err(e) => {
                error!(index = %index, error = %e.truncated(), "error writing to writeback index");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::FakeBackend;
    use serde_json::json;

    #[tokio::test]
    async fn write_adds_timestamp_and_routes_index() {
        let backend = Arc::new(FakeBackend::new());
        let writer = WritebackWriter::new(backend.clone(), "searchlight", false);
        let id = writer
            .write(WritebackKind::Status, json!({"rule_name": "r"}))
            .await;
        assert!(id.is_some());
        let docs = backend.indexed_docs();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].0, "searchlight_status");
        assert!(docs[0].1.get("@timestamp").is_some());
    }

    #[tokio::test]
    async fn debug_mode_skips_writes() {
        let backend = Arc::new(FakeBackend::new());
        let writer = WritebackWriter::new(backend.clone(), "searchlight", true);
        let id = writer.write(WritebackKind::Alert, json!({"a": 1})).await;
        assert!(id.is_none());
        assert!(backend.indexed_docs().is_empty());
    }

    #[tokio::test]
    async fn failed_write_returns_none() {
        let backend = Arc::new(FakeBackend::new());
        backend
            .fail_indexing
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let writer = WritebackWriter::new(backend.clone(), "searchlight", false);
        let id = writer.write(WritebackKind::Error, json!({"message": "x"})).await;
        assert!(id.is_none());
    }
}
