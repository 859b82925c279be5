//! Search backend abstraction.
//!
//! The engine depends only on this trait, keeping it SDK-free; the
//! HTTP implementation lives in [`http`]. The writeback store is the
//! same kind of backend, addressed through suffixed index names.

pub mod http;

#[cfg(test)]
pub mod memory;

use serde_json::Value;

pub use http::HttpBackend;

/// The four writeback document kinds and their index suffix rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritebackKind {
    /// One per match/alert attempt; lives in the base index.
    Alert,
    /// One per rule tick.
    Status,
    Silence,
    Error,
}

impl WritebackKind {
    fn suffix(self) -> &'static str {
        match self {
            WritebackKind::Alert => "",
            WritebackKind::Status => "_status",
            WritebackKind::Silence => "_silence",
            WritebackKind::Error => "_error",
        }
    }
}

/// Errors from backend calls.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("shard failures: {0}")]
    ShardFailure(String),

    #[error("unexpected response shape: {0}")]
    Response(String),
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        BackendError::Transport(e.to_string())
    }
}

impl BackendError {
    /// Error text capped at 1024 bytes. Backend errors can be enormous
    /// (full shard stack traces); the cap keeps logs and writeback
    /// documents bounded.
    pub fn truncated(&self) -> String {
        let full = self.to_string();
        if full.len() > 1024 {
            let cut: String = full.chars().take(1024).collect();
            format!("{}... ({} characters removed)", cut, full.len() - cut.len())
        } else {
            full
        }
    }
}

/// Extra request parameters for a search call.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Page size (`size`); `None` leaves the backend default.
    pub size: Option<usize>,
    /// Open a scroll cursor with this keepalive.
    pub scroll: Option<String>,
    /// Restrict `_source` to these fields.
    pub source_includes: Option<Vec<String>>,
}

impl SearchOptions {
    pub fn size(n: usize) -> Self {
        Self {
            size: Some(n),
            ..Self::default()
        }
    }
}

/// Minimal search-backend surface the engine consumes.
#[async_trait::async_trait]
pub trait SearchBackend: Send + Sync {
    /// Execute a query body against an index. Returns the raw response.
    async fn search(
        &self,
        index: &str,
        body: &Value,
        opts: SearchOptions,
    ) -> Result<Value, BackendError>;

    /// Count documents matching a query body.
    async fn count(&self, index: &str, body: &Value) -> Result<u64, BackendError>;

    /// Continue a scroll cursor.
    async fn scroll(&self, scroll_id: &str, keepalive: &str) -> Result<Value, BackendError>;

    /// Release a scroll cursor.
    async fn clear_scroll(&self, scroll_id: &str) -> Result<(), BackendError>;

    /// Index a document; returns the generated `_id`.
    async fn index_document(&self, index: &str, body: &Value) -> Result<String, BackendError>;

    /// Delete a document by id.
    async fn delete_document(&self, index: &str, id: &str) -> Result<(), BackendError>;

    /// Whether an index (or matching alias) exists.
    async fn index_exists(&self, index: &str) -> Result<bool, BackendError>;

    /// Whether the backend answers at all.
    async fn ping(&self) -> bool;

    /// Map a writeback base name and document kind to a concrete index.
    fn resolve_writeback_index(&self, base: &str, kind: WritebackKind) -> String {
        format!("{}{}", base, kind.suffix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy;

    #[async_trait::async_trait]
    impl SearchBackend for Dummy {
        async fn search(
            &self,
            _index: &str,
            _body: &Value,
            _opts: SearchOptions,
        ) -> Result<Value, BackendError> {
            unimplemented!()
        }
        async fn count(&self, _index: &str, _body: &Value) -> Result<u64, BackendError> {
            unimplemented!()
        }
        async fn scroll(&self, _scroll_id: &str, _keepalive: &str) -> Result<Value, BackendError> {
            unimplemented!()
        }
        async fn clear_scroll(&self, _scroll_id: &str) -> Result<(), BackendError> {
            unimplemented!()
        }
        async fn index_document(&self, _index: &str, _body: &Value) -> Result<String, BackendError> {
            unimplemented!()
        }
        async fn delete_document(&self, _index: &str, _id: &str) -> Result<(), BackendError> {
            unimplemented!()
        }
        async fn index_exists(&self, _index: &str) -> Result<bool, BackendError> {
            unimplemented!()
        }
        async fn ping(&self) -> bool {
            true
        }
    }

    #[test]
    fn writeback_index_resolution() {
        let b = Dummy;
        assert_eq!(
            b.resolve_writeback_index("searchlight", WritebackKind::Alert),
            "searchlight"
        );
        assert_eq!(
            b.resolve_writeback_index("searchlight", WritebackKind::Status),
            "searchlight_status"
        );
        assert_eq!(
            b.resolve_writeback_index("searchlight", WritebackKind::Silence),
            "searchlight_silence"
        );
        assert_eq!(
            b.resolve_writeback_index("searchlight", WritebackKind::Error),
            "searchlight_error"
        );
    }

    #[test]
    fn error_truncation_caps_at_1024() {
        let err = BackendError::Transport("x".repeat(5000));
        let text = err.truncated();
        assert!(text.len() < 1100);
        assert!(text.contains("characters removed"));

        let short = BackendError::Transport("small".to_string());
        assert_eq!(short.truncated(), "transport error: small");
    }
}
