//! Reqwest-based search backend client.

use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use serde_json::{json, Value};

use super::{BackendError, SearchBackend, SearchOptions};

/// HTTP client for Elasticsearch/OpenSearch-compatible backends.
pub struct HttpBackend {
    base_url: String,
    client: reqwest::Client,
    username: Option<String>,
    password: Option<String>,
    /// When set, every request is appended to this file as a curl
    /// command line (`--es_debug_trace`).
    trace: Option<Mutex<std::fs::File>>,
}

impl HttpBackend {
    pub fn new(base_url: &str, username: Option<String>, password: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            username,
            password,
            trace: None,
        }
    }

    /// Enable request tracing to a file.
    pub fn with_trace_file(mut self, path: &Path) -> Result<Self, BackendError> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| BackendError::Transport(format!("cannot open trace file: {e}")))?;
        self.trace = Some(Mutex::new(file));
        Ok(self)
    }

    fn trace_request(&self, method: &str, url: &str, body: Option<&Value>) {
        let Some(trace) = &self.trace else { return };
        let Ok(mut file) = trace.lock() else { return };
        let line = match body {
            Some(b) => format!("curl -X{} '{}' -H 'Content-Type: application/json' -d '{}'\n", method, url, b),
            None => format!("curl -X{} '{}'\n", method, url),
        };
        let _ = file.write_all(line.as_bytes());
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, url);
        if let Some(username) = &self.username {
            builder = builder.basic_auth(username, self.password.as_deref());
        }
        builder
    }

    async fn execute_json(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Value, BackendError> {
        self.trace_request(method.as_str(), url, body);
        let mut builder = self.request(method, url);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(BackendError::Http {
                status: status.as_u16(),
                body: text,
            });
        }
        serde_json::from_str(&text).map_err(|e| BackendError::Response(e.to_string()))
    }
}

#[async_trait::async_trait]
impl SearchBackend for HttpBackend {
    async fn search(
        &self,
        index: &str,
        body: &Value,
        opts: SearchOptions,
    ) -> Result<Value, BackendError> {
        let mut params = vec!["ignore_unavailable=true".to_string()];
        if let Some(size) = opts.size {
            params.push(format!("size={size}"));
        }
        if let Some(scroll) = &opts.scroll {
            params.push(format!("scroll={scroll}"));
        }
        if let Some(includes) = &opts.source_includes {
            if !includes.is_empty() {
                params.push(format!("_source_includes={}", includes.join(",")));
            }
        }
        let url = format!("{}/{}/_search?{}", self.base_url, index, params.join("&"));
        self.execute_json(reqwest::Method::POST, &url, Some(body)).await
    }

    async fn count(&self, index: &str, body: &Value) -> Result<u64, BackendError> {
        let url = format!(
            "{}/{}/_count?ignore_unavailable=true",
            self.base_url, index
        );
        let res = self.execute_json(reqwest::Method::POST, &url, Some(body)).await?;
        res.get("count")
            .and_then(Value::as_u64)
            .ok_or_else(|| BackendError::Response("count response missing 'count'".to_string()))
    }

    async fn scroll(&self, scroll_id: &str, keepalive: &str) -> Result<Value, BackendError> {
        let url = format!("{}/_search/scroll", self.base_url);
        let body = json!({ "scroll": keepalive, "scroll_id": scroll_id });
        self.execute_json(reqwest::Method::POST, &url, Some(&body)).await
    }

    async fn clear_scroll(&self, scroll_id: &str) -> Result<(), BackendError> {
        let url = format!("{}/_search/scroll", self.base_url);
        let body = json!({ "scroll_id": [scroll_id] });
        self.execute_json(reqwest::Method::DELETE, &url, Some(&body))
            .await
            .map(|_| ())
    }

    async fn index_document(&self, index: &str, body: &Value) -> Result<String, BackendError> {
        let url = format!("{}/{}/_doc?refresh=true", self.base_url, index);
        let res = self.execute_json(reqwest::Method::POST, &url, Some(body)).await?;
        res.get("_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| BackendError::Response("index response missing '_id'".to_string()))
    }

    async fn delete_document(&self, index: &str, id: &str) -> Result<(), BackendError> {
        let url = format!("{}/{}/_doc/{}", self.base_url, index, id);
        self.execute_json(reqwest::Method::DELETE, &url, None)
            .await
            .map(|_| ())
    }

    async fn index_exists(&self, index: &str) -> Result<bool, BackendError> {
        let url = format!("{}/{}", self.base_url, index);
        self.trace_request("HEAD", &url, None);
        let response = self.request(reqwest::Method::HEAD, &url).send().await?;
        Ok(response.status().is_success())
    }

    async fn ping(&self) -> bool {
        let url = format!("{}/", self.base_url);
        match self.request(reqwest::Method::GET, &url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}
