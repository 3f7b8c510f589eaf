use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Social counters attached to an entry, plus the viewer's own interactions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EntryMetrics {
    pub likes: u64,
    pub comments: u64,
    pub retweets: u64,
    pub liked: bool,
    pub commented: bool,
    pub retweeted: bool,
}

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Metrics request timed out")]
    Timeout,
    #[error("Metrics request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Metrics service returned status {0}")]
    HttpStatus(u16),
}

/// Read-only source of per-entry metrics, queried once per page.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Metrics keyed by GUID. GUIDs missing from the map count as zero.
    async fn metrics_for(
        &self,
        guids: &[String],
        viewer: Option<&str>,
    ) -> Result<HashMap<String, EntryMetrics>, MetricsError>;
}

/// Used when no metrics service is configured: every entry has zero counts.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMetrics;

#[async_trait]
impl MetricsSource for NoMetrics {
    async fn metrics_for(
        &self,
        _guids: &[String],
        _viewer: Option<&str>,
    ) -> Result<HashMap<String, EntryMetrics>, MetricsError> {
        Ok(HashMap::new())
    }
}

#[derive(Serialize)]
struct MetricsRequest<'a> {
    guids: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    viewer: Option<&'a str>,
}

#[derive(Deserialize)]
struct MetricsResponse {
    #[serde(default)]
    metrics: HashMap<String, EntryMetrics>,
}

/// Metrics service reached over HTTP: one JSON POST per page.
///
/// Request: `{"guids": [...], "viewer": "..."}`.
/// Response: `{"metrics": {"<guid>": {"likes": 1, ...}}}`.
pub struct HttpMetrics {
    client: reqwest::Client,
    url: String,
    token: Option<SecretString>,
    timeout: Duration,
}

impl HttpMetrics {
    pub fn new(client: reqwest::Client, url: impl Into<String>, token: Option<SecretString>) -> Self {
        Self {
            client,
            url: url.into(),
            token,
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl MetricsSource for HttpMetrics {
    async fn metrics_for(
        &self,
        guids: &[String],
        viewer: Option<&str>,
    ) -> Result<HashMap<String, EntryMetrics>, MetricsError> {
        if guids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut request = self
            .client
            .post(&self.url)
            .json(&MetricsRequest { guids, viewer });
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {}", token.expose_secret()));
        }

        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| MetricsError::Timeout)??;

        if !response.status().is_success() {
            return Err(MetricsError::HttpStatus(response.status().as_u16()));
        }

        let body: MetricsResponse = tokio::time::timeout(self.timeout, response.json())
            .await
            .map_err(|_| MetricsError::Timeout)??;
        Ok(body.metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_http_metrics_roundtrip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/metrics"))
            .and(header("Authorization", "Bearer s3cret"))
            .and(body_json(serde_json::json!({"guids": ["a", "b"], "viewer": "alice"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "metrics": {"a": {"likes": 3, "comments": 1, "liked": true}}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let source = HttpMetrics::new(
            reqwest::Client::new(),
            format!("{}/metrics", server.uri()),
            Some(SecretString::from("s3cret")),
        );
        let guids = vec!["a".to_string(), "b".to_string()];
        let metrics = source.metrics_for(&guids, Some("alice")).await.unwrap();

        let a = metrics["a"];
        assert_eq!(a.likes, 3);
        assert_eq!(a.comments, 1);
        assert_eq!(a.retweets, 0);
        assert!(a.liked);
        assert!(!metrics.contains_key("b"));
    }

    #[tokio::test]
    async fn test_http_metrics_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let source = HttpMetrics::new(reqwest::Client::new(), server.uri(), None);
        let result = source.metrics_for(&["a".to_string()], None).await;
        assert!(matches!(result, Err(MetricsError::HttpStatus(503))));
    }

    #[tokio::test]
    async fn test_empty_guids_skip_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let source = HttpMetrics::new(reqwest::Client::new(), server.uri(), None);
        assert!(source.metrics_for(&[], None).await.unwrap().is_empty());
    }
}
