//! HTTP transport for posting bulk payloads to the indexing backend

use crate::errors::{Result, ShipperError, SinkError};
use reqwest::{Client, Response, StatusCode, Url};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: Option<String>,
}

/// `_bulk` response body; only the fields needed to find failed items.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BulkResponse {
    #[serde(default)]
    pub errors: bool,
    #[serde(default)]
    pub items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkItem {
    pub status: u16,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

impl BulkResponse {
    /// Status of the `index`th item, whatever its action key.
    pub fn item(&self, index: usize) -> Option<&BulkItem> {
        self.items.get(index).and_then(|item| item.values().next())
    }
}

/// HTTP transport for NDJSON bulk requests
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    endpoint: std::result::Result<Url, String>,
    timeout: Duration,
    auth: Option<BasicAuth>,
}

impl HttpTransport {
    /// Create a new HTTP transport. A malformed endpoint does not fail here:
    /// every request reports it as a permanent sink failure instead.
    pub fn new(endpoint: &str, http_timeout: Duration, auth: Option<BasicAuth>) -> Result<Self> {
        let client = Client::builder()
            .timeout(http_timeout)
            .user_agent(format!("log_shipper/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(ShipperError::Http)?;

        Ok(Self {
            client,
            endpoint: parse_endpoint(endpoint),
            timeout: http_timeout,
            auth,
        })
    }

    pub fn endpoint(&self) -> Option<&Url> {
        self.endpoint.as_ref().ok()
    }

    fn url(&self, path: &str) -> std::result::Result<String, SinkError> {
        let endpoint = self
            .endpoint
            .as_ref()
            .map_err(|reason| SinkError::Permanent(reason.clone()))?;
        Ok(format!("{}/{}", endpoint.as_str().trim_end_matches('/'), path))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            Some(auth) => request.basic_auth(&auth.username, auth.password.as_ref()),
            None => request,
        }
    }

    /// Post an NDJSON body to `{endpoint}/_bulk`.
    pub async fn post_bulk(&self, body: Vec<u8>) -> std::result::Result<BulkResponse, SinkError> {
        let url = self.url("_bulk")?;
        debug!("Posting {} byte bulk request to {}", body.len(), url);

        let request = self
            .authorize(self.client.post(&url))
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body);

        let response = timeout(self.timeout, request.send())
            .await
            .map_err(|_| SinkError::Transient("request timeout".to_string()))?
            .map_err(classify_request_error)?;

        self.handle_response(response).await
    }

    async fn handle_response(&self, response: Response) -> std::result::Result<BulkResponse, SinkError> {
        let status = response.status();
        let body = response.text().await.unwrap_or_else(|_| String::new());

        if status.is_success() {
            return match serde_json::from_str::<BulkResponse>(&body) {
                Ok(parsed) => Ok(parsed),
                Err(e) => {
                    warn!("Unreadable bulk response body, treating {} as full acknowledgment: {}", status, e);
                    Ok(BulkResponse::default())
                }
            };
        }

        Err(classify_status(status, &body))
    }

    /// Health check the endpoint root.
    pub async fn health_check(&self) -> std::result::Result<(), SinkError> {
        let url = self.url("")?;
        debug!("Performing health check against {}", url);

        let response = timeout(self.timeout, self.authorize(self.client.get(&url)).send())
            .await
            .map_err(|_| SinkError::Transient("health check timeout".to_string()))?
            .map_err(classify_request_error)?;

        if !response.status().is_success() {
            return Err(classify_status(response.status(), ""));
        }
        Ok(())
    }
}

fn parse_endpoint(endpoint: &str) -> std::result::Result<Url, String> {
    let url = Url::parse(endpoint).map_err(|e| format!("malformed endpoint '{}': {}", endpoint, e))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(format!("unsupported endpoint scheme '{}' in '{}'", scheme, endpoint)),
    }
}

fn classify_request_error(err: reqwest::Error) -> SinkError {
    if err.is_builder() {
        SinkError::Permanent(format!("invalid request: {}", err))
    } else {
        SinkError::Transient(err.to_string())
    }
}

/// Map a non-success status to what the worker should do with the batch.
pub fn classify_status(status: StatusCode, body: &str) -> SinkError {
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, body)
    };

    match status.as_u16() {
        400 | 413 => SinkError::Rejected(detail),
        401 | 403 | 404 | 405 => SinkError::Permanent(detail),
        _ => SinkError::Transient(detail),
    }
}

/// Statuses of individual bulk items that are worth sending again.
pub fn is_retryable_item(status: u16) -> bool {
    status == 429 || (500..=599).contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_creation() {
        let transport = HttpTransport::new("http://localhost:9200", Duration::from_secs(10), None).unwrap();
        assert_eq!(transport.endpoint().map(Url::as_str), Some("http://localhost:9200/"));
        assert_eq!(transport.url("_bulk").unwrap(), "http://localhost:9200/_bulk");
    }

    #[test]
    fn test_malformed_endpoint_is_permanent() {
        let transport = HttpTransport::new("not a url", Duration::from_secs(1), None).unwrap();
        assert!(transport.endpoint().is_none());
        assert!(matches!(transport.url("_bulk"), Err(SinkError::Permanent(_))));

        let transport = HttpTransport::new("ftp://logs.internal", Duration::from_secs(1), None).unwrap();
        assert!(matches!(transport.url("_bulk"), Err(SinkError::Permanent(_))));
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(classify_status(StatusCode::BAD_REQUEST, ""), SinkError::Rejected(_)));
        assert!(matches!(classify_status(StatusCode::PAYLOAD_TOO_LARGE, ""), SinkError::Rejected(_)));
        assert!(matches!(classify_status(StatusCode::UNAUTHORIZED, ""), SinkError::Permanent(_)));
        assert!(matches!(classify_status(StatusCode::NOT_FOUND, ""), SinkError::Permanent(_)));
        assert!(matches!(classify_status(StatusCode::TOO_MANY_REQUESTS, ""), SinkError::Transient(_)));
        assert!(matches!(classify_status(StatusCode::SERVICE_UNAVAILABLE, ""), SinkError::Transient(_)));
    }

    #[test]
    fn test_bulk_response_parsing() {
        let body = r#"{
            "took": 30,
            "errors": true,
            "items": [
                {"index": {"_index": "app", "status": 201}},
                {"create": {"_index": "app", "status": 429, "error": {"type": "es_rejected_execution_exception"}}},
                {"index": {"_index": "app", "status": 400, "error": {"type": "mapper_parsing_exception"}}}
            ]
        }"#;

        let response: BulkResponse = serde_json::from_str(body).unwrap();
        assert!(response.errors);
        assert_eq!(response.item(0).unwrap().status, 201);
        assert_eq!(response.item(1).unwrap().status, 429);
        assert!(response.item(2).unwrap().error.is_some());
        assert!(response.item(3).is_none());

        assert!(is_retryable_item(429));
        assert!(is_retryable_item(503));
        assert!(!is_retryable_item(400));
    }
}
