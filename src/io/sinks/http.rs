//! HTTP JSON sink
//!
//! POSTs the event as JSON with the event id as `Idempotency-Key`.
//! 5xx, 408, 429 and transport errors are retriable; any other non-2xx
//! status is a permanent rejection.

use super::Sink;
use crate::domain::error::SinkError;
use crate::domain::types::ScanEvent;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Auth {
    None,
    Basic(String, Option<String>),
    Bearer(String),
}

pub struct HttpSink {
    name: String,
    url: String,
    auth: Auth,
    client: reqwest::Client,
}

/// Map a response status onto the sink error taxonomy
pub fn classify_status(status: StatusCode) -> Result<(), SinkError> {
    if status.is_success() {
        return Ok(());
    }
    let reason = format!("HTTP {}", status.as_u16());
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        Err(SinkError::Retriable(reason))
    } else {
        Err(SinkError::Permanent(reason))
    }
}

fn classify_error(e: &reqwest::Error) -> SinkError {
    if e.is_builder() {
        SinkError::Permanent(e.to_string())
    } else {
        SinkError::Retriable(e.to_string())
    }
}

impl HttpSink {
    pub fn new(name: &str, url: &str, auth: Auth, timeout: Duration) -> reqwest::Result<Self> {
        // one client per sink for connection pooling
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { name: name.to_string(), url: url.to_string(), auth, client })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Sink for HttpSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, event: &ScanEvent) -> Result<(), SinkError> {
        let start = Instant::now();
        let mut request = self
            .client
            .post(&self.url)
            .header("Idempotency-Key", event.event_id.to_string())
            .json(event);
        request = match &self.auth {
            Auth::None => request,
            Auth::Basic(user, password) => request.basic_auth(user, password.as_deref()),
            Auth::Bearer(token) => request.bearer_auth(token),
        };

        let response = request.send().await.map_err(|e| classify_error(&e))?;
        let status = response.status();
        debug!(
            sink = %self.name,
            status = %status.as_u16(),
            latency_ms = %start.elapsed().as_millis(),
            "http_sink_response"
        );
        classify_status(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_statuses() {
        assert!(classify_status(StatusCode::OK).is_ok());
        assert!(classify_status(StatusCode::CREATED).is_ok());
        assert!(classify_status(StatusCode::NO_CONTENT).is_ok());
    }

    #[test]
    fn test_retriable_statuses() {
        for status in [
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::TOO_MANY_REQUESTS,
        ] {
            assert!(classify_status(status).unwrap_err().is_retriable(), "{status}");
        }
    }

    #[test]
    fn test_permanent_statuses() {
        for status in [StatusCode::BAD_REQUEST, StatusCode::UNAUTHORIZED, StatusCode::NOT_FOUND] {
            let err = classify_status(status).unwrap_err();
            assert!(!err.is_retriable(), "{status}");
            assert_eq!(err.reason(), format!("HTTP {}", status.as_u16()));
        }
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_retriable() {
        use chrono::Utc;
        use uuid::Uuid;

        // port 9 (discard) on loopback is closed on CI hosts
        let sink =
            HttpSink::new("crm", "http://127.0.0.1:9/events", Auth::None, Duration::from_millis(500)).unwrap();
        let event = ScanEvent {
            event_id: Uuid::now_v7(),
            scanner_id: "pi".to_string(),
            sequence_no: 1,
            object_id: "OBJ002".to_string(),
            object_name: "Laptop".to_string(),
            category: "personal".to_string(),
            location_id: "LOC002".to_string(),
            location_name: "Server Room".to_string(),
            observed_at: Utc::now(),
        };
        let err = sink.send(&event).await.unwrap_err();
        assert!(err.is_retriable());
    }
}
