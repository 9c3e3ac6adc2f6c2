//! Reference HTTP connector built on `reqwest`.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use reqwest::{Client, Method, header};
use toolflow_types::{HttpMethod, RequestStepConfig};
use toolflow_util::{build_request_url, parse_response_body, redact_sensitive, status_error_message, truncate_preview};
use tracing::{debug, warn};

use super::connector::{ConnectorResponse, StepConnector};
use crate::resolve::ResolvedRequest;

const USER_AGENT: &str = concat!("toolflow/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct HttpConnector {
    client: Client,
}

impl HttpConnector {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("build http client")?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

fn to_reqwest_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
        HttpMethod::Head => Method::HEAD,
        HttpMethod::Options => Method::OPTIONS,
    }
}

#[async_trait::async_trait]
impl StepConnector for HttpConnector {
    async fn execute(&self, _config: &RequestStepConfig, request: &ResolvedRequest) -> ConnectorResponse {
        let start = Instant::now();
        let url = match build_request_url(&request.url, &request.query_params) {
            Ok(url) => url,
            Err(error) => return ConnectorResponse::failed(format!("invalid url '{}': {error}", redact_sensitive(&request.url))),
        };
        let method = to_reqwest_method(request.method);
        debug!(
            method = %method,
            url = %redact_sensitive(url.as_str()),
            header_count = request.headers.len(),
            has_body = request.body.is_some(),
            "http request started"
        );

        let mut builder = self.client.request(method.clone(), url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            let has_content_type = request
                .headers
                .keys()
                .any(|name| name.eq_ignore_ascii_case(header::CONTENT_TYPE.as_str()));
            if !has_content_type && serde_json::from_str::<serde_json::Value>(body).is_ok() {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
            }
            builder = builder.body(body.clone());
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(error) => {
                warn!(
                    method = %method,
                    url = %redact_sensitive(url.as_str()),
                    error = %error,
                    duration_ms = start.elapsed().as_millis(),
                    "http request failed"
                );
                return ConnectorResponse::failed(format!("request to {} failed: {error}", redact_sensitive(url.as_str())));
            }
        };

        let status = response.status();
        let body_text = match response.text().await {
            Ok(text) => text,
            Err(error) => return ConnectorResponse::failed(format!("failed to read response body: {error}")),
        };
        let data = parse_response_body(&body_text);

        if !status.is_success() {
            let message = status_error_message(status.as_u16())
                .unwrap_or_else(|| format!("HTTP {}: {}", status.as_u16(), truncate_preview(&body_text, 200)));
            warn!(
                method = %method,
                url = %redact_sensitive(url.as_str()),
                status = %status,
                duration_ms = start.elapsed().as_millis(),
                "http request returned an error status"
            );
            return ConnectorResponse::failed_with_data(data, message);
        }

        debug!(
            method = %method,
            status = %status,
            body_len = body_text.len(),
            duration_ms = start.elapsed().as_millis(),
            "http request completed"
        );
        ConnectorResponse::ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(status_line: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("address");
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut buffer = vec![0u8; 8192];
            let read = socket.read(&mut buffer).await.expect("read");
            let response = format!(
                "{status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.expect("write");
            String::from_utf8_lossy(&buffer[..read]).into_owned()
        });
        (format!("http://{address}"), handle)
    }

    fn request(url: String) -> ResolvedRequest {
        ResolvedRequest {
            system_id: "crm".into(),
            url: format!("{url}/users"),
            method: HttpMethod::Get,
            headers: IndexMap::from([("X-Api-Key".to_string(), "k".to_string())]),
            query_params: IndexMap::from([("limit".to_string(), "2".to_string())]),
            body: None,
        }
    }

    #[tokio::test]
    async fn parses_json_responses() {
        let (base, server) = serve_once("HTTP/1.1 200 OK", r#"[{"id":1}]"#).await;
        let connector = HttpConnector::new(Duration::from_secs(5)).expect("client");
        let response = connector.execute(&RequestStepConfig::default(), &request(base)).await;
        assert!(response.success, "{response:?}");
        assert_eq!(response.data, json!([{"id": 1}]));

        let raw_request = server.await.expect("server").to_ascii_lowercase();
        assert!(raw_request.starts_with("get /users?limit=2 "));
        assert!(raw_request.contains("x-api-key: k"));
    }

    #[tokio::test]
    async fn error_statuses_become_failed_responses() {
        let (base, server) = serve_once("HTTP/1.1 404 Not Found", r#"{"message":"missing"}"#).await;
        let connector = HttpConnector::new(Duration::from_secs(5)).expect("client");
        let response = connector.execute(&RequestStepConfig::default(), &request(base)).await;
        server.await.expect("server");
        assert!(!response.success);
        assert_eq!(response.data, json!({"message": "missing"}));
        assert!(response.error.as_deref().is_some_and(|error| error.contains("404")));
    }
}
