use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use toolflow_types::RequestStepConfig;
use toolflow_util::redact_sensitive;
use tracing::{debug, warn};

use crate::resolve::ResolvedRequest;

/// Result reported by a connector for one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectorResponse {
    pub success: bool,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConnectorResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self::failed_with_data(Value::Null, error)
    }

    pub fn failed_with_data(data: Value, error: impl Into<String>) -> Self {
        Self {
            success: false,
            data,
            error: Some(error.into()),
        }
    }
}

/// Connector family, derived from the request URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http,
    Sql,
    FileTransfer,
}

impl Protocol {
    /// Protocol for `url`, or `None` when the scheme is missing or unknown.
    pub fn from_url(url: &str) -> Option<Self> {
        let (scheme, _) = url.trim().split_once("://")?;
        match scheme.to_ascii_lowercase().as_str() {
            "http" | "https" => Some(Protocol::Http),
            "postgres" | "postgresql" | "mysql" | "mariadb" | "mssql" | "sqlserver" | "sqlite" | "oracle" => Some(Protocol::Sql),
            "ftp" | "ftps" | "sftp" => Some(Protocol::FileTransfer),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Sql => "sql",
            Protocol::FileTransfer => "file_transfer",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Performs the I/O of a request step.
///
/// Implementations report remote failures through [`ConnectorResponse::failed`] rather than
/// panicking; the orchestrator decides whether a failure aborts the run.
#[async_trait::async_trait]
pub trait StepConnector: Send + Sync {
    async fn execute(&self, config: &RequestStepConfig, request: &ResolvedRequest) -> ConnectorResponse;
}

/// Connector that performs no I/O and echoes the resolved request as its data.
pub struct NoopConnector;

#[async_trait::async_trait]
impl StepConnector for NoopConnector {
    async fn execute(&self, _config: &RequestStepConfig, request: &ResolvedRequest) -> ConnectorResponse {
        let mut echo = Map::new();
        echo.insert("method".into(), Value::String(request.method.as_str().to_string()));
        echo.insert("url".into(), Value::String(request.url.clone()));
        echo.insert(
            "headers".into(),
            Value::Object(
                request
                    .headers
                    .iter()
                    .map(|(name, value)| (name.clone(), Value::String(redact_sensitive(value))))
                    .collect(),
            ),
        );
        echo.insert(
            "queryParams".into(),
            Value::Object(
                request
                    .query_params
                    .iter()
                    .map(|(name, value)| (name.clone(), Value::String(value.clone())))
                    .collect(),
            ),
        );
        if let Some(body) = &request.body {
            echo.insert("body".into(), Value::String(body.clone()));
        }
        ConnectorResponse::ok(Value::Object(echo))
    }
}

/// Connectors registered per protocol.
#[derive(Clone, Default)]
pub struct ConnectorSet {
    connectors: HashMap<Protocol, Arc<dyn StepConnector>>,
}

impl fmt::Debug for ConnectorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut protocols: Vec<&'static str> = self.connectors.keys().map(Protocol::as_str).collect();
        protocols.sort_unstable();
        f.debug_struct("ConnectorSet").field("protocols", &protocols).finish()
    }
}

impl ConnectorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connector(mut self, protocol: Protocol, connector: Arc<dyn StepConnector>) -> Self {
        self.register(protocol, connector);
        self
    }

    /// Registers `connector`, replacing any connector previously registered for `protocol`.
    pub fn register(&mut self, protocol: Protocol, connector: Arc<dyn StepConnector>) {
        self.connectors.insert(protocol, connector);
    }

    pub fn get(&self, protocol: Protocol) -> Option<&Arc<dyn StepConnector>> {
        self.connectors.get(&protocol)
    }

    /// Dispatches by URL scheme. Unknown schemes and unregistered protocols yield a failed
    /// response.
    pub async fn execute(&self, config: &RequestStepConfig, request: &ResolvedRequest) -> ConnectorResponse {
        let Some(protocol) = Protocol::from_url(&request.url) else {
            warn!(url = %redact_sensitive(&request.url), "unsupported url scheme");
            return ConnectorResponse::failed(format!(
                "unsupported url scheme in '{}'; expected http(s), a SQL scheme or ftp/sftp",
                redact_sensitive(&request.url)
            ));
        };
        let Some(connector) = self.connectors.get(&protocol) else {
            warn!(protocol = %protocol, system_id = %request.system_id, "no connector registered");
            return ConnectorResponse::failed(format!("no connector registered for protocol '{protocol}'"));
        };
        debug!(protocol = %protocol, system_id = %request.system_id, "dispatching request to connector");
        connector.execute(config, request).await
    }
}
