//! Bearer-token JSON client for the Databricks control planes.
//!
//! Two hosts are in play: the regional account host and the per-workspace
//! host. Azure deployments additionally identify the workspace via extra
//! headers carrying the workspace resource id and a management-plane token.
//!
//! Error classification is typed: the HTTP status and the `error_code` field
//! of the JSON error payload drive fallback decisions in resolution chains.
//! Substring sniffing of the body survives only as a legacy shim here, for
//! API versions that omit the structured code.

use serde_json::Value;
use thiserror::Error;
use ureq::Agent;

pub const WORKSPACE_RESOURCE_ID_HEADER: &str = "X-Databricks-Azure-Workspace-Resource-Id";
pub const MANAGEMENT_TOKEN_HEADER: &str = "X-Databricks-Azure-SP-Management-Token";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
}

#[derive(Debug, Error)]
pub enum ApiError {
    /// Non-2xx response, with the error code parsed from the body when the
    /// API provided one.
    #[error("API error {status}: {body}")]
    Status {
        status: u16,
        code: Option<String>,
        body: String,
    },
    #[error("API transport error: {0}")]
    Transport(String),
    #[error("API response was not valid JSON: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    fn classified_as(&self, error_code: &str) -> bool {
        let ApiError::Status { code, body, .. } = self else {
            return false;
        };
        match code {
            Some(code) => code == error_code,
            // Legacy shim: older endpoints return unstructured bodies.
            None => body.contains(error_code),
        }
    }

    /// The path does not exist on this workspace (chain: try next strategy).
    pub fn is_endpoint_not_found(&self) -> bool {
        self.classified_as("ENDPOINT_NOT_FOUND")
    }

    /// The filter or parameter is not supported (chain: try next strategy).
    pub fn is_invalid_parameter(&self) -> bool {
        self.classified_as("INVALID_PARAMETER_VALUE")
    }
}

/// Prefix bare hosts with the https scheme.
pub fn normalize_host(host: &str) -> String {
    if host.is_empty() || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("https://{host}")
    }
}

/// Minimal JSON-over-HTTPS interface; the trait exists so resolution chains
/// can run against canned responses in tests.
pub trait ControlPlane {
    fn call(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value, ApiError>;
}

pub struct ApiClient {
    agent: Agent,
    base: String,
    token: String,
    extra_headers: Vec<(String, String)>,
}

impl ApiClient {
    pub fn new(host: &str, token: &str) -> Self {
        // Non-2xx statuses come back as readable responses so the error body
        // can be classified.
        let agent: Agent = Agent::config_builder()
            .http_status_as_error(false)
            .build()
            .into();
        ApiClient {
            agent,
            base: normalize_host(host).trim_end_matches('/').to_string(),
            token: token.to_string(),
            extra_headers: Vec::new(),
        }
    }

    /// Attach an extra header to every request. Empty values are dropped,
    /// matching callers that pass through optional tokens.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if !value.is_empty() {
            self.extra_headers.push((name.to_string(), value.to_string()));
        }
        self
    }
}

impl ControlPlane for ApiClient {
    fn call(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value, ApiError> {
        let url = format!("{}{}", self.base, path);
        let auth = format!("Bearer {}", self.token);
        tracing::debug!(?method, %url, "api call");
        let transport = |err: ureq::Error| ApiError::Transport(err.to_string());
        let result = match method {
            Method::Get => {
                let mut request = self
                    .agent
                    .get(&url)
                    .header("Authorization", &auth)
                    .header("Content-Type", "application/json");
                for (name, value) in &self.extra_headers {
                    request = request.header(name, value);
                }
                request.call()
            }
            Method::Post | Method::Put | Method::Patch => {
                let mut request = match method {
                    Method::Post => self.agent.post(&url),
                    Method::Put => self.agent.put(&url),
                    _ => self.agent.patch(&url),
                }
                .header("Authorization", &auth)
                .header("Content-Type", "application/json");
                for (name, value) in &self.extra_headers {
                    request = request.header(name, value);
                }
                match body {
                    Some(body) => request.send_json(body),
                    None => request.send_empty(),
                }
            }
        };
        let mut response = result.map_err(transport)?;
        let status = response.status().as_u16();
        let text = response.body_mut().read_to_string().map_err(transport)?;
        if !(200..300).contains(&status) {
            return Err(ApiError::Status {
                status,
                code: parse_error_code(&text),
                body: text,
            });
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|err| ApiError::Decode(err.to_string()))
    }
}

fn parse_error_code(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value
        .get("error_code")
        .and_then(Value::as_str)
        .map(str::to_string)
}
