//! Control-plane client for the notebook service.
//!
//! Everything the core needs from the service goes through the
//! [`ControlPlane`] trait: runtime assignment, kernel session management on
//! the runtime's proxy, and keep-alive pings. The production implementation
//! is a thin reqwest wrapper; tests substitute mocks.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Accelerator category a runtime is requested for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcceleratorFamily {
    Gpu,
    Tpu,
    /// CPU-only runtime; the service calls this the default variant.
    Default,
}

impl AcceleratorFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            AcceleratorFamily::Gpu => "gpu",
            AcceleratorFamily::Tpu => "tpu",
            AcceleratorFamily::Default => "default",
        }
    }
}

impl fmt::Display for AcceleratorFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Proxy credentials for reaching a runtime's kernel endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proxy {
    pub url: String,
    pub token: String,
    #[serde(default)]
    pub token_expires_in_seconds: u64,
}

/// A runtime the service has assigned to this account. The endpoint is the
/// pooling key; the proxy token gets replaced in place when an existing
/// runtime is reused.
#[derive(Debug, Clone)]
pub struct AssignedRuntime {
    pub label: String,
    pub accelerator: String,
    pub endpoint: String,
    pub proxy: Proxy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Assignment {
    pub endpoint: String,
    pub accelerator: String,
    pub family: AcceleratorFamily,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub proxy: Option<Proxy>,
}

impl Assignment {
    pub fn into_runtime(self, proxy: Proxy) -> AssignedRuntime {
        AssignedRuntime {
            label: self
                .label
                .unwrap_or_else(|| format!("{} runtime", self.accelerator)),
            accelerator: self.accelerator,
            endpoint: self.endpoint,
            proxy,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssignResponse {
    pub assignment: Assignment,
    #[serde(default)]
    pub is_new: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KernelInfo {
    pub id: String,
    #[serde(default)]
    pub execution_state: String,
    #[serde(default)]
    pub connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub kernel: KernelInfo,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("invalid control plane configuration: {0}")]
    InvalidConfig(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("control plane returned status {status}: {body}")]
    Http { status: StatusCode, body: String },
    #[error("too many concurrent runtime assignments: {0}")]
    CapacityExceeded(String),
    #[error("invalid control plane response: {0}")]
    InvalidResponse(String),
}

impl ApiError {
    /// 5xx-class failures are safe to retry against another candidate;
    /// everything else is terminal for the current attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Http { status, .. } if status.is_server_error())
    }

    pub fn is_capacity_exceeded(&self) -> bool {
        matches!(self, ApiError::CapacityExceeded(_))
    }
}

#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn assign(
        &self,
        idempotency_key: &str,
        family: AcceleratorFamily,
        accelerator: Option<&str>,
    ) -> Result<AssignResponse, ApiError>;

    async fn list_assignments(&self) -> Result<Vec<Assignment>, ApiError>;

    /// Accelerator names this account may request within a family.
    async fn list_accelerators(&self, family: AcceleratorFamily) -> Result<Vec<String>, ApiError>;

    async fn refresh_connection(&self, endpoint: &str) -> Result<Proxy, ApiError>;

    async fn create_session(
        &self,
        notebook_path: &str,
        kernel_name: &str,
        proxy: &Proxy,
    ) -> Result<SessionInfo, ApiError>;

    async fn get_kernel(&self, kernel_id: &str, proxy: &Proxy) -> Result<KernelInfo, ApiError>;

    async fn delete_kernel(&self, kernel_id: &str, proxy: &Proxy) -> Result<(), ApiError>;

    async fn list_kernels(&self, proxy: &Proxy) -> Result<Vec<KernelInfo>, ApiError>;

    async fn send_keep_alive(&self, endpoint: &str) -> Result<(), ApiError>;
}

/// Production control plane over HTTP.
pub struct HttpControlPlane {
    client: reqwest::Client,
    base_url: Url,
    bearer_token: Option<String>,
}

impl HttpControlPlane {
    pub fn new(base_url: &str, bearer_token: Option<String>) -> Result<Self, ApiError> {
        let parsed = Url::parse(base_url)
            .map_err(|err| ApiError::InvalidConfig(format!("invalid api base url: {err}")))?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: parsed,
            bearer_token,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        self.base_url
            .join(path)
            .map_err(|err| ApiError::InvalidConfig(format!("invalid endpoint {path}: {err}")))
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn proxy_endpoint(proxy: &Proxy, path: &str) -> Result<Url, ApiError> {
        let base = Url::parse(&proxy.url)
            .map_err(|err| ApiError::InvalidResponse(format!("invalid proxy url: {err}")))?;
        let mut url = base
            .join(path)
            .map_err(|err| ApiError::InvalidResponse(format!("invalid proxy path {path}: {err}")))?;
        url.query_pairs_mut().append_pair("token", &proxy.token);
        Ok(url)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_failure(status, body))
    }
}

/// The service reports an exhausted assignment quota either as a conflict
/// status or with an error body naming the condition.
fn classify_failure(status: StatusCode, body: String) -> ApiError {
    let lowered = body.to_ascii_lowercase();
    if status == StatusCode::CONFLICT || lowered.contains("too many assignments") {
        let detail = if body.trim().is_empty() {
            "assignment quota exhausted".to_string()
        } else {
            body
        };
        return ApiError::CapacityExceeded(detail);
    }
    ApiError::Http { status, body }
}

#[derive(Debug, Serialize)]
struct AssignRequest<'a> {
    idempotency_key: &'a str,
    family: AcceleratorFamily,
    #[serde(skip_serializing_if = "Option::is_none")]
    accelerator: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ListAssignmentsResponse {
    #[serde(default)]
    assignments: Vec<Assignment>,
}

#[derive(Debug, Deserialize)]
struct ListAcceleratorsResponse {
    #[serde(default)]
    accelerators: Vec<String>,
}

#[derive(Debug, Serialize)]
struct EndpointRequest<'a> {
    endpoint: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateSessionRequest<'a> {
    path: &'a str,
    #[serde(rename = "type")]
    session_type: &'a str,
    kernel: KernelSpec<'a>,
}

#[derive(Debug, Serialize)]
struct KernelSpec<'a> {
    name: &'a str,
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn assign(
        &self,
        idempotency_key: &str,
        family: AcceleratorFamily,
        accelerator: Option<&str>,
    ) -> Result<AssignResponse, ApiError> {
        let endpoint = self.endpoint("assignments")?;
        let request = AssignRequest {
            idempotency_key,
            family,
            accelerator,
        };
        let response = self
            .authorized(self.client.post(endpoint))
            .json(&request)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn list_assignments(&self) -> Result<Vec<Assignment>, ApiError> {
        let endpoint = self.endpoint("assignments")?;
        let response = self.authorized(self.client.get(endpoint)).send().await?;
        let payload: ListAssignmentsResponse = Self::check(response).await?.json().await?;
        Ok(payload.assignments)
    }

    async fn list_accelerators(&self, family: AcceleratorFamily) -> Result<Vec<String>, ApiError> {
        let mut endpoint = self.endpoint("accelerators")?;
        endpoint
            .query_pairs_mut()
            .append_pair("family", family.as_str());
        let response = self.authorized(self.client.get(endpoint)).send().await?;
        let payload: ListAcceleratorsResponse = Self::check(response).await?.json().await?;
        Ok(payload.accelerators)
    }

    async fn refresh_connection(&self, endpoint: &str) -> Result<Proxy, ApiError> {
        let url = self.endpoint("assignments/refresh")?;
        let response = self
            .authorized(self.client.post(url))
            .json(&EndpointRequest { endpoint })
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn create_session(
        &self,
        notebook_path: &str,
        kernel_name: &str,
        proxy: &Proxy,
    ) -> Result<SessionInfo, ApiError> {
        let url = Self::proxy_endpoint(proxy, "api/sessions")?;
        let request = CreateSessionRequest {
            path: notebook_path,
            session_type: "notebook",
            kernel: KernelSpec { name: kernel_name },
        };
        let response = self.client.post(url).json(&request).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn get_kernel(&self, kernel_id: &str, proxy: &Proxy) -> Result<KernelInfo, ApiError> {
        let url = Self::proxy_endpoint(proxy, &format!("api/kernels/{kernel_id}"))?;
        let response = self.client.get(url).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn delete_kernel(&self, kernel_id: &str, proxy: &Proxy) -> Result<(), ApiError> {
        let url = Self::proxy_endpoint(proxy, &format!("api/kernels/{kernel_id}"))?;
        let response = self.client.delete(url).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn list_kernels(&self, proxy: &Proxy) -> Result<Vec<KernelInfo>, ApiError> {
        let url = Self::proxy_endpoint(proxy, "api/kernels")?;
        let response = self.client.get(url).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn send_keep_alive(&self, endpoint: &str) -> Result<(), ApiError> {
        let url = self.endpoint("assignments/keep-alive")?;
        let response = self
            .authorized(self.client.post(url))
            .json(&EndpointRequest { endpoint })
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}
