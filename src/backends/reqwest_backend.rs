//! Reqwest-based [`HttpBackend`] implementation.
//!
//! Both HTTP backend kinds are reqwest clients with their own cookie jar and
//! connection pool. They differ in connection behaviour: the primary
//! negotiates HTTP/2 like a modern browser, the secondary stays on HTTP/1.1
//! with a shorter idle pool, so the two kinds present different transport
//! characteristics to the remote side.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::{
    HeaderMap as HttpHeaderMap, HeaderName as HttpHeaderName, HeaderValue as HttpHeaderValue,
};
use reqwest::{Client, Method, header::HeaderMap};

use super::{
    BackendError, BackendFactory, BackendKind, BackendRequest, BackendResponse, HttpBackend,
};
use crate::modules::profiles::BrowserProfile;

/// Connection settings shared by every client the factory builds.
#[derive(Debug, Clone)]
pub struct ReqwestBackendConfig {
    pub connect_timeout: Duration,
    pub max_redirects: usize,
    pub pool_idle_timeout: Duration,
}

impl Default for ReqwestBackendConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_redirects: 10,
            pool_idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Reqwest-backed HTTP client bound to one profile fingerprint.
pub struct ReqwestBackend {
    kind: BackendKind,
    fingerprint: String,
    client: Client,
}

impl ReqwestBackend {
    pub fn new(
        kind: BackendKind,
        profile: &BrowserProfile,
        config: &ReqwestBackendConfig,
    ) -> Result<Self, BackendError> {
        let fingerprint = match kind {
            BackendKind::Secondary => profile.secondary_fingerprint.clone(),
            BackendKind::Primary | BackendKind::Rendering => profile.primary_fingerprint.clone(),
        };

        let mut builder = Client::builder()
            .cookie_store(true)
            .gzip(true)
            .brotli(true)
            .user_agent(profile.user_agent.clone())
            .connect_timeout(config.connect_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects));

        builder = match kind {
            BackendKind::Secondary => builder
                .http1_only()
                .pool_idle_timeout(config.pool_idle_timeout / 3)
                .pool_max_idle_per_host(2),
            BackendKind::Primary | BackendKind::Rendering => {
                builder.pool_idle_timeout(config.pool_idle_timeout)
            }
        };

        let client = builder
            .build()
            .map_err(|err| BackendError::Build(err.to_string()))?;

        log::debug!("built {kind} backend for fingerprint {fingerprint}");

        Ok(Self {
            kind,
            fingerprint,
            client,
        })
    }

    /// Wrap an existing reqwest client.
    pub fn from_client(kind: BackendKind, fingerprint: impl Into<String>, client: Client) -> Self {
        Self {
            kind,
            fingerprint: fingerprint.into(),
            client,
        }
    }
}

#[async_trait]
impl HttpBackend for ReqwestBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    async fn send(&self, request: BackendRequest) -> Result<BackendResponse, BackendError> {
        let method = map_method(&request.method)?;
        let headers = convert_headers(&request.headers)?;

        let mut builder = self
            .client
            .request(method, request.url.as_str())
            .headers(headers)
            .timeout(request.timeout);

        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                BackendError::Timeout(request.timeout)
            } else {
                BackendError::Transport(err.to_string())
            }
        })?;

        to_backend_response(response).await
    }
}

/// Default factory producing [`ReqwestBackend`] handles.
#[derive(Debug, Clone, Default)]
pub struct ReqwestBackendFactory {
    config: ReqwestBackendConfig,
}

impl ReqwestBackendFactory {
    pub fn new(config: ReqwestBackendConfig) -> Self {
        Self { config }
    }
}

impl BackendFactory for ReqwestBackendFactory {
    fn create(
        &self,
        kind: BackendKind,
        profile: &BrowserProfile,
    ) -> Result<Arc<dyn HttpBackend>, BackendError> {
        Ok(Arc::new(ReqwestBackend::new(kind, profile, &self.config)?))
    }
}

fn map_method(method: &http::Method) -> Result<Method, BackendError> {
    Method::from_bytes(method.as_str().as_bytes())
        .map_err(|err| BackendError::InvalidRequest(err.to_string()))
}

fn convert_headers(headers: &[(String, String)]) -> Result<HeaderMap, BackendError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| BackendError::InvalidRequest(format!("header {name}: {err}")))?;
        let value = reqwest::header::HeaderValue::from_str(value)
            .map_err(|err| BackendError::InvalidRequest(format!("header {name}: {err}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

async fn to_backend_response(response: reqwest::Response) -> Result<BackendResponse, BackendError> {
    let status = response.status().as_u16();
    let headers = convert_back_headers(response.headers())?;
    let url = response.url().clone();
    let body = response
        .bytes()
        .await
        .map_err(|err| BackendError::Transport(err.to_string()))?;

    Ok(BackendResponse {
        status,
        headers,
        body,
        url,
    })
}

fn convert_back_headers(map: &HeaderMap) -> Result<HttpHeaderMap, BackendError> {
    let mut headers = HttpHeaderMap::with_capacity(map.len());
    for (name, value) in map.iter() {
        let http_name = HttpHeaderName::from_bytes(name.as_str().as_bytes())
            .map_err(|err| BackendError::Transport(err.to_string()))?;
        let http_value = HttpHeaderValue::from_bytes(value.as_bytes())
            .map_err(|err| BackendError::Transport(err.to_string()))?;
        headers.append(http_name, http_value);
    }
    Ok(headers)
}
