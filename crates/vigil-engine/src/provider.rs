//! Provider adapters.
//!
//! One operation per integration: attempt a sync and return either stats or
//! a raw `{code, message}` error. Adapters are stateless; the executor wraps
//! every call in the integration's timeout.

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use vigil_core::classifier::RawError;
use vigil_core::config::{Config, ProviderSpec};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    #[serde(default)]
    pub items: u64,
    /// Control checks reported as not holding.
    #[serde(default)]
    pub failed_checks: u32,
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn sync(&self) -> std::result::Result<SyncStats, RawError>;
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

/// Calls one endpoint. 2xx is success; the body may carry `SyncStats` JSON.
pub struct HttpProvider {
    client: reqwest::Client,
    method: Method,
    url: String,
    headers: HeaderMap,
    token_env: Option<String>,
}

impl HttpProvider {
    pub fn new(
        integration: &str,
        url: &str,
        method: &str,
        headers: &BTreeMap<String, String>,
        token_env: Option<String>,
    ) -> Result<Self> {
        let invalid = |reason: String| EngineError::InvalidProvider {
            integration: integration.to_string(),
            reason,
        };
        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|_| invalid(format!("bad method '{method}'")))?;
        let mut map = HeaderMap::new();
        for (k, v) in headers {
            let name = HeaderName::from_bytes(k.as_bytes())
                .map_err(|_| invalid(format!("bad header name '{k}'")))?;
            let value =
                HeaderValue::from_str(v).map_err(|_| invalid(format!("bad value for header '{k}'")))?;
            map.insert(name, value);
        }
        Ok(Self {
            client: reqwest::Client::new(),
            method,
            url: url.to_string(),
            headers: map,
            token_env,
        })
    }

    fn bearer(&self) -> std::result::Result<Option<HeaderValue>, RawError> {
        let Some(var) = &self.token_env else {
            return Ok(None);
        };
        let token = std::env::var(var)
            .map_err(|_| RawError::new(None, format!("missing required token env var {var}")))?;
        HeaderValue::from_str(&format!("Bearer {token}"))
            .map(Some)
            .map_err(|_| RawError::new(None, format!("invalid token in env var {var}")))
    }
}

#[async_trait]
impl ProviderAdapter for HttpProvider {
    async fn sync(&self) -> std::result::Result<SyncStats, RawError> {
        let mut req = self
            .client
            .request(self.method.clone(), &self.url)
            .headers(self.headers.clone());
        if let Some(auth) = self.bearer()? {
            req = req.header(AUTHORIZATION, auth);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                RawError::new(Some(408), "request timeout")
            } else {
                RawError::new(None, format!("connection error: {e}"))
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let reason = status.canonical_reason().unwrap_or("error");
            return Err(RawError::new(
                Some(status.as_u16()),
                format!("HTTP {} {reason}", status.as_u16()),
            ));
        }
        let body = resp.text().await.unwrap_or_default();
        Ok(serde_json::from_str(&body).unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Fixed
// ---------------------------------------------------------------------------

/// Returns the same result on every call.
pub struct FixedProvider {
    result: std::result::Result<SyncStats, RawError>,
}

impl FixedProvider {
    pub fn ok(items: u64) -> Self {
        Self {
            result: Ok(SyncStats {
                items,
                failed_checks: 0,
            }),
        }
    }

    pub fn err(error: RawError) -> Self {
        Self { result: Err(error) }
    }
}

#[async_trait]
impl ProviderAdapter for FixedProvider {
    async fn sync(&self) -> std::result::Result<SyncStats, RawError> {
        self.result.clone()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Default, Clone)]
pub struct ProviderRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut registry = Self::default();
        for (id, integration) in &config.integrations {
            let adapter: Arc<dyn ProviderAdapter> = match &integration.provider {
                ProviderSpec::Http {
                    url,
                    method,
                    headers,
                    token_env,
                } => Arc::new(HttpProvider::new(id, url, method, headers, token_env.clone())?),
                ProviderSpec::Fixed {
                    items,
                    error_code,
                    error_message,
                } => match (error_code, error_message) {
                    (None, None) => Arc::new(FixedProvider::ok(*items)),
                    (code, message) => Arc::new(FixedProvider::err(RawError::new(
                        *code,
                        message.clone().unwrap_or_else(|| "provider error".to_string()),
                    ))),
                },
            };
            registry.insert(id.clone(), adapter);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, integration_id: impl Into<String>, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(integration_id.into(), adapter);
    }

    pub fn get(&self, integration_id: &str) -> Result<Arc<dyn ProviderAdapter>> {
        self.adapters
            .get(integration_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownProvider(integration_id.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
