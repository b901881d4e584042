use std::env;
use std::time::Duration;

use reqwest::Url;

use crate::errors::{GatewayError, GatewayResult};

pub const DEFAULT_API_URL: &str = "https://clientes.domcloud.dev";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Lifetime, in seconds, assumed for an access token that carries no readable `exp` claim.
pub const ACCESS_TOKEN_FALLBACK_TTL_SECS: i64 = 15 * 60;

/// Cookie names cleared when the CSRF token is force-refreshed.
pub const CSRF_COOKIE_NAMES: &[&str] = &["_csrf", "XSRF-TOKEN", "csrf-token"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Backend base URL, without a trailing slash
    pub base_url: String,
    pub timeout_ms: u64,
    pub environment: Environment,
    /// Forces soft warnings on even in production
    pub debug: bool,
    /// Origin the client itself is served from, if any. Its cookies are cleared
    /// alongside the backend's on a forced CSRF refresh.
    pub origin: Option<String>,
    /// Clear CSRF cookies whenever the backend rejects a CSRF token
    pub csrf_force_clear: bool,
}

impl GatewayConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            environment: Environment::Development,
            debug: false,
            origin: None,
            csrf_force_clear: false,
        }
    }

    pub fn from_env() -> GatewayResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> GatewayResult<Self> {
        let base_url = lookup("API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string());
        Url::parse(&base_url)
            .map_err(|e| GatewayError::Config(format!("API_URL {base_url:?} is not a URL: {e}")))?;

        let timeout_ms = match lookup("API_TIMEOUT_MS") {
            Some(raw) => raw.trim().parse::<u64>().map_err(|e| {
                GatewayError::Config(format!("API_TIMEOUT_MS {raw:?} is not a number: {e}"))
            })?,
            None => DEFAULT_TIMEOUT_MS,
        };

        let environment = match lookup("APP_ENV").as_deref() {
            Some("production") | Some("prod") => Environment::Production,
            _ => Environment::Development,
        };

        let is_true = |key: &str| lookup(key).map(|v| v == "true" || v == "1").unwrap_or(false);

        Ok(Self {
            timeout_ms,
            environment,
            debug: is_true("ENABLE_DEBUG"),
            origin: lookup("APP_ORIGIN"),
            csrf_force_clear: is_true("CSRF_FORCE_CLEAR"),
            ..Self::new(base_url)
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Warnings are only emitted outside production, unless debugging is forced.
    /// Errors are always emitted.
    pub fn soft_warnings(&self) -> bool {
        self.debug || self.environment == Environment::Development
    }

    /// Hosts whose CSRF cookies get cleared on a forced refresh.
    pub fn cookie_hosts(&self) -> Vec<String> {
        [Some(self.base_url.as_str()), self.origin.as_deref()]
            .into_iter()
            .flatten()
            .filter_map(|url| Url::parse(url).ok())
            .filter_map(|url| url.host_str().map(str::to_string))
            .collect()
    }
}
