use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, PoisonError, RwLock,
};

use reqwest::{Method, StatusCode};
use serde::Deserialize;
use tracing::{debug, error, info};

use crate::{
    config::{GatewayConfig, CSRF_COOKIE_NAMES},
    cookies::CookieJar,
    errors::{GatewayError, GatewayResult},
    middleware::apply_default_headers,
    transport::{ApiRequest, ApiResponse, Transport},
};

pub const CSRF_TOKEN_PATH: &str = "/api/csrf-token";
pub const CSRF_HEADER: &str = "x-csrf-token";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CsrfTokenResponse {
    csrf_token: Option<String>,
}

/// Whether a 403 was caused by a stale or missing CSRF token rather than a real
/// permission problem.
pub fn is_csrf_rejection(response: &ApiResponse) -> bool {
    if response.status != StatusCode::FORBIDDEN {
        return false;
    }

    let Some(body) = response.json_value() else {
        return false;
    };

    ["error", "message"].iter().any(|field| {
        body.get(field)
            .and_then(|v| v.as_str())
            .map(|text| text.to_ascii_lowercase().contains("csrf"))
            .unwrap_or(false)
    })
}

/// Single slot holding the anti-CSRF token, fetched on first need.
///
/// Population is not serialized: two callers that both find the slot empty both
/// fetch, and the last write wins.
pub struct CsrfCache {
    token: RwLock<Option<String>>,
    fetches: AtomicUsize,
    transport: Arc<dyn Transport>,
    cookies: Arc<CookieJar>,
    cookie_hosts: Vec<String>,
}

impl CsrfCache {
    pub fn new(config: &GatewayConfig, transport: Arc<dyn Transport>, cookies: Arc<CookieJar>) -> Self {
        Self {
            token: RwLock::new(None),
            fetches: AtomicUsize::new(0),
            transport,
            cookies,
            cookie_hosts: config.cookie_hosts(),
        }
    }

    pub fn current(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// How many times the token endpoint has been called.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub async fn ensure_token(&self) -> GatewayResult<String> {
        if let Some(token) = self.current() {
            return Ok(token);
        }

        let token = self.fetch().await?;
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = Some(token.clone());
        Ok(token)
    }

    pub fn invalidate(&self) {
        let previous = self
            .token
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if previous.is_some() {
            debug!("CSRF token invalidated");
        }
    }

    /// Throw the token away and fetch a new one, optionally clearing the CSRF
    /// cookies first so the backend issues a fresh pair.
    pub async fn force_refresh(&self, clear_cookies: bool) -> GatewayResult<String> {
        if clear_cookies {
            self.clear_cookies();
        }
        self.invalidate();
        self.ensure_token().await
    }

    pub(crate) fn clear_cookies(&self) {
        let mut removed = 0;
        for host in &self.cookie_hosts {
            for name in CSRF_COOKIE_NAMES {
                if self.cookies.remove(name, host) {
                    removed += 1;
                }
            }
        }
        debug!(removed, "cleared CSRF cookies");
    }

    async fn fetch(&self) -> GatewayResult<String> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let mut request = ApiRequest::new(Method::GET, CSRF_TOKEN_PATH);
        apply_default_headers(&mut request);

        let response = self.transport.send(&request).await.map_err(|e| {
            error!(error = %e, "CSRF token endpoint unreachable");
            GatewayError::CsrfFetch(e.to_string())
        })?;

        if !response.is_success() {
            error!(status = %response.status, "CSRF token endpoint rejected the request");
            return Err(GatewayError::CsrfFetch(format!(
                "token endpoint answered {}",
                response.status
            )));
        }

        let token = response
            .json::<CsrfTokenResponse>()
            .ok()
            .and_then(|body| body.csrf_token)
            .filter(|token| !token.is_empty());

        match token {
            Some(token) => {
                info!("CSRF token fetched");
                Ok(token)
            }
            None => {
                error!("CSRF token endpoint answered without a csrfToken");
                Err(GatewayError::CsrfFetch(
                    "response carried no csrfToken".to_string(),
                ))
            }
        }
    }
}
