use async_trait::async_trait;
use reqwest::{
    header::{HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE},
    StatusCode,
};
use tracing::{debug, warn};

use crate::{
    csrf::{is_csrf_rejection, CSRF_HEADER, CSRF_TOKEN_PATH},
    errors::GatewayResult,
    gateway::GatewayContext,
    transport::{ApiRequest, ApiResponse},
};

const REQUESTED_WITH: HeaderName = HeaderName::from_static("x-requested-with");

/// What the pipeline does with a response once a layer has seen it.
#[derive(Debug)]
pub enum Flow {
    /// Hand the response to the next layer, and eventually the caller
    Continue(ApiResponse),
    /// Replay the request through the whole pipeline. Honoured once per request.
    Retry,
}

/// One stage of the request pipeline.
///
/// `on_request` runs in stack order before the request is sent and may reject it
/// outright. `on_response` runs in reverse order and may fail the call or ask for a
/// replay.
#[async_trait]
pub trait Layer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_request(&self, _ctx: &GatewayContext, _request: &mut ApiRequest) -> GatewayResult<()> {
        Ok(())
    }

    async fn on_response(
        &self,
        _ctx: &GatewayContext,
        _request: &ApiRequest,
        response: ApiResponse,
    ) -> GatewayResult<Flow> {
        Ok(Flow::Continue(response))
    }
}

pub(crate) fn apply_default_headers(request: &mut ApiRequest) {
    let headers = &mut request.headers;
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert(REQUESTED_WITH, HeaderValue::from_static("XMLHttpRequest"));
}

/// Static headers every backend call carries.
pub struct DefaultHeaders;

#[async_trait]
impl Layer for DefaultHeaders {
    fn name(&self) -> &'static str {
        "default-headers"
    }

    async fn on_request(&self, _ctx: &GatewayContext, request: &mut ApiRequest) -> GatewayResult<()> {
        apply_default_headers(request);
        Ok(())
    }

    async fn on_response(
        &self,
        ctx: &GatewayContext,
        request: &ApiRequest,
        response: ApiResponse,
    ) -> GatewayResult<Flow> {
        if response.is_success()
            && response.status != StatusCode::NO_CONTENT
            && !response.has_body()
            && ctx.config.soft_warnings()
        {
            warn!(status = %response.status, path = request.route(), "response without a body");
        }
        Ok(Flow::Continue(response))
    }
}

/// Attaches the CSRF token to mutating requests and drops it when the backend
/// says it went stale.
pub struct CsrfLayer;

#[async_trait]
impl Layer for CsrfLayer {
    fn name(&self) -> &'static str {
        "csrf"
    }

    async fn on_request(&self, ctx: &GatewayContext, request: &mut ApiRequest) -> GatewayResult<()> {
        if !request.is_mutating() || request.route() == CSRF_TOKEN_PATH {
            return Ok(());
        }

        match ctx.csrf.ensure_token().await {
            Ok(token) => request.set_header(HeaderName::from_static(CSRF_HEADER), &token)?,
            Err(e) => {
                // Send anyway; the backend decides.
                if ctx.config.soft_warnings() {
                    warn!(error = %e, "sending without a CSRF token");
                }
            }
        }
        Ok(())
    }

    async fn on_response(
        &self,
        ctx: &GatewayContext,
        _request: &ApiRequest,
        response: ApiResponse,
    ) -> GatewayResult<Flow> {
        if is_csrf_rejection(&response) {
            debug!(
                clear_cookies = ctx.config.csrf_force_clear,
                "backend rejected the CSRF token"
            );
            if ctx.config.csrf_force_clear {
                ctx.csrf.clear_cookies();
            }
            ctx.csrf.invalidate();
        }
        Ok(Flow::Continue(response))
    }
}
