use async_trait::async_trait;
use reqwest::{
    header::{HeaderName, AUTHORIZATION},
    Method, StatusCode,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::{
    csrf::{CSRF_HEADER, CSRF_TOKEN_PATH},
    errors::{GatewayError, GatewayResult},
    gateway::GatewayContext,
    middleware::{apply_default_headers, Flow, Layer},
    refresh::{RefreshFailure, RefreshOutcome},
    session::SignedOutReason,
    transport::{ApiRequest, ApiResponse},
};

pub const LOGIN_PATH: &str = "/auth/login";
pub const REGISTER_PATH: &str = "/auth/register";
pub const FIRST_LOGIN_PATH: &str = "/auth/first-login";
pub const RESET_PASSWORD_PATH: &str = "/auth/reset-password-with-code";
pub const CHANGE_PASSWORD_PATH: &str = "/auth/change-password";
pub const REFRESH_PATH: &str = "/auth/refresh";

/// Routes that never carry an `Authorization` header.
pub const PUBLIC_ROUTES: &[&str] = &[
    LOGIN_PATH,
    REGISTER_PATH,
    FIRST_LOGIN_PATH,
    RESET_PASSWORD_PATH,
    REFRESH_PATH,
    CSRF_TOKEN_PATH,
];

pub fn is_public_route(route: &str) -> bool {
    PUBLIC_ROUTES.iter().any(|public| {
        route == *public
            || route
                .strip_prefix(public)
                .map(|rest| rest.starts_with('/'))
                .unwrap_or(false)
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Exchange the stored refresh token for a new access token.
///
/// Goes straight to the transport: the refresh call must never itself trigger a
/// refresh. Any failure tears the session down.
pub(crate) async fn refresh_session(ctx: &GatewayContext) -> RefreshOutcome {
    let outcome = exchange_refresh_token(ctx).await;

    match &outcome {
        Ok(_) => info!("access token refreshed"),
        Err(failure) => {
            error!(reason = %failure, "token refresh failed, ending session");
            ctx.session.clear(SignedOutReason::RefreshFailed).await;
        }
    }
    outcome
}

async fn exchange_refresh_token(ctx: &GatewayContext) -> RefreshOutcome {
    let refresh_token = ctx
        .session
        .refresh_token()
        .ok_or_else(|| RefreshFailure::new("no refresh token in session"))?;

    let mut request = ApiRequest::new(Method::POST, REFRESH_PATH)
        .with_body(json!({ "refreshToken": refresh_token }));
    apply_default_headers(&mut request);
    match ctx.csrf.ensure_token().await {
        Ok(csrf) => request
            .set_header(HeaderName::from_static(CSRF_HEADER), &csrf)
            .map_err(|e| RefreshFailure::new(e.to_string()))?,
        Err(e) => {
            if ctx.config.soft_warnings() {
                warn!(error = %e, "refreshing without a CSRF token");
            }
        }
    }

    let response = ctx
        .transport
        .send(&request)
        .await
        .map_err(|e| RefreshFailure::new(format!("refresh call failed: {e}")))?;

    if !response.is_success() {
        return Err(RefreshFailure::new(format!(
            "refresh endpoint answered {}",
            response.status
        )));
    }

    let body: RefreshResponse = response
        .json()
        .map_err(|e| RefreshFailure::new(e.to_string()))?;

    let session = ctx
        .session
        .replace_access(body.access_token, body.refresh_token)
        .await;
    session
        .access_token
        .ok_or_else(|| RefreshFailure::new("refreshed session has no access token"))
}

/// Bearer authentication plus the 401 recovery path.
pub struct AuthLayer;

#[async_trait]
impl Layer for AuthLayer {
    fn name(&self) -> &'static str {
        "auth"
    }

    async fn on_request(&self, ctx: &GatewayContext, request: &mut ApiRequest) -> GatewayResult<()> {
        if is_public_route(request.route()) {
            request.headers.remove(AUTHORIZATION);
            return Ok(());
        }

        let token = ctx
            .session
            .valid_access_token()
            .ok_or_else(|| GatewayError::MissingCredentials {
                path: request.route().to_string(),
            })?;
        request.set_header(AUTHORIZATION, &format!("Bearer {token}"))
    }

    async fn on_response(
        &self,
        ctx: &GatewayContext,
        request: &ApiRequest,
        response: ApiResponse,
    ) -> GatewayResult<Flow> {
        if response.status != StatusCode::UNAUTHORIZED || request.retried {
            return Ok(Flow::Continue(response));
        }

        let route = request.route();
        if route == REFRESH_PATH {
            error!("refresh endpoint rejected the session");
            ctx.session.clear(SignedOutReason::RefreshFailed).await;
            return Err(GatewayError::RefreshFailed {
                reason: "refresh endpoint answered 401".to_string(),
            });
        }
        if is_public_route(route) {
            return Ok(Flow::Continue(response));
        }

        match (request.bearer(), ctx.session.access_token()) {
            (_, None) => {
                return Err(GatewayError::RefreshFailed {
                    reason: "session was terminated while the request was in flight".to_string(),
                })
            }
            // A refresh already landed after this request went out.
            (Some(sent), Some(current)) if sent != current => {
                debug!("token was replaced in flight, replaying");
                return Ok(Flow::Retry);
            }
            _ => {}
        }

        match ctx.refresh.run(|| refresh_session(ctx)).await {
            Ok(_) => Ok(Flow::Retry),
            Err(failure) => Err(GatewayError::RefreshFailed {
                reason: failure.reason,
            }),
        }
    }
}
