use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::{
    auth::{
        CHANGE_PASSWORD_PATH, FIRST_LOGIN_PATH, LOGIN_PATH, REGISTER_PATH, RESET_PASSWORD_PATH,
    },
    errors::{GatewayError, GatewayResult},
    gateway::Gateway,
    session::{Session, SignedOutReason},
    transport::ApiResponse,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenPair {
    access_token: Option<String>,
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageBody {
    message: Option<String>,
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn require(fields: &[(&str, &str)]) -> GatewayResult<()> {
    let missing: Vec<&str> = fields
        .iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| *name)
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(GatewayError::InvalidInput(format!(
            "required: {}",
            missing.join(", ")
        )))
    }
}

fn message_or(response: &ApiResponse, fallback: &str) -> String {
    response
        .json::<MessageBody>()
        .ok()
        .and_then(|body| body.message)
        .unwrap_or_else(|| fallback.to_string())
}

/// A sign-in refusal is a credentials problem, not an expired session.
fn credentials_error(err: GatewayError) -> GatewayError {
    match err {
        GatewayError::AuthenticationExpired { .. } => GatewayError::InvalidCredentials,
        other => other,
    }
}

/// Sign in, sign out and password management over a [`Gateway`].
#[derive(Clone)]
pub struct AccountClient {
    gateway: Gateway,
}

impl AccountClient {
    pub fn new(gateway: Gateway) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub async fn login(&self, email: &str, password: &str) -> GatewayResult<Session> {
        let email = normalize_email(email);
        require(&[("email", email.as_str()), ("password", password)])?;

        let response = self
            .gateway
            .post(LOGIN_PATH, json!({ "email": email, "password": password }))
            .await
            .map_err(credentials_error)?;

        let session = self.establish_from(&response).await?;
        info!("login succeeded");
        Ok(session)
    }

    /// Create an account. Returns the backend's confirmation message.
    pub async fn register(&self, name: &str, email: &str, password: &str) -> GatewayResult<String> {
        let name = name.trim();
        let email = normalize_email(email);
        require(&[("name", name), ("email", email.as_str()), ("password", password)])?;

        let response = self
            .gateway
            .post(
                REGISTER_PATH,
                json!({ "name": name, "email": email, "password": password }),
            )
            .await?;

        info!("registration accepted");
        Ok(message_or(&response, "registration completed"))
    }

    /// Sign in with a temporary password and replace it in the same call.
    pub async fn first_login(
        &self,
        email: &str,
        temporary_password: &str,
        new_password: &str,
    ) -> GatewayResult<Session> {
        let email = normalize_email(email);
        require(&[
            ("email", email.as_str()),
            ("temporaryPassword", temporary_password),
            ("newPassword", new_password),
        ])?;

        let response = self
            .gateway
            .post(
                FIRST_LOGIN_PATH,
                json!({
                    "email": email,
                    "temporaryPassword": temporary_password,
                    "newPassword": new_password,
                }),
            )
            .await
            .map_err(credentials_error)?;

        let session = self.establish_from(&response).await?;
        info!("first login completed");
        Ok(session)
    }

    pub async fn reset_password_with_code(
        &self,
        email: &str,
        code: &str,
        new_password: &str,
    ) -> GatewayResult<String> {
        let email = normalize_email(email);
        require(&[("email", email.as_str()), ("code", code), ("newPassword", new_password)])?;

        let response = self
            .gateway
            .post(
                RESET_PASSWORD_PATH,
                json!({ "email": email, "code": code.trim(), "newPassword": new_password }),
            )
            .await?;

        info!("password reset with code");
        Ok(message_or(&response, "password reset"))
    }

    pub async fn change_password(&self, current: &str, new: &str) -> GatewayResult<String> {
        require(&[("currentPassword", current), ("newPassword", new)])?;

        let response = self
            .gateway
            .put(
                CHANGE_PASSWORD_PATH,
                json!({ "currentPassword": current, "newPassword": new }),
            )
            .await?;

        info!("password changed");
        Ok(message_or(&response, "password changed"))
    }

    /// Forget the session locally. The backend keeps no server-side session to end.
    pub async fn logout(&self) {
        self.gateway
            .session()
            .clear(SignedOutReason::UserRequested)
            .await;
    }

    /// Sign out if the access token has run out. Returns whether the session is
    /// still usable. Meant to be polled.
    pub async fn check_token_expiry(&self) -> bool {
        let session = self.gateway.session();
        if session.is_authenticated() {
            return true;
        }

        if session.access_token().is_some() {
            if self.gateway.config().soft_warnings() {
                warn!("access token expired, signing out");
            }
            session.clear(SignedOutReason::Expired).await;
        }
        false
    }

    async fn establish_from(&self, response: &ApiResponse) -> GatewayResult<Session> {
        let tokens: TokenPair = response.json()?;
        match (tokens.access_token, tokens.refresh_token) {
            (Some(access), Some(refresh)) if !access.is_empty() => {
                Ok(self.gateway.session().establish(access, refresh).await)
            }
            _ => Err(GatewayError::InvalidResponse(
                "sign-in response is missing accessToken or refreshToken".to_string(),
            )),
        }
    }
}
