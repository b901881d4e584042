use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use axum::{
    extract::{Path, Query, Request, State},
    http::{
        header::{AUTHORIZATION, COOKIE, RETRY_AFTER, SET_COOKIE},
        HeaderMap, Method, StatusCode,
    },
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

const SIGNING_SECRET: &[u8] = b"fixture-backend-secret";
pub const CSRF_HEADER: &str = "x-csrf-token";
pub const CSRF_COOKIE: &str = "_csrf";
pub const RESET_CODE: &str = "123456";

/// One request as the backend saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedRequest {
    pub method: Method,
    pub path: String,
    pub authorization: Option<String>,
    pub csrf: Option<String>,
}

impl LoggedRequest {
    pub fn bearer(&self) -> Option<&str> {
        self.authorization
            .as_deref()
            .and_then(|h| h.strip_prefix("Bearer "))
    }
}

#[derive(Debug, Clone)]
struct User {
    name: String,
    password: String,
    role: String,
    /// Must go through first-login before a normal login works
    temporary: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct AccessClaims {
    sub: String,
    role: String,
    iat: i64,
    exp: i64,
    jti: String,
    generation: u64,
}

#[derive(Debug)]
struct BackendState {
    users: HashMap<String, User>,
    /// Access tokens minted under an older generation are rejected
    generation: u64,
    access_ttl_secs: i64,
    refresh_tokens: HashMap<String, String>,
    csrf_tokens: HashSet<String>,
    csrf_fetches: usize,
    refresh_calls: usize,
    refresh_delay: Duration,
    refresh_fails: bool,
    log: Vec<LoggedRequest>,
}

/// In-memory stand-in for the billing backend.
///
/// Clones share state, so a test can hold one handle while the server runs on another.
#[derive(Clone)]
pub struct Backend {
    state: Arc<Mutex<BackendState>>,
}

impl Default for Backend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend {
    /// A backend with three accounts: `admin@example.com`/`admin123` (admin),
    /// `user@example.com`/`user123`, and `temp@example.com`/`temp123` which still
    /// needs its first login.
    pub fn new() -> Self {
        let users = [
            ("admin@example.com", "Admin", "admin123", "admin", false),
            ("user@example.com", "User", "user123", "user", false),
            ("temp@example.com", "Temp", "temp123", "user", true),
        ]
        .into_iter()
        .map(|(email, name, password, role, temporary)| {
            (
                email.to_string(),
                User {
                    name: name.to_string(),
                    password: password.to_string(),
                    role: role.to_string(),
                    temporary,
                },
            )
        })
        .collect();

        Self {
            state: Arc::new(Mutex::new(BackendState {
                users,
                generation: 0,
                access_ttl_secs: 15 * 60,
                refresh_tokens: HashMap::new(),
                csrf_tokens: HashSet::new(),
                csrf_fetches: 0,
                refresh_calls: 0,
                refresh_delay: Duration::ZERO,
                refresh_fails: false,
                log: Vec::new(),
            })),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/csrf-token", get(csrf_token))
            .route("/auth/login", post(login))
            .route("/auth/register", post(register))
            .route("/auth/first-login", post(first_login))
            .route("/auth/reset-password-with-code", post(reset_password_with_code))
            .route("/auth/change-password", put(change_password))
            .route("/auth/refresh", post(refresh))
            .route("/clientes", get(list_clients).post(create_client))
            .route("/clientes/slow", get(slow))
            .route("/clientes/status/:code", get(status))
            .route("/clientes/:id", put(update_client).delete(delete_client))
            .route("/backup", get(list_backups).post(create_backup))
            .layer(middleware::from_fn_with_state(self.clone(), record))
            .with_state(self.clone())
    }

    /// Every access token issued so far stops working.
    pub fn revoke_access_tokens(&self) {
        self.lock().generation += 1;
    }

    /// Every CSRF token issued so far stops working.
    pub fn revoke_csrf_tokens(&self) {
        self.lock().csrf_tokens.clear();
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        self.lock().refresh_delay = delay;
    }

    pub fn set_refresh_fails(&self, fails: bool) {
        self.lock().refresh_fails = fails;
    }

    pub fn refresh_calls(&self) -> usize {
        self.lock().refresh_calls
    }

    pub fn csrf_fetches(&self) -> usize {
        self.lock().csrf_fetches
    }

    pub fn requests(&self) -> Vec<LoggedRequest> {
        self.lock().log.clone()
    }

    pub fn requests_to(&self, path: &str) -> Vec<LoggedRequest> {
        self.lock()
            .log
            .iter()
            .filter(|r| r.path == path)
            .cloned()
            .collect()
    }

    /// Mint an access token directly, bypassing login.
    pub fn issue_access_token(&self, email: &str) -> Option<String> {
        let state = self.lock();
        let user = state.users.get(email)?;
        Some(mint_access_token(&state, email, &user.role))
    }

    fn lock(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn issue_tokens(&self, email: &str, role: &str) -> Value {
        let mut state = self.lock();
        let access = mint_access_token(&state, email, role);
        let refresh = Uuid::new_v4().to_string();
        state.refresh_tokens.insert(refresh.clone(), email.to_string());
        json!({ "accessToken": access, "refreshToken": refresh })
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<AccessClaims, Response> {
        let token = headers
            .get(AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "))
            .ok_or_else(|| error(StatusCode::UNAUTHORIZED, "missing token"))?;

        let claims = jsonwebtoken::decode::<AccessClaims>(
            token,
            &DecodingKey::from_secret(SIGNING_SECRET),
            &Validation::new(Algorithm::HS256),
        )
        .map_err(|_| error(StatusCode::UNAUTHORIZED, "token expired"))?
        .claims;

        if claims.generation != self.lock().generation {
            return Err(error(StatusCode::UNAUTHORIZED, "token expired"));
        }
        Ok(claims)
    }

    /// The CSRF header must name an issued token and match the `_csrf` cookie.
    fn check_csrf(&self, headers: &HeaderMap) -> Result<(), Response> {
        let header = headers.get(CSRF_HEADER).and_then(|h| h.to_str().ok());
        let cookie = headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|h| h.to_str().ok())
            .flat_map(|h| h.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == CSRF_COOKIE)
            .map(|(_, value)| value);

        match (header, cookie) {
            (Some(header), Some(cookie))
                if header == cookie && self.lock().csrf_tokens.contains(header) =>
            {
                Ok(())
            }
            _ => Err(error(StatusCode::FORBIDDEN, "invalid csrf token")),
        }
    }

    /// Auth first, then CSRF for anything that mutates.
    fn guard(&self, method: &Method, headers: &HeaderMap) -> Result<AccessClaims, Response> {
        let claims = self.authorize(headers)?;
        if method != Method::GET {
            self.check_csrf(headers)?;
        }
        Ok(claims)
    }
}

fn mint_access_token(state: &BackendState, email: &str, role: &str) -> String {
    let now = chrono::Utc::now().timestamp();
    let claims = AccessClaims {
        sub: email.to_string(),
        role: role.to_string(),
        iat: now,
        exp: now + state.access_ttl_secs,
        jti: Uuid::new_v4().to_string(),
        generation: state.generation,
    };

    // HS256 with a static key cannot fail to encode.
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(SIGNING_SECRET),
    )
    .unwrap_or_default()
}

fn error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn field<'a>(body: &'a Value, name: &str) -> &'a str {
    body.get(name).and_then(|v| v.as_str()).unwrap_or("").trim()
}

async fn record(State(backend): State<Backend>, request: Request, next: Next) -> Response {
    let entry = {
        let header = |name: &str| {
            request
                .headers()
                .get(name)
                .and_then(|h| h.to_str().ok())
                .map(str::to_string)
        };
        LoggedRequest {
            method: request.method().clone(),
            path: request.uri().path().to_string(),
            authorization: header(AUTHORIZATION.as_str()),
            csrf: header(CSRF_HEADER),
        }
    };
    backend.lock().log.push(entry);

    next.run(request).await
}

async fn csrf_token(State(backend): State<Backend>) -> impl IntoResponse {
    let token = Uuid::new_v4().to_string();
    {
        let mut state = backend.lock();
        state.csrf_fetches += 1;
        state.csrf_tokens.insert(token.clone());
    }

    (
        [(SET_COOKIE, format!("{CSRF_COOKIE}={token}; Path=/; HttpOnly"))],
        Json(json!({ "csrfToken": token })),
    )
}

async fn login(State(backend): State<Backend>, Json(body): Json<Value>) -> Response {
    let email = field(&body, "email").to_lowercase();
    let password = body.get("password").and_then(|v| v.as_str()).unwrap_or("");

    let user = backend.lock().users.get(&email).cloned();
    match user {
        Some(user) if user.password == password && user.temporary => {
            error(StatusCode::FORBIDDEN, "first login required")
        }
        Some(user) if user.password == password => {
            info!(email = %email, "login");
            let mut tokens = backend.issue_tokens(&email, &user.role);
            tokens["user"] = json!({ "name": user.name, "email": email, "role": user.role });
            Json(tokens).into_response()
        }
        _ => error(StatusCode::UNAUTHORIZED, "invalid credentials"),
    }
}

async fn register(State(backend): State<Backend>, Json(body): Json<Value>) -> Response {
    let name = field(&body, "name");
    let email = field(&body, "email").to_lowercase();
    let password = field(&body, "password");

    let missing: Vec<&str> = [("name", name), ("email", email.as_str()), ("password", password)]
        .into_iter()
        .filter(|(_, value)| value.is_empty())
        .map(|(key, _)| key)
        .collect();
    if !missing.is_empty() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": "validation failed", "fields": missing })),
        )
            .into_response();
    }

    let mut state = backend.lock();
    if state.users.contains_key(&email) {
        return error(StatusCode::CONFLICT, "email already registered");
    }
    state.users.insert(
        email,
        User {
            name: name.to_string(),
            password: password.to_string(),
            role: "user".to_string(),
            temporary: false,
        },
    );

    (
        StatusCode::CREATED,
        Json(json!({ "message": format!("welcome, {name}") })),
    )
        .into_response()
}

async fn first_login(State(backend): State<Backend>, Json(body): Json<Value>) -> Response {
    let email = field(&body, "email").to_lowercase();
    let temporary = field(&body, "temporaryPassword");
    let new_password = field(&body, "newPassword");

    let role = {
        let mut state = backend.lock();
        match state.users.get_mut(&email) {
            Some(user) if user.temporary && user.password == temporary && !new_password.is_empty() => {
                user.password = new_password.to_string();
                user.temporary = false;
                user.role.clone()
            }
            _ => return error(StatusCode::UNAUTHORIZED, "invalid temporary password"),
        }
    };

    Json(backend.issue_tokens(&email, &role)).into_response()
}

async fn reset_password_with_code(
    State(backend): State<Backend>,
    Json(body): Json<Value>,
) -> Response {
    let email = field(&body, "email").to_lowercase();
    let code = field(&body, "code");
    let new_password = field(&body, "newPassword");

    let mut state = backend.lock();
    match state.users.get_mut(&email) {
        Some(user) if code == RESET_CODE && !new_password.is_empty() => {
            user.password = new_password.to_string();
            user.temporary = false;
            Json(json!({ "message": "password updated" })).into_response()
        }
        _ => error(StatusCode::BAD_REQUEST, "invalid or expired code"),
    }
}

async fn change_password(
    State(backend): State<Backend>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let claims = match backend.authorize(&headers) {
        Ok(claims) => claims,
        Err(response) => return response,
    };
    let current = field(&body, "currentPassword");
    let new_password = field(&body, "newPassword");

    let mut state = backend.lock();
    match state.users.get_mut(&claims.sub) {
        Some(user) if user.password == current && !new_password.is_empty() => {
            user.password = new_password.to_string();
            Json(json!({ "message": "password changed" })).into_response()
        }
        _ => error(StatusCode::BAD_REQUEST, "current password is wrong"),
    }
}

async fn refresh(State(backend): State<Backend>, Json(body): Json<Value>) -> Response {
    let delay = {
        let mut state = backend.lock();
        state.refresh_calls += 1;
        state.refresh_delay
    };
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let refresh_token = field(&body, "refreshToken");
    let state = backend.lock();
    if state.refresh_fails {
        return error(StatusCode::UNAUTHORIZED, "invalid refresh token");
    }

    let Some(email) = state.refresh_tokens.get(refresh_token).cloned() else {
        return error(StatusCode::UNAUTHORIZED, "invalid refresh token");
    };
    let Some(role) = state.users.get(&email).map(|u| u.role.clone()) else {
        return error(StatusCode::UNAUTHORIZED, "invalid refresh token");
    };

    // Rotation is not modelled: the refresh token stays valid.
    let access = mint_access_token(&state, &email, &role);
    Json(json!({ "accessToken": access })).into_response()
}

async fn list_clients(State(backend): State<Backend>, headers: HeaderMap) -> Response {
    if let Err(response) = backend.guard(&Method::GET, &headers) {
        return response;
    }
    Json(json!([
        { "id": 1, "nome": "Cliente Um", "status": "ativo" },
        { "id": 2, "nome": "Cliente Dois", "status": "inativo" },
    ]))
    .into_response()
}

async fn create_client(
    State(backend): State<Backend>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let claims = match backend.guard(&Method::POST, &headers) {
        Ok(claims) => claims,
        Err(response) => return response,
    };
    (
        StatusCode::CREATED,
        Json(json!({ "id": 3, "createdBy": claims.sub, "cliente": body })),
    )
        .into_response()
}

async fn update_client(
    State(backend): State<Backend>,
    Path(id): Path<u64>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(response) = backend.guard(&Method::PUT, &headers) {
        return response;
    }
    Json(json!({ "id": id, "cliente": body })).into_response()
}

async fn delete_client(
    State(backend): State<Backend>,
    Path(_id): Path<u64>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = backend.guard(&Method::DELETE, &headers) {
        return response;
    }
    StatusCode::NO_CONTENT.into_response()
}

#[derive(Debug, Deserialize)]
struct SlowParams {
    ms: Option<u64>,
}

async fn slow(
    State(backend): State<Backend>,
    headers: HeaderMap,
    Query(params): Query<SlowParams>,
) -> Response {
    if let Err(response) = backend.guard(&Method::GET, &headers) {
        return response;
    }
    tokio::time::sleep(Duration::from_millis(params.ms.unwrap_or(1_000))).await;
    Json(json!({ "slow": true })).into_response()
}

/// Answers with whatever status the path names.
async fn status(
    State(backend): State<Backend>,
    Path(code): Path<u16>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = backend.guard(&Method::GET, &headers) {
        return response;
    }

    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_REQUEST);
    match status {
        StatusCode::UNPROCESSABLE_ENTITY => (
            status,
            Json(json!({ "error": "validation failed", "fields": ["email"] })),
        )
            .into_response(),
        StatusCode::TOO_MANY_REQUESTS => (
            status,
            [(RETRY_AFTER, "30")],
            Json(json!({ "error": "slow down" })),
        )
            .into_response(),
        StatusCode::OK => Json(json!({ "status": code })).into_response(),
        _ => error(status, status.canonical_reason().unwrap_or("error")),
    }
}

async fn list_backups(State(backend): State<Backend>, headers: HeaderMap) -> Response {
    if let Err(response) = backend.guard(&Method::GET, &headers) {
        return response;
    }
    Json(json!([{ "id": "bkp-1", "size": 1024 }])).into_response()
}

async fn create_backup(State(backend): State<Backend>, headers: HeaderMap) -> Response {
    if let Err(response) = backend.guard(&Method::POST, &headers) {
        return response;
    }
    (StatusCode::CREATED, Json(json!({ "id": "bkp-2" }))).into_response()
}
