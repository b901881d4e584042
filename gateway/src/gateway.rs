use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Method,
};
use serde_json::Value;
use tracing::{debug, error, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    auth::AuthLayer,
    config::GatewayConfig,
    cookies::CookieJar,
    csrf::CsrfCache,
    errors::{GatewayError, GatewayResult},
    middleware::{CsrfLayer, DefaultHeaders, Flow, Layer},
    refresh::RefreshCoordinator,
    session::{MemorySessionStore, SessionState, SessionStore},
    transport::{ApiRequest, ApiResponse, HttpTransport, Transport},
};

/// Everything the pipeline layers share: one per gateway, never global.
pub struct GatewayContext {
    pub config: GatewayConfig,
    pub session: Arc<SessionState>,
    pub csrf: Arc<CsrfCache>,
    pub refresh: RefreshCoordinator,
    pub cookies: Arc<CookieJar>,
    pub transport: Arc<dyn Transport>,
}

/// Per-call extras on top of method, path and body.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
}

impl RequestOptions {
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

pub struct GatewayBuilder {
    config: GatewayConfig,
    transport: Option<Arc<dyn Transport>>,
    store: Option<Arc<dyn SessionStore>>,
    layers: Vec<Arc<dyn Layer>>,
}

impl GatewayBuilder {
    /// Send through this transport instead of the reqwest one.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Append a layer after the built-in ones.
    pub fn layer(mut self, layer: impl Layer + 'static) -> Self {
        self.layers.push(Arc::new(layer));
        self
    }

    pub fn build(self) -> GatewayResult<Gateway> {
        let cookies = Arc::new(CookieJar::new());
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(&self.config, cookies.clone())?),
        };
        let store: Arc<dyn SessionStore> = match self.store {
            Some(store) => store,
            None => Arc::new(MemorySessionStore::new()),
        };

        let csrf = Arc::new(CsrfCache::new(
            &self.config,
            transport.clone(),
            cookies.clone(),
        ));

        // Credentials are checked before the CSRF token is fetched, so a request
        // that is going to be refused never causes network traffic.
        let mut layers: Vec<Arc<dyn Layer>> = vec![
            Arc::new(DefaultHeaders),
            Arc::new(AuthLayer),
            Arc::new(CsrfLayer),
        ];
        layers.extend(self.layers);

        Ok(Gateway {
            ctx: Arc::new(GatewayContext {
                config: self.config,
                session: Arc::new(SessionState::new(store)),
                csrf,
                refresh: RefreshCoordinator::new(),
                cookies,
                transport,
            }),
            layers: Arc::new(layers),
            pending: Arc::new(AtomicUsize::new(0)),
        })
    }
}

/// The single way requests reach the backend.
#[derive(Clone)]
pub struct Gateway {
    ctx: Arc<GatewayContext>,
    layers: Arc<Vec<Arc<dyn Layer>>>,
    pending: Arc<AtomicUsize>,
}

struct PendingGuard(Arc<AtomicUsize>);

impl PendingGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Gateway {
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder {
            config,
            transport: None,
            store: None,
            layers: Vec::new(),
        }
    }

    pub fn from_env() -> GatewayResult<Self> {
        Self::builder(GatewayConfig::from_env()?).build()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.ctx.config
    }

    pub fn session(&self) -> &Arc<SessionState> {
        &self.ctx.session
    }

    pub fn csrf(&self) -> &Arc<CsrfCache> {
        &self.ctx.csrf
    }

    pub fn cookies(&self) -> &Arc<CookieJar> {
        &self.ctx.cookies
    }

    pub fn refresh_coordinator(&self) -> &RefreshCoordinator {
        &self.ctx.refresh
    }

    /// Calls currently between entering the gateway and returning to their caller.
    pub fn pending_requests(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn has_pending_requests(&self) -> bool {
        self.pending_requests() > 0
    }

    /// Fetch the CSRF token up front. Meant to run once at startup.
    pub async fn initialize_csrf(&self, force_clear: bool) -> GatewayResult<()> {
        let result = if force_clear {
            self.ctx.csrf.force_refresh(true).await
        } else {
            self.ctx.csrf.ensure_token().await
        };

        result.map(|_| ()).map_err(|e| {
            error!(error = %e, "CSRF initialization failed");
            e
        })
    }

    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        options: RequestOptions,
    ) -> GatewayResult<ApiResponse> {
        let mut request = ApiRequest::new(method, path);
        request.body = body;
        request.query = options.query;
        request.headers = options.headers;
        self.execute(request).await
    }

    pub async fn get(&self, path: &str) -> GatewayResult<ApiResponse> {
        self.request(Method::GET, path, None, RequestOptions::default())
            .await
    }

    pub async fn post(&self, path: &str, body: Value) -> GatewayResult<ApiResponse> {
        self.request(Method::POST, path, Some(body), RequestOptions::default())
            .await
    }

    pub async fn put(&self, path: &str, body: Value) -> GatewayResult<ApiResponse> {
        self.request(Method::PUT, path, Some(body), RequestOptions::default())
            .await
    }

    pub async fn patch(&self, path: &str, body: Value) -> GatewayResult<ApiResponse> {
        self.request(Method::PATCH, path, Some(body), RequestOptions::default())
            .await
    }

    pub async fn delete(&self, path: &str) -> GatewayResult<ApiResponse> {
        self.request(Method::DELETE, path, None, RequestOptions::default())
            .await
    }

    /// Run a request through the pipeline, replaying it at most once.
    pub async fn execute(&self, mut request: ApiRequest) -> GatewayResult<ApiResponse> {
        let _pending = PendingGuard::new(&self.pending);
        let span = info_span!(
            "request",
            id = %Uuid::new_v4(),
            method = %request.method,
            path = %request.route(),
        );

        async move {
            loop {
                match self.dispatch_once(&mut request).await {
                    Ok(Flow::Continue(response)) => return self.finish(&request, response),
                    Ok(Flow::Retry) if !request.retried => {
                        debug!("replaying request");
                        request.retried = true;
                    }
                    Ok(Flow::Retry) => {
                        error!("replay asked for twice, giving up");
                        return Err(GatewayError::AuthenticationExpired {
                            path: request.route().to_string(),
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "request failed");
                        return Err(e);
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn dispatch_once(&self, request: &mut ApiRequest) -> GatewayResult<Flow> {
        for layer in self.layers.iter() {
            layer.on_request(&self.ctx, request).await?;
        }

        let mut response = self.ctx.transport.send(request).await?;
        debug!(status = %response.status, "response received");

        for layer in self.layers.iter().rev() {
            match layer.on_response(&self.ctx, request, response).await? {
                Flow::Continue(next) => response = next,
                Flow::Retry => {
                    debug!(layer = layer.name(), "layer asked for a replay");
                    return Ok(Flow::Retry);
                }
            }
        }
        Ok(Flow::Continue(response))
    }

    fn finish(&self, request: &ApiRequest, response: ApiResponse) -> GatewayResult<ApiResponse> {
        if response.is_success() {
            return Ok(response);
        }

        let err = GatewayError::from_response(request.route(), &response);
        match response.status.as_u16() {
            403 | 404 | 422 | 429 | 500..=599 => {
                error!(status = %response.status, error = %err, "backend rejected request");
            }
            _ if self.ctx.config.soft_warnings() => {
                warn!(status = %response.status, error = %err, "backend rejected request");
            }
            _ => {}
        }
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use reqwest::StatusCode;
    use serde_json::json;
    use tokio::sync::Notify;

    use super::*;
    use crate::{
        config::Environment,
        session::tests::USER_TOKEN,
        transport::testing::{json_response, ScriptedTransport},
    };

    struct Tagging;

    #[async_trait::async_trait]
    impl Layer for Tagging {
        fn name(&self) -> &'static str {
            "tagging"
        }

        async fn on_request(&self, _ctx: &GatewayContext, request: &mut ApiRequest) -> GatewayResult<()> {
            request.set_header(HeaderName::from_static("x-tag"), "yes")
        }
    }

    #[tokio::test]
    async fn test_extra_layers_run_and_options_apply() {
        let transport = ScriptedTransport::new(|_| json_response(200, json!([])));
        let gateway = Gateway::builder(GatewayConfig::new("http://api.local"))
            .transport(transport.clone())
            .layer(Tagging)
            .build()
            .unwrap();
        gateway
            .session()
            .establish(USER_TOKEN.to_string(), "r".to_string())
            .await;

        gateway
            .request(
                Method::GET,
                "/clientes",
                None,
                RequestOptions::default().query("page", "2"),
            )
            .await
            .unwrap();

        let sent = &transport.sent()[0];
        assert_eq!(sent.headers["x-tag"], "yes");
        assert_eq!(sent.query, vec![("page".to_string(), "2".to_string())]);
    }

    #[tokio::test]
    async fn test_errors_are_classified() {
        let transport = ScriptedTransport::new(|_| json_response(500, json!({"error": "boom"})));
        let gateway = Gateway::builder(GatewayConfig::new("http://api.local"))
            .transport(transport)
            .build()
            .unwrap();

        let err = gateway.get("/auth/login").await.unwrap_err();

        assert_eq!(err.status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(matches!(err, GatewayError::Server { message, .. } if message == "boom"));
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn lines_at(&self, level: &str) -> Vec<String> {
            String::from_utf8_lossy(&self.0.lock().unwrap())
                .lines()
                .filter(|line| line.contains(level))
                .map(str::to_string)
                .collect()
        }
    }

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLogs {
        type Writer = CapturedLogs;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[tokio::test]
    async fn test_error_classes_are_logged_in_production() {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let transport = ScriptedTransport::new(|request| match request.route() {
            "/backup" => json_response(503, json!({"error": "down"})),
            "/clientes/9" => json_response(404, json!({"error": "missing"})),
            _ => json_response(400, json!({"error": "bad input"})),
        });
        let mut config = GatewayConfig::new("http://api.local");
        config.environment = Environment::Production;
        let gateway = Gateway::builder(config)
            .transport(transport)
            .build()
            .unwrap();
        gateway
            .session()
            .establish(USER_TOKEN.to_string(), "r".to_string())
            .await;

        let err = gateway.get("/backup").await.unwrap_err();
        assert!(matches!(err, GatewayError::Server { .. }));
        let errors = logs.lines_at("ERROR");
        assert_eq!(errors.len(), 1, "{errors:?}");
        assert!(errors[0].contains("503"));

        gateway.get("/clientes/9").await.unwrap_err();
        assert_eq!(logs.lines_at("ERROR").len(), 2);

        gateway.get("/clientes").await.unwrap_err();
        assert_eq!(logs.lines_at("ERROR").len(), 2);
        assert!(logs.lines_at("WARN").is_empty());
    }

    #[tokio::test]
    async fn test_other_client_errors_warn_outside_production() {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let transport = ScriptedTransport::new(|_| json_response(400, json!({"error": "bad input"})));
        let gateway = Gateway::builder(GatewayConfig::new("http://api.local"))
            .transport(transport)
            .build()
            .unwrap();

        gateway.get("/auth/login").await.unwrap_err();

        assert_eq!(logs.lines_at("WARN").len(), 1);
        assert!(logs.lines_at("ERROR").is_empty());
    }

    struct Blocking(Arc<Notify>);

    #[async_trait::async_trait]
    impl Transport for Blocking {
        async fn send(&self, _request: &ApiRequest) -> GatewayResult<ApiResponse> {
            self.0.notified().await;
            Ok(json_response(200, json!({})))
        }
    }

    #[tokio::test]
    async fn test_pending_requests_are_counted() {
        let gate = Arc::new(Notify::new());
        let gateway = Gateway::builder(GatewayConfig::new("http://api.local"))
            .transport(Arc::new(Blocking(gate.clone())))
            .build()
            .unwrap();
        assert!(!gateway.has_pending_requests());

        let handle = {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.get("/auth/login").await })
        };
        while gateway.pending_requests() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(gateway.pending_requests(), 1);

        gate.notify_one();
        handle.await.unwrap().unwrap();
        assert_eq!(gateway.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_initialize_csrf_fetches_token() {
        let transport = ScriptedTransport::new(|_| json_response(200, json!({"csrfToken": "boot"})));
        let gateway = Gateway::builder(GatewayConfig::new("http://api.local"))
            .transport(transport)
            .build()
            .unwrap();

        gateway.initialize_csrf(false).await.unwrap();
        gateway.initialize_csrf(true).await.unwrap();

        assert_eq!(gateway.csrf().current().as_deref(), Some("boot"));
        assert_eq!(gateway.csrf().fetch_count(), 2);
    }
}
