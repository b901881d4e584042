//! Authenticated request gateway for the billing backend.
//!
//! Every call goes through one [`Gateway`]: it attaches the bearer token and the
//! CSRF token, and recovers from an expired access token with a single shared
//! refresh before replaying the affected requests once.

pub mod account;
pub mod auth;
pub mod config;
pub mod cookies;
pub mod csrf;
pub mod errors;
pub mod gateway;
pub mod middleware;
pub mod refresh;
pub mod session;
pub mod token;
pub mod transport;

pub use account::AccountClient;
pub use config::{Environment, GatewayConfig};
pub use errors::{GatewayError, GatewayResult};
pub use gateway::{Gateway, GatewayBuilder, GatewayContext, RequestOptions};
pub use middleware::{Flow, Layer};
pub use session::{
    FileSessionStore, MemorySessionStore, Session, SessionEvent, SessionState, SessionStore,
    SignedOutReason,
};
pub use transport::{ApiRequest, ApiResponse, HttpTransport, Transport};
