use salvo::http::{StatusCode, StatusError};
use salvo::oapi::{self, EndpointOutRegister, ToSchema};
use salvo::prelude::*;
use thiserror::Error;

/// Ambient, non-protocol errors: configuration, pub/sub wiring, registry
/// build-time mistakes, and HTTP-adapter auth/rate-limit outcomes.
///
/// RPC-frame errors are a different taxonomy entirely (see
/// [`crate::registry::CallError`]): they never bubble up as a Rust `Result`
/// out of the session loop, they are always turned into a reply frame
/// instead — per-call errors never terminate a session.
#[derive(Error, Debug)]
pub enum EphapticError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid rate limit spec {spec:?}: {reason}")]
    InvalidRateLimit { spec: String, reason: String },

    #[error("pub/sub connection error")]
    PubSub(#[from] redis::RedisError),

    #[error("access token is invalid")]
    InvalidAccess,

    #[error("login required")]
    LoginRequired,

    #[error("rate limit exceeded, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },
}

impl Scribe for EphapticError {
    fn render(self, res: &mut Response) {
        let status_error = match &self {
            Self::Config(_) | Self::InvalidRateLimit { .. } | Self::PubSub(_) => {
                tracing::error!(error = ?self, "internal ephaptic error");
                StatusError::internal_server_error()
            }
            Self::InvalidAccess | Self::LoginRequired => {
                StatusError::unauthorized().brief(self.to_string())
            }
            Self::RateLimited { retry_after } => {
                if let Ok(value) = retry_after.to_string().parse() {
                    res.headers_mut().insert("X-Retry-After", value);
                }
                StatusError::too_many_requests().brief(self.to_string())
            }
        };
        res.render(status_error);
    }
}

impl EndpointOutRegister for EphapticError {
    fn register(components: &mut oapi::Components, operation: &mut oapi::Operation) {
        let responses = [
            (StatusCode::UNAUTHORIZED, "Not logged in or invalid access token"),
            (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded"),
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error"),
        ];

        for (status, description) in responses {
            operation.responses.insert(
                status.as_str(),
                oapi::Response::new(description)
                    .add_content("application/json", StatusError::to_schema(components)),
            );
        }
    }
}
