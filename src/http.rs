//! Optional HTTP adapter: the same frozen [`Registry`] a [`crate::Session`]
//! dispatches against, reachable as plain `POST /rpc/{name}` routes for
//! callers that don't want a persistent WebSocket.
//!
//! Uses manual `req.parse_json()` rather than the `#[endpoint]`/`JsonBody`
//! extractor, since this path needs raw access to headers and a path
//! parameter the extractor macros don't cover. An auth failure renders its
//! error and returns immediately, the same shape any auth hoop uses to
//! stop a request early.

use std::collections::HashMap;

use salvo::http::{StatusCode, StatusError};
use salvo::prelude::*;
use serde::{Deserialize, Serialize};

use crate::app;
use crate::context::Context;
use crate::error::EphapticError;
use crate::limiter::rate_limit_identity;
use crate::registry::{CallError, HttpAuthInput};

#[derive(Debug, Deserialize, Default)]
pub struct HttpRpcBody {
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default)]
    pub kwargs: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct HttpRpcError {
    code: Option<&'static str>,
    message: String,
}

/// Mount under e.g. `Router::with_path("rpc/{name}").post(call_procedure)`.
/// Auth and rate limiting are both driven off the *same* registry metadata
/// a WebSocket session would use, so a procedure behaves identically
/// whichever transport a caller reaches it through.
#[handler]
pub async fn call_procedure(req: &mut Request, res: &mut Response) {
    let app = app::get();
    let Some(name) = req.param::<String>("name") else {
        res.render(StatusError::bad_request().brief("missing procedure name"));
        return;
    };

    let Some(meta) = app.registry.procedure_meta(&name) else {
        res.render(StatusError::not_found().brief(format!("Function '{name}' not found.")));
        return;
    };

    let uid = resolve_identity(req, &app).await;
    if meta.requires_login && uid.is_none() {
        EphapticError::LoginRequired.render(res);
        return;
    }

    if let Some((max_requests, window_seconds)) = meta.rate_limit {
        let identity = rate_limit_identity(uid.as_deref(), Some(req.remote_addr().to_string()).as_deref());
        if let Err(exceeded) = app.limiter.check(&name, &identity, max_requests, window_seconds).await {
            EphapticError::RateLimited { retry_after: exceeded.retry_after }.render(res);
            return;
        }
    }

    let body: HttpRpcBody = req.parse_json().await.unwrap_or_default();
    let args: Vec<rmpv::Value> = body.args.iter().map(json_to_rmpv).collect();
    let kwargs: HashMap<String, rmpv::Value> = body.kwargs.iter().map(|(k, v)| (k.clone(), json_to_rmpv(v))).collect();

    let outcome = Context::scope_http(uid, app.broadcaster.clone(), app.registry.invoke(&name, &args, &kwargs)).await;

    match outcome {
        Ok(result) => {
            res.render(Json(rmpv_to_json(&result)));
        }
        Err(err) => render_call_error(res, err),
    }
}

async fn resolve_identity(req: &Request, app: &app::App) -> Option<String> {
    let loader = app.registry.http_identity_loader()?.clone();
    let bearer_token = req
        .header::<String>("authorization")
        .and_then(|h| h.strip_prefix("Bearer ").map(str::to_string));
    let headers = req
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect();
    (loader.as_ref())(HttpAuthInput { bearer_token, headers }).await
}

fn render_call_error(res: &mut Response, err: CallError) {
    let (status, body) = match err {
        CallError::NotFound(name) => (
            StatusCode::NOT_FOUND,
            HttpRpcError { code: None, message: format!("Function '{name}' not found.") },
        ),
        CallError::Bind(message) => (StatusCode::BAD_REQUEST, HttpRpcError { code: None, message }),
        CallError::Validation(_) => (
            StatusCode::BAD_REQUEST,
            HttpRpcError { code: Some("VALIDATION_ERROR"), message: "Input validation failed.".into() },
        ),
        CallError::ReturnValidation(message) => {
            tracing::error!(error = %message, "handler returned ill-typed value");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                HttpRpcError { code: Some("RETURN_VALIDATION_ERROR"), message },
            )
        }
        CallError::Handler(message) => (StatusCode::INTERNAL_SERVER_ERROR, HttpRpcError { code: None, message }),
        CallError::RateLimited { retry_after } => {
            unreachable!("rate limit checked before invoke; retry_after={retry_after}")
        }
    };
    res.status_code(status);
    res.render(Json(body));
}

fn json_to_rmpv(value: &serde_json::Value) -> rmpv::Value {
    rmpv::ext::to_value(value).unwrap_or(rmpv::Value::Nil)
}

fn rmpv_to_json(value: &rmpv::Value) -> serde_json::Value {
    rmpv::ext::from_value(value.clone()).unwrap_or(serde_json::Value::Null)
}
