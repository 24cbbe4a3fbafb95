//! Per-transport receive loop: handshake, decode, rate-check, validate,
//! invoke, encode, reply. Owns the in-RPC `emit` contract's transport
//! side (the call itself lives in [`crate::broadcast::emit`], which reads
//! the active transport this module binds via [`Context::scope_rpc`]).
//!
//! Handshake-then-loop shape: the first frame is consumed unconditionally
//! and only acted on if it's an `init`, and per-call errors reply without
//! ever terminating the session.

use std::sync::Arc;

use rmpv::Value;

use crate::broadcast::Broadcaster;
use crate::codec::{self, IncomingFrame, RpcRequest};
use crate::connection_manager::ConnectionManager;
use crate::context::Context;
use crate::limiter::{rate_limit_identity, Limiter, RateLimitExceeded};
use crate::registry::{CallError, Registry};
use crate::transport::{ConnectionClosed, Transport};

pub struct Session {
    transport: Arc<dyn Transport>,
    registry: Arc<Registry>,
    connections: Arc<ConnectionManager>,
    limiter: Arc<Limiter>,
}

impl Session {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<Registry>,
        connections: Arc<ConnectionManager>,
        limiter: Arc<Limiter>,
    ) -> Arc<Self> {
        Arc::new(Self { transport, registry, connections, limiter })
    }

    /// Drive the session to completion. Returns once the transport
    /// signals `ConnectionClosed` or every frame has been exhausted;
    /// never panics out through to the caller.
    pub async fn run(self: Arc<Self>) {
        let current_uid = self.handshake().await;

        // Removal runs on drop, so it fires on every exit path — normal
        // loop termination, an early return, or the whole task getting
        // cancelled out from under us.
        let _removal_guard = RemovalGuard {
            entry: current_uid
                .clone()
                .map(|uid| (uid, self.transport.clone(), self.connections.clone())),
        };

        loop {
            let raw = match self.transport.receive().await {
                Ok(raw) => raw,
                Err(ConnectionClosed) => break,
            };

            let incoming = match codec::decode(&raw).and_then(codec::parse_incoming) {
                Ok(incoming) => incoming,
                Err(e) => {
                    tracing::debug!(error = %e, "dropping malformed frame");
                    continue;
                }
            };

            let IncomingFrame::Rpc(request) = incoming else {
                continue;
            };

            let session = self.clone();
            let uid = current_uid.clone();
            tokio::spawn(async move { session.dispatch(request, uid).await });
        }
    }

    /// Consume exactly one frame and, if (and only if) it's an `init`
    /// frame, run the identity loader. Any other frame — malformed,
    /// undecodable, or simply a different `type` — is silently dropped.
    async fn handshake(&self) -> Option<String> {
        let raw = self.transport.receive().await.ok()?;
        let incoming = codec::decode(&raw).and_then(codec::parse_incoming).ok()?;
        let IncomingFrame::Init(init) = incoming else {
            return None;
        };

        let loader = self.registry.identity_loader()?.clone();
        let uid = match tokio::spawn((loader.as_ref())(init.auth)).await {
            Ok(Some(uid)) if !uid.is_empty() => uid,
            Ok(_) => return None,
            Err(join_err) => {
                tracing::error!(error = %join_err, "identity loader panicked; treating connection as anonymous");
                return None;
            }
        };

        self.connections.add(&uid, self.transport.clone());
        Some(uid)
    }

    async fn dispatch(self: Arc<Self>, request: RpcRequest, current_uid: Option<String>) {
        let RpcRequest { id, name, args, kwargs } = request;

        let Some(meta) = self.registry.procedure_meta(&name).cloned() else {
            self.reply(codec::reply_error_flat(id, format!("Function '{name}' not found."))).await;
            return;
        };

        if let Some((max_requests, window_seconds)) = meta.rate_limit {
            let identity = rate_limit_identity(current_uid.as_deref(), self.transport.remote_addr().as_deref());
            if let Err(RateLimitExceeded { retry_after }) =
                self.limiter.check(&name, &identity, max_requests, window_seconds).await
            {
                let data = Value::Map(vec![(Value::from("retry_after"), Value::from(retry_after))]);
                let message = format!("Rate Limit exceeded. Try again in {retry_after} seconds.");
                self.reply(codec::reply_error_structured(id, "RATELIMIT", message, data)).await;
                return;
            }
        }

        let registry = self.registry.clone();
        let transport = self.transport.clone();
        let broadcaster = Broadcaster::new(self.connections.clone());
        let reply_frame = Context::scope_rpc(current_uid, transport, broadcaster, async move {
            match registry.invoke(&name, &args, &kwargs).await {
                Ok(result) => codec::reply_ok(id, result),
                Err(CallError::NotFound(missing)) => codec::reply_error_flat(id, format!("Function '{missing}' not found.")),
                Err(CallError::Bind(message)) => codec::reply_error_flat(id, message),
                Err(CallError::Validation(data)) => {
                    codec::reply_error_structured(id, "VALIDATION_ERROR", "Input validation failed.", data)
                }
                Err(CallError::ReturnValidation(message)) => {
                    tracing::error!(procedure = %name, error = %message, "handler return value failed validation");
                    codec::reply_error_structured(
                        id,
                        "RETURN_VALIDATION_ERROR",
                        format!("Server returned invalid type: {message}"),
                        Value::Nil,
                    )
                }
                Err(CallError::Handler(message)) => codec::reply_error_flat(id, message),
                Err(CallError::RateLimited { .. }) => {
                    unreachable!("rate limiting is checked before Registry::invoke is ever called")
                }
            }
        })
        .await;

        self.reply(reply_frame).await;
    }

    async fn reply(&self, frame: Value) {
        match codec::encode(&frame) {
            Ok(bytes) => {
                let _ = self.transport.send(bytes).await;
            }
            Err(e) => tracing::error!(error = %e, "failed to encode reply frame"),
        }
    }
}

struct RemovalGuard {
    entry: Option<(String, Arc<dyn Transport>, Arc<ConnectionManager>)>,
}

impl Drop for RemovalGuard {
    fn drop(&mut self) {
        if let Some((uid, transport, connections)) = self.entry.take() {
            connections.remove(&uid, &transport);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ExposeOptions, ParamSpec, RegistryBuilder};
    use crate::transport::ChannelTransport;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct EchoParams {
        message: String,
    }

    #[derive(Deserialize)]
    struct AddParams {
        a: i64,
        b: i64,
    }

    fn build_registry() -> Arc<Registry> {
        let mut builder = RegistryBuilder::new();
        builder.expose(
            "echo",
            vec![ParamSpec::new::<String>("message")],
            ExposeOptions::default(),
            |p: EchoParams| async move { Ok::<_, std::convert::Infallible>(p.message) },
        );
        builder.expose(
            "add",
            vec![ParamSpec::new::<i64>("a"), ParamSpec::new::<i64>("b")],
            ExposeOptions::default(),
            |p: AddParams| async move { Ok::<_, std::convert::Infallible>(p.a + p.b) },
        );
        builder.expose(
            "spam_me",
            vec![],
            ExposeOptions { rate_limit: Some("1/m"), ..Default::default() },
            |_: ()| async move { Ok::<_, std::convert::Infallible>("ok".to_string()) },
        );
        builder.identity_loader(|auth: Value| async move { auth.as_str().map(str::to_string) });
        builder.build()
    }

    async fn send_frame(peer: &crate::transport::ChannelTestPeer, frame: Value) {
        let bytes = codec::encode(&frame).unwrap();
        peer.to_transport.send(bytes).unwrap();
    }

    async fn recv_frame(peer: &crate::transport::ChannelTestPeer) -> Value {
        let bytes = peer.from_transport.lock().await.recv().await.unwrap();
        codec::decode(&bytes).unwrap()
    }

    fn kwargs_frame(id: i64, name: &str, kwargs: Vec<(&str, Value)>) -> Value {
        let kwargs = Value::Map(kwargs.into_iter().map(|(k, v)| (Value::from(k), v)).collect());
        Value::Map(vec![
            (Value::from("type"), Value::from("rpc")),
            (Value::from("id"), Value::from(id)),
            (Value::from("name"), Value::from(name)),
            (Value::from("kwargs"), kwargs),
        ])
    }

    #[tokio::test]
    async fn s1_echo_round_trip() {
        let (transport, peer) = ChannelTransport::pair();
        let connections = ConnectionManager::local_only();
        let limiter = Limiter::new(None);
        let session = Session::new(transport, build_registry(), connections, limiter);
        tokio::spawn(session.run());

        send_frame(&peer, Value::Map(vec![(Value::from("type"), Value::from("init")), (Value::from("auth"), Value::from("user123"))])).await;
        send_frame(&peer, kwargs_frame(1, "echo", vec![("message", Value::from("Hello, Ephaptic!"))])).await;

        let reply = recv_frame(&peer).await;
        assert_eq!(reply.as_map().unwrap()[1].1.as_str(), Some("Hello, Ephaptic!"));
    }

    #[tokio::test]
    async fn s3_validation_error_does_not_end_the_session() {
        let (transport, peer) = ChannelTransport::pair();
        let connections = ConnectionManager::local_only();
        let limiter = Limiter::new(None);
        let session = Session::new(transport, build_registry(), connections, limiter);
        tokio::spawn(session.run());

        send_frame(&peer, Value::Map(vec![(Value::from("type"), Value::from("init")), (Value::from("auth"), Value::Nil)])).await;
        send_frame(&peer, kwargs_frame(3, "add", vec![("a", Value::from("x")), ("b", Value::from(7))])).await;
        let err_reply = recv_frame(&peer).await;
        let error = err_reply.as_map().unwrap().iter().find(|(k, _)| k.as_str() == Some("error")).unwrap().1.clone();
        assert_eq!(error.as_map().unwrap().iter().find(|(k, _)| k.as_str() == Some("code")).unwrap().1.as_str(), Some("VALIDATION_ERROR"));

        send_frame(&peer, kwargs_frame(4, "add", vec![("a", Value::from(5)), ("b", Value::from(7))])).await;
        let ok_reply = recv_frame(&peer).await;
        assert_eq!(ok_reply.as_map().unwrap()[1].1.as_i64(), Some(12));
    }

    #[tokio::test]
    async fn s4_unknown_method() {
        let (transport, peer) = ChannelTransport::pair();
        let connections = ConnectionManager::local_only();
        let limiter = Limiter::new(None);
        let session = Session::new(transport, build_registry(), connections, limiter);
        tokio::spawn(session.run());

        send_frame(&peer, Value::Map(vec![(Value::from("type"), Value::from("init")), (Value::from("auth"), Value::Nil)])).await;
        send_frame(&peer, kwargs_frame(4, "nope", vec![])).await;
        let reply = recv_frame(&peer).await;
        let error = reply.as_map().unwrap().iter().find(|(k, _)| k.as_str() == Some("error")).unwrap().1.clone();
        assert_eq!(error.as_str(), Some("Function 'nope' not found."));
    }

    #[tokio::test]
    async fn s5_rate_limit_second_call_rejected() {
        let (transport, peer) = ChannelTransport::pair();
        let connections = ConnectionManager::local_only();
        let limiter = Limiter::new(None);
        let session = Session::new(transport, build_registry(), connections, limiter);
        tokio::spawn(session.run());

        send_frame(&peer, Value::Map(vec![(Value::from("type"), Value::from("init")), (Value::from("auth"), Value::from("user123"))])).await;
        send_frame(&peer, kwargs_frame(5, "spam_me", vec![])).await;
        let ok_reply = recv_frame(&peer).await;
        assert_eq!(ok_reply.as_map().unwrap()[1].1.as_str(), Some("ok"));

        send_frame(&peer, kwargs_frame(6, "spam_me", vec![])).await;
        let err_reply = recv_frame(&peer).await;
        let error = err_reply.as_map().unwrap().iter().find(|(k, _)| k.as_str() == Some("error")).unwrap().1.clone();
        assert_eq!(error.as_map().unwrap().iter().find(|(k, _)| k.as_str() == Some("code")).unwrap().1.as_str(), Some("RATELIMIT"));
    }

    #[tokio::test]
    async fn removal_guard_prunes_connection_manager_on_close() {
        let (transport, peer) = ChannelTransport::pair();
        let connections = ConnectionManager::local_only();
        let limiter = Limiter::new(None);
        let session = Session::new(transport, build_registry(), connections.clone(), limiter);
        let handle = tokio::spawn(session.run());

        send_frame(&peer, Value::Map(vec![(Value::from("type"), Value::from("init")), (Value::from("auth"), Value::from("user123"))])).await;
        drop(peer);
        handle.await.unwrap();

        assert_eq!(connections.session_count_for("user123"), 0);
    }
}
