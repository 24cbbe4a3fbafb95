//! `to(users…).emit(event)`, plus the free `emit(event)` used from
//! inside an RPC handler to push to the caller's own connection.
//!
//! A dynamic-attribute-style `target.<event_name>(*args, **kwargs)` call
//! has no static Rust equivalent, so [`Target::emit_raw`] spells out the
//! same capability as an explicit method instead.

use std::collections::HashMap;
use std::sync::Arc;

use rmpv::Value;
use thiserror::Error;

use crate::codec;
use crate::connection_manager::ConnectionManager;
use crate::context::Context;
use crate::registry::EphapticEvent;

#[derive(Debug, Error)]
pub enum EmitError {
    #[error(".emit(...) called outside RPC context; use .to(...).emit(...) to broadcast from background tasks")]
    NoActiveTransport,
}

/// Builds [`Target`]s. Held by [`crate::app::App`] and cloned freely
/// (it's just an `Arc<ConnectionManager>` handle).
#[derive(Clone)]
pub struct Broadcaster {
    connections: Arc<ConnectionManager>,
}

impl Broadcaster {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self { connections }
    }

    /// Flattens a mix of single ids and lists of ids into one ordered
    /// list, duplicates preserved.
    pub fn to(&self, args: impl IntoIterator<Item = TargetArg>) -> Target {
        let mut user_ids = Vec::new();
        for arg in args {
            match arg {
                TargetArg::One(id) => user_ids.push(id),
                TargetArg::Many(ids) => user_ids.extend(ids),
            }
        }
        Target { user_ids, connections: self.connections.clone() }
    }
}

#[derive(Debug, Clone)]
pub enum TargetArg {
    One(String),
    Many(Vec<String>),
}

impl From<&str> for TargetArg {
    fn from(s: &str) -> Self {
        Self::One(s.to_string())
    }
}
impl From<String> for TargetArg {
    fn from(s: String) -> Self {
        Self::One(s)
    }
}
impl From<Vec<String>> for TargetArg {
    fn from(v: Vec<String>) -> Self {
        Self::Many(v)
    }
}
impl From<Vec<&str>> for TargetArg {
    fn from(v: Vec<&str>) -> Self {
        Self::Many(v.into_iter().map(str::to_string).collect())
    }
}

/// A resolved list of recipient user ids, ready to receive one event.
pub struct Target {
    user_ids: Vec<String>,
    connections: Arc<ConnectionManager>,
}

impl Target {
    pub async fn emit<E: EphapticEvent>(&self, event: &E) {
        let kwargs = event_to_kwargs(event);
        self.connections.broadcast(&self.user_ids, E::NAME, vec![], kwargs).await;
    }

    /// Spells out a dynamic `target.<name>(*args, **kwargs)`-style call as
    /// an explicit method.
    pub async fn emit_raw(&self, name: &str, args: Vec<Value>, kwargs: HashMap<String, Value>) {
        self.connections.broadcast(&self.user_ids, name, args, kwargs).await;
    }
}

/// Push an event directly on the currently active transport. Valid only
/// from inside an RPC handler (scope = `rpc`, an active transport is
/// bound via [`Context::scope_rpc`]); calling this from a background task
/// is an error: there is no caller connection to push to.
pub async fn emit<E: EphapticEvent>(event: &E) -> Result<(), EmitError> {
    let transport = Context::active_transport().ok_or(EmitError::NoActiveTransport)?;

    let kwargs = event_to_kwargs(event);
    let frame = codec::event_frame(E::NAME, vec![], kwargs);
    let bytes = match codec::encode(&frame) {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(error = %e, event = E::NAME, "failed to encode event frame");
            return Ok(());
        }
    };

    let _ = transport.send(bytes).await;
    Ok(())
}

fn event_to_kwargs<E: EphapticEvent>(event: &E) -> HashMap<String, Value> {
    match rmpv::ext::to_value(event) {
        Ok(Value::Map(pairs)) => pairs
            .into_iter()
            .filter_map(|(k, v)| k.as_str().map(|k| (k.to_string(), v)))
            .collect(),
        Ok(_) => {
            tracing::error!(event = E::NAME, "event payload did not serialize to a map");
            HashMap::new()
        }
        Err(e) => {
            tracing::error!(error = %e, event = E::NAME, "failed to serialize event payload");
            HashMap::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ChannelTransport, Transport};
    use serde::Serialize;

    #[derive(Serialize)]
    struct Ping {
        message: String,
    }
    impl EphapticEvent for Ping {
        const NAME: &'static str = "Ping";
    }

    #[tokio::test]
    async fn to_flattens_single_ids_and_lists_preserving_duplicates() {
        let connections = ConnectionManager::local_only();
        let broadcaster = Broadcaster::new(connections);
        let target = broadcaster.to([
            TargetArg::from("alice"),
            TargetArg::from(vec!["bob".to_string(), "alice".to_string()]),
        ]);
        assert_eq!(target.user_ids, vec!["alice", "bob", "alice"]);
    }

    #[tokio::test]
    async fn emit_outside_rpc_scope_errors_without_writing_anywhere() {
        let err = emit(&Ping { message: "hi".into() }).await.unwrap_err();
        assert!(matches!(err, EmitError::NoActiveTransport));
    }

    #[tokio::test]
    async fn emit_inside_rpc_scope_writes_to_the_active_transport() {
        let (transport, peer) = ChannelTransport::pair();
        let transport: Arc<dyn Transport> = transport;
        let broadcaster = Broadcaster::new(ConnectionManager::local_only());

        Context::scope_rpc(Some("alice".into()), transport, broadcaster, async {
            emit(&Ping { message: "hi".into() }).await.unwrap();
        })
        .await;

        let bytes = peer.from_transport.lock().await.recv().await.unwrap();
        let value = codec::decode(&bytes).unwrap();
        assert_eq!(value.as_map().unwrap()[1].1.as_str(), Some("Ping"));
    }
}
