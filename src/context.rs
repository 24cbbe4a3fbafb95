//! Ambient, per-invocation context: current scope, active user, active transport.
//!
//! Every RPC invocation already runs on its own spawned task (see
//! [`crate::session`]), and every HTTP request already runs on its own task
//! under the host framework, so [`tokio::task_local!`] gives us the "values
//! set in one logical task never leak into a concurrent task" and "reset on
//! every exit path" guarantees for free — there is nothing to explicitly
//! reset, the task-local simply stops existing when its task does.

use std::sync::Arc;

use tokio::task_local;

use crate::broadcast::Broadcaster;
use crate::transport::Transport;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    Rpc,
    Http,
}

#[derive(Clone)]
struct Ambient {
    scope: Scope,
    active_user: Option<String>,
    active_transport: Option<Arc<dyn Transport>>,
    broadcaster: Broadcaster,
}

task_local! {
    static AMBIENT: Ambient;
}

/// Per-call context passed to the scoping helpers below. Not constructible
/// outside this crate: application code only ever reads it through
/// [`is_http`], [`is_rpc`], and [`active_user`].
pub struct Context;

impl Context {
    /// Run `fut` with `scope = rpc`, the given active user, and the given
    /// active transport (used for same-connection `emit`). `broadcaster`
    /// is bound to the same connection manager the caller's own session
    /// registered its transport with, so `.to(...).emit(...)` from inside
    /// the handler fans out through that session's fabric rather than a
    /// separately-constructed one.
    pub async fn scope_rpc<F, T>(
        active_user: Option<String>,
        active_transport: Arc<dyn Transport>,
        broadcaster: Broadcaster,
        fut: F,
    ) -> T
    where
        F: std::future::Future<Output = T>,
    {
        AMBIENT
            .scope(
                Ambient {
                    scope: Scope::Rpc,
                    active_user,
                    active_transport: Some(active_transport),
                    broadcaster,
                },
                fut,
            )
            .await
    }

    /// Run `fut` with `scope = http` and the given active user (if the HTTP
    /// identity loader resolved one). There is no active transport in the
    /// HTTP scope, so `emit` from inside an HTTP handler is always an error.
    pub async fn scope_http<F, T>(active_user: Option<String>, broadcaster: Broadcaster, fut: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        AMBIENT
            .scope(
                Ambient {
                    scope: Scope::Http,
                    active_user,
                    active_transport: None,
                    broadcaster,
                },
                fut,
            )
            .await
    }

    pub(crate) fn active_transport() -> Option<Arc<dyn Transport>> {
        AMBIENT.try_with(|a| a.active_transport.clone()).ok().flatten()
    }
}

pub fn is_http() -> bool {
    AMBIENT.try_with(|a| a.scope == Scope::Http).unwrap_or(false)
}

pub fn is_rpc() -> bool {
    AMBIENT.try_with(|a| a.scope == Scope::Rpc).unwrap_or(false)
}

pub fn active_user() -> Option<String> {
    AMBIENT.try_with(|a| a.active_user.clone()).unwrap_or(None)
}

/// The broadcaster bound to the current RPC or HTTP call, if any. Wired to
/// the same connection manager the active session (or the HTTP adapter)
/// was built with, not a separately-constructed one.
pub fn broadcaster() -> Option<Broadcaster> {
    AMBIENT.try_with(|a| a.broadcaster.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn outside_any_handler_both_scopes_are_false() {
        assert!(!is_http());
        assert!(!is_rpc());
        assert_eq!(active_user(), None);
    }

    #[tokio::test]
    async fn scopes_do_not_leak_across_sibling_tasks() {
        let barrier = Arc::new(tokio::sync::Barrier::new(2));

        let b1 = barrier.clone();
        let t1 = tokio::spawn(async move {
            let transport: Arc<dyn Transport> = crate::transport::ChannelTransport::pair().0;
            let broadcaster = Broadcaster::new(crate::connection_manager::ConnectionManager::local_only());
            Context::scope_rpc(Some("alice".into()), transport, broadcaster, async move {
                b1.wait().await;
                assert!(is_rpc());
                assert_eq!(active_user().as_deref(), Some("alice"));
            })
            .await;
        });

        let b2 = barrier.clone();
        let t2 = tokio::spawn(async move {
            b2.wait().await;
            assert!(!is_rpc());
            assert!(!is_http());
            assert_eq!(active_user(), None);
        });

        let (r1, r2) = tokio::join!(t1, t2);
        r1.unwrap();
        r2.unwrap();
    }
}
