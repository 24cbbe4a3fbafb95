//! Builds and owns the frozen runtime a running server shares across every
//! session and request handler: the registry, connection manager, rate
//! limiter, and broadcaster.
//!
//! Shaped like [`crate::config`]'s own `CONFIG`/`init`/`get` cell: one
//! process-wide slot, set once at startup by the binary, read everywhere
//! after by [`crate::ws`] and [`crate::http`] so neither has to thread an
//! `Arc<App>` through every handler signature.

use std::sync::{Arc, OnceLock};

use crate::broadcast::Broadcaster;
use crate::config::ServerConfig;
use crate::connection_manager::ConnectionManager;
use crate::error::EphapticError;
use crate::limiter::Limiter;
use crate::registry::{Registry, RegistryBuilder};

pub struct App {
    pub registry: Arc<Registry>,
    pub connections: Arc<ConnectionManager>,
    pub limiter: Arc<Limiter>,
    pub broadcaster: Broadcaster,
}

static APP: OnceLock<Arc<App>> = OnceLock::new();

impl App {
    /// Freeze `builder` and wire it to local or cluster-wide connection and
    /// rate-limit fabric depending on whether `config.redis_url` is set.
    pub async fn build(builder: RegistryBuilder, config: &ServerConfig) -> Result<Arc<Self>, EphapticError> {
        let registry = builder.build();

        let (connections, limiter) = match &config.redis_url {
            Some(url) => {
                let connections = ConnectionManager::with_redis(url).await?;
                let client = redis::Client::open(url.as_str())?;
                let redis_conn = redis::aio::ConnectionManager::new(client).await?;
                (connections, Limiter::new(Some(redis_conn)))
            }
            None => (ConnectionManager::local_only(), Limiter::new(None)),
        };

        let broadcaster = Broadcaster::new(connections.clone());
        Ok(Arc::new(Self { registry, connections, limiter, broadcaster }))
    }

    /// Stash this instance in the process-wide cell. Must run exactly once,
    /// before the server starts accepting connections.
    pub fn install(self: Arc<Self>) {
        if APP.set(self).is_err() {
            panic!("App::install called more than once");
        }
    }
}

/// Read back the instance installed by [`App::install`]. Panics if called
/// before installation — a startup-ordering bug, not a runtime condition
/// callers should handle.
pub fn get() -> Arc<App> {
    APP.get().expect("App::install must run before serving requests").clone()
}

#[cfg(test)]
pub(crate) fn install_for_test(app: Arc<App>) {
    let _ = APP.set(app);
}
