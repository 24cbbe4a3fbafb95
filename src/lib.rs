//! Bidirectional RPC-plus-events runtime.
//!
//! A [`Session`](session::Session) owns one [`Transport`](transport::Transport),
//! decodes [`IncomingFrame`](codec::IncomingFrame)s off it, and dispatches `rpc`
//! frames against a frozen [`Registry`](registry::Registry). Server code reaches
//! back out to clients either from inside a handler ([`broadcast::emit`]) or
//! from anywhere else via [`Broadcaster::to`](broadcast::Broadcaster::to).

pub mod app;
pub mod broadcast;
pub mod codec;
pub mod config;
pub mod connection_manager;
pub mod context;
pub mod demo;
pub mod error;
pub mod http;
pub mod limiter;
pub mod registry;
pub mod session;
pub mod transport;
pub mod utils;
pub mod ws;

pub use app::App;
pub use broadcast::Broadcaster;
pub use codec::IncomingFrame;
pub use context::Context;
pub use error::EphapticError;
pub use registry::{CallError, ParamSpec, ProcedureMeta, Registry, RegistryBuilder};
pub use session::Session;
pub use transport::Transport;

pub type AppResult<T> = Result<T, EphapticError>;
