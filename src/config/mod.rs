use std::sync::OnceLock;

use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::Deserialize;

mod log_config;
pub use log_config::LogConfig;

pub static CONFIG: OnceLock<ServerConfig> = OnceLock::new();

/// Load `config.toml` (or `$APP_CONFIG`) merged with `APP_`-prefixed env
/// vars, and stash it in the process-wide [`CONFIG`] cell.
///
/// Invalid config is a hard startup failure, matching the host
/// application's own `config::init`.
pub fn init() {
    let raw_config = Figment::new()
        .merge(Toml::file(
            Env::var("APP_CONFIG").as_deref().unwrap_or("config.toml"),
        ))
        .merge(Env::prefixed("APP_").global());

    let config = match raw_config.extract::<ServerConfig>() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("It looks like your config is invalid. The following error occurred: {e}");
            std::process::exit(1);
        }
    };
    crate::config::CONFIG.set(config).expect("config should be set");
}

pub fn get() -> &'static ServerConfig {
    CONFIG.get().expect("config should be set")
}

#[derive(Deserialize, Clone, Debug)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Mount point for the WebSocket upgrade endpoint. Default `/_ephaptic`.
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
    /// Presence switches [`crate::connection_manager::ConnectionManager`]
    /// broadcasts (and the rate limiter) from local-only to cluster-wide.
    pub redis_url: Option<String>,
    #[serde(default)]
    pub log: LogConfig,
}

fn default_listen_addr() -> String {
    "127.0.0.1".into()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_ws_path() -> String {
    "/_ephaptic".into()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            listen_port: default_listen_port(),
            ws_path: default_ws_path(),
            redis_url: None,
            log: LogConfig::default(),
        }
    }
}
