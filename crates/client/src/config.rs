//! Engine configuration from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use storyweave_shared::CharacterRef;
use url::Url;

use crate::error::{EngineError, EngineResult};
use crate::storage::LocalStorage;
use crate::ws::{EndpointConfig, ReconnectConfig};

pub const DEFAULT_SERVER_URL: &str = "http://localhost:5000";
pub const DEFAULT_REVEAL_MS: u64 = 30;
const SOCKET_PATH: &str = "/ws";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base URL for the REST API.
    pub server_url: Url,
    pub socket: EndpointConfig,
    pub reveal_interval: Duration,
    pub reconnect: ReconnectConfig,
    /// Directory for the local snapshot. `None` if the platform has no
    /// config directory and none was given.
    pub data_dir: Option<PathBuf>,
    pub initial_character: Option<CharacterRef>,
}

/// `http(s)://host:port/...` -> `ws(s)://host:port/ws`.
fn socket_url_for(server: &Url) -> EngineResult<Url> {
    let scheme = match server.scheme() {
        "https" => "wss",
        _ => "ws",
    };
    let mut url = server.clone();
    url.set_scheme(scheme)
        .map_err(|_| EngineError::Config(format!("cannot derive socket url from {}", server)))?;
    url.set_path(SOCKET_PATH);
    url.set_query(None);
    Ok(url)
}

fn parse_number<T: std::str::FromStr>(name: &str, raw: Option<String>, default: T) -> EngineResult<T> {
    match raw {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| EngineError::Config(format!("{} must be a number, got '{}'", name, raw))),
    }
}

impl EngineConfig {
    /// Read configuration from the process environment.
    ///
    /// Environment variables:
    /// - `STORYWEAVE_SERVER_URL`: REST base URL (default: "http://localhost:5000")
    /// - `STORYWEAVE_WS_URL`: socket URL (default: server URL with ws scheme, path `/ws`)
    /// - `STORYWEAVE_REVEAL_MS`: per-character reveal interval (default: 30)
    /// - `STORYWEAVE_RECONNECT_ATTEMPTS`: reconnect ceiling (default: 5)
    /// - `STORYWEAVE_RECONNECT_DELAY_MS`: fixed delay between attempts (default: 1000)
    /// - `STORYWEAVE_DATA_DIR`: local snapshot directory (default: platform config dir)
    /// - `STORYWEAVE_CHARACTER`: character to talk to at startup
    pub fn from_env() -> EngineResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> EngineResult<Self> {
        let raw_server = lookup("STORYWEAVE_SERVER_URL").unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());
        let server_url = Url::parse(&raw_server)
            .map_err(|e| EngineError::Config(format!("invalid server url '{}': {}", raw_server, e)))?;
        if !matches!(server_url.scheme(), "http" | "https") {
            return Err(EngineError::Config(format!(
                "server url must be http or https, got '{}'",
                raw_server
            )));
        }

        let socket = match lookup("STORYWEAVE_WS_URL") {
            Some(raw) => EndpointConfig::parse(&raw)?,
            None => EndpointConfig {
                url: socket_url_for(&server_url)?,
            },
        };

        let reveal_ms = parse_number("STORYWEAVE_REVEAL_MS", lookup("STORYWEAVE_REVEAL_MS"), DEFAULT_REVEAL_MS)?;
        let defaults = ReconnectConfig::default();
        let reconnect = ReconnectConfig {
            max_attempts: parse_number(
                "STORYWEAVE_RECONNECT_ATTEMPTS",
                lookup("STORYWEAVE_RECONNECT_ATTEMPTS"),
                defaults.max_attempts,
            )?,
            initial_delay_ms: parse_number(
                "STORYWEAVE_RECONNECT_DELAY_MS",
                lookup("STORYWEAVE_RECONNECT_DELAY_MS"),
                defaults.initial_delay_ms,
            )?,
            ..defaults
        };

        let data_dir = lookup("STORYWEAVE_DATA_DIR")
            .map(PathBuf::from)
            .or_else(LocalStorage::default_dir);
        let initial_character = lookup("STORYWEAVE_CHARACTER")
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .map(CharacterRef::new);

        Ok(Self {
            server_url,
            socket,
            reveal_interval: Duration::from_millis(reveal_ms),
            reconnect,
            data_dir,
            initial_character,
        })
    }
}
