//! Server configuration with environment overrides.

use std::env;
use std::net::SocketAddr;

use tracing::warn;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    /// Static bearer token sessions must present. `None` disables the check.
    pub auth_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            auth_token: None,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `COWRITE_ADDR` and `COWRITE_AUTH_TOKEN`.
    pub fn from_env() -> Self {
        Self::from_vars(
            env::var("COWRITE_ADDR").ok(),
            env::var("COWRITE_AUTH_TOKEN").ok(),
        )
    }

    fn from_vars(addr: Option<String>, token: Option<String>) -> Self {
        let mut config = ServerConfig::default();
        if let Some(addr) = addr {
            match addr.parse() {
                Ok(parsed) => config.addr = parsed,
                Err(err) => warn!("ignoring unparsable COWRITE_ADDR {:?}: {}", addr, err),
            }
        }
        if let Some(token) = token {
            if !token.is_empty() {
                config.auth_token = Some(token);
            }
        }
        config
    }
}
