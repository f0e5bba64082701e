// Server configuration
//
// Process-level settings read from the environment. Pipeline tuning lives in
// courier_delivery::PipelineConfig.

use std::net::SocketAddr;

use thiserror::Error;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:9000";

#[derive(Debug, Error)]
pub enum ServerConfigError {
    #[error("invalid COURIER_BIND_ADDR {value:?}: {source}")]
    BindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
}

/// Server settings
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Address the HTTP listener binds to
    pub bind_addr: SocketAddr,
    /// PostgreSQL connection string; `None` runs the in-memory store
    pub database_url: Option<String>,
    /// Origins allowed by CORS; empty means same-origin only
    pub cors_allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            database_url: None,
            cors_allowed_origins: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Environment variables:
    /// - `COURIER_BIND_ADDR` (default `0.0.0.0:9000`)
    /// - `DATABASE_URL` (optional)
    /// - `CORS_ALLOWED_ORIGINS` (comma separated, optional)
    pub fn from_env() -> Result<Self, ServerConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ServerConfigError> {
        let bind = lookup("COURIER_BIND_ADDR")
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind
            .parse()
            .map_err(|source| ServerConfigError::BindAddr {
                value: bind.clone(),
                source,
            })?;

        let cors_allowed_origins = lookup("CORS_ALLOWED_ORIGINS")
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            bind_addr,
            database_url: lookup("DATABASE_URL").filter(|s| !s.is_empty()),
            cors_allowed_origins,
        })
    }
}
