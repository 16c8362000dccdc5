//! JSON configuration file, covering exactly the keys spec.md §6 says are
//! "consumed, not defined here".

use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;
use tokio::net::lookup_host;

use crate::error::Error;
use crate::server::{Registry, ServerEntry};

/// Up to this many remote servers may be configured.
pub const MAX_SERVER: usize = 32;

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub address: String,
    pub port: String,
    pub secret: String,
}

#[derive(Debug, Deserialize)]
pub struct DnsConfig {
    pub address: String,
    pub port: String,
    pub upstream_address: String,
    pub upstream_port: String,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub dns: DnsConfig,
    pub server: Vec<ServerConfig>,
    pub user: Option<String>,
    pub group: Option<String>,
}

impl Config {
    /// Load and structurally validate the config file. Does not resolve any
    /// addresses yet — that happens in [`Config::resolve`], whose failures
    /// map to `RESOLVE_FAIL` rather than `CONFIG_INVALID`.
    pub fn load(path: &Path) -> Result<Config, Error> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigInvalid(format!("cannot read {}: {e}", path.display())))?;
        let config: Config = serde_json::from_str(&text)
            .map_err(|e| Error::ConfigInvalid(format!("malformed config: {e}")))?;

        if config.server.is_empty() {
            return Err(Error::ConfigInvalid("no server entries configured".into()));
        }
        if config.server.len() > MAX_SERVER {
            return Err(Error::ConfigInvalid(format!(
                "too many servers: {} > MAX_SERVER ({MAX_SERVER})",
                config.server.len()
            )));
        }
        for s in &config.server {
            if s.secret.is_empty() {
                return Err(Error::ConfigInvalid(format!(
                    "server {}:{} has no shared secret",
                    s.address, s.port
                )));
            }
        }
        if config.dns.upstream_address.len() >= crate::request::HOST_LEN {
            return Err(Error::ConfigInvalid(format!(
                "upstream_address too long: {} bytes (max {})",
                config.dns.upstream_address.len(),
                crate::request::HOST_LEN - 1
            )));
        }
        if config.dns.upstream_port.len() >= crate::request::PORT_LEN {
            return Err(Error::ConfigInvalid(format!(
                "upstream_port too long: {} bytes (max {})",
                config.dns.upstream_port.len(),
                crate::request::PORT_LEN - 1
            )));
        }

        Ok(config)
    }

    /// Resolve the local bind endpoint to a `SocketAddr`.
    pub async fn local_bind_addr(&self) -> Result<SocketAddr, Error> {
        resolve_one(&self.dns.address, &self.dns.port).await
    }

    /// Resolve every configured server's address and build the registry.
    pub async fn resolve_registry(&self) -> Result<Registry, Error> {
        let mut entries = Vec::with_capacity(self.server.len());
        for s in &self.server {
            let addr = resolve_one(&s.address, &s.port).await?;
            entries.push(ServerEntry::new(addr, s.secret.as_bytes()));
        }
        Ok(Registry::new(entries))
    }
}

async fn resolve_one(host: &str, port: &str) -> Result<SocketAddr, Error> {
    let lookup = format!("{host}:{port}");
    let mut addrs = lookup_host(&lookup)
        .await
        .map_err(|e| Error::ResolveFail(format!("{lookup}: {e}")))?;
    addrs
        .next()
        .ok_or_else(|| Error::ResolveFail(format!("{lookup}: no addresses returned")))
}
