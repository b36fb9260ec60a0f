//! Gateway configuration: one `RouteConfig` per mount point, immutable
//! after load. Loaded from a JSON file; validation happens once at startup.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{bail, Context};
use futures_util::future::BoxFuture;
use serde::Deserialize;

use crate::db::{DbError, Session};

/// Custom transaction finalizer: receives the live session and the
/// canonical procedure name after output is drained.
pub type TxCallback = Arc<
    dyn for<'a> Fn(&'a mut dyn Session, &'a str) -> BoxFuture<'a, Result<(), DbError>>
        + Send
        + Sync,
>;

/// Closed set of transaction finalization behaviors. Config files can only
/// express `commit` and `rollback`; `Custom` is wired programmatically.
#[derive(Clone, Default)]
pub enum TransactionPolicy {
    #[default]
    Commit,
    Rollback,
    Custom(TxCallback),
}

impl fmt::Debug for TransactionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionPolicy::Commit => write!(f, "Commit"),
            TransactionPolicy::Rollback => write!(f, "Rollback"),
            TransactionPolicy::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl<'de> Deserialize<'de> for TransactionPolicy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        match s.as_str() {
            "commit" => Ok(TransactionPolicy::Commit),
            "rollback" => Ok(TransactionPolicy::Rollback),
            other => Err(serde::de::Error::custom(format!(
                "unknown transaction policy '{}' (expected commit|rollback)",
                other
            ))),
        }
    }
}

/// How much a failed request tells the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorStyle {
    #[default]
    Basic,
    Debug,
}

/// Optional per-route HTTP Basic authentication. The password may be a
/// plain string or an Argon2 PHC hash (`$argon2...`).
#[derive(Debug, Clone, Deserialize)]
pub struct BasicAuth {
    #[serde(default = "default_realm")]
    pub realm: String,
    pub username: String,
    pub password: String,
}

fn default_realm() -> String {
    "plsgate".to_string()
}

/// Connect descriptor for the route's database. Consumed by whatever pool
/// implementation is wired in; the gateway core never reads it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DbConnect {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub connect_string: String,
}

/// One mounted gateway route.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouteConfig {
    /// URL prefix the route is mounted at, e.g. "/pls/app".
    pub prefix: String,
    #[serde(default)]
    pub database: DbConnect,
    /// Procedure invoked for requests that name no procedure.
    #[serde(default)]
    pub default_page: Option<String>,
    /// Table receiving uploaded documents; uploads are rejected when unset.
    #[serde(default)]
    pub document_table: Option<String>,
    /// Glob-like patterns of forbidden procedure names. When absent, a
    /// built-in denial set for catalog/owner packages applies.
    #[serde(default)]
    pub exclusion_list: Option<Vec<String>>,
    /// Boolean database function consulted before any catalog work.
    #[serde(default)]
    pub request_validation_function: Option<String>,
    /// Path alias and the function that maps it to a real target.
    #[serde(default)]
    pub path_alias: Option<String>,
    #[serde(default)]
    pub path_alias_procedure: Option<String>,
    #[serde(default)]
    pub transaction: TransactionPolicy,
    #[serde(default)]
    pub error_style: ErrorStyle,
    /// Static CGI variable overrides merged over the derived set.
    #[serde(default)]
    pub cgi: HashMap<String, String>,
    #[serde(default)]
    pub basic_auth: Option<BasicAuth>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    pub routes: Vec<RouteConfig>,
}

fn default_http_port() -> u16 {
    7878
}

impl GatewayConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path))?;
        let cfg: GatewayConfig =
            serde_json::from_str(&raw).with_context(|| format!("invalid config file: {}", path))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.routes.is_empty() {
            bail!("config declares no routes");
        }
        let mut seen: Vec<&str> = Vec::new();
        for route in &self.routes {
            if !route.prefix.starts_with('/') || route.prefix == "/" {
                bail!("route prefix must start with '/' and not be bare: '{}'", route.prefix);
            }
            if seen.contains(&route.prefix.as_str()) {
                bail!("duplicate route prefix: '{}'", route.prefix);
            }
            if route.path_alias.is_some() != route.path_alias_procedure.is_some() {
                bail!(
                    "route '{}': path_alias and path_alias_procedure must be configured together",
                    route.prefix
                );
            }
            seen.push(route.prefix.as_str());
        }
        Ok(())
    }
}
