//! Unified gateway error model and client-facing rendering.
//!
//! Three families matter to callers: request rejections (client
//! attributable, 4xx), procedure failures (raised inside the database,
//! rendered per the route's error style) and resource errors from the pool.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::cgi::RequestEnvironment;
use crate::config::ErrorStyle;
use crate::db::{BindSet, BindValue, DbError};

/// A failure raised while invoking or streaming a procedure. Carries the
/// failing statement and bind set so the `debug` error style can show them.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ProcedureFailure {
    pub statement: String,
    pub binds: BindSet,
    pub at: DateTime<Utc>,
    pub message: String,
}

impl ProcedureFailure {
    pub fn new(statement: impl Into<String>, binds: BindSet, err: &DbError) -> Self {
        ProcedureFailure {
            statement: statement.into(),
            binds,
            at: Utc::now(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Excluded procedure, failed validation callback, bad identifier.
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// The requested name does not resolve to a callable procedure.
    #[error("not found: {0}")]
    NotFound(String),
    /// Malformed request input (alias, oversized signature, missing parts).
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("procedure failed: {0}")]
    Procedure(#[from] ProcedureFailure),
    #[error("database unavailable: {0}")]
    Pool(DbError),
    #[error("document transfer failed: {0}")]
    Document(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Map to HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::Forbidden(_) => 403,
            GatewayError::NotFound(_) => 404,
            GatewayError::BadRequest(_) => 400,
            GatewayError::Procedure(_) => 500,
            GatewayError::Pool(_) => 503,
            GatewayError::Document(_) => 500,
            GatewayError::Internal(_) => 500,
        }
    }

    /// True for client-attributable rejections that are never logged as
    /// server faults.
    pub fn is_request_error(&self) -> bool {
        matches!(
            self,
            GatewayError::Forbidden(_) | GatewayError::NotFound(_) | GatewayError::BadRequest(_)
        )
    }

    /// Render an HTML error page. `basic` stays terse; `debug` shows the
    /// failing statement, binds and the request's CGI environment.
    pub fn render(&self, style: ErrorStyle, env: Option<&RequestEnvironment>) -> String {
        let mut out = String::new();
        out.push_str("<html><head><title>plsgate error</title></head><body>\n");
        match self {
            _ if self.is_request_error() => {
                out.push_str(&format!("<h1>Request rejected</h1>\n<p>{}</p>\n", escape(&self.to_string())));
            }
            GatewayError::Procedure(f) if style == ErrorStyle::Debug => {
                out.push_str("<h1>Procedure failed</h1>\n");
                out.push_str(&format!("<p>{}</p>\n", escape(&f.message)));
                out.push_str(&format!("<p>at {}</p>\n", f.at.to_rfc3339()));
                out.push_str(&format!("<h2>Statement</h2>\n<pre>{}</pre>\n", escape(&f.statement)));
                out.push_str("<h2>Binds</h2>\n<table border=\"1\">\n");
                for (name, spec) in f.binds.iter() {
                    out.push_str(&format!(
                        "<tr><td>{}</td><td>{}</td></tr>\n",
                        escape(name),
                        escape(&render_value(&spec.value))
                    ));
                }
                out.push_str("</table>\n");
                if let Some(env) = env {
                    out.push_str("<h2>Environment</h2>\n<table border=\"1\">\n");
                    for (name, value) in env.iter() {
                        out.push_str(&format!(
                            "<tr><td>{}</td><td>{}</td></tr>\n",
                            escape(name),
                            escape(value)
                        ));
                    }
                    out.push_str("</table>\n");
                }
            }
            GatewayError::Pool(e) if style == ErrorStyle::Debug => {
                out.push_str(&format!("<h1>Database unavailable</h1>\n<p>{}</p>\n", escape(&e.to_string())));
            }
            _ => {
                out.push_str("<h1>Request failed</h1>\n<p>The gateway could not process this request.</p>\n");
            }
        }
        out.push_str("</body></html>\n");
        out
    }
}

fn render_value(value: &BindValue) -> String {
    match value {
        BindValue::Null => "null".to_string(),
        BindValue::Str(s) => s.clone(),
        BindValue::Int(n) => n.to_string(),
        BindValue::StrArray(v) => format!("[{}]", v.join(", ")),
        BindValue::Raw(b) => format!("<{} bytes>", b.len()),
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

pub type GatewayResult<T> = Result<T, GatewayError>;
