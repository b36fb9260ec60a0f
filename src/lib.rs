//! plsgate: an HTTP gateway that maps URLs onto stored procedures.
//!
//! A request like `GET /pls/app/pkg.page?name=Joe` resolves `pkg.page`
//! inside the route's database, binds `name` to the procedure's
//! parameters, executes it with a per-request session, and streams the
//! page the procedure printed (or the file it signalled) back as the
//! HTTP response.

pub mod args;
pub mod bind;
pub mod cache;
pub mod cgi;
pub mod config;
pub mod db;
pub mod docs;
pub mod error;
pub mod page;
pub mod pipeline;
pub mod resolve;
pub mod server;
pub mod stream;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
