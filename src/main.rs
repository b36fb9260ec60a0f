use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use plsgate::config::{GatewayConfig, RouteConfig};
use plsgate::db::mock::MockDb;
use plsgate::db::Pool;
use plsgate::pipeline::RouteState;
use plsgate::server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cfg = match config_path() {
        Some(path) => {
            info!(path = %path, "loading gateway configuration");
            GatewayConfig::load(&path)?
        }
        None => {
            warn!("no config given (--config or PLSGATE_CONFIG); serving the demo route");
            demo_config()
        }
    };

    info!("plsgate {} starting", plsgate::VERSION);

    // TODO: wire a native driver pool from RouteConfig::database once one
    // is linked in; until then every route runs on the in-memory backend.
    let mut routes = Vec::with_capacity(cfg.routes.len());
    for route in cfg.routes.iter().cloned() {
        let pool: Arc<dyn Pool> = Arc::new(MockDb::demo());
        routes.push(Arc::new(RouteState::new(route, pool)?));
    }

    server::run(cfg, routes).await
}

fn config_path() -> Option<String> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    std::env::var("PLSGATE_CONFIG").ok()
}

fn demo_config() -> GatewayConfig {
    GatewayConfig {
        http_port: 7878,
        routes: vec![RouteConfig {
            prefix: "/pls/demo".to_string(),
            default_page: Some("sample.pageindex".to_string()),
            ..Default::default()
        }],
    }
}
