//! Per-request orchestration: resolve → authorize → bind → invoke →
//! stream → assemble. No stage is re-entered and nothing is retried; a
//! failure at any stage goes straight to error reporting. The session is
//! released on every exit path (dropping it returns it to the pool).

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures_channel::mpsc;
use futures_util::{SinkExt, StreamExt};
use tracing::{error, info, warn};

use crate::args::ArgumentSet;
use crate::bind::{ArgSignature, Binder};
use crate::cache::BindingCache;
use crate::cgi::RequestEnvironment;
use crate::config::RouteConfig;
use crate::db::Pool;
use crate::docs::{self, UploadedFile};
use crate::error::{GatewayError, GatewayResult};
use crate::page::{self, FilePayload, PageHead, PageResult};
use crate::resolve::Resolver;
use crate::stream::{self, PageStream};

/// Everything a mounted route keeps alive for the process lifetime: its
/// config, its pool handle and the two binding caches. The caches are
/// constructed here and injected, never ambient globals, so tests can
/// substitute fresh instances per case.
pub struct RouteState {
    pub config: Arc<RouteConfig>,
    pub name_cache: Arc<BindingCache<String>>,
    pub signature_cache: Arc<BindingCache<ArgSignature>>,
    resolver: Resolver,
    binder: Binder,
    pool: Arc<dyn Pool>,
}

impl RouteState {
    pub fn new(config: RouteConfig, pool: Arc<dyn Pool>) -> anyhow::Result<Self> {
        let name_cache = Arc::new(BindingCache::new());
        let signature_cache = Arc::new(BindingCache::new());
        let resolver = Resolver::new(&config, name_cache.clone())?;
        let binder = Binder::new(signature_cache.clone());
        Ok(RouteState {
            config: Arc::new(config),
            name_cache,
            signature_cache,
            resolver,
            binder,
            pool,
        })
    }
}

/// One translated HTTP request, ready for the pipeline.
#[derive(Debug, Default)]
pub struct GatewayRequest {
    pub proc_name: String,
    pub args: ArgumentSet,
    pub env: RequestEnvironment,
    pub files: Vec<UploadedFile>,
}

/// Body chunks flowing from the paging fetches to the HTTP writer. The
/// channel is bounded, so a slow client applies backpressure to the
/// fetch loop instead of buffering unbounded output in the gateway.
pub type BodyChunks = mpsc::Receiver<Result<Bytes, GatewayError>>;

pub enum GatewayResponse {
    Page { head: PageHead, body: BodyChunks },
    Download(FilePayload),
}

// Manual impl: the body channel has no useful Debug form.
impl fmt::Debug for GatewayResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayResponse::Page { head, .. } => {
                f.debug_struct("Page").field("head", head).finish_non_exhaustive()
            }
            GatewayResponse::Download(file) => f.debug_tuple("Download").field(file).finish(),
        }
    }
}

impl GatewayResponse {
    pub fn status(&self) -> u16 {
        match self {
            GatewayResponse::Page { head, .. } => head.effective_status(),
            GatewayResponse::Download(_) => 200,
        }
    }
}

/// Run the pipeline and emit the per-request completion event.
pub async fn handle(state: &RouteState, req: GatewayRequest) -> GatewayResult<GatewayResponse> {
    let started = Instant::now();
    let proc = req.proc_name.clone();
    let result = run(state, req).await;
    let ms = started.elapsed().as_millis() as u64;
    match &result {
        Ok(resp) => {
            info!(target: "request", proc = %proc, status = resp.status(), ms, outcome = "success", "request completed");
        }
        Err(e) if e.is_request_error() => {
            info!(target: "request", proc = %proc, status = e.http_status(), ms, outcome = "rejected", reason = %e, "request rejected");
        }
        Err(e) => {
            error!(target: "request", proc = %proc, error = %e, "request failed");
            info!(target: "request", proc = %proc, status = e.http_status(), ms, outcome = "error", "request completed");
        }
    }
    result
}

async fn run(state: &RouteState, req: GatewayRequest) -> GatewayResult<GatewayResponse> {
    let mut session = state.pool.acquire().await.map_err(GatewayError::Pool)?;

    // Uploads land in the document table before invocation so the
    // procedure can reference them.
    if let Err(e) = docs::store_uploads(
        session.as_mut(),
        state.config.document_table.as_deref(),
        &req.files,
    )
    .await
    {
        stream::rollback_quietly(session.as_mut()).await;
        return Err(e);
    }

    let canonical = match state.resolver.resolve(session.as_mut(), &req.proc_name).await {
        Ok(c) => c,
        Err(e) => {
            stream::rollback_quietly(session.as_mut()).await;
            return Err(e);
        }
    };

    let plan = match state.binder.plan(session.as_mut(), &canonical, &req.args).await {
        Ok(p) => p,
        Err(e) => {
            stream::rollback_quietly(session.as_mut()).await;
            return Err(e);
        }
    };

    if let Err(e) = stream::init_cgi(session.as_mut(), &req.env).await {
        stream::rollback_quietly(session.as_mut()).await;
        return Err(e);
    }

    if let Err(e) = stream::invoke(session.as_mut(), &plan).await {
        stream::rollback_quietly(session.as_mut()).await;
        return Err(e);
    }

    // File download short-circuits page assembly entirely.
    match docs::download_probe(session.as_mut()).await {
        Ok(Some(file)) => {
            stream::finalize(session.as_mut(), &canonical, &state.config.transaction).await?;
            return Ok(GatewayResponse::Download(file));
        }
        Ok(None) => {}
        Err(e) => {
            stream::rollback_quietly(session.as_mut()).await;
            return Err(e);
        }
    }

    let mut page = PageStream::new(session, canonical, state.config.transaction.clone());
    let (head, leftover) = match page::assemble_head(&mut page).await {
        Ok(parsed) => parsed,
        Err(e) => {
            page.abort().await;
            return Err(e);
        }
    };

    let (tx, rx) = mpsc::channel(2);
    tokio::spawn(drain_body(page, leftover, tx));
    Ok(GatewayResponse::Page { head, body: rx })
}

/// Pump remaining output chunks into the bounded body channel. A closed
/// receiver means the client disconnected: stop fetching and run
/// finalization anyway; no cleanup step is skipped.
async fn drain_body(
    mut page: PageStream,
    leftover: Vec<String>,
    mut tx: mpsc::Sender<Result<Bytes, GatewayError>>,
) {
    let mut sent_any = false;
    if !leftover.is_empty() {
        if tx.send(Ok(Bytes::from(leftover.join("\n")))).await.is_err() {
            finish_after_disconnect(page).await;
            return;
        }
        sent_any = true;
    }
    loop {
        match page.next_chunk().await {
            Ok(Some(lines)) => {
                let mut text = String::new();
                if sent_any {
                    text.push('\n');
                }
                text.push_str(&lines.join("\n"));
                sent_any = true;
                if tx.send(Ok(Bytes::from(text))).await.is_err() {
                    finish_after_disconnect(page).await;
                    return;
                }
            }
            Ok(None) => {
                if let Err(e) = page.finish().await {
                    error!(error = %e, "transaction finalization failed after drain");
                    let _ = tx.send(Err(e)).await;
                }
                return;
            }
            Err(e) => {
                page.abort().await;
                let _ = tx.send(Err(e)).await;
                return;
            }
        }
    }
}

async fn finish_after_disconnect(page: PageStream) {
    if let Err(e) = page.finish().await {
        warn!(error = %e, "finalization after client disconnect failed");
    }
}

/// Drain a response into a `PageResult`; used by tests and by callers
/// that want the buffered form.
pub async fn collect(resp: GatewayResponse) -> GatewayResult<PageResult> {
    match resp {
        GatewayResponse::Download(file) => Ok(PageResult::from_file(file)),
        GatewayResponse::Page { head, mut body } => {
            let mut text = String::new();
            while let Some(item) = body.next().await {
                let chunk = item?;
                text.push_str(&String::from_utf8_lossy(&chunk));
            }
            Ok(PageResult { head, body: text, file: None })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::mock::MockDb;
    use crate::db::DbError;
    use std::collections::HashMap;

    fn route() -> RouteConfig {
        RouteConfig {
            prefix: "/pls/app".into(),
            exclusion_list: Some(vec![]),
            ..Default::default()
        }
    }

    fn request(proc: &str, query: &str) -> GatewayRequest {
        let mut args = ArgumentSet::new();
        args.parse_urlencoded(query).unwrap();
        let meta = crate::cgi::RequestMeta {
            method: "GET".into(),
            prefix: "/pls/app".into(),
            proc_name: proc.into(),
            query_string: query.into(),
            remote_addr: Some("127.0.0.1".into()),
            remote_user: None,
        };
        let env = crate::cgi::build(&meta, &axum::http::HeaderMap::new(), &HashMap::new());
        GatewayRequest { proc_name: proc.into(), args, env, files: Vec::new() }
    }

    #[tokio::test]
    async fn renders_page_end_to_end() {
        let db = MockDb::new()
            .resolve("sample.pageindex", "web_demo.sample.pageindex")
            .signature("web_demo.sample.pageindex", &[("name", "VARCHAR2")])
            .page_text("Content-type: text/html\n\n<p>Hi Joe</p>");
        let state = RouteState::new(route(), Arc::new(db.clone())).unwrap();

        let resp = handle(&state, request("sample.pageindex", "name=Joe")).await.unwrap();
        assert_eq!(resp.status(), 200);
        let page = collect(resp).await.unwrap();
        assert_eq!(page.head.effective_content_type(), "text/html");
        assert_eq!(page.body, "<p>Hi Joe</p>");
        assert!(page.file.is_none());
        // one commit, no rollback, session back in the pool
        assert_eq!(db.commits(), 1);
        assert_eq!(db.rollbacks(), 0);
        assert_eq!(db.released(), 1);
        assert_eq!(db.cgi_inits(), 1);
    }

    #[tokio::test]
    async fn responses_are_debug_printable() {
        let db = MockDb::new()
            .resolve("app.page", "owner.app.page")
            .signature("owner.app.page", &[("x", "VARCHAR2")])
            .page_text("Content-type: text/html\n\nok");
        let state = RouteState::new(route(), Arc::new(db.clone())).unwrap();

        let resp = handle(&state, request("app.page", "x=1")).await.unwrap();
        let dump = format!("{:?}", resp);
        assert!(dump.contains("Page"));
        assert!(dump.contains("text/html"));
        collect(resp).await.unwrap();

        let download = GatewayResponse::Download(FilePayload {
            file_type: "application/pdf".into(),
            size: 3,
            blob: Bytes::from_static(b"pdf"),
        });
        assert!(format!("{:?}", download).contains("application/pdf"));
    }

    #[tokio::test]
    async fn procedure_failure_rolls_back_and_releases() {
        let db = MockDb::new()
            .resolve("app.broken", "owner.app.broken")
            .signature("owner.app.broken", &[("x", "VARCHAR2")])
            .fail_when("owner.app.broken(", DbError::Execution { code: 600, message: "ORA-00600".into() });
        let state = RouteState::new(route(), Arc::new(db.clone())).unwrap();

        let err = handle(&state, request("app.broken", "x=1")).await.unwrap_err();
        assert!(matches!(err, GatewayError::Procedure(_)));
        assert_eq!(db.commits(), 0);
        assert_eq!(db.rollbacks(), 1);
        assert_eq!(db.released(), 1);
    }

    #[tokio::test]
    async fn pool_timeout_surfaces_without_retry() {
        let db = MockDb::new().acquire_fail(DbError::Timeout(5000));
        let state = RouteState::new(route(), Arc::new(db.clone())).unwrap();
        let err = handle(&state, request("app.page", "")).await.unwrap_err();
        assert!(matches!(err, GatewayError::Pool(DbError::Timeout(_))));
        assert_eq!(err.http_status(), 503);
    }

    #[tokio::test]
    async fn download_bypasses_page_assembly() {
        let db = MockDb::new()
            .resolve("app.fetch_doc", "owner.app.fetch_doc")
            .signature("owner.app.fetch_doc", &[("id", "NUMBER")])
            .download("image/png", 4, Bytes::from_static(b"\x89PNG"));
        let state = RouteState::new(route(), Arc::new(db.clone())).unwrap();

        let resp = handle(&state, request("app.fetch_doc", "id=7")).await.unwrap();
        let page = collect(resp).await.unwrap();
        let file = page.file.expect("download payload");
        assert_eq!(file.file_type, "image/png");
        assert_eq!(file.blob, Bytes::from_static(b"\x89PNG"));
        assert!(page.body.is_empty());
        // no page fetch happened at all
        assert_eq!(db.executed_matching("owa.get_page"), 0);
        assert_eq!(db.commits(), 1);
    }

    #[tokio::test]
    async fn client_disconnect_stops_fetching_but_finalizes() {
        // enough output for several fetch windows
        let chunks: Vec<Vec<String>> = (0..4)
            .map(|_| (0..1000).map(|i| format!("row{}", i)).collect())
            .collect();
        let db = MockDb::new()
            .resolve("app.big", "owner.app.big")
            .signature("owner.app.big", &[("x", "VARCHAR2")])
            .page_chunks(chunks);
        let state = RouteState::new(route(), Arc::new(db.clone())).unwrap();

        let resp = handle(&state, request("app.big", "x=1")).await.unwrap();
        // Drop the body receiver without reading: the drain task must stop
        // issuing fetches and still finalize the transaction.
        drop(resp);
        for _ in 0..50 {
            tokio::task::yield_now().await;
            if db.commits() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(db.commits(), 1);
        assert_eq!(db.released(), 1);
        assert!(db.executed_matching("owa.get_page") < 4);
    }
}
