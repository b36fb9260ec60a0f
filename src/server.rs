//!
//! plsgate HTTP server
//! -------------------
//! Axum front end for the gateway. Each configured route mounts under its
//! prefix with two endpoints: the bare prefix (served by the route's
//! default page) and `/{proc}`. Any HTTP method is accepted; query
//! string, form fields and multipart parts all feed the argument set,
//! and multipart file parts are staged to temp files for the document
//! bridge. Handler bodies are panic-isolated so one bad request cannot
//! take the server down.

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, FromRequest, Multipart, Path, Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use base64::Engine;
use futures_util::FutureExt; // for catch_unwind on async blocks
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::args::ArgumentSet;
use crate::cgi::{self, RequestEnvironment, RequestMeta};
use crate::config::{BasicAuth, GatewayConfig};
use crate::docs::UploadedFile;
use crate::error::GatewayError;
use crate::pipeline::{self, GatewayRequest, GatewayResponse, RouteState};

/// Upper bound for buffered form bodies.
const MAX_FORM_BYTES: usize = 2 * 1024 * 1024;

/// Mount every route under its prefix.
pub fn build_router(routes: Vec<Arc<RouteState>>) -> Router {
    let mut app = Router::new().route("/", axum::routing::get(|| async { "plsgate ok" }));
    for route in routes {
        let prefix = route.config.prefix.clone();
        app = app.nest(&prefix, route_router(route));
    }
    app
}

fn route_router(state: Arc<RouteState>) -> Router {
    Router::new()
        .route("/", any(handle_index))
        .route("/{proc}", any(handle_named))
        .with_state(state)
}

/// Start serving. Connect info is threaded through so REMOTE_ADDR in the
/// CGI environment is the real peer address.
pub async fn run(cfg: GatewayConfig, routes: Vec<Arc<RouteState>>) -> anyhow::Result<()> {
    for route in &routes {
        info!(prefix = %route.config.prefix, "mounting gateway route");
    }
    let app = build_router(routes);
    let addr: SocketAddr = format!("0.0.0.0:{}", cfg.http_port).parse()?;
    info!("Starting plsgate on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}

async fn handle_index(State(state): State<Arc<RouteState>>, req: Request) -> Response {
    match state.config.default_page.clone() {
        Some(page) => serve(state, page, req).await,
        None => (StatusCode::NOT_FOUND, "no default page configured for this route").into_response(),
    }
}

async fn handle_named(
    State(state): State<Arc<RouteState>>,
    Path(proc): Path<String>,
    req: Request,
) -> Response {
    serve(state, proc, req).await
}

async fn serve(state: Arc<RouteState>, proc: String, req: Request) -> Response {
    let fut = handle_request(state, proc, req);
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(resp) => resp,
        Err(panic_payload) => {
            let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                *s
            } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                s.as_str()
            } else {
                "panic"
            };
            error!(target: "panic", "gateway handler panic: {}", msg);
            (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
        }
    }
}

async fn handle_request(state: Arc<RouteState>, proc: String, req: Request) -> Response {
    let method = req.method().clone();
    let headers = req.headers().clone();
    let query = req.uri().query().unwrap_or("").to_string();
    let remote_addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string());

    // Basic auth gates before any parsing or database work.
    let mut remote_user = None;
    if let Some(auth) = &state.config.basic_auth {
        match check_basic_auth(auth, &headers) {
            Some(user) => remote_user = Some(user),
            None => return unauthorized(&auth.realm),
        }
    }

    let mut args = ArgumentSet::new();
    if let Err(e) = args.parse_urlencoded(&query) {
        return error_response(&state, e, None);
    }

    let mut files: Vec<UploadedFile> = Vec::new();
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    if content_type.starts_with("application/x-www-form-urlencoded") {
        match axum::body::to_bytes(req.into_body(), MAX_FORM_BYTES).await {
            Ok(bytes) => {
                let raw = String::from_utf8_lossy(&bytes).into_owned();
                if let Err(e) = args.parse_urlencoded(&raw) {
                    return error_response(&state, e, None);
                }
            }
            Err(e) => {
                return error_response(
                    &state,
                    GatewayError::BadRequest(format!("unreadable form body: {}", e)),
                    None,
                )
            }
        }
    } else if content_type.starts_with("multipart/form-data") {
        let multipart = match Multipart::from_request(req, &()).await {
            Ok(m) => m,
            Err(e) => {
                return error_response(
                    &state,
                    GatewayError::BadRequest(format!("unreadable multipart body: {}", e)),
                    None,
                )
            }
        };
        if let Err(e) = read_multipart(multipart, &mut args, &mut files).await {
            cleanup_staged(&files).await;
            return error_response(&state, e, None);
        }
    }

    let meta = RequestMeta {
        method: method.to_string(),
        prefix: state.config.prefix.clone(),
        proc_name: proc.clone(),
        query_string: query,
        remote_addr,
        remote_user,
    };
    let env = cgi::build(&meta, &headers, &state.config.cgi);

    let gw_req = GatewayRequest { proc_name: proc, args, env: env.clone(), files };
    match pipeline::handle(&state, gw_req).await {
        Ok(resp) => write_response(resp),
        Err(e) => error_response(&state, e, Some(&env)),
    }
}

/// Decode multipart parts: file parts are staged to temp files for the
/// document bridge (and their filename becomes the argument value), text
/// parts go straight into the argument set.
async fn read_multipart(
    mut multipart: Multipart,
    args: &mut ArgumentSet,
    files: &mut Vec<UploadedFile>,
) -> Result<(), GatewayError> {
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(f)) => f,
            Ok(None) => return Ok(()),
            Err(e) => return Err(GatewayError::BadRequest(format!("bad multipart field: {}", e))),
        };
        let name = field.name().unwrap_or("").to_string();
        let file_name = field.file_name().map(|s| s.to_string());
        match file_name {
            Some(original_name) if !original_name.is_empty() => {
                let mime_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| GatewayError::Document(format!("upload read failed: {}", e)))?;
                let temp_path = std::env::temp_dir().join(format!("plsgate-{}", Uuid::new_v4()));
                tokio::fs::write(&temp_path, &data)
                    .await
                    .map_err(|e| GatewayError::Document(format!("upload staging failed: {}", e)))?;
                files.push(UploadedFile {
                    field_name: name.clone(),
                    original_name: original_name.clone(),
                    encoding: "binary".to_string(),
                    mime_type,
                    temp_path,
                    size: data.len() as u64,
                });
                // the procedure receives the stored document name
                args.push(name, original_name);
            }
            _ => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| GatewayError::BadRequest(format!("bad multipart field: {}", e)))?;
                args.push(name, text);
            }
        }
    }
}

async fn cleanup_staged(files: &[UploadedFile]) {
    for f in files {
        let _ = tokio::fs::remove_file(&f.temp_path).await;
    }
}

/// Verify an `Authorization: Basic` header against the route policy.
/// Returns the authenticated username. The configured password may be a
/// plain string or an Argon2 PHC hash.
fn check_basic_auth(auth: &BasicAuth, headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    if user != auth.username {
        return None;
    }
    let ok = if auth.password.starts_with("$argon2") {
        use argon2::{Argon2, PasswordVerifier};
        match password_hash::PasswordHash::new(&auth.password) {
            Ok(parsed) => Argon2::default().verify_password(pass.as_bytes(), &parsed).is_ok(),
            Err(_) => false,
        }
    } else {
        pass == auth.password
    };
    if ok {
        Some(user.to_string())
    } else {
        None
    }
}

fn unauthorized(realm: &str) -> Response {
    let challenge = format!("Basic realm=\"{}\"", realm);
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, challenge)],
        "unauthorized",
    )
        .into_response()
}

fn error_response(
    state: &RouteState,
    err: GatewayError,
    env: Option<&RequestEnvironment>,
) -> Response {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let html = err.render(state.config.error_style, env);
    (status, [(header::CONTENT_TYPE, "text/html")], html).into_response()
}

/// Translate a pipeline response into HTTP. Rendered pages stream their
/// body; downloads go out as one binary buffer with the reported type.
fn write_response(resp: GatewayResponse) -> Response {
    match resp {
        GatewayResponse::Download(file) => {
            let mut builder = Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_LENGTH, file.blob.len().to_string());
            builder = match HeaderValue::from_str(&file.file_type) {
                Ok(v) => builder.header(header::CONTENT_TYPE, v),
                Err(_) => builder.header(header::CONTENT_TYPE, "application/octet-stream"),
            };
            builder
                .body(Body::from(file.blob))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        GatewayResponse::Page { head, body } => {
            let status = StatusCode::from_u16(head.effective_status()).unwrap_or(StatusCode::OK);
            let mut builder = Response::builder()
                .status(status)
                .header(header::CONTENT_TYPE, head.effective_content_type());
            for cookie in &head.cookies {
                if let Ok(v) = HeaderValue::from_str(cookie) {
                    builder = builder.header(header::SET_COOKIE, v);
                } else {
                    warn!(cookie = %cookie, "dropping unrepresentable Set-Cookie value");
                }
            }
            if let Some(location) = &head.redirect_location {
                if let Ok(v) = HeaderValue::from_str(location) {
                    builder = builder.header(header::LOCATION, v);
                }
            }
            if let Some(len) = head.content_length {
                builder = builder.header(header::CONTENT_LENGTH, len.to_string());
            }
            for (name, value) in &head.other {
                match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
                    (Ok(n), Ok(v)) => builder = builder.header(n, v),
                    _ => warn!(header = %name, "dropping unrepresentable response header"),
                }
            }
            builder
                .body(Body::from_stream(body))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageHead;
    use futures_channel::mpsc;
    use futures_util::SinkExt;

    #[test]
    fn basic_auth_accepts_plain_password() {
        let auth = BasicAuth {
            realm: "plsgate".into(),
            username: "admin".into(),
            password: "secret".into(),
        };
        let mut headers = HeaderMap::new();
        let token = base64::engine::general_purpose::STANDARD.encode("admin:secret");
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {}", token)).unwrap(),
        );
        assert_eq!(check_basic_auth(&auth, &headers), Some("admin".to_string()));

        let bad = base64::engine::general_purpose::STANDARD.encode("admin:wrong");
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {}", bad)).unwrap(),
        );
        assert_eq!(check_basic_auth(&auth, &headers), None);
    }

    #[test]
    fn basic_auth_verifies_phc_hashes() {
        use argon2::{Argon2, PasswordHasher};
        use password_hash::SaltString;

        let salt = SaltString::encode_b64(b"plsgate-salt-16b").unwrap();
        let phc = Argon2::default()
            .hash_password(b"secret", &salt)
            .unwrap()
            .to_string();
        let auth = BasicAuth { realm: "plsgate".into(), username: "admin".into(), password: phc };
        let mut headers = HeaderMap::new();
        let token = base64::engine::general_purpose::STANDARD.encode("admin:secret");
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {}", token)).unwrap(),
        );
        assert_eq!(check_basic_auth(&auth, &headers), Some("admin".to_string()));
    }

    #[test]
    fn missing_header_fails_auth() {
        let auth = BasicAuth {
            realm: "plsgate".into(),
            username: "admin".into(),
            password: "secret".into(),
        };
        assert_eq!(check_basic_auth(&auth, &HeaderMap::new()), None);
    }

    #[tokio::test]
    async fn page_response_carries_headers_cookies_and_status() {
        let head = PageHead {
            cookies: vec!["a=1".into(), "b=2".into()],
            content_type: Some("text/plain".into()),
            status_code: Some(404),
            status_reason: Some("Not Found".into()),
            other: vec![("X-Frame-Options".into(), "DENY".into())],
            ..Default::default()
        };
        let (mut tx, rx) = mpsc::channel::<Result<bytes::Bytes, GatewayError>>(2);
        tx.send(Ok(bytes::Bytes::from_static(b"missing"))).await.unwrap();
        drop(tx);

        let resp = write_response(GatewayResponse::Page { head, body: rx });
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(resp.headers().get(header::CONTENT_TYPE).unwrap(), "text/plain");
        let cookies: Vec<_> = resp.headers().get_all(header::SET_COOKIE).iter().collect();
        assert_eq!(cookies.len(), 2);
        assert_eq!(resp.headers().get("X-Frame-Options").unwrap(), "DENY");
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"missing");
    }

    #[tokio::test]
    async fn download_response_is_binary_passthrough() {
        let file = crate::page::FilePayload {
            file_type: "application/pdf".into(),
            size: 3,
            blob: bytes::Bytes::from_static(b"pdf"),
        };
        let resp = write_response(GatewayResponse::Download(file));
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get(header::CONTENT_TYPE).unwrap(), "application/pdf");
        assert_eq!(resp.headers().get(header::CONTENT_LENGTH).unwrap(), "3");
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"pdf");
    }

    #[test]
    fn unauthorized_carries_challenge() {
        let resp = unauthorized("gateway");
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            resp.headers().get(header::WWW_AUTHENTICATE).unwrap(),
            "Basic realm=\"gateway\""
        );
    }
}
