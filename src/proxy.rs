use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Context;
use futures::FutureExt;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::header;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::error::ServeError;
use crate::supervisor::Supervisor;
use crate::templates;

/// Host-based dispatch in front of the per-host supervisors, plus the
/// code viewer on a second, ephemeral port.
pub struct Proxy {
    port: u16,
    servers: Arc<HashMap<String, Arc<Supervisor>>>,
    default_server: Option<Arc<Supervisor>>,
}

struct ProxyContext {
    servers: Arc<HashMap<String, Arc<Supervisor>>>,
    default_server: Option<Arc<Supervisor>>,
    viewer_port: u16,
}

impl Proxy {
    pub fn new(
        port: u16,
        servers: Arc<HashMap<String, Arc<Supervisor>>>,
        default_server: Option<Arc<Supervisor>>,
    ) -> Self {
        Self {
            port,
            servers,
            default_server,
        }
    }

    pub async fn run(self, shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .await
            .with_context(|| format!("unable to bind proxy port {}", self.port))?;

        let viewer_listener = TcpListener::bind(("0.0.0.0", 0))
            .await
            .context("unable to bind code viewer port")?;
        let viewer_port = viewer_listener.local_addr()?.port();
        info!(port = self.port, viewer_port, "proxy listening");

        let context = Arc::new(ProxyContext {
            servers: Arc::clone(&self.servers),
            default_server: self.default_server.clone(),
            viewer_port,
        });

        {
            let servers = Arc::clone(&self.servers);
            let shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                run_viewer(viewer_listener, servers, shutdown).await;
            });
        }

        let mut shutdown_rx = shutdown_rx;
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = Arc::clone(&context);
                            tokio::spawn(async move {
                                if let Err(err) = handle_connection(stream, addr, context).await {
                                    debug!(addr = %addr, error = %err, "connection error");
                                }
                            });
                        }
                        Err(err) => error!(error = %err, "failed to accept connection"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("proxy shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    addr: SocketAddr,
    context: Arc<ProxyContext>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let context = Arc::clone(&context);
        async move { handle_request(req, context, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|err| anyhow::anyhow!("connection error: {err}"))?;
    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    context: Arc<ProxyContext>,
    client: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let host = request_host(&req);

    let srv = match context
        .servers
        .get(&host)
        .or(context.default_server.as_ref())
    {
        Some(srv) => Arc::clone(srv),
        None => {
            return Ok(templates::plain_response(
                StatusCode::NOT_FOUND,
                format!("Host not found {host:?}"),
            ));
        }
    };

    debug!(host = %host, method = %req.method(), uri = %req.uri(), "incoming request");

    let is_websocket = is_websocket_upgrade(&req);

    match AssertUnwindSafe(srv.serve(req, client.ip())).catch_unwind().await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(err)) => {
            // A failed WebSocket upgrade gets a minimal error response;
            // the HTML template is for pages a browser will render.
            if is_websocket {
                return Ok(templates::plain_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    err.message().to_string(),
                ));
            }
            Ok(render_error(&srv, &err, context.viewer_port))
        }
        Err(panic) => {
            let message = panic_message(panic);
            error!(host = %host, "panic while serving request: {message}");
            let err = ServeError::Runtime(message);
            Ok(render_error(&srv, &err, context.viewer_port))
        }
    }
}

/// True for any WebSocket upgrade request, live-reload included (the
/// reload socket is answered before errors surface, so an error here
/// can only belong to a bridged upgrade).
fn is_websocket_upgrade(req: &Request<Incoming>) -> bool {
    req.headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

fn render_error(
    srv: &Arc<Supervisor>,
    err: &ServeError,
    viewer_port: u16,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let viewer_authority = format!("{}:{}", srv.host(), viewer_port);
    let nodes = templates::parse_error_nodes(err.message(), &srv.src_dirs(), &viewer_authority);
    templates::error_response(err, &nodes, srv.proxy_port())
}

/// The bare host of a request: Host header first, URI authority as a
/// fallback, port stripped.
fn request_host(req: &Request<Incoming>) -> String {
    req.headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().host())
        .map(|h| h.split(':').next().unwrap_or(h).to_string())
        .unwrap_or_default()
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown error".to_string()
    }
}

/// The code viewer: serves `/{path}:{line}` as escaped, line-numbered
/// source resolved against the owning supervisor's source directories.
async fn run_viewer(
    listener: TcpListener,
    servers: Arc<HashMap<String, Arc<Supervisor>>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                let Ok((stream, _)) = result else { continue };
                let servers = Arc::clone(&servers);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req: Request<Incoming>| {
                        let servers = Arc::clone(&servers);
                        async move { viewer_request(req, servers) }
                    });
                    let _ = AutoBuilder::new(TokioExecutor::new())
                        .serve_connection(io, service)
                        .await;
                });
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
        }
    }
}

fn viewer_request(
    req: Request<Incoming>,
    servers: Arc<HashMap<String, Arc<Supervisor>>>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let path = req.uri().path();
    if path.len() <= 1 {
        return Ok(templates::plain_response(
            StatusCode::NOT_FOUND,
            "not found".to_string(),
        ));
    }

    let host = request_host(&req);
    let Some(srv) = servers.get(&host) else {
        return Ok(templates::plain_response(
            StatusCode::NOT_FOUND,
            format!("Server not found: {host}"),
        ));
    };

    let (file, line) = split_path_line(&path[1..]);

    for dir in srv.src_dirs() {
        let candidate = dir.join(file);
        if let Ok(source) = std::fs::read_to_string(&candidate) {
            let page = templates::code_page(&format!("Source: {file}"), &source, line);
            return Ok(Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
                .header("X-Content-Type-Options", "nosniff")
                .body(
                    http_body_util::Full::new(Bytes::from(page))
                        .map_err(|never| match never {})
                        .boxed(),
                )
                .expect("valid response builder"));
        }
    }

    Ok(templates::plain_response(
        StatusCode::NOT_FOUND,
        format!("File not found: {file}"),
    ))
}

/// Split a trailing `:{line}` off a viewer path.
fn split_path_line(path: &str) -> (&str, u64) {
    match path.rsplit_once(':') {
        Some((file, line)) => match line.parse() {
            Ok(line) => (file, line),
            Err(_) => (path, 0),
        },
        None => (path, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_path_line() {
        assert_eq!(split_path_line("app/main.go:42"), ("app/main.go", 42));
        assert_eq!(split_path_line("app/main.go"), ("app/main.go", 0));
        assert_eq!(split_path_line("odd:name"), ("odd:name", 0));
    }

    #[test]
    fn test_panic_message_variants() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new("boom".to_string())), "boom");
        assert_eq!(panic_message(Box::new(42u32)), "unknown error");
    }
}
