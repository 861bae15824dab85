//! Accept loop and access control shared by the proxy and status listeners

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Version};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::gate::{resolve_identity, AccessPolicy, Decision, IdentityFallback, IdentityGate};
use crate::overlay::OverlaySession;

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub const FORBIDDEN_MESSAGE: &str = "Forbidden: Access restricted to owner only";

/// Settings shared by every listener in a generation
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    pub policy: AccessPolicy,
    pub fallback: IdentityFallback,
    /// How long in-flight connections get to finish after cancellation
    pub grace_period: Duration,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            policy: AccessPolicy::SelfOnly,
            fallback: IdentityFallback::RemoteAddr,
            grace_period: Duration::from_secs(5),
        }
    }
}

/// Method, path and version of a request, kept for log lines
#[derive(Debug, Clone)]
pub struct RequestLine {
    method: Method,
    path: String,
    version: Version,
}

impl RequestLine {
    pub fn of<B>(req: &Request<B>) -> Self {
        Self {
            method: req.method().clone(),
            path: req.uri().path().to_string(),
            version: req.version(),
        }
    }
}

impl fmt::Display for RequestLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {:?}", self.method, self.path, self.version)
    }
}

/// Identity check in front of one listener
#[derive(Clone)]
pub struct Gatekeeper {
    port: u16,
    session: Arc<dyn OverlaySession>,
    gate: Arc<IdentityGate>,
    fallback: IdentityFallback,
}

impl Gatekeeper {
    pub fn new(port: u16, session: Arc<dyn OverlaySession>, options: &ListenerOptions) -> Self {
        Self {
            port,
            session,
            gate: Arc::new(IdentityGate::new(options.policy)),
            fallback: options.fallback,
        }
    }

    /// Decide whether a request may proceed. On success returns the caller's
    /// identity; on refusal returns the 403 to send back.
    pub async fn admit(
        &self,
        line: &RequestLine,
        peer: SocketAddr,
    ) -> Result<String, Response<ProxyBody>> {
        let Some(identity) = resolve_identity(self.session.as_ref(), peer, self.fallback).await
        else {
            warn!(
                "[Port {}] DENIED {} (from {}, identity unknown)",
                self.port, line, peer
            );
            return Err(text_response(StatusCode::FORBIDDEN, FORBIDDEN_MESSAGE));
        };

        match self.gate.evaluate(&identity) {
            Decision::Latched => {
                info!("[Port {}] Restricting access to: {}", self.port, identity);
            }
            Decision::Allowed => {}
            Decision::Denied { expected } => {
                warn!(
                    "[Port {}] DENIED {} (from {}, expected {})",
                    self.port, line, identity, expected
                );
                return Err(text_response(StatusCode::FORBIDDEN, FORBIDDEN_MESSAGE));
            }
        }

        info!("[Port {}] {} (from {})", self.port, line, identity);
        Ok(identity)
    }
}

/// Accept connections until `cancel` fires, then drain.
///
/// Each connection is served on its own task. After cancellation no new
/// connections are accepted, open ones are asked to finish their current
/// request, and anything still running after `grace_period` is aborted.
pub async fn serve_connections<H, Fut>(
    listener: TcpListener,
    port: u16,
    cancel: CancellationToken,
    grace_period: Duration,
    handler: H,
) where
    H: Fn(Request<Incoming>, SocketAddr) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<ProxyBody>> + Send + 'static,
{
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        debug!("[Port {}] accept error: {}", port, e);
                        continue;
                    }
                };

                let handler = handler.clone();
                let cancel = cancel.clone();
                connections.spawn(async move {
                    let service = service_fn(move |req| {
                        let handler = handler.clone();
                        async move { Ok::<_, Infallible>(handler(req, peer).await) }
                    });

                    let conn = http1::Builder::new()
                        .preserve_header_case(true)
                        .title_case_headers(false)
                        .serve_connection(TokioIo::new(stream), service)
                        .with_upgrades();
                    tokio::pin!(conn);

                    let result = tokio::select! {
                        res = conn.as_mut() => res,
                        _ = cancel.cancelled() => {
                            conn.as_mut().graceful_shutdown();
                            conn.await
                        }
                    };
                    if let Err(e) = result {
                        debug!("[Port {}] connection error from {}: {}", port, peer, e);
                    }
                });
            }
        }
    }

    drop(listener);

    if !connections.is_empty() {
        debug!(
            "[Port {}] waiting up to {:?} for {} connection(s)",
            port,
            grace_period,
            connections.len()
        );
        let drained = tokio::time::timeout(grace_period, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "[Port {}] abandoning {} connection(s) after grace period",
                port,
                connections.len()
            );
            connections.abort_all();
        }
    }
}

/// Create text response
pub fn text_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Create full body
pub fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_response() {
        let response = text_response(StatusCode::FORBIDDEN, FORBIDDEN_MESSAGE);
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            response.headers()[hyper::header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
    }

    #[test]
    fn test_request_line_display() {
        let req = Request::post("http://devbox:8000/api/items?page=2")
            .body(())
            .unwrap();
        assert_eq!(RequestLine::of(&req).to_string(), "POST /api/items HTTP/1.1");
    }

    #[test]
    fn test_default_options() {
        let options = ListenerOptions::default();
        assert_eq!(options.policy, AccessPolicy::SelfOnly);
        assert_eq!(options.fallback, IdentityFallback::RemoteAddr);
        assert_eq!(options.grace_period, Duration::from_secs(5));
    }
}
