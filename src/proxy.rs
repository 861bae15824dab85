//! Per-port reverse proxy
//!
//! A [`ProxyListener`] owns one overlay listener and forwards every admitted
//! request to the local HTTP server on the matching port. Bodies are streamed
//! in both directions; protocol upgrades (WebSocket and friends) are spliced
//! once both sides have switched protocols. Spliced streams belong to the
//! listener: they get the same grace period as ordinary connections once the
//! generation is cancelled, and the listener does not return until they end.

use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST, UPGRADE};
use http_body_util::BodyExt;
use hyper::{Request, Response, StatusCode, Version};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::listener::{
    serve_connections, text_response, Gatekeeper, ListenerOptions, ProxyBody, RequestLine,
};
use crate::overlay::OverlaySession;

/// Host every target lives on
const TARGET_HOST: &str = "localhost";

/// Upper bound for reaching the local target
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Headers that only make sense for a single hop
const HOP_HEADERS: [&str; 8] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
];

/// Upgraded streams of one listener, bound to its generation
#[derive(Clone)]
struct UpgradeScope {
    tracker: TaskTracker,
    cancel: CancellationToken,
    grace_period: Duration,
}

impl UpgradeScope {
    fn spawn_splice(
        &self,
        client: hyper::upgrade::OnUpgrade,
        target: hyper::upgrade::OnUpgrade,
        port: u16,
    ) {
        let cancel = self.cancel.clone();
        let grace_period = self.grace_period;
        self.tracker.spawn(async move {
            let cutoff = async {
                cancel.cancelled().await;
                tokio::time::sleep(grace_period).await;
            };
            tokio::select! {
                _ = splice_upgraded(client, target, port) => {}
                _ = cutoff => {
                    debug!("[Port {}] closing upgraded stream after grace period", port);
                }
            }
        });
    }
}

/// One exposed port
pub struct ProxyListener {
    port: u16,
    session: Arc<dyn OverlaySession>,
    gatekeeper: Gatekeeper,
    grace_period: Duration,
}

impl ProxyListener {
    /// Expose local `port` on the same port inside the overlay
    pub fn new(port: u16, session: Arc<dyn OverlaySession>, options: &ListenerOptions) -> Self {
        Self {
            port,
            gatekeeper: Gatekeeper::new(port, session.clone(), options),
            session,
            grace_period: options.grace_period,
        }
    }

    /// Bind and serve until `cancel` fires.
    ///
    /// A bind failure ends only this listener.
    pub async fn serve(self, cancel: CancellationToken) -> Result<()> {
        let listener = self
            .session
            .listen(self.port)
            .await
            .map_err(|source| Error::Listen {
                port: self.port,
                source,
            })?;

        info!(
            "Serving port {} on overlay network, proxying to {}:{}",
            self.port, TARGET_HOST, self.port
        );

        let upgrades = UpgradeScope {
            tracker: TaskTracker::new(),
            cancel: cancel.clone(),
            grace_period: self.grace_period,
        };
        let gatekeeper = self.gatekeeper;
        let target_port = self.port;
        let scope = upgrades.clone();
        serve_connections(listener, self.port, cancel, self.grace_period, move |req, peer| {
            let gatekeeper = gatekeeper.clone();
            let scope = scope.clone();
            async move {
                let line = RequestLine::of(&req);
                match gatekeeper.admit(&line, peer).await {
                    Ok(_) => forward(req, peer, target_port, &scope).await,
                    Err(denied) => denied,
                }
            }
        })
        .await;

        upgrades.tracker.close();
        if !upgrades.tracker.is_empty() {
            debug!(
                "[Port {}] waiting for {} upgraded stream(s)",
                self.port,
                upgrades.tracker.len()
            );
        }
        upgrades.tracker.wait().await;

        debug!("Listener on port {} stopped", self.port);
        Ok(())
    }
}

/// Forward one request to the local target, converting failures to 502
async fn forward(
    req: Request<Incoming>,
    peer: SocketAddr,
    target_port: u16,
    upgrades: &UpgradeScope,
) -> Response<ProxyBody> {
    match proxy_request(req, peer, target_port, upgrades).await {
        Ok(response) => response,
        Err(e) => {
            error!("{}", e);
            text_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
        }
    }
}

async fn proxy_request(
    mut req: Request<Incoming>,
    peer: SocketAddr,
    target_port: u16,
    upgrades: &UpgradeScope,
) -> Result<Response<ProxyBody>> {
    let forward_err = |reason: String| Error::Forward {
        port: target_port,
        reason,
    };

    let upgrade = upgrade_protocol(req.headers());
    let client_upgrade = upgrade.as_ref().map(|_| hyper::upgrade::on(&mut req));

    let connect = TcpStream::connect((TARGET_HOST, target_port));
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, connect)
        .await
        .map_err(|_| forward_err("connect timed out".to_string()))?
        .map_err(|e| forward_err(e.to_string()))?;

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| forward_err(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!("Target connection error: {}", e);
        }
    });

    prepare_outbound(&mut req, peer, target_port, upgrade.as_ref());

    let mut response = sender
        .send_request(req)
        .await
        .map_err(|e| forward_err(e.to_string()))?;

    strip_hop_headers(response.headers_mut());

    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        let (Some(client_upgrade), Some(protocol)) = (client_upgrade, upgrade) else {
            return Err(forward_err(
                "target switched protocols without an upgrade request".to_string(),
            ));
        };
        let target_upgrade = hyper::upgrade::on(&mut response);
        upgrades.spawn_splice(client_upgrade, target_upgrade, target_port);
        response
            .headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("upgrade"));
        response.headers_mut().insert(UPGRADE, protocol);
    }

    Ok(response.map(|body| body.boxed()))
}

/// Rewrite an inbound request in place so it can be sent to the target.
///
/// A request without `Host` (HTTP/1.0) gets the target's authority.
fn prepare_outbound<B>(
    req: &mut Request<B>,
    peer: SocketAddr,
    target_port: u16,
    upgrade: Option<&HeaderValue>,
) {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    if let Ok(uri) = path_and_query.parse() {
        *req.uri_mut() = uri;
    }
    *req.version_mut() = Version::HTTP_11;

    let original_host = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.to_string());

    let headers = req.headers_mut();
    strip_hop_headers(headers);

    if let Some(protocol) = upgrade {
        headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
        headers.insert(UPGRADE, protocol.clone());
    }

    let forwarded_for = match headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        Some(prior) => format!("{}, {}", prior, peer.ip()),
        None => peer.ip().to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert("x-forwarded-for", value);
    }
    match original_host.and_then(|h| HeaderValue::from_str(&h).ok()) {
        Some(host) => {
            headers.insert("x-forwarded-host", host);
        }
        None => {
            let authority = format!("{}:{}", TARGET_HOST, target_port);
            if let Ok(host) = HeaderValue::from_str(&authority) {
                headers.insert(HOST, host);
            }
        }
    }
    headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));
}

/// Protocol requested via `Connection: upgrade`, if any
fn upgrade_protocol(headers: &HeaderMap) -> Option<HeaderValue> {
    let wants_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    if wants_upgrade {
        headers.get(UPGRADE).cloned()
    } else {
        None
    }
}

/// Remove hop-by-hop headers, including any named by `Connection`
fn strip_hop_headers(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_HEADERS {
        headers.remove(name);
    }
    headers.remove(UPGRADE);
}

async fn splice_upgraded(
    client: hyper::upgrade::OnUpgrade,
    target: hyper::upgrade::OnUpgrade,
    port: u16,
) {
    let (client, target) = match tokio::try_join!(client, target) {
        Ok(pair) => pair,
        Err(e) => {
            debug!("[Port {}] upgrade failed: {}", port, e);
            return;
        }
    };

    let mut client = TokioIo::new(client);
    let mut target = TokioIo::new(target);
    match tokio::io::copy_bidirectional(&mut client, &mut target).await {
        Ok((up, down)) => debug!(
            "[Port {}] upgraded stream closed ({} up, {} down)",
            port, up, down
        ),
        Err(e) => debug!("[Port {}] upgraded stream error: {}", port, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(headers: &[(&str, &str)]) -> Request<()> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("http://devbox:8000/api/items?page=2")
            .version(Version::HTTP_10);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap()
    }

    fn peer() -> SocketAddr {
        "100.64.0.7:51234".parse().unwrap()
    }

    #[test]
    fn test_prepare_outbound_rewrites_uri_and_headers() {
        let mut req = request(&[
            ("host", "devbox:8000"),
            ("connection", "keep-alive, x-trace"),
            ("keep-alive", "timeout=5"),
            ("x-trace", "1"),
            ("content-type", "application/json"),
        ]);

        prepare_outbound(&mut req, peer(), 8000, None);

        assert_eq!(req.uri().to_string(), "/api/items?page=2");
        assert_eq!(req.version(), Version::HTTP_11);
        let headers = req.headers();
        assert_eq!(headers[HOST], "devbox:8000");
        assert_eq!(headers["content-type"], "application/json");
        assert_eq!(headers["x-forwarded-for"], "100.64.0.7");
        assert_eq!(headers["x-forwarded-host"], "devbox:8000");
        assert_eq!(headers["x-forwarded-proto"], "http");
        assert!(headers.get(CONNECTION).is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get("x-trace").is_none());
    }

    #[test]
    fn test_prepare_outbound_appends_forwarded_for() {
        let mut req = request(&[("x-forwarded-for", "10.0.0.1")]);
        prepare_outbound(&mut req, peer(), 8000, None);
        assert_eq!(req.headers()["x-forwarded-for"], "10.0.0.1, 100.64.0.7");
    }

    #[test]
    fn test_prepare_outbound_keeps_upgrade() {
        let mut req = request(&[("connection", "Upgrade"), ("upgrade", "websocket")]);
        let protocol = upgrade_protocol(req.headers());
        assert_eq!(protocol.as_ref().unwrap(), "websocket");

        prepare_outbound(&mut req, peer(), 8000, protocol.as_ref());
        assert_eq!(req.headers()[CONNECTION], "upgrade");
        assert_eq!(req.headers()[UPGRADE], "websocket");
    }

    #[test]
    fn test_prepare_outbound_fills_missing_host() {
        let mut req = request(&[]);
        prepare_outbound(&mut req, peer(), 8000, None);
        assert_eq!(req.headers()[HOST], "localhost:8000");
        assert!(req.headers().get("x-forwarded-host").is_none());
    }

    #[test]
    fn test_upgrade_requires_connection_token() {
        let req = request(&[("upgrade", "websocket")]);
        assert!(upgrade_protocol(req.headers()).is_none());
    }
}
