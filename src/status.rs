//! Status page listener
//!
//! Serves an HTML table of the host's listening ports on a fixed port inside
//! the overlay, behind the same identity gate as the proxied ports.

use bytes::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Method, Response, StatusCode};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::listener::{
    full_body, serve_connections, text_response, Gatekeeper, ListenerOptions, ProxyBody,
    RequestLine,
};
use crate::overlay::OverlaySession;
use crate::procinfo::{ListeningPort, ProcessTable};

pub const DEFAULT_STATUS_PORT: u16 = 80;

/// Upper bound on how long a page waits for process introspection
pub const DEFAULT_INTROSPECTION_TIMEOUT: Duration = Duration::from_secs(2);

/// Node naming used to build links on the page
#[derive(Debug, Clone)]
pub struct NodeName {
    pub hostname: String,
    pub dns_suffix: Option<String>,
}

impl NodeName {
    /// Fully qualified name when a suffix is known, bare hostname otherwise
    pub fn display_host(&self) -> String {
        match self.dns_suffix.as_deref().filter(|s| !s.is_empty()) {
            Some(suffix) => format!("{}.{}", self.hostname, suffix.trim_matches('.')),
            None => self.hostname.clone(),
        }
    }
}

pub struct StatusListener {
    port: u16,
    node: NodeName,
    session: Arc<dyn OverlaySession>,
    gatekeeper: Gatekeeper,
    table: Arc<dyn ProcessTable>,
    introspection_timeout: Duration,
    grace_period: Duration,
}

impl StatusListener {
    pub fn new(
        port: u16,
        node: NodeName,
        session: Arc<dyn OverlaySession>,
        table: Arc<dyn ProcessTable>,
        options: &ListenerOptions,
    ) -> Self {
        Self {
            port,
            node,
            gatekeeper: Gatekeeper::new(port, session.clone(), options),
            session,
            table,
            introspection_timeout: DEFAULT_INTROSPECTION_TIMEOUT,
            grace_period: options.grace_period,
        }
    }

    pub async fn serve(self, cancel: CancellationToken) -> Result<()> {
        let listener = self
            .session
            .listen(self.port)
            .await
            .map_err(|source| Error::Listen {
                port: self.port,
                source,
            })?;

        info!("Serving status page on port {}", self.port);

        let gatekeeper = self.gatekeeper;
        let node = Arc::new(self.node);
        let table = self.table;
        let timeout = self.introspection_timeout;
        serve_connections(listener, self.port, cancel, self.grace_period, move |req, peer| {
            let gatekeeper = gatekeeper.clone();
            let node = node.clone();
            let table = table.clone();
            async move {
                let line = RequestLine::of(&req);
                let method = req.method().clone();
                if let Err(denied) = gatekeeper.admit(&line, peer).await {
                    return denied;
                }
                status_page(&method, &node, table, timeout).await
            }
        })
        .await;

        debug!("Status listener on port {} stopped", self.port);
        Ok(())
    }
}

async fn status_page(
    method: &Method,
    node: &NodeName,
    table: Arc<dyn ProcessTable>,
    timeout: Duration,
) -> Response<ProxyBody> {
    if method != Method::GET && method != Method::HEAD {
        let mut response = text_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
        response
            .headers_mut()
            .insert(hyper::header::ALLOW, HeaderValue::from_static("GET, HEAD"));
        return response;
    }

    let scan = tokio::task::spawn_blocking(move || table.listening_ports());
    let (ports, notice) = match tokio::time::timeout(timeout, scan).await {
        Ok(Ok(Ok(ports))) => (ports, None),
        Ok(Ok(Err(e))) => {
            warn!("Error getting listening ports: {}", e);
            (Vec::new(), Some(format!("Error getting listening ports: {}", e)))
        }
        Ok(Err(e)) => {
            warn!("Port scan task failed: {}", e);
            (Vec::new(), Some("Port scan failed".to_string()))
        }
        Err(_) => {
            warn!("Port scan exceeded {:?}", timeout);
            (Vec::new(), Some("Port scan timed out".to_string()))
        }
    };

    let html = render_page(node, &ports, notice.as_deref());
    let mut response = Response::new(full_body(Bytes::from(html)));
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    response
}

/// Render the port table. Every interpolated value is escaped.
pub fn render_page(node: &NodeName, ports: &[ListeningPort], notice: Option<&str>) -> String {
    let host = escape_html(&node.display_host());
    let title = escape_html(&node.hostname);

    let mut html = String::new();
    let _ = write!(
        html,
        "<html><head><title>{} - Listening Ports</title></head><body>",
        title
    );
    let _ = write!(html, "<h1>{}</h1>", title);
    html.push_str("<h2>Listening Ports</h2>");
    if let Some(notice) = notice {
        let _ = write!(html, "<p><em>{}</em></p>", escape_html(notice));
    }
    html.push_str("<table border='1' cellpadding='5' cellspacing='0'>");
    html.push_str("<tr><th>Port</th><th>Process</th><th>PID</th><th>Command</th></tr>");
    for p in ports {
        let _ = write!(
            html,
            "<tr><td><a href='http://{}:{}/' target='_blank'>{}</a></td>\
             <td>{}</td><td>{}</td><td>{}</td></tr>",
            host,
            p.port,
            p.port,
            escape_html(&p.process),
            escape_html(&p.pid),
            escape_html(&p.command)
        );
    }
    html.push_str("</table></body></html>");
    html
}

/// Escape text for use in HTML element content and single- or double-quoted attributes
pub fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c if c.is_control() && c != '\t' => out.push('\u{FFFD}'),
            c => out.push(c),
        }
    }
    out
}
