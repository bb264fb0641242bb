use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use serde_json::Value;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::error::TunnelError;
use crate::protocol::{ForwardedRequest, ForwardedResponse, Headers, RequestId};

/// Abort a forward that has not completed after this long.
pub const FORWARD_TIMEOUT: Duration = Duration::from_secs(25);

/// Headers meaningful only for a single transport leg, stripped before
/// re-issuing the request locally. Matched case-insensitively.
const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "proxy-connection",
    "te",
    "trailers",
];

/// Shared HTTP client for connection pooling and reuse
static HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

/// Get or create the shared HTTP client
fn get_client() -> &'static Client {
    HTTP_CLIENT.get_or_init(|| {
        Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(10)
            .build()
            .expect("failed to create HTTP client")
    })
}

/// The local service requests are forwarded to.
///
/// Whether the leg is encrypted is decided by an explicit scheme on the
/// configured host: `https://host` forwards over TLS, `http://host` or a
/// bare host over plain HTTP.
#[derive(Debug, Clone)]
pub struct LocalTarget {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl LocalTarget {
    pub fn parse(local_host: &str, port: u16) -> Result<Self, TunnelError> {
        if port == 0 {
            return Err(TunnelError::InvalidTarget(
                "port must be a positive integer".to_string(),
            ));
        }

        if !local_host.contains("://") {
            return Ok(Self {
                host: local_host.to_string(),
                port,
                tls: false,
            });
        }

        let parsed = Url::parse(local_host)
            .map_err(|e| TunnelError::InvalidTarget(format!("{local_host}: {e}")))?;
        let tls = match parsed.scheme() {
            "https" => true,
            "http" => false,
            other => {
                return Err(TunnelError::InvalidTarget(format!(
                    "unsupported scheme {other:?} for {local_host}"
                )))
            }
        };
        let host = parsed
            .host_str()
            .ok_or_else(|| TunnelError::InvalidTarget(format!("{local_host}: missing host")))?
            .to_string();

        Ok(Self { host, port, tls })
    }

    /// `host:port`, as used for the outbound `host` header and error bodies.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn url_for(&self, path: &str) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://{}{}", scheme, self.authority(), path)
    }
}

/// Forward one request to the local service.
///
/// Never fails: every failure mode is encoded as a response carrying the
/// request's own id, so the relay always gets an answer it can correlate.
pub async fn forward(target: &LocalTarget, request: &ForwardedRequest) -> ForwardedResponse {
    forward_with_timeout(target, request, FORWARD_TIMEOUT).await
}

pub(crate) async fn forward_with_timeout(
    target: &LocalTarget,
    request: &ForwardedRequest,
    deadline: Duration,
) -> ForwardedResponse {
    match tokio::time::timeout(deadline, call_local(target, request)).await {
        Ok(response) => response,
        Err(_) => {
            warn!(
                "{} {} -> timed out after {:?}",
                request.method, request.path, deadline
            );
            error_response(
                request.request_id.clone(),
                504,
                "gateway_timeout",
                format!(
                    "local service did not respond within {} seconds",
                    deadline.as_secs()
                ),
            )
        }
    }
}

async fn call_local(target: &LocalTarget, request: &ForwardedRequest) -> ForwardedResponse {
    let request_id = request.request_id.clone();

    let method = match reqwest::Method::from_str(&request.method) {
        Ok(method) => method,
        Err(_) => {
            return error_response(
                request_id,
                502,
                "bad_gateway",
                format!("unsupported method {:?}", request.method),
            )
        }
    };

    let url = target.url_for(&request.path);
    let headers = outbound_headers(&request.headers, target, request.body.len());

    let response = get_client()
        .request(method, &url)
        .headers(headers)
        .body(request.body.clone())
        .send()
        .await;

    let response = match response {
        Ok(response) => response,
        Err(e) => {
            warn!("{} {} -> unreachable: {}", request.method, request.path, e);
            return error_response(
                request_id,
                502,
                "bad_gateway",
                format!("could not reach local service at {}", target.authority()),
            );
        }
    };

    let status = response.status().as_u16();
    let headers = inbound_headers(response.headers());

    match response.bytes().await {
        Ok(body) => {
            debug!(
                "{} {} -> {} {} bytes",
                request.method,
                request.path,
                status,
                body.len()
            );
            ForwardedResponse {
                request_id,
                status,
                headers,
                body: body.to_vec(),
            }
        }
        Err(e) => {
            warn!(
                "{} {} -> error reading local response: {}",
                request.method, request.path, e
            );
            error_response(
                request_id,
                502,
                "bad_gateway",
                "local service error while reading response".to_string(),
            )
        }
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Build the outbound header map: hop-by-hop fields dropped, `host` pinned
/// to the target, `content-length` pinned to the decoded body size.
fn outbound_headers(headers: &Headers, target: &LocalTarget, body_len: usize) -> HeaderMap {
    let mut map = HeaderMap::with_capacity(headers.len() + 2);

    for (name, value) in headers {
        if is_hop_by_hop(name)
            || name.eq_ignore_ascii_case("host")
            || name.eq_ignore_ascii_case("content-length")
        {
            continue;
        }

        let Ok(header_name) = HeaderName::from_str(name) else {
            continue;
        };

        match value {
            Value::String(s) => {
                if let Ok(v) = HeaderValue::from_str(s) {
                    map.append(header_name, v);
                }
            }
            Value::Array(list) => {
                for entry in list {
                    if let Some(s) = entry.as_str() {
                        if let Ok(v) = HeaderValue::from_str(s) {
                            map.append(header_name.clone(), v);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    if let Ok(host) = HeaderValue::from_str(&target.authority()) {
        map.insert(reqwest::header::HOST, host);
    }
    map.insert(reqwest::header::CONTENT_LENGTH, HeaderValue::from(body_len));

    map
}

/// Collect response headers into the wire mapping, folding repeated names
/// into arrays and dropping hop-by-hop fields.
fn inbound_headers(headers: &HeaderMap) -> Headers {
    let mut map = Headers::new();

    for (name, value) in headers {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        let Ok(value) = value.to_str() else {
            continue;
        };

        match map.get_mut(name.as_str()) {
            None => {
                map.insert(name.as_str().to_string(), Value::String(value.to_string()));
            }
            Some(Value::Array(list)) => {
                list.push(Value::String(value.to_string()));
            }
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, Value::String(value.to_string())]);
            }
        }
    }

    map
}

fn error_response(
    request_id: RequestId,
    status: u16,
    error: &str,
    message: String,
) -> ForwardedResponse {
    let body = serde_json::json!({ "error": error, "message": message })
        .to_string()
        .into_bytes();

    let mut headers = Headers::new();
    headers.insert(
        "content-type".to_string(),
        Value::String("application/json".to_string()),
    );

    ForwardedResponse {
        request_id,
        status,
        headers,
        body,
    }
}
