use std::net::SocketAddr;
use std::time::Duration;
use axum::{
    body::{to_bytes, Body, Bytes},
    http::{header, HeaderMap, HeaderName, HeaderValue, Request, Response},
};
use http_body_util::LengthLimitError;
use crate::broadcast::node_url;
use crate::error::GatewayError;

const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::HOST,
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_FORWARDED_PREFIX: &str = "x-forwarded-prefix";

/// What the backend is told about the original request
#[derive(Debug, Clone, Default)]
pub struct Forwarded {
    pub client: Option<SocketAddr>,
    pub host: Option<String>,
    pub prefix: String,
}

/// `http://<address><path>[?query]`
pub fn upstream_url(address: &str, path: &str, query: Option<&str>) -> String {
    let url = node_url(address, path);
    match query {
        Some(q) if !q.is_empty() => format!("{}?{}", url, q),
        _ => url,
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(name) || name.as_str() == "keep-alive"
}

fn forward_headers(incoming: &HeaderMap, forwarded: &Forwarded) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in incoming {
        if !is_hop_by_hop(name) && *name != header::CONTENT_LENGTH {
            headers.append(name.clone(), value.clone());
        }
    }

    if let Some(client) = forwarded.client {
        let ip = client.ip().to_string();
        let chain = match incoming.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(existing) => format!("{}, {}", existing, ip),
            None => ip,
        };
        if let Ok(value) = HeaderValue::from_str(&chain) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }
    if let Some(host) = forwarded.host.as_deref() {
        if let Ok(value) = HeaderValue::from_str(host) {
            headers.insert(X_FORWARDED_HOST, value);
        }
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    if let Ok(value) = HeaderValue::from_str(&forwarded.prefix) {
        headers.insert(X_FORWARDED_PREFIX, value);
    }
    headers
}

/// Declared `Content-Length`, if present and well formed
fn declared_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// HTTP forwarding to a chosen backend node. Both the request and the
/// relayed response are buffered up to `max_body_bytes`.
pub struct Proxy {
    client: reqwest::Client,
    max_body_bytes: usize,
}

impl Proxy {
    pub fn new(timeout: Duration, max_body_bytes: usize) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            max_body_bytes,
        }
    }

    /// Send `request` to `url` on `address` and relay the answer
    pub async fn forward(
        &self,
        request: Request<Body>,
        address: &str,
        url: &str,
        forwarded: &Forwarded,
    ) -> Result<Response<Body>, GatewayError> {
        let (parts, body) = request.into_parts();
        if declared_length(&parts.headers).is_some_and(|len| len > self.max_body_bytes) {
            return Err(GatewayError::PayloadTooLarge(self.max_body_bytes));
        }
        let body = to_bytes(body, self.max_body_bytes).await.map_err(|e| {
            let inner = e.into_inner();
            if inner.is::<LengthLimitError>() {
                GatewayError::PayloadTooLarge(self.max_body_bytes)
            } else {
                GatewayError::BadRequest(format!("Failed to read request body: {}", inner))
            }
        })?;

        let mut outbound = self
            .client
            .request(parts.method, url)
            .headers(forward_headers(&parts.headers, forwarded));
        if !body.is_empty() {
            outbound = outbound.body(body);
        }

        let upstream = outbound.send().await.map_err(|e| GatewayError::Upstream {
            address: address.to_string(),
            reason: e.to_string(),
        })?;

        let status = upstream.status();
        let headers = upstream.headers().clone();
        let bytes = self.read_capped(upstream, address).await?;

        let mut response = Response::new(Body::from(bytes));
        *response.status_mut() = status;
        for (name, value) in &headers {
            if !is_hop_by_hop(name) && *name != header::CONTENT_LENGTH {
                response.headers_mut().append(name.clone(), value.clone());
            }
        }
        Ok(response)
    }

    /// Collect the upstream body, giving up once it passes the cap
    async fn read_capped(
        &self,
        mut upstream: reqwest::Response,
        address: &str,
    ) -> Result<Bytes, GatewayError> {
        let too_large = || GatewayError::Upstream {
            address: address.to_string(),
            reason: format!("Response body exceeds {} bytes", self.max_body_bytes),
        };
        if upstream
            .content_length()
            .is_some_and(|len| len > self.max_body_bytes as u64)
        {
            return Err(too_large());
        }

        let mut buf = Vec::new();
        while let Some(chunk) = upstream.chunk().await.map_err(|e| GatewayError::Upstream {
            address: address.to_string(),
            reason: format!("Failed to read response body: {}", e),
        })? {
            if buf.len() + chunk.len() > self.max_body_bytes {
                return Err(too_large());
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(Bytes::from(buf))
    }
}
