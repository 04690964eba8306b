//! HTTP(S) status probing against raw IP addresses.

use reqwest::header::{AUTHORIZATION, HeaderValue};
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use crate::error::ProbeError;

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(5);
/// Bodies beyond this are cut off; health endpoints answer in a few KiB
pub const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Status and (possibly truncated) body of one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub truncated: bool,
}

impl HttpResponse {
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Client for status-code probes.
///
/// Certificate verification is switched off: API servers are addressed by
/// bare IP with cluster-internal certificates, and this probe only asks
/// whether an HTTP exchange completes and which status it returns. Never
/// use it to transfer anything that matters. Redirects are not followed so
/// the status seen is the one the target sent.
#[derive(Debug, Clone)]
pub struct HttpProber {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpProber {
    pub fn new(timeout: Duration) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(format!("k8snetlook/{}", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// GET `url`, optionally with `Authorization: Bearer <token>`. A blank
    /// token sends no header at all.
    ///
    /// Any status the server sends is a successful probe; interpreting it is
    /// up to the caller.
    pub async fn probe(&self, url: &str, bearer: Option<&str>) -> Result<HttpResponse, ProbeError> {
        let mut request = self.client.get(url);
        if let Some(token) = bearer.map(str::trim).filter(|t| !t.is_empty()) {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
                ProbeError::InvalidArgument("bearer token contains invalid header characters".to_string())
            })?;
            value.set_sensitive(true);
            request = request.header(AUTHORIZATION, value);
        }

        debug!(url, with_token = bearer.is_some(), "sending HTTP probe");
        let mut response = request.send().await?;
        let status = response.status().as_u16();

        let mut body = Vec::new();
        let mut truncated = false;
        while let Some(chunk) = response.chunk().await? {
            let room = MAX_BODY_SIZE - body.len();
            if chunk.len() > room {
                body.extend_from_slice(&chunk[..room]);
                truncated = true;
                break;
            }
            body.extend_from_slice(&chunk);
        }

        debug!(url, status, body_len = body.len(), truncated, "HTTP probe answered");
        Ok(HttpResponse {
            status,
            body,
            truncated,
        })
    }
}

/// `https://<ip>:<port><path>`, bracketing IPv6 literals
pub fn https_url(addr: std::net::SocketAddr, path: &str) -> String {
    format!("https://{}{}", addr, path)
}
