//! DoH client resolver
//!
//! Resolves DNS queries by POSTing them to an upstream DNS-over-HTTPS
//! endpoint (RFC 8484). The HTTP client is long-lived; when requests keep
//! failing it is replaced with a fresh one, because an HTTP/2 transport
//! will otherwise pin dead TCP state across network changes.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hickory_proto::op::Message;
use reqwest::dns::{Addrs, Name as DnsName, Resolve, Resolving};
use reqwest::{header, Certificate, StatusCode, Url};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::exchange;
use crate::resolver::Resolver;

/// RFC 8484 media type
pub const DNS_MESSAGE_TYPE: &str = "application/dns-message";

/// Total per-request timeout. DNS clients rarely wait longer anyway.
const HTTP_TIMEOUT: Duration = Duration::from_secs(4);

/// TCP dial timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Drop idle pooled connections after this long, so rotations don't pile
/// up stale connections.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// How often the maintenance loop checks for a needed rotation
const ROTATION_CHECK_PERIOD: Duration = Duration::from_secs(2);

/// Rotate the client once errors have persisted this long
const ROTATE_AFTER: Duration = Duration::from_secs(10);

/// Upper bound on a DoH response body
const MAX_RESPONSE_SIZE: usize = 64 * 1024;

/// Resolves hostnames for the HTTP transport by querying a fixed DNS
/// server directly.
///
/// When this process is the local resolver, the system resolver points
/// back at it; dialing the DoH upstream through it would deadlock.
struct FallbackResolver {
    server: SocketAddr,
}

impl Resolve for FallbackResolver {
    fn resolve(&self, name: DnsName) -> Resolving {
        let server = self.server;
        Box::pin(async move {
            let addrs = exchange::lookup_host(name.as_str(), server)
                .await
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)?;
            Ok(Box::new(addrs.into_iter()) as Addrs)
        })
    }
}

#[derive(Default)]
struct ClientState {
    client: Option<reqwest::Client>,
    ca_certs: Vec<Certificate>,
    first_err: Option<Instant>,
}

/// Resolver that answers queries via an upstream DoH endpoint.
pub struct DohClient {
    upstream: Url,
    ca_file: Option<PathBuf>,
    fallback: Option<SocketAddr>,
    state: Mutex<ClientState>,
}

impl DohClient {
    /// Create a new DoH client resolver.
    ///
    /// `ca_file` optionally points at a PEM bundle to use as the HTTPS
    /// trust root instead of the system defaults. `fallback` optionally
    /// names the DNS server used to resolve the upstream's hostname.
    pub fn new(upstream: Url, ca_file: Option<PathBuf>, fallback: Option<SocketAddr>) -> Self {
        Self {
            upstream,
            ca_file,
            fallback,
            state: Mutex::new(ClientState::default()),
        }
    }

    fn load_ca_certs(&self) -> Result<Vec<Certificate>> {
        let Some(path) = &self.ca_file else {
            return Ok(Vec::new());
        };

        let pem = std::fs::read(path)?;
        let certs = Certificate::from_pem_bundle(&pem)
            .map_err(|e| Error::Config(format!("cannot load CA bundle {path:?}: {e}")))?;
        if certs.is_empty() {
            return Err(Error::Config(format!("no certificates in {path:?}")));
        }
        Ok(certs)
    }

    fn build_client(&self, ca_certs: &[Certificate]) -> Result<reqwest::Client> {
        // Proxy settings come from the environment, HTTP/2 is negotiated
        // via ALPN; both are reqwest defaults.
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(HTTP_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_idle_timeout(IDLE_TIMEOUT);

        for cert in ca_certs {
            builder = builder.add_root_certificate(cert.clone());
        }

        if let Some(server) = self.fallback {
            builder = builder.dns_resolver(Arc::new(FallbackResolver { server }));
        }

        builder
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {e}")))
    }

    /// Record one POST outcome. The first failure pins the timestamp; any
    /// success clears it.
    async fn record_outcome(&self, failed: bool) {
        let mut state = self.state.lock().await;
        if !failed {
            state.first_err = None;
        } else if state.first_err.is_none() {
            state.first_err = Some(Instant::now());
        }
    }

    async fn maybe_rotate(&self) {
        let mut state = self.state.lock().await;
        let Some(first_err) = state.first_err else {
            return;
        };
        if first_err.elapsed() < ROTATE_AFTER {
            return;
        }

        match self.build_client(&state.ca_certs) {
            Ok(client) => {
                info!(
                    upstream = %self.upstream,
                    errors_for = ?first_err.elapsed(),
                    "rotating DoH client after persistent errors"
                );
                state.client = Some(client);
                state.first_err = None;
            }
            Err(e) => {
                warn!(error = %e, "failed to build replacement DoH client");
            }
        }
    }

    #[cfg(test)]
    async fn first_err(&self) -> Option<Instant> {
        self.state.lock().await.first_err
    }
}

#[async_trait]
impl Resolver for DohClient {
    async fn init(&self) -> Result<()> {
        let ca_certs = self.load_ca_certs()?;
        let client = self.build_client(&ca_certs)?;

        let mut state = self.state.lock().await;
        state.ca_certs = ca_certs;
        state.client = Some(client);
        state.first_err = None;

        debug!(upstream = %self.upstream, "DoH client initialized");
        Ok(())
    }

    async fn maintain(&self) {
        let mut interval = tokio::time::interval(ROTATION_CHECK_PERIOD);
        loop {
            interval.tick().await;
            self.maybe_rotate().await;
        }
    }

    async fn query(&self, req: &Message) -> Result<Message> {
        let packed = req
            .to_vec()
            .map_err(|e| Error::Decode(format!("cannot pack query: {e}")))?;

        // Take a handle to the current client; the lock is never held
        // across the request itself.
        let client = self
            .state
            .lock()
            .await
            .client
            .clone()
            .ok_or_else(|| Error::Config("DoH client not initialized".into()))?;

        let result = client
            .post(self.upstream.clone())
            .header(header::CONTENT_TYPE, DNS_MESSAGE_TYPE)
            .body(packed)
            .send()
            .await;
        self.record_outcome(result.is_err()).await;

        let mut resp = result.map_err(|e| Error::Transport(format!("POST failed: {e}")))?;

        if resp.status() != StatusCode::OK {
            return Err(Error::Validation(format!(
                "response status: {}",
                resp.status()
            )));
        }

        let content_type = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if media_type(content_type) != DNS_MESSAGE_TYPE {
            return Err(Error::Validation(format!(
                "unknown response content type {content_type:?}"
            )));
        }

        // Read at most 64 KiB of body, stopping mid-stream once the cap
        // is reached.
        let mut body = Vec::new();
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| Error::Transport(format!("error reading body: {e}")))?
        {
            let remaining = MAX_RESPONSE_SIZE - body.len();
            if chunk.len() >= remaining {
                body.extend_from_slice(&chunk[..remaining]);
                break;
            }
            body.extend_from_slice(&chunk);
        }

        Message::from_vec(&body).map_err(|e| Error::Decode(format!("cannot unpack reply: {e}")))
    }
}

/// The media type of a `Content-Type` value, lowercased, without
/// parameters.
pub(crate) fn media_type(value: &str) -> String {
    value
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}
