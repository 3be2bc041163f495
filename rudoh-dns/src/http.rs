//! DoH server
//!
//! Serves DNS-over-HTTPS (RFC 8484) requests at `/dns-query` and
//! `/resolve`, resolving each through a classical upstream DNS server.
//! Listens with TLS by default; an insecure plain-HTTP mode exists for
//! test environments.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query as UrlQuery, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hickory_proto::op::Message;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tower::Service;
use tracing::{debug, info};

use crate::client::{media_type, DNS_MESSAGE_TYPE};
use crate::error::{Error, Result};
use crate::exchange;

/// Cap on a POST request body
const MAX_REQUEST_SIZE: usize = 4092;

/// DoH server proxying requests to a classical DNS upstream.
pub struct DohServer {
    pub addr: String,
    pub upstream: SocketAddr,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub insecure: bool,
}

struct DohState {
    upstream: SocketAddr,
}

#[derive(Deserialize)]
struct DohParams {
    dns: Option<String>,
}

/// Status-coded request failure.
struct DohError {
    status: StatusCode,
    message: String,
}

impl DohError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl IntoResponse for DohError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

impl DohServer {
    /// Serve until the listener fails.
    pub async fn run(self) -> Result<()> {
        let app = router(self.upstream);
        let listener = TcpListener::bind(&self.addr).await?;

        info!(addr = %self.addr, insecure = self.insecure, "HTTPS listening");

        if self.insecure {
            return axum::serve(listener, app)
                .await
                .map_err(|e| Error::Transport(format!("HTTP server exited: {e}")));
        }

        let (cert_file, key_file) = match (&self.cert_file, &self.key_file) {
            (Some(cert), Some(key)) => (cert, key),
            _ => {
                return Err(Error::Config(
                    "HTTPS server requires a certificate and key".into(),
                ))
            }
        };
        let tls_config = load_tls_config(cert_file, key_file)?;
        let acceptor = TlsAcceptor::from(tls_config);

        loop {
            let (stream, peer) = listener.accept().await?;
            let acceptor = acceptor.clone();
            let app = app.clone();

            tokio::spawn(async move {
                let tls_stream = match acceptor.accept(stream).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        debug!(%peer, error = %e, "TLS handshake failed");
                        return;
                    }
                };

                let service =
                    service_fn(move |req: hyper::Request<Incoming>| app.clone().call(req));
                if let Err(e) = ConnBuilder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(tls_stream), service)
                    .await
                {
                    debug!(%peer, error = %e, "connection ended with error");
                }
            });
        }
    }
}

/// The DoH request router, exposed separately so tests can drive it
/// without a listener.
pub fn router(upstream: SocketAddr) -> Router {
    let state = Arc::new(DohState { upstream });
    Router::new()
        .route("/dns-query", get(doh_get).post(doh_post))
        .route("/resolve", get(doh_get).post(doh_post))
        .with_state(state)
}

async fn doh_get(
    State(state): State<Arc<DohState>>,
    UrlQuery(params): UrlQuery<DohParams>,
) -> std::result::Result<Response, DohError> {
    let encoded = match params.dns.as_deref() {
        Some(encoded) if !encoded.is_empty() => encoded,
        _ => {
            return Err(DohError::new(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "unknown request type",
            ))
        }
    };

    let payload = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| DohError::bad_request(format!("invalid base64: {e}")))?;

    resolve(&state, &payload).await
}

async fn doh_post(
    State(state): State<Arc<DohState>>,
    headers: HeaderMap,
    body: Bytes,
) -> std::result::Result<Response, DohError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if media_type(content_type) != DNS_MESSAGE_TYPE {
        return Err(DohError::new(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "unknown request type",
        ));
    }

    // Read at most 4k of body; anything longer is cut off here and will
    // fail to parse as a DNS message.
    let payload = &body[..body.len().min(MAX_REQUEST_SIZE)];
    resolve(&state, payload).await
}

/// Unpack the query, exchange it with the upstream, and pack the reply.
async fn resolve(state: &DohState, payload: &[u8]) -> std::result::Result<Response, DohError> {
    let query = Message::from_vec(payload)
        .map_err(|e| DohError::bad_request(format!("error unpacking request: {e}")))?;

    let reply = exchange::exchange_udp(&query, state.upstream)
        .await
        .map_err(|e| match e {
            Error::UpstreamTimeout => {
                DohError::new(StatusCode::REQUEST_TIMEOUT, "no response from upstream")
            }
            other => DohError::new(
                StatusCode::FAILED_DEPENDENCY,
                format!("dns exchange error: {other}"),
            ),
        })?;

    let packed = reply.to_vec().map_err(|e| {
        DohError::new(
            StatusCode::FAILED_DEPENDENCY,
            format!("cannot pack reply: {e}"),
        )
    })?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static(DNS_MESSAGE_TYPE),
        )],
        packed,
    )
        .into_response())
}

fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<Arc<rustls::ServerConfig>> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<std::io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(Error::Config(format!(
            "no certificates found in {cert_path:?}"
        )));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| Error::Config(format!("no private key found in {key_path:?}")))?;

    let mut config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::Config(format!("TLS configuration failed: {e}")))?
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .map_err(|e| Error::Config(format!("invalid certificate or key: {e}")))?;

    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}
