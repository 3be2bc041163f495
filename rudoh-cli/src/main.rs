//! rudoh - DNS to DNS-over-HTTPS (and back) proxy
//!
//! Runs one or both of:
//! - a DNS server that resolves queries against a DoH upstream
//!   (`--enable-dns-to-https`), and
//! - a DoH server that resolves requests against a classical DNS upstream
//!   (`--enable-https-to-dns`).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use reqwest::Url;
use tokio::signal;
use tokio::task::JoinSet;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rudoh_dns::{CachingResolver, DnsProxy, DohClient, DohServer, DomainMap, Resolver};

/// Bidirectional DNS <-> DNS-over-HTTPS proxy
#[derive(Parser)]
#[command(name = "rudoh")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// DNS address to listen on; use "systemd" to consume pre-bound
    /// sockets from the service manager
    #[arg(long, default_value = "0.0.0.0:53")]
    dns_listen_addr: String,

    /// DNS server to use for unqualified (single-label) queries
    #[arg(long)]
    dns_unqualified_upstream: Option<SocketAddr>,

    /// Per-domain DNS overrides, as "domain1:addr1,domain2:addr2,..."
    #[arg(long, default_value = "")]
    dns_server_for_domain: String,

    /// DNS server used to bootstrap the DoH upstream's hostname, so the
    /// proxy can start while it is itself the system resolver
    #[arg(long)]
    fallback_upstream: Option<SocketAddr>,

    /// Enable the DNS-to-HTTPS forward proxy
    #[arg(long)]
    enable_dns_to_https: bool,

    /// Upstream DoH URL
    #[arg(long, default_value = "https://dns.google/dns-query")]
    https_upstream: String,

    /// CA bundle (PEM) to trust for the DoH upstream instead of the
    /// system roots
    #[arg(long)]
    https_client_cafile: Option<PathBuf>,

    /// Cache DoH answers with decaying TTLs
    #[arg(
        long,
        default_value_t = true,
        num_args = 0..=1,
        default_missing_value = "true",
        action = clap::ArgAction::Set
    )]
    enable_cache: bool,

    /// Enable the HTTPS-to-DNS reverse proxy
    #[arg(long)]
    enable_https_to_dns: bool,

    /// Upstream DNS server for the DoH server
    #[arg(long, default_value = "8.8.8.8:53")]
    dns_upstream: SocketAddr,

    /// HTTPS address to listen on
    #[arg(long, default_value = "0.0.0.0:443")]
    https_server_addr: String,

    /// TLS certificate (PEM) for the DoH server
    #[arg(long)]
    https_cert: Option<PathBuf>,

    /// TLS private key (PEM) for the DoH server
    #[arg(long)]
    https_key: Option<PathBuf>,

    /// Serve DoH over plain HTTP; for test environments only
    #[arg(long)]
    insecure_http_server: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    anyhow::ensure!(
        args.enable_dns_to_https || args.enable_https_to_dns,
        "nothing to do: pass --enable-dns-to-https and/or --enable-https-to-dns"
    );

    let mut servers = JoinSet::new();

    if args.enable_dns_to_https {
        let upstream = Url::parse(&args.https_upstream)
            .with_context(|| format!("invalid --https-upstream {:?}", args.https_upstream))?;
        let overrides: DomainMap = args
            .dns_server_for_domain
            .parse()
            .context("invalid --dns-server-for-domain")?;

        let doh = DohClient::new(
            upstream.clone(),
            args.https_client_cafile.clone(),
            args.fallback_upstream,
        );
        let resolver: Arc<dyn Resolver> = if args.enable_cache {
            Arc::new(CachingResolver::new(doh))
        } else {
            Arc::new(doh)
        };

        let proxy = DnsProxy::new(
            args.dns_listen_addr.clone(),
            resolver,
            args.dns_unqualified_upstream,
            overrides,
        );

        info!(
            listen = %args.dns_listen_addr,
            upstream = %upstream,
            cache = args.enable_cache,
            "starting DNS-to-HTTPS proxy"
        );
        servers.spawn(async move { proxy.run().await });
    }

    if args.enable_https_to_dns {
        if !args.insecure_http_server {
            anyhow::ensure!(
                args.https_cert.is_some() && args.https_key.is_some(),
                "--https-cert and --https-key are required unless --insecure-http-server is set"
            );
        }

        let server = DohServer {
            addr: args.https_server_addr.clone(),
            upstream: args.dns_upstream,
            cert_file: args.https_cert.clone(),
            key_file: args.https_key.clone(),
            insecure: args.insecure_http_server,
        };

        info!(
            listen = %args.https_server_addr,
            upstream = %args.dns_upstream,
            "starting HTTPS-to-DNS proxy"
        );
        servers.spawn(async move { server.run().await });
    }

    tokio::select! {
        _ = wait_for_shutdown() => {
            info!("shutting down");
            Ok(())
        }
        result = servers.join_next() => match result {
            Some(Ok(Ok(()))) => anyhow::bail!("server exited unexpectedly"),
            Some(Ok(Err(e))) => Err(e).context("server failed"),
            Some(Err(e)) => Err(e).context("server task panicked"),
            None => unreachable!("at least one server was spawned"),
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .expect("failed to register SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.expect("failed to listen for Ctrl+C");
        info!("received Ctrl+C");
    }
}
