//! rudoh-dns - bidirectional DNS / DNS-over-HTTPS proxy core
//!
//! This crate implements both halves of a DNS <-> DoH (RFC 8484) bridge:
//!
//! - **DNS -> HTTPS**: a concurrent UDP+TCP DNS front-end that resolves
//!   queries through a DoH upstream, with per-domain overrides, an
//!   unqualified-name shortcut, and an optional TTL-decaying cache.
//! - **HTTPS -> DNS**: a DoH server that accepts GET/POST requests and
//!   resolves them via a classical upstream DNS server.
//!
//! The resolving side is built around the [`Resolver`] capability;
//! [`DohClient`] talks to the upstream and [`CachingResolver`] wraps any
//! resolver with a cache, so composition is plain chaining:
//!
//! ```no_run
//! use std::sync::Arc;
//! use rudoh_dns::{CachingResolver, DnsProxy, DohClient, DomainMap, Resolver};
//!
//! let upstream = reqwest::Url::parse("https://dns.example/dns-query").unwrap();
//! let resolver: Arc<dyn Resolver> =
//!     Arc::new(CachingResolver::new(DohClient::new(upstream, None, None)));
//! let proxy = DnsProxy::new(
//!     "127.0.0.1:53".into(),
//!     resolver,
//!     None,
//!     DomainMap::new(),
//! );
//! # drop(proxy);
//! ```

pub mod activation;
mod cache;
mod client;
mod domainmap;
pub mod error;
pub mod exchange;
mod http;
mod proxy;
pub mod reqid;
mod resolver;

pub use cache::{CachingResolver, CacheStatsSnapshot, MAINTENANCE_PERIOD, MAX_CACHE_SIZE, MAX_TTL, MIN_TTL};
pub use client::{DohClient, DNS_MESSAGE_TYPE};
pub use domainmap::{canonical_name, label_count, DomainMap};
pub use error::{Error, Result};
pub use http::{router, DohServer};
pub use proxy::{DnsProxy, SYSTEMD_ADDR};
pub use resolver::Resolver;
