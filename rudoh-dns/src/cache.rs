//! TTL-decaying caching resolver
//!
//! Wraps a backing resolver and caches its answers, keyed by question.
//! Instead of remembering insertion times, a background sweep decrements
//! the stored records' TTLs in place on a fixed schedule, so a cache hit
//! always serves records carrying their live remaining lifetime.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{DNSClass, Record, RecordType};
use tokio::sync::RwLock;
use tracing::debug;

use crate::domainmap::canonical_name;
use crate::error::Result;
use crate::resolver::Resolver;

/// Maximum number of entries we keep in the cache. 2k is reasonable for a
/// small network; increasing it too much interacts badly with the sweep,
/// which scans every entry under the write lock.
pub const MAX_CACHE_SIZE: usize = 2000;

/// Minimum TTL for an answer to be worth caching
pub const MIN_TTL: Duration = Duration::from_secs(120);

/// Cap applied to stored TTLs, so unused long-lived entries don't linger
pub const MAX_TTL: Duration = Duration::from_secs(7200);

/// Sweep interval. Must stay below `MIN_TTL` so no entry goes stale
/// between ticks.
pub const MAINTENANCE_PERIOD: Duration = Duration::from_secs(30);

/// Cache key: the question in canonical form.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CacheKey {
    name: String,
    qtype: RecordType,
    qclass: DNSClass,
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        u16::from(self.qtype).hash(state);
        u16::from(self.qclass).hash(state);
    }
}

impl CacheKey {
    fn from_query(query: &Query) -> Self {
        Self {
            name: canonical_name(&query.name().to_ascii()),
            qtype: query.query_type(),
            qclass: query.query_class(),
        }
    }
}

/// Counters kept by the caching resolver.
#[derive(Debug, Default)]
pub struct CacheStats {
    total: AtomicU64,
    bypassed: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    recorded: AtomicU64,
}

/// Point-in-time snapshot of [`CacheStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub total: u64,
    pub bypassed: u64,
    pub hits: u64,
    pub misses: u64,
    pub recorded: u64,
}

impl CacheStats {
    fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            bypassed: self.bypassed.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            recorded: self.recorded.load(Ordering::Relaxed),
        }
    }
}

/// A resolver that caches answers from a backing resolver.
pub struct CachingResolver<R> {
    back: R,
    answers: RwLock<HashMap<CacheKey, Vec<Record>>>,
    stats: CacheStats,
}

impl<R: Resolver> CachingResolver<R> {
    /// Wrap the given resolver with a cache.
    pub fn new(back: R) -> Self {
        Self {
            back,
            answers: RwLock::new(HashMap::new()),
            stats: CacheStats::default(),
        }
    }

    /// Number of cached entries.
    pub async fn len(&self) -> usize {
        self.answers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.answers.read().await.is_empty()
    }

    /// Drop every cached entry.
    pub async fn flush(&self) {
        self.answers.write().await.clear();
    }

    /// Current counter values.
    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    /// One maintenance pass: decrement every entry's TTL by the sweep
    /// period and drop the ones that reached zero. Stored record lists are
    /// replaced with decremented copies rather than mutated, so answers
    /// already handed out keep the TTL they were served with.
    async fn sweep(&self) {
        let period = MAINTENANCE_PERIOD.as_secs() as u32;

        let mut answers = self.answers.write().await;
        let total = answers.len();
        let mut expired = 0;

        answers.retain(|_, records| {
            let ttl = records.first().map(Record::ttl).unwrap_or(0);
            if ttl > period {
                *records = records_with_ttl(records, ttl - period);
                true
            } else {
                expired += 1;
                false
            }
        });

        drop(answers);

        let stats = self.stats();
        debug!(
            entries = total,
            expired,
            queries = stats.total,
            hits = stats.hits,
            misses = stats.misses,
            bypassed = stats.bypassed,
            recorded = stats.recorded,
            "cache sweep"
        );
    }
}

/// Why a reply is not eligible for caching, or `None` if it is.
fn cache_disqualifier(question: &CacheKey, reply: &Message) -> Option<&'static str> {
    if reply.response_code() != ResponseCode::NoError {
        Some("unsuccessful query")
    } else if reply.message_type() != MessageType::Response {
        Some("not a response")
    } else if reply.op_code() != OpCode::Query {
        Some("opcode is not query")
    } else if reply.answers().is_empty() {
        Some("answer is empty")
    } else if reply.queries().len() != 1 {
        Some("too many/few questions")
    } else if reply.truncated() {
        Some("truncated reply")
    } else if CacheKey::from_query(&reply.queries()[0]) != *question {
        Some("reply question does not match")
    } else {
        None
    }
}

/// Copy of a record list with every TTL set to `ttl`.
///
/// All records in an entry share one TTL; the answer's first record is
/// taken as authoritative for the whole list.
fn records_with_ttl(records: &[Record], ttl: u32) -> Vec<Record> {
    records
        .iter()
        .map(|record| {
            let mut copy = record.clone();
            copy.set_ttl(ttl);
            copy
        })
        .collect()
}

#[async_trait]
impl<R: Resolver> Resolver for CachingResolver<R> {
    async fn init(&self) -> Result<()> {
        self.back.init().await
    }

    async fn maintain(&self) {
        let sweep_loop = async {
            let mut interval = tokio::time::interval(MAINTENANCE_PERIOD);
            interval.tick().await; // the first tick completes immediately
            loop {
                interval.tick().await;
                self.sweep().await;
            }
        };

        tokio::join!(self.back.maintain(), sweep_loop);
    }

    async fn query(&self, req: &Message) -> Result<Message> {
        self.stats.total.fetch_add(1, Ordering::Relaxed);

        // To keep it simple we only cache single-question queries.
        if req.queries().len() != 1 {
            self.stats.bypassed.fetch_add(1, Ordering::Relaxed);
            return self.back.query(req).await;
        }

        let question = CacheKey::from_query(&req.queries()[0]);

        let cached = self.answers.read().await.get(&question).cloned();
        if let Some(answer) = cached {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);

            let mut reply = Message::new();
            reply.set_id(req.id());
            reply.set_message_type(MessageType::Response);
            reply.set_authoritative(false);
            reply.set_response_code(ResponseCode::NoError);
            reply.add_queries(req.queries().to_vec());
            reply.insert_answers(answer);
            return Ok(reply);
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);

        let reply = self.back.query(req).await?;

        if let Some(reason) = cache_disqualifier(&question, &reply) {
            debug!(reason, "cache not recording reply");
            return Ok(reply);
        }

        let ttl = Duration::from_secs(u64::from(reply.answers()[0].ttl())).min(MAX_TTL);

        // Entries that would expire almost immediately aren't worth the
        // space.
        if ttl < MIN_TTL {
            return Ok(reply);
        }

        let mut answers = self.answers.write().await;
        if answers.len() < MAX_CACHE_SIZE {
            answers.insert(
                question,
                records_with_ttl(reply.answers(), ttl.as_secs() as u32),
            );
            self.stats.recorded.fetch_add(1, Ordering::Relaxed);
        }
        drop(answers);

        Ok(reply)
    }
}
