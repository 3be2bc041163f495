//! The resolver capability
//!
//! Both the DoH client and the caching wrapper implement [`Resolver`];
//! composition is chaining, with the cache's backing field holding
//! another resolver.

use async_trait::async_trait;
use hickory_proto::op::Message;

use crate::error::Result;

/// A resolver that can answer DNS queries.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Initialize the resolver. Called once before serving.
    async fn init(&self) -> Result<()>;

    /// Perform resolver maintenance. Expected to run indefinitely.
    async fn maintain(&self);

    /// Answer a DNS query.
    async fn query(&self, req: &Message) -> Result<Message>;
}
