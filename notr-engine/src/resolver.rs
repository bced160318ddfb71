//! Dynamic DNS hook

use std::net::Ipv4Addr;

use crate::error::Result;

/// Publishes client domains so they resolve to the broker
///
/// Called once per session, after the auth reply, with the broker's public
/// address. A failure aborts that session.
#[async_trait::async_trait]
pub trait DomainResolver: Send + Sync {
    async fn apply(&self, domain: &str, public_ip: Ipv4Addr) -> Result<()>;
}
