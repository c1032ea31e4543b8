//! Peer DNS resolution

use async_trait::async_trait;
use tracing::trace;

#[cfg(test)]
use mockall::automock;

/// Answers whether a peer's DNS name resolves yet
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PeerResolver: Send + Sync {
    /// Returns true once `host` resolves to at least one address
    async fn resolves(&self, host: &str) -> bool;
}

/// Resolver backed by the system resolver
#[derive(Clone, Copy, Debug, Default)]
pub struct DnsResolver;

#[async_trait]
impl PeerResolver for DnsResolver {
    async fn resolves(&self, host: &str) -> bool {
        match tokio::net::lookup_host((host, 0)).await {
            Ok(mut addrs) => addrs.next().is_some(),
            Err(e) => {
                trace!(host, error = %e, "lookup failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_localhost_resolves() {
        assert!(DnsResolver.resolves("localhost").await);
    }

    #[tokio::test]
    async fn test_reserved_name_does_not_resolve() {
        assert!(!DnsResolver.resolves("demo-etcd-0.demo-etcd.invalid").await);
    }
}
