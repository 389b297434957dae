//! Peer join announcements.
//!
//! When a server finishes registering it tells every other known server
//! that it is now serving. Delivery is best effort: the coordinator logs
//! failures and moves on, so an unreachable peer never blocks startup.
//! The transport is behind a trait; the default implementation only logs,
//! and deployments wire in their own carrier.

use async_trait::async_trait;
use tracing::info;

use crate::error::StorageResult;

/// Outbound channel for "a server joined" announcements.
#[async_trait]
pub trait PeerNotifier: Send + Sync {
    /// Tell `peer_url` that `joined_url` is now serving.
    async fn peer_joined(&self, peer_url: &str, joined_url: &str) -> StorageResult<()>;
}

/// Default notifier that records the announcement in the log and nothing
/// else. Useful for single-node deployments and as a stand-in until a real
/// transport is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl PeerNotifier for LoggingNotifier {
    async fn peer_joined(&self, peer_url: &str, joined_url: &str) -> StorageResult<()> {
        info!(peer = %peer_url, joined = %joined_url, "Announcing new server to peer");
        Ok(())
    }
}
