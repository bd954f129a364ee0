use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::tracker::{AnnounceParams, TrackerClient};

use super::PeerListSender;

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Wait before retrying a failed announce.
    pub retry: Duration,
    /// Lower bound on the interval requested by the tracker.
    pub min_interval: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            retry: Duration::from_secs(5),
            min_interval: Duration::from_secs(1),
        }
    }
}

/// Periodically announces to the tracker and publishes the latest peer list.
/// Only the newest list is kept; a list nobody consumed is overwritten.
#[derive(Debug)]
pub struct TrackerProc {
    handle: JoinHandle<()>,
}

impl TrackerProc {
    pub fn spawn(
        client: TrackerClient,
        params: AnnounceParams,
        config: TrackerConfig,
        sender: PeerListSender,
        token: CancellationToken,
    ) -> Self {
        let handle = tokio::spawn(entry(client, params, config, sender, token));
        Self { handle }
    }

    pub async fn join(self) {
        if let Err(err) = self.handle.await {
            tracing::error!("tracker task failed: {err}");
        }
    }
}

async fn entry(
    client: TrackerClient,
    params: AnnounceParams,
    config: TrackerConfig,
    sender: PeerListSender,
    token: CancellationToken,
) {
    loop {
        let result = tokio::select! {
            _ = token.cancelled() => break,
            result = client.announce(&params) => result,
        };
        let wait = match result {
            Ok(announce) => {
                tracing::info!(
                    url = client.url(),
                    "tracker response: interval {}s, {} peers",
                    announce.interval,
                    announce.peers.len()
                );
                for peer in &announce.peers {
                    tracing::info!("\t{} {}", peer.id, peer.addr);
                }
                sender.send_replace(announce.peers);
                Duration::from_secs(announce.interval).max(config.min_interval)
            }
            Err(err) => {
                tracing::warn!(url = client.url(), "announce failed: {err}");
                config.retry
            }
        };

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }
    tracing::info!("tracker stopped");
}
