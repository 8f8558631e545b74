//! Heartbeat and hardware-stats publishers running at a fixed cadence.

use crate::webhook::WebhookClient;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const HW_STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Publish `/heartbeat` until cancelled.
pub fn spawn_heartbeat(webhook: WebhookClient, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {
                    let _ = webhook.publish_heartbeat();
                }
            }
        }
    })
}

/// Publish disk usage of the given partitions until cancelled. Sampling is
/// best-effort; unreadable partitions are skipped.
pub fn spawn_hw_stats(
    webhook: WebhookClient,
    partitions: Vec<PathBuf>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(HW_STATS_INTERVAL) => {
                    let samples = sample_partitions(&partitions);
                    if !samples.is_empty() {
                        let _ = webhook.publish_hw_stats(samples);
                    }
                }
            }
        }
    })
}

pub fn sample_partitions(partitions: &[PathBuf]) -> Vec<Value> {
    partitions
        .iter()
        .filter_map(|p| {
            let used = partition_used_bytes(p)?;
            Some(serde_json::json!({
                "partition": p.to_string_lossy(),
                "used_bytes": used,
            }))
        })
        .collect()
}

#[cfg(unix)]
fn partition_used_bytes(path: &std::path::Path) -> Option<u64> {
    let stat = nix::sys::statvfs::statvfs(path).ok()?;
    let block_size = stat.fragment_size() as u64;
    let total = stat.blocks() as u64 * block_size;
    let free = stat.blocks_available() as u64 * block_size;
    debug!("partition {} total={} free={}", path.display(), total, free);
    Some(total.saturating_sub(free))
}

#[cfg(not(unix))]
fn partition_used_bytes(_path: &std::path::Path) -> Option<u64> {
    None
}
