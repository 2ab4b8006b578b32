//! 会话清理与存储目录维护的后台任务。

use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::auth::{AuthConfig, prune_expired_sessions, prune_login_attempts};
use crate::config::{SESSION_PRUNE_INTERVAL_SECS, STALE_TEMP_TTL_SECS, STORAGE_SWEEP_INTERVAL_SECS};
use crate::storage::Storage;

/// 启动后台任务（会话清理与存储目录维护）。
pub fn spawn_background_tasks(storage: Arc<Storage>, auth: Arc<AuthConfig>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(SESSION_PRUNE_INTERVAL_SECS));
        loop {
            interval.tick().await;
            prune_expired_sessions(&auth).await;
            prune_login_attempts(&auth).await;
        }
    });

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(STORAGE_SWEEP_INTERVAL_SECS));
        loop {
            interval.tick().await;
            if let Err(err) = storage.sweep(Duration::from_secs(STALE_TEMP_TTL_SECS)).await {
                warn!(error = %err, "storage sweep failed");
            }
        }
    });
}
