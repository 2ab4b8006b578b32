//! 内存文件名锁：串行化同名文件的写入与删除。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time;

/// Manages asynchronous mutexes keyed by stored filename.
#[derive(Debug, Default)]
pub struct LockManager {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockManager {
    /// 创建新的锁管理器实例。
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// 在给定超时时间内获取文件名锁，超时返回 Err。
    pub async fn lock_name_with_timeout(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<tokio::sync::OwnedMutexGuard<()>, ()> {
        let key = name.trim().to_string();
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        time::timeout(timeout, lock.lock_owned())
            .await
            .map_err(|_| ())
    }
}
