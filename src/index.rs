//! 存储目录内的元数据旁路索引。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::atomic::AtomicFile;

/// 单个文件的索引元数据。
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub original_name: String,
    pub uploaded_at: DateTime<Utc>,
}

/// 按内部文件名索引的元数据表，原子落盘。
#[derive(Debug)]
pub struct FileIndex {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, FileMeta>>,
}

impl FileIndex {
    /// 从磁盘加载索引，文件缺失或损坏时从空表开始。
    pub async fn load(path: PathBuf) -> Self {
        let entries = match fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(map) => map,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "index unreadable, starting empty");
                    BTreeMap::new()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "index unreadable, starting empty");
                BTreeMap::new()
            }
        };
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub async fn get(&self, stored_name: &str) -> Option<FileMeta> {
        let entries = self.entries.lock().await;
        entries.get(stored_name).cloned()
    }

    pub async fn snapshot(&self) -> BTreeMap<String, FileMeta> {
        let entries = self.entries.lock().await;
        entries.clone()
    }

    /// 写入一条元数据并落盘。
    pub async fn insert(&self, stored_name: String, meta: FileMeta) -> io::Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(stored_name, meta);
        self.persist(&entries).await
    }

    /// 删除一条元数据；条目不存在时不触碰磁盘。
    pub async fn remove(&self, stored_name: &str) -> io::Result<()> {
        let mut entries = self.entries.lock().await;
        if entries.remove(stored_name).is_none() {
            return Ok(());
        }
        self.persist(&entries).await
    }

    /// 清理磁盘上已不存在的文件条目，返回清理数量。
    pub async fn prune_missing(&self, root: &Path) -> io::Result<usize> {
        let mut entries = self.entries.lock().await;
        let mut missing = Vec::new();
        for name in entries.keys() {
            if fs::metadata(root.join(name)).await.is_err() {
                missing.push(name.clone());
            }
        }
        for name in &missing {
            entries.remove(name);
        }
        if !missing.is_empty() {
            self.persist(&entries).await?;
        }
        Ok(missing.len())
    }

    async fn persist(&self, entries: &BTreeMap<String, FileMeta>) -> io::Result<()> {
        let bytes = serde_json::to_vec_pretty(entries).map_err(io::Error::other)?;
        let mut atomic = AtomicFile::new(&self.path).await?;
        if let Err(err) = atomic.file_mut().write_all(&bytes).await {
            atomic.cleanup().await;
            return Err(err);
        }
        atomic.finalize().await
    }
}

#[cfg(test)]
mod tests {
    use super::{FileIndex, FileMeta};
    use chrono::Utc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn index_survives_reload() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join(".index.json");

        let index = FileIndex::load(path.clone()).await;
        index
            .insert(
                "20240101_120000_report.pdf".to_string(),
                FileMeta {
                    original_name: "report.pdf".to_string(),
                    uploaded_at: Utc::now(),
                },
            )
            .await
            .expect("insert");
        drop(index);

        let reloaded = FileIndex::load(path).await;
        let meta = reloaded
            .get("20240101_120000_report.pdf")
            .await
            .expect("entry present after reload");
        assert_eq!(meta.original_name, "report.pdf");
    }

    #[tokio::test]
    async fn prune_missing_drops_stale_entries() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().to_path_buf();
        let index = FileIndex::load(root.join(".index.json")).await;

        std::fs::write(root.join("20240101_120000_kept.txt"), b"data").expect("write file");
        index
            .insert(
                "20240101_120000_kept.txt".to_string(),
                FileMeta {
                    original_name: "kept.txt".to_string(),
                    uploaded_at: Utc::now(),
                },
            )
            .await
            .expect("insert kept");
        index
            .insert(
                "20240101_120000_gone.txt".to_string(),
                FileMeta {
                    original_name: "gone.txt".to_string(),
                    uploaded_at: Utc::now(),
                },
            )
            .await
            .expect("insert gone");

        let pruned = index.prune_missing(&root).await.expect("prune");
        assert_eq!(pruned, 1);
        assert!(index.get("20240101_120000_kept.txt").await.is_some());
        assert!(index.get("20240101_120000_gone.txt").await.is_none());
    }
}
