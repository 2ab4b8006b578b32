use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs::{self, File};
use tracing::{info, warn};

use crate::config::{ALLOWED_EXTENSIONS, STORAGE_INDEX_FILE};
use crate::index::{FileIndex, FileMeta};

pub const STORED_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const DISPLAY_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug)]
pub struct Storage {
    root: PathBuf,
    index: FileIndex,
}

impl Storage {
    pub async fn open(root: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(&root).await?;
        let index = FileIndex::load(root.join(STORAGE_INDEX_FILE)).await;
        Ok(Self { root, index })
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    pub fn stored_name_for(original_name: &str, uploaded_at: DateTime<Utc>) -> String {
        format!(
            "{}_{}",
            uploaded_at.format(STORED_TIMESTAMP_FORMAT),
            original_name
        )
    }

    pub fn resolve_stored(&self, stored_name: &str) -> Result<PathBuf, StorageError> {
        validate_name(stored_name)?;
        Ok(self.root.join(stored_name))
    }

    pub async fn record_upload(
        &self,
        stored_name: &str,
        original_name: &str,
        uploaded_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.index
            .insert(
                stored_name.to_string(),
                FileMeta {
                    original_name: original_name.to_string(),
                    uploaded_at,
                },
            )
            .await?;
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<StoredFileEntry>, StorageError> {
        let tracked = self.index.snapshot().await;
        let mut dir = fs::read_dir(&self.root).await?;
        let mut entries = Vec::new();

        while let Some(entry) = dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let stored_name = entry.file_name().to_string_lossy().to_string();
            if stored_name.starts_with('.') {
                continue;
            }
            let (uploaded_at, original_name) = match tracked.get(&stored_name) {
                Some(meta) => (meta.uploaded_at, meta.original_name.clone()),
                None => match parse_stored_name(&stored_name) {
                    Some(parsed) => parsed,
                    None => {
                        warn!(stored_name, "skipping entry with unrecognized name");
                        continue;
                    }
                },
            };
            entries.push((
                uploaded_at,
                StoredFileEntry::new(stored_name, original_name, uploaded_at, metadata.len()),
            ));
        }

        entries.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then_with(|| a.1.stored_name.cmp(&b.1.stored_name))
        });

        Ok(entries.into_iter().map(|(_, entry)| entry).collect())
    }

    pub async fn open_download(
        &self,
        stored_name: &str,
    ) -> Result<(File, std::fs::Metadata, String), StorageError> {
        let target = self.resolve_stored(stored_name)?;
        let metadata = fs::metadata(&target).await?;
        if metadata.is_dir() {
            return Err(StorageError::InvalidName);
        }
        let file = File::open(&target).await?;
        let original_name = match self.index.get(stored_name).await {
            Some(meta) => meta.original_name,
            None => parse_stored_name(stored_name)
                .map(|(_, original)| original)
                .unwrap_or_else(|| stored_name.to_string()),
        };
        Ok((file, metadata, original_name))
    }

    pub async fn delete(&self, stored_name: &str) -> Result<(), StorageError> {
        let target = self.resolve_stored(stored_name)?;
        let removed = fs::remove_file(&target).await;
        // Drop the index entry even when the file is already gone, so no
        // stale row survives a failed delete.
        self.index.remove(stored_name).await?;
        removed?;
        Ok(())
    }

    /// 清理过期的原子写入临时文件，并同步索引与磁盘状态。
    pub async fn sweep(&self, temp_ttl: Duration) -> io::Result<()> {
        let now = SystemTime::now();
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with('.') || !name.contains(".tmp.") {
                continue;
            }
            let metadata = match entry.metadata().await {
                Ok(value) => value,
                Err(_) => continue,
            };
            if !metadata.is_file() {
                continue;
            }
            let modified = match metadata.modified() {
                Ok(value) => value,
                Err(_) => continue,
            };
            let age = match now.duration_since(modified) {
                Ok(value) => value,
                Err(_) => continue,
            };
            if age >= temp_ttl {
                let path = entry.path();
                if let Err(err) = fs::remove_file(&path).await {
                    warn!(path = ?path, error = %err, "failed to remove stale temp file");
                } else {
                    info!(path = ?path, "removed stale temp file");
                }
            }
        }

        let pruned = self.index.prune_missing(&self.root).await?;
        if pruned > 0 {
            info!(pruned, "dropped index entries for missing files");
        }
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<(), StorageError> {
    if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
        return Err(StorageError::InvalidName);
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(StorageError::InvalidName),
    }
}

pub fn extension_allowed(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            ALLOWED_EXTENSIONS
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(ext))
        })
}

/// 解析 `YYYYMMDD_HHMMSS_<原始文件名>` 形式的内部文件名。
pub fn parse_stored_name(stored_name: &str) -> Option<(DateTime<Utc>, String)> {
    let mut parts = stored_name.splitn(3, '_');
    let date = parts.next()?;
    let time = parts.next()?;
    let original = parts.next()?;
    if date.len() != 8 || !date.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if time.len() != 6 || !time.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if original.is_empty() {
        return None;
    }
    let naive =
        NaiveDateTime::parse_from_str(&format!("{date}_{time}"), STORED_TIMESTAMP_FORMAT).ok()?;
    Some((naive.and_utc(), original.to_string()))
}

pub fn format_size(size_bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = size_bytes as f64;
    for unit in &UNITS[..UNITS.len() - 1] {
        if size < 1024.0 {
            return format!("{size:.2} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.2} TB")
}

#[derive(Debug)]
pub enum StorageError {
    InvalidName,
    Io(io::Error),
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredFileEntry {
    pub original_name: String,
    pub stored_name: String,
    pub uploaded_at: String,
    pub size: String,
    pub size_bytes: u64,
}

impl StoredFileEntry {
    pub(crate) fn new(
        stored_name: String,
        original_name: String,
        uploaded_at: DateTime<Utc>,
        size_bytes: u64,
    ) -> Self {
        Self {
            original_name,
            stored_name,
            uploaded_at: uploaded_at.format(DISPLAY_TIMESTAMP_FORMAT).to_string(),
            size: format_size(size_bytes),
            size_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Storage, StorageError, extension_allowed, format_size, parse_stored_name};
    use chrono::{TimeZone, Utc};
    use std::io::ErrorKind;
    use tempfile::tempdir;

    async fn make_storage() -> (tempfile::TempDir, Storage) {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("uploads");
        let storage = Storage::open(root).await.expect("open storage");
        (temp, storage)
    }

    #[test]
    fn format_size_steps_through_units() {
        assert_eq!(format_size(500), "500.00 B");
        assert_eq!(format_size(2048), "2.00 KB");
        assert_eq!(format_size(1_048_576), "1.00 MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    #[test]
    fn stored_name_round_trips_through_parser() {
        let uploaded_at = Utc.with_ymd_and_hms(2024, 3, 15, 9, 30, 5).unwrap();
        let stored = Storage::stored_name_for("report.pdf", uploaded_at);
        assert_eq!(stored, "20240315_093005_report.pdf");

        let (parsed_at, original) = parse_stored_name(&stored).expect("parse");
        assert_eq!(parsed_at, uploaded_at);
        assert_eq!(original, "report.pdf");
    }

    #[test]
    fn parse_stored_name_rejects_malformed_names() {
        assert!(parse_stored_name("report.pdf").is_none());
        assert!(parse_stored_name("2024_093005_report.pdf").is_none());
        assert!(parse_stored_name("20240315_9305_report.pdf").is_none());
        assert!(parse_stored_name("20240315_093005_").is_none());
        assert!(parse_stored_name("notadate_093005_report.pdf").is_none());
    }

    #[test]
    fn extension_allow_list_is_enforced() {
        assert!(extension_allowed("report.pdf"));
        assert!(extension_allowed("DATA.XLSX"));
        assert!(!extension_allowed("payload.exe"));
        assert!(!extension_allowed("no_extension"));
    }

    #[tokio::test]
    async fn resolve_stored_rejects_traversal() {
        let (_temp, storage) = make_storage().await;
        assert!(matches!(
            storage.resolve_stored("../secret.txt"),
            Err(StorageError::InvalidName)
        ));
        assert!(matches!(
            storage.resolve_stored("nested/file.txt"),
            Err(StorageError::InvalidName)
        ));
        assert!(matches!(
            storage.resolve_stored(".hidden"),
            Err(StorageError::InvalidName)
        ));
    }

    #[tokio::test]
    async fn list_resolves_metadata_and_orders_newest_first() {
        let (_temp, storage) = make_storage().await;
        let older = Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap();
        let newer = Utc.with_ymd_and_hms(2024, 1, 2, 8, 0, 0).unwrap();

        for (name, at, body) in [
            ("notes.txt", older, &b"hello"[..]),
            ("report.pdf", newer, &b"pdf bytes"[..]),
        ] {
            let stored = Storage::stored_name_for(name, at);
            std::fs::write(storage.root_path().join(&stored), body).expect("write file");
            storage.record_upload(&stored, name, at).await.expect("record");
        }

        let entries = storage.list().await.expect("list");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].original_name, "report.pdf");
        assert_eq!(entries[0].uploaded_at, "2024-01-02 08:00:00");
        assert_eq!(entries[0].size_bytes, 9);
        assert_eq!(entries[0].size, "9.00 B");
        assert_eq!(entries[1].original_name, "notes.txt");
    }

    #[tokio::test]
    async fn list_falls_back_to_name_parsing_and_skips_garbage() {
        let (_temp, storage) = make_storage().await;
        std::fs::write(
            storage.root_path().join("20240315_093005_manual.csv"),
            b"a,b",
        )
        .expect("write untracked file");
        std::fs::write(storage.root_path().join("garbage.bin"), b"??").expect("write garbage");

        let entries = storage.list().await.expect("list");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].original_name, "manual.csv");
        assert_eq!(entries[0].uploaded_at, "2024-03-15 09:30:05");
    }

    #[tokio::test]
    async fn delete_missing_file_returns_not_found() {
        let (_temp, storage) = make_storage().await;
        let result = storage.delete("20240101_120000_nope.pdf").await;
        match result {
            Err(StorageError::Io(err)) => assert_eq!(err.kind(), ErrorKind::NotFound),
            other => panic!("expected not-found io error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn delete_removes_file_and_index_entry() {
        let (_temp, storage) = make_storage().await;
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let stored = Storage::stored_name_for("doc.docx", at);
        std::fs::write(storage.root_path().join(&stored), b"content").expect("write file");
        storage.record_upload(&stored, "doc.docx", at).await.expect("record");

        storage.delete(&stored).await.expect("delete");
        assert!(storage.list().await.expect("list").is_empty());
        assert!(!storage.root_path().join(&stored).exists());
    }

    #[tokio::test]
    async fn download_round_trips_saved_bytes() {
        use tokio::io::AsyncReadExt;

        let (_temp, storage) = make_storage().await;
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap();
        let stored = Storage::stored_name_for("data.csv", at);
        std::fs::write(storage.root_path().join(&stored), b"1,2,3").expect("write file");
        storage.record_upload(&stored, "data.csv", at).await.expect("record");

        let (mut file, metadata, original) =
            storage.open_download(&stored).await.expect("open download");
        assert_eq!(original, "data.csv");
        assert_eq!(metadata.len(), 5);
        let mut contents = Vec::new();
        file.read_to_end(&mut contents).await.expect("read");
        assert_eq!(contents, b"1,2,3");
    }
}
