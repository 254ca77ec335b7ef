use super::{DirectoryTarget, SourceRef, TransferBackend};
use crate::core::cache::{CacheSource, CachedEntry, EntryKind, PathCache};
use crate::core::paths;
use crate::error::{Result, TransferError};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use walkdir::WalkDir;

/// 文件修改时间（Unix 秒），取不到时为 0
pub(crate) fn modified_secs(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs() as i64)
}

/// 列出本地目录的直接子项
async fn list_fs_dir(source: CacheSource, dir: &str) -> Result<Vec<CachedEntry>> {
    let base = PathBuf::from(dir);
    match fs::metadata(&base).await {
        Ok(m) if m.is_dir() => {}
        Ok(_) => {
            return Err(TransferError::TypeMismatch(format!("\"{}\" 不是目录", dir)));
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TransferError::NotFound(format!("目录 \"{}\" 不存在", dir)));
        }
        Err(e) => return Err(e.into()),
    }

    // 使用 spawn_blocking 避免阻塞 async runtime
    let entries = tokio::task::spawn_blocking(move || {
        WalkDir::new(&base)
            .min_depth(1)
            .max_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter_map(|entry| {
                let metadata = entry.metadata().ok()?;
                let kind = if metadata.is_dir() {
                    EntryKind::Dir
                } else {
                    EntryKind::File
                };
                Some(CachedEntry::new(
                    source,
                    &paths::from_local(entry.path()),
                    modified_secs(&metadata),
                    kind,
                ))
            })
            .collect::<Vec<_>>()
    })
    .await?;

    Ok(entries)
}

/// 创建单个本地目录
async fn create_fs_dir(path: &str) -> Result<bool> {
    match fs::create_dir(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            let metadata = fs::metadata(path).await?;
            if metadata.is_dir() {
                Ok(false)
            } else {
                Err(TransferError::TypeMismatch(format!(
                    "目录 \"{}\" 无法创建（已存在同名文件）",
                    path
                )))
            }
        }
        Err(e) => Err(e.into()),
    }
}

/// 使用临时文件写入，然后原子重命名
pub(crate) async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Ok(metadata) = fs::metadata(path).await {
        if metadata.is_dir() {
            return Err(TransferError::TypeMismatch(format!(
                "\"{}\" 是目录，无法写入文件",
                path.display()
            )));
        }
    }

    let mut temp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    temp_name.push(".pushsync.tmp");
    let temp_path = path.with_file_name(temp_name);

    fs::write(&temp_path, data).await?;
    if let Err(e) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(e.into());
    }
    Ok(())
}

/// 本地文件系统一侧（下载目标、目录上传的来源）
///
/// 与后端共享同一个路径缓存，条目来源为 Local。
pub struct LocalSide {
    cache: Arc<PathCache>,
}

impl LocalSide {
    pub fn new(cache: Arc<PathCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl DirectoryTarget for LocalSide {
    fn cache(&self) -> &Arc<PathCache> {
        &self.cache
    }

    fn cache_source(&self) -> CacheSource {
        CacheSource::Local
    }

    async fn list_live(&self, dir: &str) -> Result<Vec<CachedEntry>> {
        list_fs_dir(CacheSource::Local, dir).await
    }

    async fn create_dir(&self, path: &str) -> Result<bool> {
        create_fs_dir(path).await
    }
}

/// 本地复制后端：远程根目录是本机上的另一个目录
pub struct LocalBackend {
    name: String,
    cache: Arc<PathCache>,
}

impl LocalBackend {
    pub fn new(root: &str) -> Result<Self> {
        let root = PathBuf::from(root);
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }
        let name = format!("file:{}", root.display());
        Ok(Self {
            name,
            cache: Arc::new(PathCache::new()),
        })
    }
}

#[async_trait]
impl DirectoryTarget for LocalBackend {
    fn cache(&self) -> &Arc<PathCache> {
        &self.cache
    }

    fn cache_source(&self) -> CacheSource {
        CacheSource::Remote
    }

    async fn list_live(&self, dir: &str) -> Result<Vec<CachedEntry>> {
        list_fs_dir(CacheSource::Remote, dir).await
    }

    async fn create_dir(&self, path: &str) -> Result<bool> {
        create_fs_dir(path).await
    }
}

#[async_trait]
impl TransferBackend for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write_file(&self, source: &SourceRef, dest: &str) -> Result<()> {
        let dest_path = Path::new(dest);
        match source {
            SourceRef::Path(p) => {
                let data = fs::read(p).await?;
                write_atomic(dest_path, &data).await
            }
            SourceRef::Stream(s) => write_atomic(dest_path, &s.data).await,
        }
    }

    async fn read_file(&self, path: &str) -> Result<Bytes> {
        Ok(Bytes::from(fs::read(path).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, LocalBackend, String) {
        let dir = TempDir::new().unwrap();
        let root = paths::from_local(&dir.path().join("remote"));
        let backend = LocalBackend::new(&root).unwrap();
        (dir, backend, root)
    }

    #[tokio::test]
    async fn list_populates_cache_once() {
        let (_dir, backend, root) = setup();
        std::fs::write(format!("{}/a.txt", root), b"a").unwrap();
        std::fs::create_dir(format!("{}/sub", root)).unwrap();

        let entries = backend.list(&root).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(backend.cache().is_cached(CacheSource::Remote, &root));

        // 缓存命中后新文件不可见，直到清空缓存
        std::fs::write(format!("{}/b.txt", root), b"b").unwrap();
        assert_eq!(backend.list(&root).await.unwrap().len(), 2);
        backend.init().await.unwrap();
        assert_eq!(backend.list(&root).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn listing_missing_directory_is_not_found() {
        let (_dir, backend, root) = setup();
        let err = backend.list(&format!("{}/nope", root)).await.unwrap_err();
        assert!(matches!(err, TransferError::NotFound(_)));
    }

    #[tokio::test]
    async fn mkdir_recursive_creates_chain_and_records_cache() {
        let (_dir, backend, root) = setup();
        let dest = format!("{}/a/b/c", root);

        backend.mkdir_recursive(&dest, &root).await.unwrap();

        assert!(Path::new(&dest).is_dir());
        for dir in paths::ancestors_below(&root, &dest) {
            let entry = backend
                .cache()
                .get_entry_by_path(CacheSource::Remote, &dir)
                .unwrap();
            assert!(entry.is_dir());
        }
        // 已存在时再次调用直接返回
        backend.mkdir_recursive(&dest, &root).await.unwrap();
    }

    #[tokio::test]
    async fn mkdir_recursive_refuses_file_in_chain_before_creating() {
        let (_dir, backend, root) = setup();
        std::fs::write(format!("{}/a", root), b"file").unwrap();

        let err = backend
            .mkdir_recursive(&format!("{}/a/b", root), &root)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::TypeMismatch(_)));
        assert!(Path::new(&format!("{}/a", root)).is_file());
    }

    #[tokio::test]
    async fn mkdir_recursive_outside_root_is_invalid() {
        let (_dir, backend, root) = setup();
        let err = backend
            .mkdir_recursive("/elsewhere/x", &root)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidReference(_)));
    }

    #[tokio::test]
    async fn put_overwrites_and_updates_cache() {
        let (dir, backend, root) = setup();
        let local = dir.path().join("a.txt");
        std::fs::write(&local, b"new").unwrap();
        let dest = format!("{}/a.txt", root);
        std::fs::write(&dest, b"old").unwrap();

        backend.list(&root).await.unwrap();
        backend.put(&SourceRef::path(&local), &dest).await.unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"new");
        assert_eq!(backend.list(&root).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn get_stats_reports_missing_target() {
        let (dir, backend, root) = setup();
        let local = dir.path().join("a.txt");
        std::fs::write(&local, b"a").unwrap();

        let stats = backend
            .get_stats(&format!("{}/a.txt", root), &SourceRef::path(&local))
            .await
            .unwrap();
        assert_eq!(stats.source.name, "a.txt");
        assert!(stats.target.is_none());
    }

    #[tokio::test]
    async fn get_writes_local_file() {
        let (dir, backend, root) = setup();
        std::fs::write(format!("{}/r.txt", root), b"remote").unwrap();
        let dest = paths::from_local(&dir.path().join("r.txt"));

        backend.get(&format!("{}/r.txt", root), &dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"remote");
        assert!(backend
            .cache()
            .get_entry_by_path(CacheSource::Local, &dest)
            .is_some());
    }
}
