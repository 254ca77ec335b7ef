use super::{DirectoryTarget, SourceRef, TransferBackend, IO_TIMEOUT_SECS, OP_TIMEOUT_SECS};
use crate::core::cache::{CacheSource, CachedEntry, EntryKind, PathCache};
use crate::error::{Result, TransferError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use opendal::{layers::TimeoutLayer, Metakey, Operator};
use std::sync::Arc;
use std::time::Duration;

/// 基于 opendal Operator 的远程后端（SFTP / WebDAV / 本地 fs）
pub struct OperatorBackend {
    operator: Operator,
    name: String,
    cache: Arc<PathCache>,
}

impl OperatorBackend {
    fn from_operator(operator: Operator, name: String) -> Self {
        Self {
            operator,
            name,
            cache: Arc::new(PathCache::new()),
        }
    }

    fn with_timeouts<B: opendal::Builder>(builder: B) -> Result<Operator> {
        // 添加超时层
        Ok(Operator::new(builder)?
            .layer(
                TimeoutLayer::default()
                    .with_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
                    .with_io_timeout(Duration::from_secs(IO_TIMEOUT_SECS)),
            )
            .finish())
    }

    pub fn sftp(endpoint: &str, user: &str, key: Option<&str>) -> Result<Self> {
        use opendal::services::Sftp;

        let mut builder = Sftp::default().endpoint(endpoint).user(user).root("/");
        if let Some(key) = key {
            builder = builder.key(key);
        }

        let operator = Self::with_timeouts(builder)?;
        Ok(Self::from_operator(
            operator,
            format!("sftp://{}@{}", user, endpoint.trim_end_matches('/')),
        ))
    }

    pub fn webdav(endpoint: &str, username: Option<&str>, password: Option<&str>) -> Result<Self> {
        use opendal::services::Webdav;

        let mut builder = Webdav::default().endpoint(endpoint).root("/");
        if let Some(username) = username {
            builder = builder.username(username);
        }
        if let Some(password) = password {
            builder = builder.password(password);
        }

        let operator = Self::with_timeouts(builder)?;
        Ok(Self::from_operator(
            operator,
            format!("webdav://{}", endpoint.trim_end_matches('/')),
        ))
    }

    /// 以本地目录模拟远程根，远程路径 `/x` 映射到 `<root>/x`
    pub fn fs(root: &str) -> Result<Self> {
        use opendal::services::Fs;

        let operator = Self::with_timeouts(Fs::default().root(root))?;
        Ok(Self::from_operator(operator, format!("fs://{}", root)))
    }

    /// 文件路径：去掉前导 `/`
    fn file_path(path: &str) -> String {
        crate::core::paths::normalize(path)
            .trim_start_matches('/')
            .to_string()
    }

    /// 目录路径：去掉前导 `/`，补上末尾 `/`
    fn dir_path(path: &str) -> String {
        let p = Self::file_path(path);
        if p.is_empty() || p == "." {
            "/".to_string()
        } else {
            format!("{}/", p)
        }
    }

    fn to_remote(op_path: &str) -> String {
        format!("/{}", op_path.trim_matches('/'))
    }
}

#[async_trait]
impl DirectoryTarget for OperatorBackend {
    fn cache(&self) -> &Arc<PathCache> {
        &self.cache
    }

    fn cache_source(&self) -> CacheSource {
        CacheSource::Remote
    }

    async fn list_live(&self, dir: &str) -> Result<Vec<CachedEntry>> {
        let dir_path = Self::dir_path(dir);

        // 部分服务列不存在的目录时返回空列表，先 stat 区分
        let meta = self.operator.stat(&dir_path).await.map_err(|e| match e.kind() {
            opendal::ErrorKind::NotFound => {
                TransferError::NotFound(format!("远程目录 \"{}\" 不存在", dir))
            }
            _ => e.into(),
        })?;
        if !meta.is_dir() {
            return Err(TransferError::TypeMismatch(format!("\"{}\" 不是目录", dir)));
        }

        let mut entries = Vec::new();
        let mut lister = self
            .operator
            .lister_with(&dir_path)
            .metakey(Metakey::Mode | Metakey::LastModified)
            .await?;

        while let Some(entry) = lister.try_next().await? {
            // 跳过目录自身
            if entry.path() == dir_path || entry.path().is_empty() {
                continue;
            }
            let meta = entry.metadata();
            let kind = if meta.is_dir() {
                EntryKind::Dir
            } else {
                EntryKind::File
            };
            entries.push(CachedEntry::new(
                CacheSource::Remote,
                &Self::to_remote(entry.path()),
                meta.last_modified().map_or(0, |t| t.timestamp()),
                kind,
            ));
        }

        Ok(entries)
    }

    async fn create_dir(&self, path: &str) -> Result<bool> {
        match self.operator.stat(&Self::file_path(path)).await {
            Ok(meta) if meta.is_dir() => return Ok(false),
            Ok(_) => {
                return Err(TransferError::TypeMismatch(format!(
                    "目录 \"{}\" 无法创建（已存在同名文件）",
                    path
                )));
            }
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        self.operator.create_dir(&Self::dir_path(path)).await?;
        Ok(true)
    }
}

#[async_trait]
impl TransferBackend for OperatorBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write_file(&self, source: &SourceRef, dest: &str) -> Result<()> {
        let data = source.read_bytes().await?;
        self.operator.write(&Self::file_path(dest), data).await?;
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Bytes> {
        let data = self.operator.read(&Self::file_path(path)).await?;
        Ok(data.to_bytes())
    }
}
