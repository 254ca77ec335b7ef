pub mod local;
pub mod remote;

use crate::config::{ServiceConfig, ServiceType};
use crate::core::cache::{CacheSource, CachedEntry, EntryKind, PathCache};
use crate::core::paths;
use crate::core::transfer::Direction;
use crate::error::{Result, TransferError};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

pub use local::{LocalBackend, LocalSide};
pub use remote::OperatorBackend;

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- stat, list, mkdir 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- read, write 等
pub const IO_TIMEOUT_SECS: u64 = 300;

/// 文件元数据（用于冲突比较）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub name: String,
    pub modified_time: i64,
    pub kind: EntryKind,
}

impl From<&CachedEntry> for FileMeta {
    fn from(entry: &CachedEntry) -> Self {
        Self {
            name: entry.name(),
            modified_time: entry.modified_time,
            kind: entry.kind,
        }
    }
}

/// 一次传输两端的元数据
///
/// 上传时 source 是本地文件、target 是远程已有文件；下载时相反。
/// `direction` 决定哪一侧是远程，时区偏移只作用于远程时间。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStats {
    pub direction: Direction,
    pub source: FileMeta,
    pub target: Option<FileMeta>,
}

/// 自带元数据的内容句柄（例如从另一个服务读出的文件）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHandle {
    pub name: String,
    pub modified_time: i64,
    pub kind: EntryKind,
    pub data: Bytes,
}

/// 传输源
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRef {
    Path(String),
    Stream(StreamHandle),
}

impl SourceRef {
    pub fn path(path: impl AsRef<Path>) -> Self {
        SourceRef::Path(paths::from_local(path.as_ref()))
    }

    /// 用于日志和进度显示的名称
    pub fn label(&self) -> String {
        match self {
            SourceRef::Path(p) => p.clone(),
            SourceRef::Stream(s) => s.name.clone(),
        }
    }

    /// 读取源的元数据，路径和流句柄走同一个入口
    pub async fn meta(&self) -> Result<FileMeta> {
        match self {
            SourceRef::Path(p) => {
                let name = paths::basename(p);
                if p.is_empty() || name.is_empty() || name == "." {
                    return Err(TransferError::InvalidReference(format!("路径 \"{}\" 无效", p)));
                }
                let metadata = tokio::fs::metadata(p).await.map_err(|e| match e.kind() {
                    std::io::ErrorKind::NotFound => {
                        TransferError::NotFound(format!("文件 \"{}\" 不存在", p))
                    }
                    _ => e.into(),
                })?;
                Ok(FileMeta {
                    name,
                    modified_time: local::modified_secs(&metadata),
                    kind: if metadata.is_dir() {
                        EntryKind::Dir
                    } else {
                        EntryKind::File
                    },
                })
            }
            SourceRef::Stream(s) => {
                if s.name.is_empty() || s.name.contains('/') {
                    return Err(TransferError::InvalidReference(format!(
                        "流句柄名称 \"{}\" 无效",
                        s.name
                    )));
                }
                Ok(FileMeta {
                    name: s.name.clone(),
                    modified_time: s.modified_time,
                    kind: s.kind,
                })
            }
        }
    }

    /// 读取全部内容
    pub async fn read_bytes(&self) -> Result<Bytes> {
        match self {
            SourceRef::Path(p) => Ok(Bytes::from(tokio::fs::read(p).await?)),
            SourceRef::Stream(s) => Ok(s.data.clone()),
        }
    }
}

/// 可以列目录、建目录的一侧存储，列表结果经由路径缓存
#[async_trait]
pub trait DirectoryTarget: Send + Sync {
    fn cache(&self) -> &Arc<PathCache>;

    /// 这一侧的条目在缓存中的来源
    fn cache_source(&self) -> CacheSource;

    /// 实时列出目录的直接子项，目录不存在时返回 NotFound
    async fn list_live(&self, dir: &str) -> Result<Vec<CachedEntry>>;

    /// 创建单个目录。已存在同名目录时返回 Ok(false)，已存在同名文件时返回 TypeMismatch
    async fn create_dir(&self, path: &str) -> Result<bool>;

    /// 列出目录，优先使用缓存；同一目录同时最多一次实时列表
    async fn list(&self, dir: &str) -> Result<Vec<CachedEntry>> {
        let source = self.cache_source();
        if let Some(entries) = self.cache().get_directory(source, dir) {
            return Ok(entries);
        }

        let lock = self.cache().listing_lock(source, dir);
        let _guard = lock.lock().await;

        // 等锁期间可能已经有人列过
        if let Some(entries) = self.cache().get_directory(source, dir) {
            return Ok(entries);
        }

        debug!("实时列出目录: {:?} {}", source, dir);
        let entries = self.list_live(dir).await?;
        Ok(self.cache().record_listing(source, dir, entries))
    }

    /// 查找 `path` 对应的条目；父目录不存在时视为不存在
    async fn lookup(&self, path: &str) -> Result<Option<CachedEntry>> {
        match self.list(&paths::dirname(path)).await {
            Ok(_) => Ok(self.cache().get_entry_by_path(self.cache_source(), path)),
            Err(TransferError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// 在 `root` 之内递归创建目录直到 `dest`
    ///
    /// 先自上而下校验所有祖先，发现同名文件立即返回 TypeMismatch，校验通过后才开始创建。
    async fn mkdir_recursive(&self, dest: &str, root: &str) -> Result<()> {
        let source = self.cache_source();
        let dest = paths::normalize(dest);
        let root = paths::normalize(root);

        if !paths::is_within(&root, &dest) {
            return Err(TransferError::InvalidReference(format!(
                "目录 \"{}\" 不在根目录 \"{}\" 之内，无法创建",
                dest, root
            )));
        }

        let chain = paths::ancestors_below(&root, &dest);

        // 从 dest 向上找第一个已缓存为目录的祖先
        let start = chain
            .iter()
            .rposition(|dir| {
                self.cache()
                    .get_entry_by_path(source, dir)
                    .map(|e| e.is_dir())
                    .unwrap_or(false)
            })
            .map(|i| i + 1)
            .unwrap_or(0);

        if start == chain.len() {
            return Ok(());
        }

        let mut first_missing = None;
        for (offset, dir) in chain[start..].iter().enumerate() {
            // 父目录是根目录或已确认存在的目录，这里的 NotFound 是真错误
            self.list(&paths::dirname(dir)).await?;
            match self.cache().get_entry_by_path(source, dir) {
                Some(entry) if entry.is_dir() => continue,
                Some(_) => {
                    return Err(TransferError::TypeMismatch(format!(
                        "目录 \"{}\" 无法创建（已存在同名文件）",
                        dir
                    )));
                }
                None => {
                    first_missing = Some(start + offset);
                    break;
                }
            }
        }

        let Some(first_missing) = first_missing else {
            return Ok(());
        };

        for dir in &chain[first_missing..] {
            let created = self.create_dir(dir).await?;
            self.cache()
                .add_entry(source, dir, chrono::Utc::now().timestamp(), EntryKind::Dir);
            if created {
                // 新建目录为空，丢弃可能残留的旧列表
                self.cache().clear_directory(source, dir);
                self.cache().record_listing(source, dir, Vec::new());
                debug!("已创建目录: {}", dir);
            } else {
                debug!("目录已被并发创建: {}", dir);
            }
        }

        Ok(())
    }
}

/// 传输后端能力接口，目标一侧的缓存来源为 Remote
#[async_trait]
pub trait TransferBackend: DirectoryTarget {
    /// 获取后端名称（用于日志）
    fn name(&self) -> &str;

    /// 初始化（服务重新初始化时清空缓存）
    async fn init(&self) -> Result<()> {
        self.cache().clear();
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        self.cache().clear();
        Ok(())
    }

    /// 把源写到目标路径，覆盖已有文件
    async fn write_file(&self, source: &SourceRef, dest: &str) -> Result<()>;

    /// 读取目标一侧的文件
    async fn read_file(&self, path: &str) -> Result<Bytes>;

    /// 上传并登记到缓存
    async fn put(&self, source: &SourceRef, dest: &str) -> Result<()> {
        self.write_file(source, dest).await?;
        self.cache().add_entry(
            self.cache_source(),
            dest,
            chrono::Utc::now().timestamp(),
            EntryKind::File,
        );
        Ok(())
    }

    /// 下载到本地路径并登记到本地缓存
    async fn get(&self, source_path: &str, destination: &str) -> Result<()> {
        let data = self.read_file(source_path).await?;
        local::write_atomic(Path::new(destination), &data).await?;
        self.cache().add_entry(
            CacheSource::Local,
            destination,
            chrono::Utc::now().timestamp(),
            EntryKind::File,
        );
        Ok(())
    }

    /// 上传方向：本地源元数据 + 远程目标元数据
    async fn get_stats(&self, dest_path: &str, source: &SourceRef) -> Result<FileStats> {
        let source_meta = source.meta().await?;
        let target = self.lookup(dest_path).await?;
        Ok(FileStats {
            direction: Direction::Put,
            source: source_meta,
            target: target.as_ref().map(FileMeta::from),
        })
    }

    /// 下载方向：远程源元数据 + 本地目标元数据
    async fn get_download_stats(
        &self,
        source_path: &str,
        destination: &str,
        local: &LocalSide,
    ) -> Result<FileStats> {
        self.list(&paths::dirname(source_path)).await?;
        let entry = self
            .cache()
            .get_entry_by_path(self.cache_source(), source_path)
            .ok_or_else(|| TransferError::NotFound(format!("远程文件 \"{}\" 不存在", source_path)))?;
        let target = local.lookup(destination).await?;
        Ok(FileStats {
            direction: Direction::Get,
            source: FileMeta::from(&entry),
            target: target.as_ref().map(FileMeta::from),
        })
    }
}

/// 根据配置创建后端实例
pub async fn create_backend(config: &ServiceConfig) -> anyhow::Result<Arc<dyn TransferBackend>> {
    match config.typ {
        ServiceType::File => {
            tracing::info!("初始化本地复制后端: {}", config.root);
            Ok(Arc::new(LocalBackend::new(&config.root)?) as Arc<dyn TransferBackend>)
        }
        ServiceType::Sftp => {
            let endpoint = config
                .endpoint
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("SFTP service requires endpoint"))?;
            let user = config
                .user
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("SFTP service requires user"))?;
            tracing::info!("初始化 SFTP 后端: {}@{}", user, endpoint);
            Ok(Arc::new(OperatorBackend::sftp(endpoint, user, config.key.as_deref())?)
                as Arc<dyn TransferBackend>)
        }
        ServiceType::WebDav => {
            let endpoint = config
                .endpoint
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("WebDAV service requires endpoint"))?;
            tracing::info!("初始化 WebDAV 后端: {}", endpoint);
            Ok(Arc::new(OperatorBackend::webdav(
                endpoint,
                config.user.as_deref(),
                config.password.as_deref(),
            )?) as Arc<dyn TransferBackend>)
        }
    }
}
