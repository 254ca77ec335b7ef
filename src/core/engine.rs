use crate::config::PushConfig;
use crate::core::cache::{CachedEntry, EntryKind};
use crate::core::conflict::{CollisionPrompt, CollisionResolver};
use crate::core::paths;
use crate::core::planner::{DirectoryPlanner, GlobFilter};
use crate::core::transfer::{QueueObserver, RunSummary, TransferQueue, TransferRequest};
use crate::error::{Result, TransferError};
use crate::storage::{create_backend, DirectoryTarget, SourceRef, TransferBackend};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 推送服务：把本地工作区路径映射到远程根目录，并通过队列执行传输
pub struct PushService {
    config: PushConfig,
    backend: Arc<dyn TransferBackend>,
    queue: TransferQueue,
    filter: Arc<GlobFilter>,
    planner: DirectoryPlanner,
    local_root: String,
    remote_root: String,
}

impl PushService {
    pub fn new(
        config: PushConfig,
        backend: Arc<dyn TransferBackend>,
        prompt: Arc<dyn CollisionPrompt>,
    ) -> Self {
        let resolver = CollisionResolver::new(config.collision.clone(), prompt);
        let queue = TransferQueue::new(backend.clone(), resolver, config.queue.clone());
        let filter = Arc::new(GlobFilter::new(&config.ignore_globs));
        let planner = DirectoryPlanner::new(filter.clone());
        let local_root = paths::normalize(&config.local_root);
        let remote_root = paths::normalize(&config.service.root);

        Self {
            config,
            backend,
            queue,
            filter,
            planner,
            local_root,
            remote_root,
        }
    }

    /// 校验配置并按类型创建后端
    pub async fn connect(
        config: PushConfig,
        prompt: Arc<dyn CollisionPrompt>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let backend = create_backend(&config.service).await?;
        let service = Self::new(config, backend, prompt);
        service.init().await?;
        Ok(service)
    }

    pub fn with_observer(mut self, observer: Arc<dyn QueueObserver>) -> Self {
        self.queue = self.queue.with_observer(observer);
        self
    }

    pub fn config(&self) -> &PushConfig {
        &self.config
    }

    pub fn queue(&self) -> &TransferQueue {
        &self.queue
    }

    pub fn backend(&self) -> &Arc<dyn TransferBackend> {
        &self.backend
    }

    /// 服务（重新）初始化：清空路径缓存
    pub async fn init(&self) -> Result<()> {
        info!("初始化推送服务: {}", self.backend.name());
        self.backend.init().await
    }

    pub async fn teardown(&self) -> Result<()> {
        self.queue.stop();
        self.backend.teardown().await
    }

    fn absolute(path: &Path) -> Result<String> {
        let absolute = std::path::absolute(path)?;
        Ok(paths::from_local(&absolute))
    }

    /// 本地路径 -> 远程路径
    pub fn remote_path_for(&self, local: &str) -> Result<String> {
        let relative = paths::relative_to(&self.local_root, local).ok_or_else(|| {
            TransferError::InvalidReference(format!(
                "\"{}\" 不在工作区 \"{}\" 之内",
                local, self.local_root
            ))
        })?;
        Ok(paths::join(&self.remote_root, &relative))
    }

    /// 远程路径 -> 本地路径
    pub fn local_path_for(&self, remote: &str) -> Result<String> {
        let relative = paths::relative_to(&self.remote_root, remote).ok_or_else(|| {
            TransferError::InvalidReference(format!(
                "\"{}\" 不在远程根目录 \"{}\" 之内",
                remote, self.remote_root
            ))
        })?;
        Ok(paths::join(&self.local_root, &relative))
    }

    fn is_ignored(&self, local: &str, kind: EntryKind) -> bool {
        paths::relative_to(&self.local_root, local)
            .map(|rel| self.filter.matches(&rel, kind))
            .unwrap_or(false)
    }

    fn refuse_ignored(&self, local: &str) -> Result<()> {
        if self.is_ignored(local, EntryKind::File) {
            return Err(TransferError::InvalidReference(format!(
                "无法处理被忽略的文件 \"{}\"",
                local
            )));
        }
        Ok(())
    }

    /// 入队并运行；队列已在运行时任务由当前运行执行，返回 None
    async fn submit(&self, requests: Vec<TransferRequest>) -> Result<Option<RunSummary>> {
        if requests.is_empty() {
            debug!("没有需要传输的文件");
        }
        self.queue.enqueue(requests);

        match self.queue.run().await {
            Ok(summary) => Ok(Some(summary)),
            Err(TransferError::QueueBusy(_)) => {
                info!("任务已追加到正在运行的队列");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// 上传单个或多个文件；单个目录按目录上传，多选时忽略其中的目录
    pub async fn upload(&self, local_paths: &[impl AsRef<Path>]) -> Result<Option<RunSummary>> {
        if let [single] = local_paths {
            if tokio::fs::metadata(single.as_ref()).await?.is_dir() {
                return self.upload_directory(single.as_ref()).await;
            }
        }

        let multiple = local_paths.len() > 1;
        let mut requests = Vec::new();
        for path in local_paths {
            let local = Self::absolute(path.as_ref())?;
            let metadata = tokio::fs::metadata(&local).await?;
            if metadata.is_dir() {
                debug!("多选上传忽略目录: {}", local);
                continue;
            }
            if multiple && self.is_ignored(&local, EntryKind::File) {
                warn!("跳过被忽略的文件: {}", local);
                continue;
            }
            self.refuse_ignored(&local)?;

            let remote = self.remote_path_for(&local)?;
            requests.push(TransferRequest::put(
                SourceRef::Path(local),
                &remote,
                &self.remote_root,
            ));
        }

        self.submit(requests).await
    }

    pub async fn upload_directory(&self, dir: &Path) -> Result<Option<RunSummary>> {
        let local = Self::absolute(dir)?;
        let remote = self.remote_path_for(&local)?;
        info!("上传目录 {} -> {}", local, remote);

        let requests = self
            .planner
            .plan_upload(self.queue.local(), &local, &remote, &self.remote_root)
            .await?;
        self.submit(requests).await
    }

    /// 下载本地路径对应的远程文件；远程是目录时按目录下载
    pub async fn download(&self, local_paths: &[impl AsRef<Path>]) -> Result<Option<RunSummary>> {
        let mut requests = Vec::new();
        for path in local_paths {
            let local = Self::absolute(path.as_ref())?;
            let remote = self.remote_path_for(&local)?;

            let entry = self.backend.lookup(&remote).await?.ok_or_else(|| {
                TransferError::NotFound(format!("远程文件 \"{}\" 不存在", remote))
            })?;
            if entry.is_dir() {
                if local_paths.len() == 1 {
                    return self.download_directory(path.as_ref()).await;
                }
                debug!("多选下载忽略目录: {}", remote);
                continue;
            }
            self.refuse_ignored(&local)?;

            requests.push(TransferRequest::get(&remote, &local, &self.local_root));
        }

        self.submit(requests).await
    }

    pub async fn download_directory(&self, dir: &Path) -> Result<Option<RunSummary>> {
        let local = Self::absolute(dir)?;
        let remote = self.remote_path_for(&local)?;
        info!("下载目录 {} -> {}", remote, local);

        let requests = self
            .planner
            .plan_download(&*self.backend, &remote, &local, &self.local_root)
            .await?;
        self.submit(requests).await
    }

    /// 列出远程目录（走缓存）
    pub async fn list_remote(&self, remote_dir: &str) -> Result<Vec<CachedEntry>> {
        let mut entries = self.backend.list(remote_dir).await?;
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceType;
    use crate::core::conflict::{ChannelPrompt, CollisionAction, CollisionDecision, PolicyPrompt};
    use crate::core::transfer::RunState;
    use crate::storage::LocalBackend;
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        local: PathBuf,
        remote: PathBuf,
        service: PushService,
    }

    fn fixture(ignore: &[&str]) -> Fixture {
        fixture_with(ignore, Arc::new(PolicyPrompt::new(CollisionAction::Overwrite)))
    }

    fn fixture_with(ignore: &[&str], prompt: Arc<dyn CollisionPrompt>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("work");
        let remote = dir.path().join("srv");
        std::fs::create_dir_all(&local).unwrap();

        let mut config = PushConfig::default();
        config.service.typ = ServiceType::File;
        config.service.root = paths::from_local(&remote);
        config.local_root = paths::from_local(&local);
        config.ignore_globs = ignore.iter().map(|s| s.to_string()).collect();

        let backend = Arc::new(LocalBackend::new(&config.service.root).unwrap());
        let service = PushService::new(config, backend, prompt);
        Fixture {
            _dir: dir,
            local,
            remote,
            service,
        }
    }

    #[test]
    fn maps_paths_between_roots() {
        let f = fixture(&[]);
        let local = paths::from_local(&f.local.join("a/b.txt"));
        let remote = f.service.remote_path_for(&local).unwrap();
        assert_eq!(remote, paths::from_local(&f.remote.join("a/b.txt")));
        assert_eq!(f.service.local_path_for(&remote).unwrap(), local);

        let err = f.service.remote_path_for("/elsewhere/x").unwrap_err();
        assert!(matches!(err, TransferError::InvalidReference(_)));
    }

    #[tokio::test]
    async fn uploads_single_file_into_missing_directory() {
        let f = fixture(&[]);
        std::fs::create_dir_all(f.local.join("a")).unwrap();
        std::fs::write(f.local.join("a/b.txt"), "hello").unwrap();

        let summary = f
            .service
            .upload(&[f.local.join("a/b.txt")])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(std::fs::read_to_string(f.remote.join("a/b.txt")).unwrap(), "hello");
    }

    #[tokio::test]
    async fn multi_select_ignores_directories() {
        let f = fixture(&[]);
        std::fs::create_dir_all(f.local.join("dir")).unwrap();
        std::fs::write(f.local.join("one.txt"), "1").unwrap();

        let summary = f
            .service
            .upload(&[f.local.join("one.txt"), f.local.join("dir")])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.succeeded, 1);
        assert!(!f.remote.join("dir").exists());
    }

    #[tokio::test]
    async fn ignored_file_is_refused() {
        let f = fixture(&["*.log"]);
        std::fs::write(f.local.join("debug.log"), "x").unwrap();

        let err = f
            .service
            .upload(&[f.local.join("debug.log")])
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidReference(_)));
    }

    #[tokio::test]
    async fn directory_round_trip() {
        let f = fixture(&["**/.cache/**"]);
        std::fs::create_dir_all(f.local.join("site/css")).unwrap();
        std::fs::create_dir_all(f.local.join("site/.cache")).unwrap();
        std::fs::write(f.local.join("site/index.html"), "index").unwrap();
        std::fs::write(f.local.join("site/css/main.css"), "css").unwrap();
        std::fs::write(f.local.join("site/.cache/junk"), "junk").unwrap();

        let summary = f.service.upload(&[f.local.join("site")]).await.unwrap().unwrap();
        assert_eq!(summary.state, RunState::Completed);
        assert_eq!(summary.succeeded, 4);
        assert!(f.remote.join("site/css/main.css").is_file());
        assert!(!f.remote.join("site/.cache").exists());

        // 删除本地副本后再下载回来
        std::fs::remove_dir_all(f.local.join("site")).unwrap();
        let summary = f
            .service
            .download(&[f.local.join("site")])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.failed, 0);
        assert_eq!(
            std::fs::read_to_string(f.local.join("site/css/main.css")).unwrap(),
            "css"
        );
    }

    #[tokio::test]
    async fn download_missing_remote_is_not_found() {
        let f = fixture(&[]);
        let err = f
            .service
            .download(&[f.local.join("nothing.txt")])
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::NotFound(_)));
    }

    #[tokio::test]
    async fn upload_during_run_joins_current_run() {
        let (prompt, mut requests) = ChannelPrompt::new(1);
        let f = fixture_with(&[], Arc::new(prompt));
        std::fs::create_dir_all(&f.remote).unwrap();
        std::fs::write(f.local.join("a.txt"), "local").unwrap();
        std::fs::File::options()
            .write(true)
            .open(f.local.join("a.txt"))
            .unwrap()
            .set_modified(std::time::UNIX_EPOCH)
            .unwrap();
        std::fs::write(f.remote.join("a.txt"), "remote").unwrap();
        std::fs::write(f.local.join("b.txt"), "b").unwrap();

        let service = Arc::new(f.service);
        let first = {
            let service = service.clone();
            let a = f.local.join("a.txt");
            tokio::spawn(async move { service.upload(&[a]).await })
        };

        let request = requests.recv().await.unwrap();
        let joined = service.upload(&[f.local.join("b.txt")]).await.unwrap();
        assert!(joined.is_none());
        request
            .respond_to
            .send(CollisionDecision::once(CollisionAction::Overwrite))
            .unwrap();

        let summary = first.await.unwrap().unwrap().unwrap();
        assert_eq!(summary.succeeded, 2);
        assert_eq!(std::fs::read_to_string(f.remote.join("b.txt")).unwrap(), "b");
    }
}
