//! 传输队列
//!
//! 任务按入队顺序逐个执行。每个任务开始前检查取消标志；取消后经过宽限期仍未结束的任务被强制停止。

use crate::config::QueueConfig;
use crate::core::conflict::{non_colliding_name, CollisionAction, CollisionResolver};
use crate::core::paths;
use crate::error::{Result, TransferError};
use crate::storage::{DirectoryTarget, LocalSide, SourceRef, TransferBackend};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 传输方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// 本地 -> 远程
    Put,
    /// 远程 -> 本地
    Get,
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Queued => write!(f, "queued"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Succeeded => write!(f, "succeeded"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Skipped => write!(f, "skipped"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// 队列运行状态
///
/// 队列本身只处于 Idle 或 Running，其余三种是一次运行的结束状态，记录在 `RunSummary` 中。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Cancelled,
    Stopped,
}

/// 任务内容
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskAction {
    /// 在目标一侧创建目录
    CreateDir,
    /// 传输单个文件。下载时 source 为远程路径
    Transfer { source: SourceRef },
}

/// 入队请求，id 由队列分配
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub direction: Direction,
    pub action: TaskAction,
    pub dest: String,
    /// 目标一侧的根目录，创建目录不会越过它
    pub root: String,
}

impl TransferRequest {
    pub fn put(source: SourceRef, dest: &str, root: &str) -> Self {
        Self {
            direction: Direction::Put,
            action: TaskAction::Transfer { source },
            dest: paths::normalize(dest),
            root: paths::normalize(root),
        }
    }

    pub fn get(remote_path: &str, dest: &str, root: &str) -> Self {
        Self {
            direction: Direction::Get,
            action: TaskAction::Transfer {
                source: SourceRef::Path(paths::normalize(remote_path)),
            },
            dest: paths::normalize(dest),
            root: paths::normalize(root),
        }
    }

    pub fn create_dir(direction: Direction, dest: &str, root: &str) -> Self {
        Self {
            direction,
            action: TaskAction::CreateDir,
            dest: paths::normalize(dest),
            root: paths::normalize(root),
        }
    }
}

/// 队列中的任务
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferTask {
    pub id: u64,
    pub direction: Direction,
    pub action: TaskAction,
    pub dest: String,
    pub root: String,
    pub status: TaskStatus,
    pub retries: u32,
    pub error: Option<String>,
}

impl TransferTask {
    fn from_request(id: u64, request: TransferRequest) -> Self {
        Self {
            id,
            direction: request.direction,
            action: request.action,
            dest: request.dest,
            root: request.root,
            status: TaskStatus::Queued,
            retries: 0,
            error: None,
        }
    }

    /// 进度显示用的名称
    pub fn label(&self) -> String {
        paths::basename(&self.dest)
    }

    pub fn is_create_dir(&self) -> bool {
        matches!(self.action, TaskAction::CreateDir)
    }
}

/// 进度
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueProgress {
    pub index: usize,
    pub total: usize,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFailure {
    pub dest: String,
    pub error: String,
}

/// 一次运行的汇总
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: String,
    pub state: RunState,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub failures: Vec<TaskFailure>,
}

impl RunSummary {
    fn from_tasks(run_id: String, state: RunState, tasks: &[TransferTask]) -> Self {
        let count = |status| tasks.iter().filter(|t| t.status == status).count();
        Self {
            run_id,
            state,
            succeeded: count(TaskStatus::Succeeded),
            failed: count(TaskStatus::Failed),
            skipped: count(TaskStatus::Skipped),
            cancelled: count(TaskStatus::Cancelled),
            failures: tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Failed)
                .map(|t| TaskFailure {
                    dest: t.dest.clone(),
                    error: t.error.clone().unwrap_or_default(),
                })
                .collect(),
        }
    }
}

/// 队列事件观察者
pub trait QueueObserver: Send + Sync {
    fn on_progress(&self, _progress: &QueueProgress) {}
    fn on_task_failed(&self, _task: &TransferTask, _error: &TransferError) {}
    /// 宽限期到期或调用 stop() 后强制停止，`remaining` 为未开始就被取消的任务数
    fn on_force_stop(&self, _remaining: usize) {}
    fn on_complete(&self, _summary: &RunSummary) {}
}

/// 写日志的观察者
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl QueueObserver for TracingObserver {
    fn on_progress(&self, progress: &QueueProgress) {
        debug!("进度 {}/{}: {}", progress.index, progress.total, progress.label);
    }

    fn on_task_failed(&self, task: &TransferTask, error: &TransferError) {
        error!("任务失败 {}: {}", task.dest, error);
    }

    fn on_force_stop(&self, remaining: usize) {
        warn!("队列被强制停止，{} 个任务已取消", remaining);
    }

    fn on_complete(&self, summary: &RunSummary) {
        info!(
            "队列运行结束 [{:?}]: 成功 {}, 失败 {}, 跳过 {}, 取消 {}",
            summary.state, summary.succeeded, summary.failed, summary.skipped, summary.cancelled
        );
    }
}

/// 队列事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Progress(QueueProgress),
    TaskFailed { dest: String, error: String },
    ForceStopped { remaining: usize },
    Completed(RunSummary),
}

/// 把事件转发到通道的观察者（供界面使用）
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<QueueEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<QueueEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl QueueObserver for ChannelObserver {
    fn on_progress(&self, progress: &QueueProgress) {
        let _ = self.tx.send(QueueEvent::Progress(progress.clone()));
    }

    fn on_task_failed(&self, task: &TransferTask, error: &TransferError) {
        let _ = self.tx.send(QueueEvent::TaskFailed {
            dest: task.dest.clone(),
            error: error.to_string(),
        });
    }

    fn on_force_stop(&self, remaining: usize) {
        let _ = self.tx.send(QueueEvent::ForceStopped { remaining });
    }

    fn on_complete(&self, summary: &RunSummary) {
        let _ = self.tx.send(QueueEvent::Completed(summary.clone()));
    }
}

/// 单个任务的执行结果
enum TaskOutcome {
    Succeeded,
    Skipped,
    /// 以新名称重新发出任务，原任务作废
    Renamed(String),
    Stop,
    Failed(TransferError),
}

/// 每次运行独立的控制信号
#[derive(Debug, Clone, Default)]
struct RunControl {
    cancel: CancellationToken,
    force: CancellationToken,
    /// 由 stop() 触发而不是 cancel()
    stopped: Arc<AtomicBool>,
}

impl RunControl {
    fn interrupted_state(&self) -> RunState {
        if self.stopped.load(Ordering::SeqCst) {
            RunState::Stopped
        } else {
            RunState::Cancelled
        }
    }
}

#[derive(Debug)]
struct QueueInner {
    tasks: Vec<TransferTask>,
    state: RunState,
    next_id: u64,
}

/// 传输队列
pub struct TransferQueue {
    backend: Arc<dyn TransferBackend>,
    local: LocalSide,
    resolver: CollisionResolver,
    config: QueueConfig,
    observer: Arc<dyn QueueObserver>,
    inner: Mutex<QueueInner>,
    control: Mutex<RunControl>,
}

impl TransferQueue {
    pub fn new(
        backend: Arc<dyn TransferBackend>,
        resolver: CollisionResolver,
        config: QueueConfig,
    ) -> Self {
        let local = LocalSide::new(backend.cache().clone());
        Self {
            backend,
            local,
            resolver,
            config,
            observer: Arc::new(TracingObserver),
            inner: Mutex::new(QueueInner {
                tasks: Vec::new(),
                state: RunState::Idle,
                next_id: 1,
            }),
            control: Mutex::new(RunControl::default()),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn QueueObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn backend(&self) -> &Arc<dyn TransferBackend> {
        &self.backend
    }

    pub fn local(&self) -> &LocalSide {
        &self.local
    }

    pub fn state(&self) -> RunState {
        self.inner.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == RunState::Running
    }

    /// 批量入队，运行中也可以追加
    pub fn enqueue(&self, requests: Vec<TransferRequest>) -> Vec<u64> {
        let mut inner = self.inner.lock();
        let mut ids = Vec::with_capacity(requests.len());
        for request in requests {
            let id = inner.next_id;
            inner.next_id += 1;
            inner.tasks.push(TransferTask::from_request(id, request));
            ids.push(id);
        }
        debug!("入队 {} 个任务，队列长度 {}", ids.len(), inner.tasks.len());
        ids
    }

    /// 等待执行的任务
    pub fn pending(&self) -> Vec<TransferTask> {
        self.inner
            .lock()
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Queued)
            .cloned()
            .collect()
    }

    /// 移除指定目标路径的排队任务（仅空闲时）
    pub fn remove(&self, dest: &str) -> Result<bool> {
        let dest = paths::normalize(dest);
        let mut inner = self.inner.lock();
        if inner.state == RunState::Running {
            return Err(TransferError::QueueBusy("运行中不能移除任务".to_string()));
        }
        let before = inner.tasks.len();
        inner
            .tasks
            .retain(|t| !(t.status == TaskStatus::Queued && t.dest == dest));
        Ok(inner.tasks.len() != before)
    }

    /// 清空队列（仅空闲时），返回是否移除了任务
    pub fn clear(&self) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.state == RunState::Running {
            return Err(TransferError::QueueBusy("运行中不能清空队列".to_string()));
        }
        let removed = !inner.tasks.is_empty();
        inner.tasks.clear();
        Ok(removed)
    }

    /// 请求取消：当前任务结束后停止，超过宽限期则强制停止
    pub fn cancel(&self) {
        if !self.is_running() {
            return;
        }
        let control = self.control.lock().clone();
        if control.cancel.is_cancelled() {
            return;
        }
        info!("请求取消队列，宽限期 {} 秒", self.config.cancel_grace_secs);
        control.cancel.cancel();

        let grace = Duration::from_secs(self.config.cancel_grace_secs);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let force = control.force.clone();
                handle.spawn(async move {
                    tokio::time::sleep(grace).await;
                    // 令牌属于本次运行，运行已结束时取消无副作用
                    force.cancel();
                });
            }
            Err(_) => control.force.cancel(),
        }
    }

    /// 立即强制停止
    pub fn stop(&self) {
        if !self.is_running() {
            return;
        }
        let control = self.control.lock().clone();
        info!("强制停止队列");
        control.stopped.store(true, Ordering::SeqCst);
        control.cancel.cancel();
        control.force.cancel();
    }

    /// 依次执行所有排队任务
    ///
    /// 运行结束后台账清空，状态回到 Idle；本次运行的结束状态见 `RunSummary::state`。
    pub async fn run(&self) -> Result<RunSummary> {
        let control = {
            let mut inner = self.inner.lock();
            if inner.state == RunState::Running {
                return Err(TransferError::QueueBusy("队列已在运行".to_string()));
            }
            inner.state = RunState::Running;
            let control = RunControl::default();
            *self.control.lock() = control.clone();
            control
        };
        self.resolver.reset();

        let run_id = uuid::Uuid::new_v4().to_string();
        info!("开始队列运行 {} ({} 个任务)", run_id, self.inner.lock().tasks.len());

        // 运行被中途丢弃时恢复队列状态
        let guard = scopeguard::guard(run_id.clone(), |run_id| {
            let mut inner = self.inner.lock();
            if inner.state == RunState::Running {
                Self::finish(&mut inner, &run_id, RunState::Cancelled);
            }
        });

        let mut index = 0usize;
        let summary = loop {
            let (task, total) = {
                let mut inner = self.inner.lock();
                while index < inner.tasks.len() && inner.tasks[index].status != TaskStatus::Queued {
                    index += 1;
                }
                // 判断队列已空和结束运行在同一次加锁内完成，并发追加的任务不会被丢下
                if index >= inner.tasks.len() {
                    break Self::finish(&mut inner, &run_id, RunState::Completed);
                }

                if control.cancel.is_cancelled() {
                    let remaining = Self::cancel_queued(&mut inner);
                    let state = control.interrupted_state();
                    let summary = Self::finish(&mut inner, &run_id, state);
                    drop(inner);
                    info!("队列已取消，剩余 {} 个任务不再执行", remaining);
                    if state == RunState::Stopped {
                        self.observer.on_force_stop(remaining);
                    }
                    break summary;
                }

                let total = inner.tasks.len();
                let task = &mut inner.tasks[index];
                task.status = TaskStatus::Running;
                (task.clone(), total)
            };

            debug!("执行任务 #{} {:?} -> {}", task.id, task.direction, task.dest);
            let outcome = tokio::select! {
                biased;
                _ = control.force.cancelled() => None,
                outcome = self.execute(&task, &control) => Some(outcome),
            };

            let Some(outcome) = outcome else {
                self.set_status(index, TaskStatus::Cancelled, None);
                let remaining = self.cancel_remaining();
                self.observer.on_force_stop(remaining);
                break self.finish_run(&run_id, control.interrupted_state());
            };

            let halt = match outcome {
                TaskOutcome::Succeeded => {
                    self.set_status(index, TaskStatus::Succeeded, None);
                    None
                }
                TaskOutcome::Skipped => {
                    self.set_status(index, TaskStatus::Skipped, None);
                    None
                }
                TaskOutcome::Renamed(new_dest) => {
                    self.reissue(index, new_dest);
                    continue;
                }
                TaskOutcome::Stop => {
                    self.set_status(index, TaskStatus::Cancelled, None);
                    info!("已选择停止，剩余任务全部取消");
                    Some(RunState::Stopped)
                }
                TaskOutcome::Failed(err) => {
                    self.set_status(index, TaskStatus::Failed, Some(err.to_string()));
                    self.observer.on_task_failed(&task, &err);
                    if task.is_create_dir() && matches!(err, TransferError::TypeMismatch(_)) {
                        self.fail_descendants(&task);
                    }
                    self.config
                        .stop_on_first_error
                        .then_some(RunState::Stopped)
                }
            };

            self.observer.on_progress(&QueueProgress {
                index: index + 1,
                total,
                label: task.label(),
            });

            if let Some(state) = halt {
                break self.finish_run(&run_id, state);
            }
            index += 1;
        };
        scopeguard::ScopeGuard::into_inner(guard);

        self.observer.on_complete(&summary);
        Ok(summary)
    }

    /// 结束运行：未完成的任务记为取消，台账转入汇总，队列回到空闲
    fn finish(inner: &mut QueueInner, run_id: &str, state: RunState) -> RunSummary {
        for task in inner
            .tasks
            .iter_mut()
            .filter(|t| matches!(t.status, TaskStatus::Queued | TaskStatus::Running))
        {
            task.status = TaskStatus::Cancelled;
        }
        let tasks = std::mem::take(&mut inner.tasks);
        inner.state = RunState::Idle;
        RunSummary::from_tasks(run_id.to_string(), state, &tasks)
    }

    fn finish_run(&self, run_id: &str, state: RunState) -> RunSummary {
        Self::finish(&mut self.inner.lock(), run_id, state)
    }

    fn set_status(&self, index: usize, status: TaskStatus, error: Option<String>) {
        let mut inner = self.inner.lock();
        if let Some(task) = inner.tasks.get_mut(index) {
            task.status = status;
            task.error = error;
        }
    }

    fn cancel_queued(inner: &mut QueueInner) -> usize {
        let mut count = 0;
        for task in inner.tasks.iter_mut().filter(|t| t.status == TaskStatus::Queued) {
            task.status = TaskStatus::Cancelled;
            count += 1;
        }
        count
    }

    fn cancel_remaining(&self) -> usize {
        Self::cancel_queued(&mut self.inner.lock())
    }

    /// 以新目标路径替换原任务
    fn reissue(&self, index: usize, new_dest: String) {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        if let Some(task) = inner.tasks.get_mut(index) {
            info!("重命名 {} -> {}", task.dest, new_dest);
            let request = TransferRequest {
                direction: task.direction,
                action: task.action.clone(),
                dest: new_dest,
                root: task.root.clone(),
            };
            *task = TransferTask::from_request(id, request);
        }
    }

    /// 目录创建失败时，其下所有排队任务一并失败
    fn fail_descendants(&self, dir_task: &TransferTask) {
        let failed: Vec<TransferTask> = {
            let mut inner = self.inner.lock();
            inner
                .tasks
                .iter_mut()
                .filter(|t| {
                    t.status == TaskStatus::Queued
                        && t.direction == dir_task.direction
                        && t.dest != dir_task.dest
                        && paths::is_within(&dir_task.dest, &t.dest)
                })
                .map(|t| {
                    t.status = TaskStatus::Failed;
                    t.error = Some(format!("上级目录 \"{}\" 创建失败", dir_task.dest));
                    t.clone()
                })
                .collect()
        };

        for task in &failed {
            let err = TransferError::TypeMismatch(format!("上级目录 \"{}\" 创建失败", dir_task.dest));
            self.observer.on_task_failed(task, &err);
        }
    }

    async fn execute(&self, task: &TransferTask, control: &RunControl) -> TaskOutcome {
        let result = match &task.action {
            TaskAction::CreateDir => self.create_dir(task, control).await,
            TaskAction::Transfer { source } => self.transfer(task, source, control).await,
        };

        match result {
            Ok(outcome) => outcome,
            Err(e) if e.is_stop() => TaskOutcome::Stop,
            Err(e) => TaskOutcome::Failed(e),
        }
    }

    async fn create_dir(&self, task: &TransferTask, control: &RunControl) -> Result<TaskOutcome> {
        match task.direction {
            Direction::Put => {
                self.ensure_dir(&*self.backend, &task.dest, task, control)
                    .await?
            }
            Direction::Get => self.ensure_dir(&self.local, &task.dest, task, control).await?,
        }
        Ok(TaskOutcome::Succeeded)
    }

    async fn ensure_dir<T: DirectoryTarget + ?Sized>(
        &self,
        target: &T,
        dir: &str,
        task: &TransferTask,
        control: &RunControl,
    ) -> Result<()> {
        self.with_retry(task.id, control, || target.mkdir_recursive(dir, &task.root))
            .await
    }

    async fn transfer(
        &self,
        task: &TransferTask,
        source: &SourceRef,
        control: &RunControl,
    ) -> Result<TaskOutcome> {
        let dir = paths::dirname(&task.dest);

        let stats = match task.direction {
            Direction::Put => {
                self.ensure_dir(&*self.backend, &dir, task, control).await?;
                self.with_retry(task.id, control, || {
                    self.backend.get_stats(&task.dest, source)
                })
                .await?
            }
            Direction::Get => {
                let remote = Self::remote_path(source)?;
                self.ensure_dir(&self.local, &dir, task, control).await?;
                self.with_retry(task.id, control, || {
                    self.backend.get_download_stats(remote, &task.dest, &self.local)
                })
                .await?
            }
        };

        match self.resolver.resolve(&stats).await? {
            None | Some(CollisionAction::Overwrite) => {
                match task.direction {
                    Direction::Put => {
                        debug!("上传 {} -> {}", source.label(), task.dest);
                        self.with_retry(task.id, control, || self.backend.put(source, &task.dest))
                            .await?;
                    }
                    Direction::Get => {
                        let remote = Self::remote_path(source)?;
                        debug!("下载 {} -> {}", remote, task.dest);
                        self.with_retry(task.id, control, || self.backend.get(remote, &task.dest))
                            .await?;
                    }
                }
                Ok(TaskOutcome::Succeeded)
            }
            Some(CollisionAction::Skip) => {
                debug!("跳过 {}", task.dest);
                Ok(TaskOutcome::Skipped)
            }
            Some(CollisionAction::Stop) => Ok(TaskOutcome::Stop),
            Some(CollisionAction::Rename) => {
                let entries = match task.direction {
                    Direction::Put => self.backend.list(&dir).await?,
                    Direction::Get => self.local.list(&dir).await?,
                };
                let name = non_colliding_name(&paths::basename(&task.dest), &entries);
                Ok(TaskOutcome::Renamed(paths::join(&dir, &name)))
            }
        }
    }

    fn remote_path(source: &SourceRef) -> Result<&str> {
        match source {
            SourceRef::Path(p) => Ok(p),
            SourceRef::Stream(s) => Err(TransferError::InvalidReference(format!(
                "下载源必须是远程路径，而不是流句柄 \"{}\"",
                s.name
            ))),
        }
    }

    /// 只重试 IO 原语本身，冲突提示不会因重试而重复出现
    async fn with_retry<T, F, Fut>(&self, task_id: u64, control: &RunControl, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let retry = &self.config.retry;
        let mut attempt = 0u32;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e)
                    if e.is_retryable()
                        && attempt < retry.max_retries
                        && !control.cancel.is_cancelled() =>
                {
                    let delay = retry.delay_for(attempt);
                    attempt += 1;
                    warn!(
                        "操作失败，{}ms 后重试 ({}/{}): {}",
                        delay.as_millis(),
                        attempt,
                        retry.max_retries,
                        e
                    );
                    self.note_retry(task_id);

                    tokio::select! {
                        _ = control.cancel.cancelled() => return Err(e),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn note_retry(&self, task_id: u64) {
        let mut inner = self.inner.lock();
        if let Some(task) = inner.tasks.iter_mut().find(|t| t.id == task_id) {
            task.retries += 1;
        }
    }
}
