//! 冲突检测与处理
//!
//! 传输前比较源和目标的元数据，决定跳过、覆盖、重命名或停止。
//! “应用到全部”的选择在一次队列运行内保持有效，运行开始时重置。

use crate::config::CollisionConfig;
use crate::core::cache::CachedEntry;
use crate::core::transfer::Direction;
use crate::error::{Result, TransferError};
use crate::storage::{FileMeta, FileStats};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// 冲突处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollisionAction {
    Skip,
    Overwrite,
    Rename,
    Stop,
}

impl std::fmt::Display for CollisionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollisionAction::Skip => write!(f, "skip"),
            CollisionAction::Overwrite => write!(f, "overwrite"),
            CollisionAction::Rename => write!(f, "rename"),
            CollisionAction::Stop => write!(f, "stop"),
        }
    }
}

/// 同类型冲突可选的处理方式
pub const SAME_TYPE_OPTIONS: [CollisionAction; 4] = [
    CollisionAction::Skip,
    CollisionAction::Overwrite,
    CollisionAction::Rename,
    CollisionAction::Stop,
];

/// 类型不匹配时不允许覆盖
pub const MISMATCH_OPTIONS: [CollisionAction; 3] = [
    CollisionAction::Skip,
    CollisionAction::Rename,
    CollisionAction::Stop,
];

/// 一次冲突的处理决定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollisionDecision {
    pub action: CollisionAction,
    #[serde(default)]
    pub apply_to_all: bool,
}

impl CollisionDecision {
    pub fn once(action: CollisionAction) -> Self {
        Self {
            action,
            apply_to_all: false,
        }
    }

    pub fn for_all(action: CollisionAction) -> Self {
        Self {
            action,
            apply_to_all: true,
        }
    }
}

/// 冲突类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionKind {
    /// 目标不比源旧
    Newer,
    /// 未比较时间，同名即冲突
    Exists,
    /// 一个是文件，一个是目录
    TypeMismatch,
}

/// 交给提示方的冲突描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collision {
    pub name: String,
    pub kind: CollisionKind,
    pub options: Vec<CollisionAction>,
}

impl Collision {
    pub fn allows(&self, action: CollisionAction) -> bool {
        self.options.contains(&action)
    }

    pub fn message(&self) -> String {
        match self.kind {
            CollisionKind::Newer => format!("文件 \"{}\" 已存在，且看起来更新。", self.name),
            CollisionKind::Exists => format!("文件 \"{}\" 已存在。", self.name),
            CollisionKind::TypeMismatch => {
                format!("文件 \"{}\" 已存在，且类型不同。", self.name)
            }
        }
    }
}

/// 冲突提示接口，由 UI 或策略实现
#[async_trait]
pub trait CollisionPrompt: Send + Sync {
    async fn ask(&self, collision: &Collision) -> Result<CollisionDecision>;
}

/// 固定策略，不与用户交互
#[derive(Debug, Clone, Copy)]
pub struct PolicyPrompt {
    action: CollisionAction,
}

impl PolicyPrompt {
    pub fn new(action: CollisionAction) -> Self {
        Self { action }
    }
}

#[async_trait]
impl CollisionPrompt for PolicyPrompt {
    async fn ask(&self, collision: &Collision) -> Result<CollisionDecision> {
        if collision.allows(self.action) {
            Ok(CollisionDecision::once(self.action))
        } else {
            Ok(CollisionDecision::once(CollisionAction::Skip))
        }
    }
}

/// 通过通道转发给界面的冲突请求
#[derive(Debug)]
pub struct PromptRequest {
    pub collision: Collision,
    pub respond_to: oneshot::Sender<CollisionDecision>,
}

/// 通道提示：发出请求后挂起当前任务，直到界面回复
#[derive(Debug, Clone)]
pub struct ChannelPrompt {
    tx: mpsc::Sender<PromptRequest>,
}

impl ChannelPrompt {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<PromptRequest>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl CollisionPrompt for ChannelPrompt {
    async fn ask(&self, collision: &Collision) -> Result<CollisionDecision> {
        let (respond_to, response) = oneshot::channel();
        self.tx
            .send(PromptRequest {
                collision: collision.clone(),
                respond_to,
            })
            .await
            .map_err(|_| TransferError::StopRequested)?;

        // 界面关闭或放弃回答视为停止
        response.await.map_err(|_| TransferError::StopRequested)
    }
}

/// 冲突解决器
pub struct CollisionResolver {
    config: CollisionConfig,
    prompt: Arc<dyn CollisionPrompt>,
    /// 本次运行“应用到全部”的选择
    sticky: Mutex<Option<CollisionAction>>,
}

impl CollisionResolver {
    pub fn new(config: CollisionConfig, prompt: Arc<dyn CollisionPrompt>) -> Self {
        Self {
            config,
            prompt,
            sticky: Mutex::new(None),
        }
    }

    /// 新一轮运行开始时调用
    pub fn reset(&self) {
        *self.sticky.lock() = None;
    }

    pub fn sticky(&self) -> Option<CollisionAction> {
        *self.sticky.lock()
    }

    /// 比较元数据，返回 None 表示没有冲突
    pub fn assess(&self, stats: &FileStats) -> Option<Collision> {
        let target = stats.target.as_ref()?;
        let source = &stats.source;

        if source.kind != target.kind {
            return Some(Collision {
                name: target.name.clone(),
                kind: CollisionKind::TypeMismatch,
                options: MISMATCH_OPTIONS.to_vec(),
            });
        }

        let kind = if self.config.test_collision_time_diffs {
            if self.source_is_newer(stats.direction, source, target) {
                return None;
            }
            CollisionKind::Newer
        } else {
            CollisionKind::Exists
        };

        Some(Collision {
            name: target.name.clone(),
            kind,
            options: SAME_TYPE_OPTIONS.to_vec(),
        })
    }

    /// 远程时间加上时区偏移后再比较，源比目标新出容差以上才算更新
    fn source_is_newer(&self, direction: Direction, source: &FileMeta, target: &FileMeta) -> bool {
        let offset = self.config.time_zone_offset;
        let (source_time, target_time) = match direction {
            Direction::Put => (source.modified_time, target.modified_time + offset),
            Direction::Get => (source.modified_time + offset, target.modified_time),
        };
        source_time - target_time > self.config.time_tolerance_secs
    }

    /// 决定如何处理，返回 None 表示没有冲突、正常传输
    pub async fn resolve(&self, stats: &FileStats) -> Result<Option<CollisionAction>> {
        let Some(collision) = self.assess(stats) else {
            return Ok(None);
        };

        if let Some(action) = self.sticky() {
            if collision.allows(action) {
                debug!("沿用“应用到全部”选择 {} 处理 {}", action, collision.name);
                return Ok(Some(action));
            }
            // 覆盖不适用于类型不匹配，按跳过处理
            debug!("类型不匹配，{} 不可用，跳过 {}", action, collision.name);
            return Ok(Some(CollisionAction::Skip));
        }

        let decision = self.prompt.ask(&collision).await?;
        let action = if collision.allows(decision.action) {
            decision.action
        } else {
            warn!(
                "提示返回了不可用的选项 {}，按跳过处理 {}",
                decision.action, collision.name
            );
            CollisionAction::Skip
        };

        if decision.apply_to_all && action != CollisionAction::Stop {
            *self.sticky.lock() = Some(action);
        }

        Ok(Some(action))
    }
}

/// 在已列出的目录中找一个不冲突的文件名：`name-1.ext`、`name-2.ext` ...
pub fn non_colliding_name(name: &str, entries: &[CachedEntry]) -> String {
    let taken: HashSet<String> = entries.iter().map(|e| e.name()).collect();

    let (stem, ext) = match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], &name[pos..]),
        _ => (name, ""),
    };

    let mut n = 1u64;
    loop {
        let candidate = format!("{}-{}{}", stem, n, ext);
        if !taken.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache::{CacheSource, EntryKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn meta(name: &str, time: i64, kind: EntryKind) -> FileMeta {
        FileMeta {
            name: name.to_string(),
            modified_time: time,
            kind,
        }
    }

    fn stats(source: i64, target: Option<(i64, EntryKind)>) -> FileStats {
        FileStats {
            direction: Direction::Put,
            source: meta("a.txt", source, EntryKind::File),
            target: target.map(|(t, k)| meta("a.txt", t, k)),
        }
    }

    /// 记录被询问次数的提示
    struct CountingPrompt {
        decision: CollisionDecision,
        calls: AtomicUsize,
    }

    impl CountingPrompt {
        fn new(decision: CollisionDecision) -> Arc<Self> {
            Arc::new(Self {
                decision,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl CollisionPrompt for CountingPrompt {
        async fn ask(&self, _collision: &Collision) -> Result<CollisionDecision> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.decision)
        }
    }

    fn resolver(prompt: Arc<dyn CollisionPrompt>) -> CollisionResolver {
        CollisionResolver::new(CollisionConfig::default(), prompt)
    }

    #[test]
    fn absent_target_is_not_a_collision() {
        let r = resolver(Arc::new(PolicyPrompt::new(CollisionAction::Skip)));
        assert!(r.assess(&stats(100, None)).is_none());
    }

    #[test]
    fn newer_source_is_not_a_collision() {
        let r = resolver(Arc::new(PolicyPrompt::new(CollisionAction::Skip)));
        assert!(r.assess(&stats(100, Some((50, EntryKind::File)))).is_none());
    }

    #[test]
    fn older_source_offers_all_four_actions() {
        let r = resolver(Arc::new(PolicyPrompt::new(CollisionAction::Skip)));
        let c = r.assess(&stats(50, Some((100, EntryKind::File)))).unwrap();
        assert_eq!(c.kind, CollisionKind::Newer);
        assert_eq!(c.options, SAME_TYPE_OPTIONS.to_vec());
    }

    #[test]
    fn type_mismatch_offers_no_overwrite() {
        let r = resolver(Arc::new(PolicyPrompt::new(CollisionAction::Skip)));
        let c = r.assess(&stats(100, Some((50, EntryKind::Dir)))).unwrap();
        assert_eq!(c.kind, CollisionKind::TypeMismatch);
        assert_eq!(c.options, MISMATCH_OPTIONS.to_vec());
    }

    #[test]
    fn tolerance_and_offset_are_applied() {
        let r = resolver(Arc::new(PolicyPrompt::new(CollisionAction::Skip)));
        // 差 2 秒在容差内，仍算冲突
        assert!(r.assess(&stats(102, Some((100, EntryKind::File)))).is_some());

        let config = CollisionConfig {
            time_zone_offset: -3600,
            ..CollisionConfig::default()
        };
        let r = CollisionResolver::new(config, Arc::new(PolicyPrompt::new(CollisionAction::Skip)));
        // 远程时间快一小时，修正后源更新
        assert!(r.assess(&stats(1000, Some((4000, EntryKind::File)))).is_none());
    }

    #[test]
    fn offset_corrects_remote_side_on_download() {
        let config = CollisionConfig {
            time_zone_offset: -3600,
            ..CollisionConfig::default()
        };
        let r = CollisionResolver::new(config, Arc::new(PolicyPrompt::new(CollisionAction::Skip)));
        let download = |remote: i64, local: i64| FileStats {
            direction: Direction::Get,
            source: meta("a.txt", remote, EntryKind::File),
            target: Some(meta("a.txt", local, EntryKind::File)),
        };

        // 远程修正后为 1_001_400，本地更新，必须提示
        assert!(r.assess(&download(1_005_000, 1_003_000)).is_some());
        // 远程修正后仍比本地新
        assert!(r.assess(&download(1_005_000, 1_000_000)).is_none());
    }

    #[test]
    fn disabled_time_comparison_always_collides() {
        let config = CollisionConfig {
            test_collision_time_diffs: false,
            ..CollisionConfig::default()
        };
        let r = CollisionResolver::new(config, Arc::new(PolicyPrompt::new(CollisionAction::Skip)));
        let c = r.assess(&stats(100, Some((50, EntryKind::File)))).unwrap();
        assert_eq!(c.kind, CollisionKind::Exists);
    }

    #[tokio::test]
    async fn sticky_decision_stops_prompting_until_reset() {
        let prompt = CountingPrompt::new(CollisionDecision::for_all(CollisionAction::Overwrite));
        let r = resolver(prompt.clone());
        let older = stats(50, Some((100, EntryKind::File)));

        for _ in 0..3 {
            let action = r.resolve(&older).await.unwrap();
            assert_eq!(action, Some(CollisionAction::Overwrite));
        }
        assert_eq!(prompt.calls.load(Ordering::SeqCst), 1);

        r.reset();
        r.resolve(&older).await.unwrap();
        assert_eq!(prompt.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn sticky_overwrite_skips_type_mismatch() {
        let prompt = CountingPrompt::new(CollisionDecision::for_all(CollisionAction::Overwrite));
        let r = resolver(prompt.clone());

        r.resolve(&stats(50, Some((100, EntryKind::File)))).await.unwrap();
        let action = r
            .resolve(&stats(50, Some((100, EntryKind::Dir))))
            .await
            .unwrap();
        assert_eq!(action, Some(CollisionAction::Skip));
        assert_eq!(prompt.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn policy_overwrite_falls_back_on_mismatch() {
        let r = resolver(Arc::new(PolicyPrompt::new(CollisionAction::Overwrite)));
        let action = r
            .resolve(&stats(50, Some((100, EntryKind::Dir))))
            .await
            .unwrap();
        assert_eq!(action, Some(CollisionAction::Skip));
    }

    #[tokio::test]
    async fn channel_prompt_round_trip_and_drop() {
        let (prompt, mut rx) = ChannelPrompt::new(1);
        let r = resolver(Arc::new(prompt));

        let answer = tokio::spawn(async move {
            let request = rx.recv().await.unwrap();
            assert_eq!(request.collision.kind, CollisionKind::Newer);
            request
                .respond_to
                .send(CollisionDecision::once(CollisionAction::Rename))
                .unwrap();
            // 第二次请求不回答，直接丢弃
            let request = rx.recv().await.unwrap();
            drop(request);
        });

        let older = stats(50, Some((100, EntryKind::File)));
        assert_eq!(r.resolve(&older).await.unwrap(), Some(CollisionAction::Rename));
        let err = r.resolve(&older).await.unwrap_err();
        assert!(err.is_stop());
        answer.await.unwrap();
    }

    #[test]
    fn rename_avoids_listed_names() {
        let entries = vec![
            CachedEntry::new(CacheSource::Remote, "/srv/a.txt", 1, EntryKind::File),
            CachedEntry::new(CacheSource::Remote, "/srv/a-1.txt", 1, EntryKind::File),
        ];
        let first = non_colliding_name("a.txt", &entries);
        assert_eq!(first, "a-2.txt");

        let mut more = entries.clone();
        more.push(CachedEntry::new(CacheSource::Remote, &format!("/srv/{}", first), 1, EntryKind::File));
        assert_eq!(non_colliding_name("a.txt", &more), "a-3.txt");

        assert_eq!(non_colliding_name(".env", &[]), ".env-1");
        assert_eq!(non_colliding_name("Makefile", &[]), "Makefile-1");
    }
}
