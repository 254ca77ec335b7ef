//! 目录传输规划
//!
//! 把一次目录传输展开为任务序列：每个目录先创建，再传输其直接子文件，然后进入子目录。

use crate::core::cache::EntryKind;
use crate::core::paths;
use crate::core::transfer::{Direction, TransferRequest};
use crate::error::Result;
use crate::storage::{DirectoryTarget, SourceRef};
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, warn};

/// 排除规则
pub trait ExclusionFilter: Send + Sync {
    /// `relative` 为相对传输根目录的路径
    fn is_excluded(&self, relative: &str, kind: EntryKind) -> bool;
}

/// 不排除任何路径
#[derive(Debug, Default, Clone, Copy)]
pub struct NoExclusions;

impl ExclusionFilter for NoExclusions {
    fn is_excluded(&self, _relative: &str, _kind: EntryKind) -> bool {
        false
    }
}

/// glob 排除规则
///
/// `**` 跨目录匹配，`*` 和 `?` 不跨 `/`。不含 `/` 的规则同时匹配文件名。
#[derive(Debug, Clone, Default)]
pub struct GlobFilter {
    patterns: Vec<(String, Regex, bool)>,
}

impl GlobFilter {
    pub fn new(globs: &[String]) -> Self {
        let patterns = globs
            .iter()
            .filter_map(|glob| match Regex::new(&Self::glob_to_regex(glob)) {
                Ok(re) => Some((glob.clone(), re, !glob.contains('/'))),
                Err(e) => {
                    warn!("忽略无效的排除规则 {}: {}", glob, e);
                    None
                }
            })
            .collect();
        Self { patterns }
    }

    fn glob_to_regex(glob: &str) -> String {
        let mut out = String::from("^");
        let chars: Vec<char> = glob.chars().collect();
        let mut i = 0;

        while i < chars.len() {
            match chars[i] {
                '*' if chars.get(i + 1) == Some(&'*') => {
                    if chars.get(i + 2) == Some(&'/') {
                        out.push_str("(?:.*/)?");
                        i += 3;
                    } else {
                        out.push_str(".*");
                        i += 2;
                    }
                    continue;
                }
                '*' => out.push_str("[^/]*"),
                '?' => out.push_str("[^/]"),
                c => out.push_str(&regex::escape(&c.to_string())),
            }
            i += 1;
        }

        out.push('$');
        out
    }

    /// 单个路径是否命中任一规则（不考虑父目录）
    pub fn matches(&self, relative: &str, kind: EntryKind) -> bool {
        let relative = relative.trim_start_matches('/');
        let name = paths::basename(relative);
        let dir_form = format!("{}/", relative);

        self.patterns.iter().any(|(_, re, name_only)| {
            re.is_match(relative)
                || (kind == EntryKind::Dir && re.is_match(&dir_form))
                || (*name_only && re.is_match(&name))
        })
    }
}

impl ExclusionFilter for GlobFilter {
    fn is_excluded(&self, relative: &str, kind: EntryKind) -> bool {
        self.matches(relative, kind)
    }
}

/// 目录规划器
pub struct DirectoryPlanner {
    filter: Arc<dyn ExclusionFilter>,
}

impl DirectoryPlanner {
    pub fn new(filter: Arc<dyn ExclusionFilter>) -> Self {
        Self { filter }
    }

    /// 上传目录：遍历本地树
    pub async fn plan_upload<S: DirectoryTarget + ?Sized>(
        &self,
        local: &S,
        local_dir: &str,
        remote_dir: &str,
        remote_root: &str,
    ) -> Result<Vec<TransferRequest>> {
        self.plan(local, Direction::Put, local_dir, remote_dir, remote_root)
            .await
    }

    /// 下载目录：遍历远程列表
    pub async fn plan_download<S: DirectoryTarget + ?Sized>(
        &self,
        remote: &S,
        remote_dir: &str,
        local_dir: &str,
        local_root: &str,
    ) -> Result<Vec<TransferRequest>> {
        self.plan(remote, Direction::Get, remote_dir, local_dir, local_root)
            .await
    }

    async fn plan<S: DirectoryTarget + ?Sized>(
        &self,
        source: &S,
        direction: Direction,
        source_dir: &str,
        dest_dir: &str,
        dest_root: &str,
    ) -> Result<Vec<TransferRequest>> {
        let source_dir = paths::normalize(source_dir);
        let mut requests = Vec::new();
        let mut stack = vec![(source_dir.clone(), paths::normalize(dest_dir))];

        while let Some((src, dst)) = stack.pop() {
            requests.push(TransferRequest::create_dir(direction, &dst, dest_root));

            // 本地文件随时可能变化，上传前总是重新列出
            if direction == Direction::Put {
                source.cache().clear_directory(source.cache_source(), &src);
            }

            let mut entries = source.list(&src).await?;
            entries.sort_by(|a, b| a.path.cmp(&b.path));

            let mut subdirs = Vec::new();
            for entry in entries {
                let relative = paths::relative_to(&source_dir, &entry.path).unwrap_or_default();
                if self.filter.is_excluded(&relative, entry.kind) {
                    debug!("排除: {}", relative);
                    continue;
                }

                let target = paths::join(&dst, &entry.name());
                match entry.kind {
                    EntryKind::Dir => subdirs.push((entry.path, target)),
                    EntryKind::File => requests.push(match direction {
                        Direction::Put => {
                            TransferRequest::put(SourceRef::Path(entry.path), &target, dest_root)
                        }
                        Direction::Get => TransferRequest::get(&entry.path, &target, dest_root),
                    }),
                }
            }

            // 逆序入栈，保证按名称顺序展开
            stack.extend(subdirs.into_iter().rev());
        }

        debug!("目录 {} 展开为 {} 个任务", source_dir, requests.len());
        Ok(requests)
    }
}
