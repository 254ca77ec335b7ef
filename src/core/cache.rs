//! 目录列表缓存
//!
//! 按来源（本地/远程）和目录缓存直接子项，避免同一目录下的多次传输反复列目录。

use crate::core::paths;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// 缓存来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSource {
    Local,
    Remote,
}

/// 条目类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryKind::File => write!(f, "file"),
            EntryKind::Dir => write!(f, "dir"),
        }
    }
}

/// 缓存条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedEntry {
    pub source: CacheSource,
    /// 完整路径
    pub path: String,
    /// 修改时间（Unix 秒）
    pub modified_time: i64,
    pub kind: EntryKind,
}

impl CachedEntry {
    pub fn new(source: CacheSource, path: &str, modified_time: i64, kind: EntryKind) -> Self {
        Self {
            source,
            path: paths::normalize(path),
            modified_time,
            kind,
        }
    }

    pub fn name(&self) -> String {
        paths::basename(&self.path)
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }
}

/// 单个目录的缓存，`listed` 区分“未缓存”和“已缓存但为空”
#[derive(Debug, Default)]
struct DirectoryBucket {
    listed: bool,
    entries: Vec<CachedEntry>,
}

impl DirectoryBucket {
    /// 同一路径只保留一个条目
    fn upsert(&mut self, entry: CachedEntry) {
        match self.entries.iter_mut().find(|e| e.path == entry.path) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }
}

type BucketKey = (CacheSource, String);

/// 路径缓存，每个后端实例持有一个
#[derive(Debug)]
pub struct PathCache {
    buckets: RwLock<HashMap<BucketKey, DirectoryBucket>>,
    /// 每个目录一把异步锁，保证同一目录同时只有一次实时列表
    listing_locks: Mutex<HashMap<BucketKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl PathCache {
    pub fn new() -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            listing_locks: Mutex::new(HashMap::new()),
        }
    }

    fn key(source: CacheSource, dir: &str) -> BucketKey {
        (source, paths::normalize(dir))
    }

    /// 插入或替换 `path` 在其父目录中的条目
    pub fn add_entry(&self, source: CacheSource, path: &str, modified_time: i64, kind: EntryKind) {
        let entry = CachedEntry::new(source, path, modified_time, kind);
        let key = Self::key(source, &paths::dirname(&entry.path));
        self.buckets.write().entry(key).or_default().upsert(entry);
    }

    /// 目录已列出时返回其条目，否则返回 None（未缓存）
    pub fn get_directory(&self, source: CacheSource, dir: &str) -> Option<Vec<CachedEntry>> {
        let buckets = self.buckets.read();
        buckets
            .get(&Self::key(source, dir))
            .filter(|b| b.listed)
            .map(|b| b.entries.clone())
    }

    pub fn is_cached(&self, source: CacheSource, dir: &str) -> bool {
        self.buckets
            .read()
            .get(&Self::key(source, dir))
            .map(|b| b.listed)
            .unwrap_or(false)
    }

    /// 查找单个条目；返回 None 时调用方需先用 `is_cached` 区分“不存在”和“未列出”
    pub fn get_entry_by_path(&self, source: CacheSource, path: &str) -> Option<CachedEntry> {
        let path = paths::normalize(path);
        let buckets = self.buckets.read();
        buckets
            .get(&Self::key(source, &paths::dirname(&path)))
            .and_then(|b| b.entries.iter().find(|e| e.path == path).cloned())
    }

    /// 写入一次实时列表的结果并标记为已列出
    ///
    /// 列表期间通过 `add_entry` 加入的条目会保留，不会被列表结果覆盖掉。
    pub fn record_listing(
        &self,
        source: CacheSource,
        dir: &str,
        entries: Vec<CachedEntry>,
    ) -> Vec<CachedEntry> {
        let mut buckets = self.buckets.write();
        let bucket = buckets.entry(Self::key(source, dir)).or_default();
        for entry in entries {
            bucket.upsert(entry);
        }
        bucket.listed = true;
        bucket.entries.clone()
    }

    /// 获取目录的列表锁
    pub fn listing_lock(&self, source: CacheSource, dir: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.listing_locks
            .lock()
            .entry(Self::key(source, dir))
            .or_default()
            .clone()
    }

    /// 清除全部缓存
    pub fn clear(&self) {
        let mut buckets = self.buckets.write();
        debug!("清除路径缓存 ({} 个目录)", buckets.len());
        buckets.clear();
        self.listing_locks.lock().clear();
    }

    /// 清除单个目录的缓存
    pub fn clear_directory(&self, source: CacheSource, dir: &str) {
        self.buckets.write().remove(&Self::key(source, dir));
    }

    /// 已列出的目录数量
    pub fn listed_directories(&self) -> usize {
        self.buckets.read().values().filter(|b| b.listed).count()
    }
}

impl Default for PathCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_lookup_returns_equal_entry() {
        let cache = PathCache::new();
        cache.add_entry(CacheSource::Remote, "/srv/site/a.txt", 42, EntryKind::File);

        let entry = cache
            .get_entry_by_path(CacheSource::Remote, "/srv/site/a.txt")
            .unwrap();
        assert_eq!(
            entry,
            CachedEntry::new(CacheSource::Remote, "/srv/site/a.txt", 42, EntryKind::File)
        );
    }

    #[test]
    fn add_entry_does_not_mark_directory_listed() {
        let cache = PathCache::new();
        cache.add_entry(CacheSource::Remote, "/srv/a.txt", 1, EntryKind::File);

        assert!(!cache.is_cached(CacheSource::Remote, "/srv"));
        assert!(cache.get_directory(CacheSource::Remote, "/srv").is_none());
    }

    #[test]
    fn empty_listing_is_cached_and_empty() {
        let cache = PathCache::new();
        cache.record_listing(CacheSource::Remote, "/srv/empty", Vec::new());

        assert!(cache.is_cached(CacheSource::Remote, "/srv/empty"));
        assert_eq!(cache.get_directory(CacheSource::Remote, "/srv/empty"), Some(Vec::new()));
    }

    #[test]
    fn replacing_an_entry_keeps_paths_unique() {
        let cache = PathCache::new();
        cache.add_entry(CacheSource::Remote, "/srv/a", 1, EntryKind::File);
        cache.add_entry(CacheSource::Remote, "/srv/a", 2, EntryKind::Dir);
        let entries = cache.record_listing(CacheSource::Remote, "/srv", Vec::new());

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].modified_time, 2);
        assert_eq!(entries[0].kind, EntryKind::Dir);
    }

    #[test]
    fn listing_preserves_concurrent_mkdir_record() {
        let cache = PathCache::new();
        // mkdir 在列表返回前登记了新目录
        cache.add_entry(CacheSource::Remote, "/srv/new", 10, EntryKind::Dir);
        let listed = vec![CachedEntry::new(CacheSource::Remote, "/srv/old", 5, EntryKind::File)];
        let entries = cache.record_listing(CacheSource::Remote, "/srv", listed);

        assert_eq!(entries.len(), 2);
        assert!(cache.get_entry_by_path(CacheSource::Remote, "/srv/new").is_some());
    }

    #[test]
    fn sources_are_independent() {
        let cache = PathCache::new();
        cache.record_listing(CacheSource::Local, "/srv", Vec::new());

        assert!(cache.is_cached(CacheSource::Local, "/srv"));
        assert!(!cache.is_cached(CacheSource::Remote, "/srv"));
    }

    #[test]
    fn clear_directory_only_drops_one_bucket() {
        let cache = PathCache::new();
        cache.record_listing(CacheSource::Remote, "/a", Vec::new());
        cache.record_listing(CacheSource::Remote, "/b", Vec::new());

        cache.clear_directory(CacheSource::Remote, "/a");
        assert!(!cache.is_cached(CacheSource::Remote, "/a"));
        assert!(cache.is_cached(CacheSource::Remote, "/b"));

        cache.clear();
        assert_eq!(cache.listed_directories(), 0);
    }

    #[test]
    fn listing_lock_is_shared_per_directory() {
        let cache = PathCache::new();
        let a = cache.listing_lock(CacheSource::Remote, "/srv/");
        let b = cache.listing_lock(CacheSource::Remote, "/srv");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
