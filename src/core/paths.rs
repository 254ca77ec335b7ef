//! 路径工具
//!
//! 缓存和后端统一使用 `/` 分隔的字符串路径，本地路径在进入队列前先规范化。

use std::path::Path;

/// 规范化路径分隔符，去掉重复的 `/`、`.` 段和末尾的 `/`
pub fn normalize(path: &str) -> String {
    let path = path.replace('\\', "/");
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();

    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }

    let joined = parts.join("/");
    if absolute {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// 把本地 `Path` 转为规范化的字符串路径
pub fn from_local(path: &Path) -> String {
    normalize(&path.to_string_lossy())
}

pub fn dirname(path: &str) -> String {
    let path = normalize(path);
    match path.rfind('/') {
        Some(0) => "/".to_string(),
        Some(pos) => path[..pos].to_string(),
        None => ".".to_string(),
    }
}

pub fn basename(path: &str) -> String {
    let path = normalize(path);
    match path.rfind('/') {
        Some(pos) => path[pos + 1..].to_string(),
        None => path,
    }
}

pub fn join(dir: &str, name: &str) -> String {
    let dir = normalize(dir);
    let name = name.trim_start_matches('/');
    if dir == "/" {
        format!("/{}", name)
    } else {
        normalize(&format!("{}/{}", dir, name))
    }
}

/// `path` 是否等于 `root` 或位于其下
pub fn is_within(root: &str, path: &str) -> bool {
    let root = normalize(root);
    let path = normalize(path);
    if root == "/" {
        return path.starts_with('/');
    }
    path == root || path.starts_with(&format!("{}/", root))
}

/// `path` 相对 `root` 的部分（不含前导 `/`），不在 `root` 下时返回 None
pub fn relative_to(root: &str, path: &str) -> Option<String> {
    if !is_within(root, path) {
        return None;
    }
    let root = normalize(root);
    let path = normalize(path);
    let rest = if root == "/" {
        &path[1..]
    } else {
        &path[root.len()..]
    };
    Some(rest.trim_start_matches('/').to_string())
}

/// 从 `root` 下一级开始到 `dest`（含）的所有目录，自上而下
pub fn ancestors_below(root: &str, dest: &str) -> Vec<String> {
    let Some(rel) = relative_to(root, dest) else {
        return Vec::new();
    };

    let mut current = normalize(root);
    let mut chain = Vec::new();
    for part in rel.split('/').filter(|p| !p.is_empty()) {
        current = join(&current, part);
        chain.push(current.clone());
    }
    chain
}
