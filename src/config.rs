//! 推送配置模块
//!
//! 配置文件为 JSON，字段使用 camelCase，缺省字段取默认值。

use crate::core::conflict::CollisionAction;
use crate::logging::LogConfig;
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// 后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    /// 复制到本机另一个目录
    #[default]
    File,
    Sftp,
    #[serde(rename = "webdav")]
    WebDav,
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceType::File => write!(f, "file"),
            ServiceType::Sftp => write!(f, "sftp"),
            ServiceType::WebDav => write!(f, "webdav"),
        }
    }
}

/// 后端连接配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    #[serde(rename = "type", default)]
    pub typ: ServiceType,
    /// 远程根目录，对应本地工作区根目录
    #[serde(default)]
    pub root: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// SFTP 私钥路径
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// 冲突检测配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollisionConfig {
    /// 远程时间相对本地的偏移（秒）
    #[serde(default)]
    pub time_zone_offset: i64,
    /// 是否比较修改时间；关闭后同名即视为冲突
    #[serde(default = "default_true")]
    pub test_collision_time_diffs: bool,
    /// 时间比较容差（秒）
    #[serde(default = "default_time_tolerance")]
    pub time_tolerance_secs: i64,
    /// 非交互时的固定处理方式
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<CollisionAction>,
}

fn default_true() -> bool {
    true
}

fn default_time_tolerance() -> i64 {
    2
}

impl Default for CollisionConfig {
    fn default() -> Self {
        Self {
            time_zone_offset: 0,
            test_collision_time_diffs: true,
            time_tolerance_secs: default_time_tolerance(),
            policy: None,
        }
    }
}

/// 重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    2
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    10_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    /// 第 `attempt` 次重试前的等待时间（指数退避，有上限）
    pub fn delay_for(&self, attempt: u32) -> std::time::Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        std::time::Duration::from_millis(ms)
    }
}

/// 队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    /// 取消后等待当前任务结束的宽限期（秒）
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,
    #[serde(default)]
    pub stop_on_first_error: bool,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_cancel_grace_secs() -> u64 {
    5
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            cancel_grace_secs: default_cancel_grace_secs(),
            stop_on_first_error: false,
            retry: RetryConfig::default(),
        }
    }
}

/// 完整配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    /// 本地工作区根目录
    #[serde(default)]
    pub local_root: String,
    #[serde(default)]
    pub collision: CollisionConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub ignore_globs: Vec<String>,
    #[serde(default)]
    pub log: LogConfig,
}

impl PushConfig {
    /// 默认配置目录
    pub fn default_dir() -> PathBuf {
        dirs::config_dir()
            .map(|p| p.join("pushsync"))
            .unwrap_or_else(|| PathBuf::from(".pushsync"))
    }

    pub fn default_path() -> PathBuf {
        Self::default_dir().join("push.json")
    }

    /// 从文件加载配置，文件不存在时返回默认配置
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::debug!("配置文件不存在，使用默认配置: {:?}", path);
            return Ok(Self::default());
        }

        let content =
            fs::read_to_string(path).with_context(|| format!("读取配置文件失败: {:?}", path))?;
        let config: PushConfig = serde_json::from_str(&content)
            .with_context(|| format!("解析配置文件失败: {:?}", path))?;
        Ok(config)
    }

    /// 检查当前后端类型所需的设置是否齐全
    pub fn validate(&self) -> anyhow::Result<()> {
        let missing = |key: &str| {
            anyhow::anyhow!(
                "{} 类型的服务配置缺少必需项: \"{}\"，请先补全配置",
                self.service.typ,
                key
            )
        };

        if self.service.root.is_empty() {
            return Err(missing("root"));
        }
        if self.local_root.is_empty() {
            return Err(missing("localRoot"));
        }

        match self.service.typ {
            ServiceType::File => {}
            ServiceType::Sftp => {
                if self.service.endpoint.is_none() {
                    return Err(missing("endpoint"));
                }
                if self.service.user.is_none() {
                    return Err(missing("user"));
                }
            }
            ServiceType::WebDav => {
                if self.service.endpoint.is_none() {
                    return Err(missing("endpoint"));
                }
            }
        }

        if self.collision.time_tolerance_secs < 0 {
            bail!("timeToleranceSecs 不能为负数");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = PushConfig::load(&dir.path().join("push.json")).unwrap();
        assert_eq!(config.collision.time_tolerance_secs, 2);
        assert!(config.collision.test_collision_time_diffs);
        assert_eq!(config.queue.cancel_grace_secs, 5);
        assert_eq!(config.queue.retry.max_retries, 2);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("push.json");
        fs::write(
            &path,
            r#"{
                "service": { "type": "sftp", "root": "/srv/site", "endpoint": "host:22", "user": "deploy" },
                "localRoot": "/home/me/site",
                "collision": { "timeZoneOffset": 3600, "policy": "overwrite" },
                "ignoreGlobs": ["**/.git/**"]
            }"#,
        )
        .unwrap();

        let config = PushConfig::load(&path).unwrap();
        assert_eq!(config.service.typ, ServiceType::Sftp);
        assert_eq!(config.collision.time_zone_offset, 3600);
        assert_eq!(config.collision.policy, Some(CollisionAction::Overwrite));
        assert!(config.collision.test_collision_time_diffs);
        assert_eq!(config.ignore_globs, vec!["**/.git/**".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn bad_json_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("push.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(PushConfig::load(&path).is_err());
    }

    #[test]
    fn validate_reports_missing_setting() {
        let mut config = PushConfig::default();
        config.service.typ = ServiceType::Sftp;
        config.service.root = "/srv".into();
        config.local_root = "/home".into();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("endpoint"));
    }

    #[test]
    fn retry_delay_is_capped() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_for(0).as_millis(), 500);
        assert_eq!(retry.delay_for(1).as_millis(), 1000);
        assert_eq!(retry.delay_for(10).as_millis(), 10_000);
        assert_eq!(retry.delay_for(200).as_millis(), 10_000);
    }
}
