//! 传输错误类型

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransferError {
    /// 本地或远程路径不存在
    #[error("路径不存在: {0}")]
    NotFound(String),

    /// 目录与文件类型冲突（创建目录或比较时）
    #[error("类型不匹配: {0}")]
    TypeMismatch(String),

    /// 用户或策略主动停止，不算失败
    #[error("传输已停止")]
    StopRequested,

    #[error("后端 IO 错误: {0}")]
    Backend(String),

    /// 既不是合法路径也不是可识别的流句柄
    #[error("无效的引用: {0}")]
    InvalidReference(String),

    #[error("队列正在运行: {0}")]
    QueueBusy(String),
}

pub type Result<T> = std::result::Result<T, TransferError>;

impl TransferError {
    /// 只有后端 IO 错误值得重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransferError::Backend(_))
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, TransferError::StopRequested)
    }
}

impl From<std::io::Error> for TransferError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => TransferError::NotFound(err.to_string()),
            _ => TransferError::Backend(err.to_string()),
        }
    }
}

impl From<opendal::Error> for TransferError {
    fn from(err: opendal::Error) -> Self {
        match err.kind() {
            opendal::ErrorKind::NotFound => TransferError::NotFound(err.to_string()),
            opendal::ErrorKind::NotADirectory | opendal::ErrorKind::IsADirectory => {
                TransferError::TypeMismatch(err.to_string())
            }
            _ => TransferError::Backend(err.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for TransferError {
    fn from(err: tokio::task::JoinError) -> Self {
        TransferError::Backend(format!("后台任务失败: {}", err))
    }
}

// 供 UI 层直接序列化错误消息
impl serde::Serialize for TransferError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_not_found_maps_to_not_found() {
        let err: TransferError =
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing").into();
        assert!(matches!(err, TransferError::NotFound(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn other_io_errors_are_retryable_backend_errors() {
        let err: TransferError =
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset").into();
        assert!(matches!(err, TransferError::Backend(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn stop_is_not_retryable() {
        assert!(TransferError::StopRequested.is_stop());
        assert!(!TransferError::StopRequested.is_retryable());
    }
}
