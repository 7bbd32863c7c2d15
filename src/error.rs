//! 错误类型定义

use thiserror::Error;

/// 存储操作结果
pub type StorageResult<T> = Result<T, StorageError>;

/// 存储层错误
#[derive(Debug, Error)]
pub enum StorageError {
    /// 对象或路径不存在
    #[error("对象不存在: {0}")]
    NotFound(String),

    /// 权限不足
    #[error("权限不足: {0}")]
    PermissionDenied(String),

    /// 本地 I/O 错误
    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 对象存储传输错误
    #[error("传输错误: {0}")]
    Transport(#[from] opendal::Error),

    /// 存储配置无效
    #[error("存储配置无效: {0}")]
    InvalidConfig(String),
}

impl StorageError {
    /// 是否为瞬时错误（超时、限流等），瞬时错误才会重试
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            StorageError::Transport(e) => {
                e.is_temporary() || matches!(e.kind(), opendal::ErrorKind::RateLimited)
            }
            _ => false,
        }
    }
}

/// 同步过程错误
#[derive(Debug, Error)]
pub enum SyncError {
    /// 清点失败，整个目录对中止
    #[error("扫描{side}失败: {source}")]
    Scan {
        side: &'static str,
        #[source]
        source: StorageError,
    },

    /// 单个动作的传输失败
    #[error("{path}: {source}")]
    Transfer {
        path: String,
        #[source]
        source: StorageError,
    },

    /// 传输后校验不一致
    #[error("{path}: 校验失败 (期望 {expected}, 实际 {actual})")]
    Corruption {
        path: String,
        expected: String,
        actual: String,
    },

    /// 操作已取消
    #[error("操作已取消")]
    Cancelled,
}

impl SyncError {
    /// 是否可按退避策略重试
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Transfer { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}
