//! 同步错误分类

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// 源路径不存在或无法 stat，在任何 IO 之前终止
    #[error("源路径错误 {}: {source}", path.display())]
    Path {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// SSH/SFTP 握手、主机密钥或认证失败
    #[error("远程连接失败 {host}: {message}")]
    Connection { host: String, message: String },

    #[error("配置错误: {0}")]
    Config(String),

    /// 创建目录、打开或写入文件失败（汇总到报告，不终止同步）
    #[error("传输失败 {path}: {source:#}")]
    Transfer {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    /// 复制成功后保留元数据失败，只作为警告
    #[error("元数据保留失败 {path}: {message}")]
    Metadata { path: String, message: String },
}

impl SyncError {
    pub fn transfer(path: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        SyncError::Transfer {
            path: path.into(),
            source: source.into(),
        }
    }

    pub fn metadata(path: impl Into<String>, message: impl std::fmt::Display) -> Self {
        SyncError::Metadata {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// 是否需要立即终止整次同步
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Path { .. } | SyncError::Connection { .. } | SyncError::Config(_)
        )
    }
}
