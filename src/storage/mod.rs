pub mod local;
pub mod sftp;

use crate::config::SyncOptions;
use crate::error::SyncError;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::AsyncRead;

pub use local::LocalStorage;
pub use sftp::SftpStorage;

/// 文件所有者（仅在后端提供 Unix 所有权时存在）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ownership {
    pub uid: u32,
    pub gid: u32,
}

/// 一次 stat 得到的只读快照，需要新数据时重新 stat
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
    /// 修改时间（Unix 秒）
    pub modified_time: i64,
    pub modified_nanos: u32,
    /// POSIX 权限位
    pub permissions: u32,
    pub owner: Option<Ownership>,
}

impl FileEntry {
    /// 文件名是否以 `.` 开头
    pub fn is_hidden(&self) -> bool {
        self.path
            .rsplit(['/', '\\'])
            .next()
            .is_some_and(|name| name.starts_with('.'))
    }
}

/// 传输后端：本地文件系统或 SFTP
///
/// 路径均为相对后端根目录、以 `/` 分隔的字符串，空字符串表示根目录本身。
#[async_trait]
pub trait Storage: Send + Sync {
    /// 创建目录及缺失的上级目录，已存在时不报错
    async fn ensure_dir(&self, path: &str) -> Result<()>;

    /// 获取元数据，不存在时返回 `None`
    async fn stat(&self, path: &str) -> Result<Option<FileEntry>>;

    /// 创建（或截断）文件并写入 reader 的全部内容，返回写入字节数
    async fn create_and_copy_into(
        &self,
        path: &str,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<u64>;

    async fn set_permissions(&self, path: &str, mode: u32) -> Result<()>;

    /// 将修改时间设置为 `source` 的修改时间
    async fn set_modified(&self, path: &str, source: &FileEntry) -> Result<()>;

    async fn set_owner(&self, path: &str, owner: Ownership) -> Result<()>;

    /// 是否同步所有者
    fn supports_ownership(&self) -> bool {
        false
    }

    /// 关闭底层会话
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// 获取存储名称（用于日志）
    fn name(&self) -> &str;
}

/// 根据选项创建目标存储，整次同步只创建一次
pub async fn create_storage(options: &SyncOptions) -> Result<Arc<dyn Storage>, SyncError> {
    match &options.remote {
        Some(remote) => {
            tracing::info!(
                "初始化 SFTP 存储: {}@{}:{}{}",
                remote.username,
                remote.host,
                remote.port,
                options.destination
            );
            let storage = SftpStorage::connect(remote, &options.destination).await?;
            Ok(Arc::new(storage) as Arc<dyn Storage>)
        }
        None => {
            tracing::info!("初始化本地存储: {}", options.destination);
            Ok(Arc::new(LocalStorage::new(&options.destination)) as Arc<dyn Storage>)
        }
    }
}

/// 拼接相对路径
pub fn join_path(parent: &str, name: &str) -> String {
    let parent = parent.trim_end_matches('/');
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}
