//! 元数据保留 - 复制完成后同步权限、修改时间和所有者
//!
//! 这里的失败都不影响复制结果，只以警告返回。

use crate::error::SyncError;
use crate::storage::{local, FileEntry, Storage};
use std::path::Path;
use tracing::warn;

pub async fn preserve_file(source: &Path, storage: &dyn Storage, dest: &str) -> Vec<SyncError> {
    preserve(source, storage, dest).await
}

/// 目录的修改时间要在其内容全部写入后再设置
pub async fn preserve_directory(source: &Path, storage: &dyn Storage, dest: &str) -> Vec<SyncError> {
    preserve(source, storage, dest).await
}

async fn preserve(source: &Path, storage: &dyn Storage, dest: &str) -> Vec<SyncError> {
    let entry = match local::stat_path(source).await {
        Ok(Some(entry)) => entry,
        Ok(None) => {
            return vec![SyncError::metadata(dest, format!("源路径已不存在: {}", source.display()))];
        }
        Err(e) => return vec![SyncError::metadata(dest, e)],
    };

    let warnings = apply(&entry, storage, dest).await;
    for w in &warnings {
        warn!("{}", w);
    }
    warnings
}

/// 将快照中的元数据应用到目标
pub async fn apply(entry: &FileEntry, storage: &dyn Storage, dest: &str) -> Vec<SyncError> {
    let mut warnings = Vec::new();

    if let Err(e) = storage.set_permissions(dest, entry.permissions).await {
        warnings.push(SyncError::metadata(dest, format!("设置权限失败: {:#}", e)));
    }

    // 本地后端不同步所有者，避免普通复制需要 root 权限
    if storage.supports_ownership() {
        if let Some(owner) = entry.owner {
            if let Err(e) = storage.set_owner(dest, owner).await {
                warnings.push(SyncError::metadata(dest, format!("设置所有者失败: {:#}", e)));
            }
        }
    }

    if let Err(e) = storage.set_modified(dest, entry).await {
        warnings.push(SyncError::metadata(dest, format!("设置修改时间失败: {:#}", e)));
    }

    warnings
}
