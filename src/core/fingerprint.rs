//! 文件指纹 - 基于元数据判断文件是否变化
//!
//! 指纹只由大小和修改时间（秒）计算，不读取文件内容。
//! 大小和修改时间都不变的内容修改不会被发现，这是有意接受的近似。

use crate::storage::{local, FileEntry, Storage};
use anyhow::Result;
use std::path::Path;

/// 计算文件指纹（纯函数）
pub fn fingerprint(entry: &FileEntry) -> String {
    let key = format!("{}:{}", entry.modified_time, entry.size);
    let hash = blake3::hash(key.as_bytes());
    // 只取前 16 字节（32 个十六进制字符），足够检测变化
    hash.to_hex()[..32].to_string()
}

/// 通过后端 stat 并计算指纹，不存在时返回 `None`
pub async fn delta(storage: &dyn Storage, path: &str) -> Result<Option<String>> {
    Ok(storage.stat(path).await?.map(|entry| fingerprint(&entry)))
}

/// 本地源文件的指纹
pub async fn local_delta(path: &Path) -> Result<Option<String>> {
    Ok(local::stat_path(path).await?.map(|entry| fingerprint(&entry)))
}
