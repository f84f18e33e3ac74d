use crate::storage::{local, FileEntry};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// 目录扫描配置
#[derive(Debug, Clone, Default)]
pub struct ScanConfig {
    /// 是否进入子目录
    pub recursive: bool,
    /// 是否包含以 `.` 开头的文件和目录
    pub include_hidden: bool,
}

/// 扫描到的一个条目
#[derive(Debug, Clone)]
pub struct ScannedEntry {
    /// 目录内的名称
    pub name: String,
    pub source: PathBuf,
    pub info: FileEntry,
}

/// 单个目录的扫描结果
#[derive(Debug, Default)]
pub struct DirListing {
    pub files: Vec<ScannedEntry>,
    /// 需要继续同步的子目录（已按 recursive / hidden 过滤）
    pub dirs: Vec<ScannedEntry>,
    pub excluded: usize,
    /// 单个条目读取失败，不影响其他条目
    pub errors: Vec<(PathBuf, anyhow::Error)>,
}

/// 源目录扫描器，每次只列出一层
pub struct FileScanner {
    config: ScanConfig,
}

impl FileScanner {
    pub fn new(config: ScanConfig) -> Self {
        Self { config }
    }

    /// 检查条目是否应该被排除
    ///
    /// 隐藏规则作用于目录内的所有条目（文件和目录），显式传入的顶层源路径不受影响。
    fn should_exclude(&self, name: &str, is_dir: bool) -> bool {
        if !self.config.include_hidden && name.starts_with('.') {
            return true;
        }
        is_dir && !self.config.recursive
    }

    /// 按存储返回的顺序列出目录，不排序
    pub async fn scan_dir(&self, dir: &Path) -> Result<DirListing> {
        let mut reader = fs::read_dir(dir)
            .await
            .with_context(|| format!("读取目录失败: {}", dir.display()))?;
        let mut listing = DirListing::default();

        while let Some(entry) = reader
            .next_entry()
            .await
            .with_context(|| format!("读取目录失败: {}", dir.display()))?
        {
            let source = entry.path();
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                listing
                    .errors
                    .push((source, anyhow::anyhow!("文件名不是有效的 UTF-8")));
                continue;
            };

            // stat 跟随符号链接
            let info = match local::stat_path(&source).await {
                Ok(Some(info)) => info,
                Ok(None) => {
                    listing
                        .errors
                        .push((source, anyhow::anyhow!("条目已不存在或为失效链接")));
                    continue;
                }
                Err(e) => {
                    listing.errors.push((source, e.into()));
                    continue;
                }
            };

            if self.should_exclude(&name, info.is_dir) {
                debug!("排除: {}", source.display());
                listing.excluded += 1;
                continue;
            }

            let scanned = ScannedEntry { name, source, info };
            if scanned.info.is_dir {
                listing.dirs.push(scanned);
            } else {
                listing.files.push(scanned);
            }
        }

        Ok(listing)
    }
}
