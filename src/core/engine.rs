use crate::config::SyncOptions;
use crate::core::fingerprint;
use crate::core::metadata;
use crate::core::scanner::{FileScanner, ScanConfig};
use crate::error::SyncError;
use crate::storage::{create_storage, join_path, local, FileEntry, Storage};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// 同步状态
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Completed,
    Failed,
}

/// 同步报告
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub start_time: i64,
    pub end_time: i64,
    pub duration: u64,
    pub status: SyncStatus,
    pub dirs_synced: u32,
    pub files_copied: u32,
    pub files_skipped: u32,
    pub files_failed: u32,
    pub bytes_transferred: u64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl SyncReport {
    pub fn is_success(&self) -> bool {
        self.status == SyncStatus::Completed
    }
}

/// 同步过程中的进度事件
#[derive(Debug, Clone)]
pub enum SyncEvent {
    DirectoryEntered { source: PathBuf, dest: String },
    FileCopied { source: PathBuf, dest: String, bytes: u64 },
    FileSkipped { source: PathBuf, dest: String },
    Warning { message: String },
    Failed { message: String },
}

impl fmt::Display for SyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncEvent::DirectoryEntered { source, dest } => {
                write!(f, "同步目录: {} -> {}", source.display(), display_dest(dest))
            }
            SyncEvent::FileCopied { source, dest, bytes } => {
                write!(f, "已复制: {} -> {} ({} 字节)", source.display(), dest, bytes)
            }
            SyncEvent::FileSkipped { source, .. } => {
                write!(f, "文件未变化，跳过: {}", source.display())
            }
            SyncEvent::Warning { message } => write!(f, "警告: {}", message),
            SyncEvent::Failed { message } => write!(f, "失败: {}", message),
        }
    }
}

fn display_dest(dest: &str) -> &str {
    if dest.is_empty() {
        "."
    } else {
        dest
    }
}

/// 传输统计
#[derive(Debug, Default)]
struct TransferStats {
    dirs_synced: AtomicU64,
    files_copied: AtomicU64,
    files_skipped: AtomicU64,
    files_failed: AtomicU64,
    bytes_transferred: AtomicU64,
}

/// 一次运行内所有任务共享的状态
struct RunContext {
    storage: Arc<dyn Storage>,
    events: Option<mpsc::Sender<SyncEvent>>,
    verbose: bool,
    stats: TransferStats,
    errors: Mutex<Vec<String>>,
    warnings: Mutex<Vec<String>>,
}

impl RunContext {
    async fn emit(&self, event: SyncEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }

    /// 进度事件只在 verbose 模式下发送
    async fn progress(&self, event: SyncEvent) {
        if self.verbose {
            self.emit(event).await;
        }
    }

    async fn fail(&self, err: SyncError) {
        let message = err.to_string();
        error!("{}", message);
        self.errors.lock().await.push(message.clone());
        self.emit(SyncEvent::Failed { message }).await;
    }

    async fn warn_all(&self, warnings: Vec<SyncError>) {
        for w in warnings {
            let message = w.to_string();
            self.warnings.lock().await.push(message.clone());
            self.emit(SyncEvent::Warning { message }).await;
        }
    }
}

/// 待同步的目录
struct DirTask {
    source: PathBuf,
    dest: String,
}

/// 同步引擎
pub struct SyncEngine {
    options: SyncOptions,
    storage: Arc<dyn Storage>,
    events: Option<mpsc::Sender<SyncEvent>>,
}

impl SyncEngine {
    pub fn new(options: SyncOptions, storage: Arc<dyn Storage>) -> Self {
        Self {
            options,
            storage,
            events: None,
        }
    }

    pub fn with_events(mut self, events: Option<mpsc::Sender<SyncEvent>>) -> Self {
        self.events = events;
        self
    }

    /// 校验源路径并按选项建立目标后端
    pub async fn connect(options: SyncOptions) -> Result<Self, SyncError> {
        check_source(&options.source).await?;
        let storage = create_storage(&options).await?;
        Ok(Self::new(options, storage))
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// 运行一次完整同步
    ///
    /// 源路径错误直接返回 `Err`；单个文件或目录的失败汇总到报告中，不中断同步。
    pub async fn run(&self) -> Result<SyncReport, SyncError> {
        let start_time = chrono::Utc::now().timestamp();
        let source_entry = check_source(&self.options.source).await?;

        info!(
            "开始同步: {} -> {} (recursive={}, hidden={})",
            self.options.source.display(),
            self.storage.name(),
            self.options.recursive,
            self.options.hidden
        );

        let ctx = Arc::new(RunContext {
            storage: self.storage.clone(),
            events: self.events.clone(),
            verbose: self.options.verbose,
            stats: TransferStats::default(),
            errors: Mutex::new(Vec::new()),
            warnings: Mutex::new(Vec::new()),
        });

        if source_entry.is_dir {
            self.sync_tree(&ctx).await;
        } else {
            self.sync_single_file(&ctx).await?;
        }

        let report = Self::build_report(&ctx, start_time).await;
        info!(
            "同步完成: 复制 {}, 跳过 {}, 失败 {}, {} 字节",
            report.files_copied, report.files_skipped, report.files_failed, report.bytes_transferred
        );
        Ok(report)
    }

    /// 关闭后端会话
    pub async fn close(&self) {
        if let Err(e) = self.storage.close().await {
            warn!("关闭存储失败: {:#}", e);
        }
    }

    /// 单文件模式：目标为 destination/源文件名
    async fn sync_single_file(&self, ctx: &Arc<RunContext>) -> Result<(), SyncError> {
        let source = self.options.source.clone();
        let name = source
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| SyncError::Path {
                path: source.clone(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "无法获取文件名"),
            })?;

        if let Err(e) = ctx.storage.ensure_dir("").await {
            ctx.fail(SyncError::transfer(".", e)).await;
            return Ok(());
        }

        Self::sync_file(ctx, source, name).await;
        Ok(())
    }

    /// 目录模式：显式栈做深度优先先序遍历
    async fn sync_tree(&self, ctx: &Arc<RunContext>) {
        let scanner = FileScanner::new(ScanConfig {
            recursive: self.options.recursive,
            include_hidden: self.options.hidden,
        });
        let semaphore = Arc::new(Semaphore::new(self.options.jobs.max(1)));

        let mut stack = vec![DirTask {
            source: self.options.source.clone(),
            dest: String::new(),
        }];
        let mut synced_dirs = Vec::new();

        while let Some(dir) = stack.pop() {
            ctx.progress(SyncEvent::DirectoryEntered {
                source: dir.source.clone(),
                dest: dir.dest.clone(),
            })
            .await;

            // 目录创建失败时跳过整个子树
            if let Err(e) = ctx.storage.ensure_dir(&dir.dest).await {
                ctx.fail(SyncError::transfer(display_dest(&dir.dest), e)).await;
                continue;
            }

            let listing = match scanner.scan_dir(&dir.source).await {
                Ok(listing) => listing,
                Err(e) => {
                    ctx.fail(SyncError::transfer(dir.source.display().to_string(), e))
                        .await;
                    continue;
                }
            };
            ctx.stats.dirs_synced.fetch_add(1, Ordering::Relaxed);

            for (path, e) in listing.errors {
                ctx.stats.files_failed.fetch_add(1, Ordering::Relaxed);
                ctx.fail(SyncError::transfer(path.display().to_string(), e)).await;
            }

            debug!(
                "目录 {}: {} 个文件, {} 个子目录, {} 个被排除",
                dir.source.display(),
                listing.files.len(),
                listing.dirs.len(),
                listing.excluded
            );

            let mut tasks = JoinSet::new();
            for file in listing.files {
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                let ctx = ctx.clone();
                let dest = join_path(&dir.dest, &file.name);
                tasks.spawn(async move {
                    Self::sync_file(&ctx, file.source, dest).await;
                    drop(permit);
                });
            }

            // 子目录调度前等待本目录的文件全部完成
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    ctx.stats.files_failed.fetch_add(1, Ordering::Relaxed);
                    ctx.fail(SyncError::transfer(dir.source.display().to_string(), e))
                        .await;
                }
            }

            // 逆序压栈，出栈顺序与列目录顺序一致
            for sub in listing.dirs.into_iter().rev() {
                stack.push(DirTask {
                    dest: join_path(&dir.dest, &sub.name),
                    source: sub.source,
                });
            }
            synced_dirs.push(dir);
        }

        // 先序的逆序保证子目录先于父目录设置修改时间
        for dir in synced_dirs.iter().rev() {
            let warnings =
                metadata::preserve_directory(&dir.source, ctx.storage.as_ref(), &dir.dest).await;
            ctx.warn_all(warnings).await;
        }
    }

    /// 比较指纹，需要时复制并保留元数据
    async fn sync_file(ctx: &RunContext, source: PathBuf, dest: String) {
        let source_fp = match fingerprint::local_delta(&source).await {
            Ok(Some(fp)) => fp,
            Ok(None) => {
                ctx.stats.files_failed.fetch_add(1, Ordering::Relaxed);
                ctx.fail(SyncError::transfer(
                    dest,
                    anyhow::anyhow!("源文件已不存在: {}", source.display()),
                ))
                .await;
                return;
            }
            Err(e) => {
                ctx.stats.files_failed.fetch_add(1, Ordering::Relaxed);
                ctx.fail(SyncError::transfer(dest, e)).await;
                return;
            }
        };

        match fingerprint::delta(ctx.storage.as_ref(), &dest).await {
            Ok(Some(dest_fp)) if dest_fp == source_fp => {
                debug!("文件未变化，跳过: {}", dest);
                ctx.stats.files_skipped.fetch_add(1, Ordering::Relaxed);
                ctx.progress(SyncEvent::FileSkipped { source, dest }).await;
                return;
            }
            // 目标不存在或指纹不同
            Ok(_) => {}
            Err(e) => {
                ctx.stats.files_failed.fetch_add(1, Ordering::Relaxed);
                ctx.fail(SyncError::transfer(dest, e)).await;
                return;
            }
        }

        match Self::copy_file(ctx.storage.as_ref(), &source, &dest).await {
            Ok(bytes) => {
                debug!("复制完成: {} -> {} ({} 字节)", source.display(), dest, bytes);
                ctx.stats.files_copied.fetch_add(1, Ordering::Relaxed);
                ctx.stats.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);

                let warnings = metadata::preserve_file(&source, ctx.storage.as_ref(), &dest).await;
                ctx.progress(SyncEvent::FileCopied {
                    source,
                    dest,
                    bytes,
                })
                .await;
                ctx.warn_all(warnings).await;
            }
            Err(e) => {
                ctx.stats.files_failed.fetch_add(1, Ordering::Relaxed);
                ctx.fail(e).await;
            }
        }
    }

    async fn copy_file(storage: &dyn Storage, source: &Path, dest: &str) -> Result<u64, SyncError> {
        let mut file = tokio::fs::File::open(source)
            .await
            .map_err(|e| SyncError::transfer(dest, e))?;
        storage
            .create_and_copy_into(dest, &mut file)
            .await
            .map_err(|e| SyncError::transfer(dest, e))
    }

    async fn build_report(ctx: &RunContext, start_time: i64) -> SyncReport {
        let end_time = chrono::Utc::now().timestamp();
        let errors = ctx.errors.lock().await.clone();
        let warnings = ctx.warnings.lock().await.clone();
        let status = if errors.is_empty() {
            SyncStatus::Completed
        } else {
            SyncStatus::Failed
        };

        SyncReport {
            start_time,
            end_time,
            duration: (end_time - start_time).max(0) as u64,
            status,
            dirs_synced: ctx.stats.dirs_synced.load(Ordering::Relaxed) as u32,
            files_copied: ctx.stats.files_copied.load(Ordering::Relaxed) as u32,
            files_skipped: ctx.stats.files_skipped.load(Ordering::Relaxed) as u32,
            files_failed: ctx.stats.files_failed.load(Ordering::Relaxed) as u32,
            bytes_transferred: ctx.stats.bytes_transferred.load(Ordering::Relaxed),
            errors,
            warnings,
        }
    }
}

/// 源路径必须存在且可 stat
async fn check_source(source: &Path) -> Result<FileEntry, SyncError> {
    let path_error = |e: std::io::Error| SyncError::Path {
        path: source.to_path_buf(),
        source: e,
    };
    local::stat_path(source)
        .await
        .map_err(path_error)?
        .ok_or_else(|| path_error(std::io::Error::from(std::io::ErrorKind::NotFound)))
}

/// 校验源路径、建立后端、同步并关闭会话
pub async fn run_sync(
    options: SyncOptions,
    events: Option<mpsc::Sender<SyncEvent>>,
) -> Result<SyncReport, SyncError> {
    let engine = SyncEngine::connect(options).await?.with_events(events);
    let result = engine.run().await;
    engine.close().await;
    result
}
