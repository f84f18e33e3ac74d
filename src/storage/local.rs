use super::{FileEntry, Ownership, Storage};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use filetime::FileTime;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};

pub struct LocalStorage {
    base_path: PathBuf,
    name: String,
}

impl LocalStorage {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let base_path = path.as_ref().to_path_buf();
        let name = format!("local:{}", base_path.display());
        Self { base_path, name }
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        let path = path.trim_start_matches('/').trim_start_matches('\\');
        if path.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(path)
        }
    }
}

/// stat 本地路径，不存在时返回 `None`
pub async fn stat_path(path: &Path) -> std::io::Result<Option<FileEntry>> {
    match fs::metadata(path).await {
        Ok(metadata) => Ok(Some(entry_from_metadata(
            path.to_string_lossy().into_owned(),
            &metadata,
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

pub(crate) fn entry_from_metadata(path: String, metadata: &Metadata) -> FileEntry {
    let mtime = FileTime::from_last_modification_time(metadata);
    FileEntry {
        path,
        size: if metadata.is_dir() { 0 } else { metadata.len() },
        is_dir: metadata.is_dir(),
        modified_time: mtime.unix_seconds(),
        modified_nanos: mtime.nanoseconds(),
        permissions: mode_bits(metadata),
        owner: ownership(metadata),
    }
}

#[cfg(unix)]
fn mode_bits(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_bits(metadata: &Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

#[cfg(unix)]
fn ownership(metadata: &Metadata) -> Option<Ownership> {
    use std::os::unix::fs::MetadataExt;
    Some(Ownership {
        uid: metadata.uid(),
        gid: metadata.gid(),
    })
}

#[cfg(not(unix))]
fn ownership(_metadata: &Metadata) -> Option<Ownership> {
    None
}

/// 与目标同目录的临时文件路径，保证 rename 不跨文件系统
fn temp_path_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{}.treesync-{}.tmp", name, std::process::id()))
}

async fn write_file(path: &Path, reader: &mut (dyn AsyncRead + Unpin + Send)) -> Result<u64> {
    let mut file = fs::File::create(path)
        .await
        .with_context(|| format!("创建文件失败: {}", path.display()))?;
    let bytes = tokio::io::copy(reader, &mut file).await?;
    file.flush().await?;
    // 返回前落盘
    file.sync_all().await?;
    Ok(bytes)
}

#[async_trait]
impl Storage for LocalStorage {
    async fn ensure_dir(&self, path: &str) -> Result<()> {
        let full_path = self.resolve_path(path);
        fs::create_dir_all(&full_path)
            .await
            .with_context(|| format!("创建目录失败: {}", full_path.display()))?;
        Ok(())
    }

    async fn stat(&self, path: &str) -> Result<Option<FileEntry>> {
        let full_path = self.resolve_path(path);
        Ok(stat_path(&full_path).await?.map(|mut entry| {
            entry.path = path.to_string();
            entry
        }))
    }

    async fn create_and_copy_into(
        &self,
        path: &str,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<u64> {
        let full_path = self.resolve_path(path);

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // 先写临时文件再替换，目标为只读时也能更新
        let tmp_path = temp_path_for(&full_path);
        match write_file(&tmp_path, reader).await {
            Ok(bytes) => {
                if let Err(e) = fs::rename(&tmp_path, &full_path).await {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(e).with_context(|| format!("替换文件失败: {}", full_path.display()));
                }
                Ok(bytes)
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp_path).await;
                Err(e)
            }
        }
    }

    async fn set_permissions(&self, path: &str, mode: u32) -> Result<()> {
        let full_path = self.resolve_path(path);

        #[cfg(unix)]
        let perms = {
            use std::os::unix::fs::PermissionsExt;
            std::fs::Permissions::from_mode(mode)
        };
        #[cfg(not(unix))]
        let perms = {
            let mut perms = fs::metadata(&full_path).await?.permissions();
            perms.set_readonly(mode & 0o200 == 0);
            perms
        };

        fs::set_permissions(&full_path, perms).await?;
        Ok(())
    }

    async fn set_modified(&self, path: &str, source: &FileEntry) -> Result<()> {
        let full_path = self.resolve_path(path);
        let mtime = FileTime::from_unix_time(source.modified_time, source.modified_nanos);
        tokio::task::spawn_blocking(move || filetime::set_file_mtime(&full_path, mtime)).await??;
        Ok(())
    }

    async fn set_owner(&self, path: &str, _owner: Ownership) -> Result<()> {
        bail!("本地存储不同步所有者: {}", path)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
