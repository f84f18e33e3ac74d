use super::{FileEntry, Ownership, Storage};
use crate::config::{HostKeyPolicy, RemoteConfig};
use crate::error::SyncError;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::keys::ssh_key::PublicKey;
use russh::keys::{load_secret_key, PrivateKeyWithHashAlg};
use russh::Disconnect;
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, Status, StatusCode};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// 按 [`HostKeyPolicy`] 校验服务器主机密钥
struct HostKeyVerifier {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    known_hosts: Option<PathBuf>,
}

impl HostKeyVerifier {
    fn is_known(&self, key: &PublicKey) -> Result<bool, russh::Error> {
        let known = match &self.known_hosts {
            Some(path) => russh::keys::check_known_hosts_path(&self.host, self.port, key, path)?,
            None => russh::keys::check_known_hosts(&self.host, self.port, key)?,
        };
        Ok(known)
    }

    fn learn(&self, key: &PublicKey) -> Result<(), russh::Error> {
        match &self.known_hosts {
            Some(path) => russh::keys::known_hosts::learn_known_hosts_path(&self.host, self.port, key, path)?,
            None => russh::keys::known_hosts::learn_known_hosts(&self.host, self.port, key)?,
        }
        Ok(())
    }
}

impl client::Handler for HostKeyVerifier {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        match self.policy {
            HostKeyPolicy::AcceptAny => {
                warn!("未校验主机密钥: {}:{}", self.host, self.port);
                Ok(true)
            }
            HostKeyPolicy::Strict => self.is_known(server_public_key),
            HostKeyPolicy::AcceptNew => {
                if self.is_known(server_public_key)? {
                    return Ok(true);
                }
                info!("记录新主机密钥: {}:{}", self.host, self.port);
                self.learn(server_public_key)?;
                Ok(true)
            }
        }
    }
}

/// SFTP 存储，整次同步共用一个 SSH 连接和 SFTP 会话
pub struct SftpStorage {
    session: Handle<HostKeyVerifier>,
    sftp: SftpSession,
    root: String,
    /// 共享会话上的文件写入串行执行
    write_lock: Mutex<()>,
    name: String,
}

impl SftpStorage {
    /// 建立连接、公钥认证并打开 sftp 子系统
    pub async fn connect(remote: &RemoteConfig, root: &str) -> Result<Self, SyncError> {
        let fail = |stage: &str, err: &dyn std::fmt::Display| SyncError::Connection {
            host: format!("{}:{}", remote.host, remote.port),
            message: format!("{}: {}", stage, err),
        };

        let verifier = HostKeyVerifier {
            host: remote.host.clone(),
            port: remote.port,
            policy: remote.host_key_policy,
            known_hosts: remote.known_hosts.clone(),
        };

        let config = Arc::new(client::Config::default());
        let mut session = client::connect(config, (remote.host.as_str(), remote.port), verifier)
            .await
            .map_err(|e| fail("连接失败", &e))?;

        let key = load_secret_key(&remote.ssh_key_path, None)
            .map_err(|e| fail(&format!("读取私钥失败 {}", remote.ssh_key_path.display()), &e))?;
        let hash_alg = session
            .best_supported_rsa_hash()
            .await
            .map_err(|e| fail("协商签名算法失败", &e))?
            .flatten();

        let auth = session
            .authenticate_publickey(
                remote.username.as_str(),
                PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
            )
            .await
            .map_err(|e| fail("认证失败", &e))?;
        if !auth.success() {
            return Err(fail("认证失败", &format!("公钥被拒绝 (user={})", remote.username)));
        }

        let channel = session
            .channel_open_session()
            .await
            .map_err(|e| fail("打开通道失败", &e))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| fail("请求 sftp 子系统失败", &e))?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| fail("SFTP 初始化失败", &e))?;

        info!("SFTP 会话已建立: {}@{}:{}", remote.username, remote.host, remote.port);

        Ok(Self {
            session,
            sftp,
            root: root.to_string(),
            write_lock: Mutex::new(()),
            name: format!("sftp://{}@{}:{}/{}", remote.username, remote.host, remote.port, root.trim_start_matches('/')),
        })
    }

    fn resolve_path(&self, path: &str) -> String {
        remote_path(&self.root, path)
    }

    async fn is_dir(&self, full_path: &str) -> bool {
        self.sftp
            .metadata(full_path)
            .await
            .map(|attrs| attrs.is_dir())
            .unwrap_or(false)
    }
}

/// 拼接远程根目录与相对路径
fn remote_path(root: &str, path: &str) -> String {
    let path = path.trim_start_matches('/');
    let trimmed = root.trim_end_matches('/');
    match (trimmed.is_empty(), path.is_empty()) {
        (_, true) => root.to_string(),
        (true, false) if root.starts_with('/') => format!("/{}", path),
        (true, false) => path.to_string(),
        (false, false) => format!("{}/{}", trimmed, path),
    }
}

/// `a/b/c` 依次展开为 `a`、`a/b`、`a/b/c`，绝对路径保留前导 `/`
fn dir_prefixes(full_path: &str) -> Vec<String> {
    let mut current = if full_path.starts_with('/') {
        String::from("/")
    } else {
        String::new()
    };
    let mut prefixes = Vec::new();

    for part in full_path.split('/').filter(|p| !p.is_empty() && *p != ".") {
        if !current.is_empty() && !current.ends_with('/') {
            current.push('/');
        }
        current.push_str(part);
        prefixes.push(current.clone());
    }
    prefixes
}

/// 只读文件需要先加上属主写权限才能截断，之后由元数据保留恢复原权限
fn writable_mode(mode: u32) -> Option<u32> {
    (mode & 0o200 == 0).then_some((mode & 0o7777) | 0o200)
}

fn is_not_found(err: &SftpError) -> bool {
    matches!(
        err,
        SftpError::Status(Status {
            status_code: StatusCode::NoSuchFile,
            ..
        })
    )
}

fn entry_from_attributes(path: &str, attrs: &FileAttributes) -> FileEntry {
    let is_dir = attrs.is_dir();
    FileEntry {
        path: path.to_string(),
        size: if is_dir { 0 } else { attrs.size.unwrap_or(0) },
        is_dir,
        modified_time: attrs.mtime.map_or(0, i64::from),
        modified_nanos: 0,
        permissions: attrs.permissions.unwrap_or(0) & 0o7777,
        owner: match (attrs.uid, attrs.gid) {
            (Some(uid), Some(gid)) => Some(Ownership { uid, gid }),
            _ => None,
        },
    }
}

#[async_trait]
impl Storage for SftpStorage {
    async fn ensure_dir(&self, path: &str) -> Result<()> {
        for current in dir_prefixes(&self.resolve_path(path)) {
            match self.sftp.metadata(current.as_str()).await {
                Ok(attrs) if attrs.is_dir() => continue,
                Ok(_) => bail!("远程路径已存在且不是目录: {}", current),
                Err(e) if is_not_found(&e) => {
                    debug!("创建远程目录: {}", current);
                    if let Err(e) = self.sftp.create_dir(current.as_str()).await {
                        // 可能已被其他任务创建
                        if !self.is_dir(&current).await {
                            return Err(e).with_context(|| format!("创建远程目录失败: {}", current));
                        }
                    }
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("读取远程目录失败: {}", current));
                }
            }
        }

        Ok(())
    }

    async fn stat(&self, path: &str) -> Result<Option<FileEntry>> {
        match self.sftp.metadata(self.resolve_path(path)).await {
            Ok(attrs) => Ok(Some(entry_from_attributes(path, &attrs))),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_and_copy_into(
        &self,
        path: &str,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<u64> {
        if let Some((parent, _)) = path.rsplit_once('/') {
            self.ensure_dir(parent).await?;
        }

        let full_path = self.resolve_path(path);
        let _guard = self.write_lock.lock().await;

        if let Ok(attrs) = self.sftp.metadata(full_path.as_str()).await {
            if let Some(mode) = attrs.permissions.and_then(writable_mode) {
                let mut writable = FileAttributes::empty();
                writable.permissions = Some(mode);
                self.sftp
                    .set_metadata(full_path.as_str(), writable)
                    .await
                    .with_context(|| format!("解除远程文件只读失败: {}", full_path))?;
            }
        }

        let mut file = self
            .sftp
            .create(full_path.as_str())
            .await
            .with_context(|| format!("创建远程文件失败: {}", full_path))?;
        let bytes = tokio::io::copy(reader, &mut file).await?;
        file.flush().await?;
        file.shutdown().await?;

        Ok(bytes)
    }

    async fn set_permissions(&self, path: &str, mode: u32) -> Result<()> {
        let mut attrs = FileAttributes::empty();
        attrs.permissions = Some(mode);
        self.sftp.set_metadata(self.resolve_path(path), attrs).await?;
        Ok(())
    }

    async fn set_modified(&self, path: &str, source: &FileEntry) -> Result<()> {
        // SFTP v3 的时间为 32 位秒，atime 与 mtime 必须同时设置
        let mtime = u32::try_from(source.modified_time)
            .with_context(|| format!("修改时间超出 SFTP 范围: {}", source.modified_time))?;
        let atime = u32::try_from(chrono::Utc::now().timestamp()).unwrap_or(mtime);

        let mut attrs = FileAttributes::empty();
        attrs.atime = Some(atime);
        attrs.mtime = Some(mtime);
        self.sftp.set_metadata(self.resolve_path(path), attrs).await?;
        Ok(())
    }

    async fn set_owner(&self, path: &str, owner: Ownership) -> Result<()> {
        let mut attrs = FileAttributes::empty();
        attrs.uid = Some(owner.uid);
        attrs.gid = Some(owner.gid);
        self.sftp.set_metadata(self.resolve_path(path), attrs).await?;
        Ok(())
    }

    fn supports_ownership(&self) -> bool {
        true
    }

    async fn close(&self) -> Result<()> {
        if let Err(e) = self.sftp.close().await {
            debug!("关闭 SFTP 会话失败: {}", e);
        }
        self.session
            .disconnect(Disconnect::ByApplication, "sync finished", "en")
            .await?;
        info!("SFTP 连接已关闭: {}", self.name);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
