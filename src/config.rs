//! 应用配置模块
//!
//! `config.json` 中按段存放配置（`log`、`remote`、`sync`），缺失或损坏的段回退到默认值。

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// 远程主机密钥校验策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// 主机密钥必须已存在于 known_hosts
    #[default]
    Strict,
    /// 未知主机写入 known_hosts，密钥变化仍然拒绝
    AcceptNew,
    /// 不校验（仅用于测试环境）
    AcceptAny,
}

/// 远程连接配置，三个必填字段齐全时才会构造
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub host: String,
    pub username: String,
    pub ssh_key_path: PathBuf,
    pub port: u16,
    pub host_key_policy: HostKeyPolicy,
    pub known_hosts: Option<PathBuf>,
}

impl RemoteConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>, ssh_key_path: impl Into<PathBuf>) -> Self {
        let defaults = RemoteDefaults::default();
        Self {
            host: host.into(),
            username: username.into(),
            ssh_key_path: ssh_key_path.into(),
            port: defaults.port,
            host_key_policy: defaults.host_key_policy,
            known_hosts: defaults.known_hosts,
        }
    }

    pub fn with_defaults(mut self, defaults: &RemoteDefaults) -> Self {
        self.port = defaults.port;
        self.host_key_policy = defaults.host_key_policy;
        self.known_hosts = defaults.known_hosts.clone();
        self
    }
}

/// 单次同步的选项，由 CLI 构造后传入引擎
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// 源文件或目录（本地）
    pub source: PathBuf,
    /// 目标路径（本地路径或远程主机上的路径）
    pub destination: String,
    pub recursive: bool,
    pub verbose: bool,
    /// 包含以 `.` 开头的文件和目录
    pub hidden: bool,
    /// 存在时使用 SFTP 后端
    pub remote: Option<RemoteConfig>,
    /// 同一目录内并发传输的文件数
    pub jobs: usize,
}

impl SyncOptions {
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            recursive: false,
            verbose: false,
            hidden: false,
            remote: None,
            jobs: default_jobs(),
        }
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn hidden(mut self, hidden: bool) -> Self {
        self.hidden = hidden;
        self
    }

    pub fn jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    /// 仅当 host、username、密钥路径都存在时选择远程后端
    pub fn with_remote(
        mut self,
        host: Option<String>,
        username: Option<String>,
        ssh_key_path: Option<PathBuf>,
        defaults: &RemoteDefaults,
    ) -> Self {
        self.remote = match (host, username, ssh_key_path) {
            (Some(host), Some(username), Some(key)) => {
                Some(RemoteConfig::new(host, username, key).with_defaults(defaults))
            }
            _ => None,
        };
        self
    }

    pub fn is_remote(&self) -> bool {
        self.remote.is_some()
    }
}

/// 远程连接的默认值（`remote` 段）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDefaults {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,
    #[serde(default)]
    pub known_hosts: Option<PathBuf>,
}

fn default_port() -> u16 {
    22
}

impl Default for RemoteDefaults {
    fn default() -> Self {
        Self {
            port: default_port(),
            host_key_policy: HostKeyPolicy::default(),
            known_hosts: None,
        }
    }
}

impl RemoteDefaults {
    pub fn load(config_dir: &Path) -> Self {
        load_section(config_dir, "remote")
    }

    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        save_section(config_dir, "remote", self)
    }
}

/// 同步默认值（`sync` 段）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDefaults {
    #[serde(default = "default_jobs")]
    pub jobs: usize,
}

fn default_jobs() -> usize {
    1
}

impl Default for SyncDefaults {
    fn default() -> Self {
        Self { jobs: default_jobs() }
    }
}

impl SyncDefaults {
    pub fn load(config_dir: &Path) -> Self {
        load_section(config_dir, "sync")
    }

    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        save_section(config_dir, "sync", self)
    }
}

/// 应用配置目录
pub fn app_config_dir() -> PathBuf {
    crate::dirs::config_dir()
        .map(|p| p.join("treesync"))
        .unwrap_or_else(|| PathBuf::from(".treesync"))
}

/// 从 config.json 读取指定段，失败时返回默认值
pub(crate) fn load_section<T: DeserializeOwned + Default>(config_dir: &Path, key: &str) -> T {
    let config_file = config_dir.join("config.json");
    fs::read_to_string(&config_file)
        .ok()
        .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
        .and_then(|config| config.get(key).cloned())
        .and_then(|section| serde_json::from_value::<T>(section).ok())
        .unwrap_or_default()
}

/// 更新 config.json 中的指定段，保留其他段
pub(crate) fn save_section<T: Serialize>(config_dir: &Path, key: &str, value: &T) -> io::Result<()> {
    fs::create_dir_all(config_dir)?;
    let config_file = config_dir.join("config.json");

    // 读取现有配置
    let mut config: serde_json::Value = if config_file.exists() {
        let content = fs::read_to_string(&config_file)?;
        serde_json::from_str(&content).unwrap_or_else(|_| serde_json::json!({}))
    } else {
        serde_json::json!({})
    };

    config[key] = serde_json::to_value(value)?;

    fs::write(&config_file, serde_json::to_string_pretty(&config)?)
}
