pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod storage;

pub use config::{HostKeyPolicy, RemoteConfig, SyncOptions};
pub use core::{SyncEngine, SyncEvent, SyncReport, SyncStatus};
pub use error::{Result, SyncError};
pub use storage::{FileEntry, Ownership, Storage};

// 平台配置目录，避免引入 dirs 依赖
pub mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            // Linux
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config"))
        }
    }
}
