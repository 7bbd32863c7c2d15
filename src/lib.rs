pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod storage;

pub use config::{AppConfig, S3Settings, SyncOptions, SyncPair};
pub use crate::core::{EngineConfig, FidelityMode, SyncEngine, SyncResult, SyncStatus};
pub use error::{StorageError, SyncError};
pub use storage::{FileEntry, Fingerprint, Storage};

/// 平台相关的默认目录
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

    /// 默认状态目录：存放各目录对的同步清单
    pub fn state_dir() -> PathBuf {
        config_dir()
            .map(|p| p.join("bucketsync"))
            .unwrap_or_else(|| PathBuf::from(".bucketsync"))
    }
}
