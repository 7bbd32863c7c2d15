//! 同步清单：每个目录对上次成功收敛的快照
//!
//! 清单是区分「已删除」和「从未存在」的唯一依据，
//! 同时用于调和本地哈希与远端 ETag 这类跨类指纹。

use crate::storage::Fingerprint;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// 清单条目：上次收敛时双方各自的指纹
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub size: u64,
    pub modified_time: i64,
    pub local_fingerprint: Fingerprint,
    pub remote_fingerprint: Fingerprint,
}

/// 一个目录对的同步清单
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncManifest {
    pub entries: HashMap<String, ManifestEntry>,
    /// 最近一次保存时间（Unix 时间戳）
    pub updated_at: u64,
}

impl SyncManifest {
    pub fn get(&self, path: &str) -> Option<&ManifestEntry> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn insert(&mut self, path: String, entry: ManifestEntry) {
        self.entries.insert(path, entry);
    }

    pub fn remove(&mut self, path: &str) {
        self.entries.remove(path);
    }
}

/// 清单存储：状态目录下每个目录对一个 JSON 文件
pub struct ManifestStore {
    state_dir: PathBuf,
}

impl ManifestStore {
    pub fn new(state_dir: PathBuf) -> Self {
        // 确保状态目录存在
        let _ = std::fs::create_dir_all(&state_dir);
        Self { state_dir }
    }

    /// 目录对标识：本地根 + 远端 URI 的哈希。任一侧改名即开始新历史
    pub fn pair_key(local_root: &Path, remote_uri: &str) -> String {
        let identity = format!("{}\n{}", local_root.display(), remote_uri);
        blake3::hash(identity.as_bytes()).to_hex()[..16].to_string()
    }

    fn manifest_path(&self, pair_key: &str) -> PathBuf {
        self.state_dir.join(format!("{}.manifest.json", pair_key))
    }

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs()
    }

    /// 加载清单；缺失或损坏一律当作首次同步
    pub fn load(&self, pair_key: &str) -> Option<SyncManifest> {
        let path = self.manifest_path(pair_key);

        if !path.exists() {
            return None;
        }

        let data = match std::fs::read(&path) {
            Ok(d) => d,
            Err(e) => {
                warn!("读取清单失败，按首次同步处理: {:?} - {}", path, e);
                return None;
            }
        };

        match serde_json::from_slice::<SyncManifest>(&data) {
            Ok(manifest) => {
                debug!(
                    "加载清单: {} 个条目 (更新于 {})",
                    manifest.entries.len(),
                    manifest.updated_at
                );
                Some(manifest)
            }
            Err(e) => {
                // 清单损坏，删除后重新开始
                warn!("清单损坏，已清除: {:?} - {}", path, e);
                let _ = std::fs::remove_file(&path);
                None
            }
        }
    }

    /// 保存清单。先写临时文件再重命名，中断不会留下残缺清单
    pub fn save(&self, pair_key: &str, manifest: &SyncManifest) -> std::io::Result<()> {
        let mut manifest = manifest.clone();
        manifest.updated_at = Self::now();

        let path = self.manifest_path(pair_key);
        let temp_path = path.with_extension("json.part");

        let data = serde_json::to_vec_pretty(&manifest)?;
        std::fs::write(&temp_path, data)?;
        std::fs::rename(&temp_path, &path)?;

        info!("已保存清单: {} 个条目", manifest.entries.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> ManifestEntry {
        ManifestEntry {
            size: 5,
            modified_time: 100,
            local_fingerprint: Fingerprint::ContentHash("abc".to_string()),
            remote_fingerprint: Fingerprint::ETag("def".to_string()),
        }
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path().to_path_buf());

        let mut manifest = SyncManifest::default();
        manifest.insert("a.txt".to_string(), sample_entry());
        store.save("pair1", &manifest).unwrap();

        let loaded = store.load("pair1").unwrap();
        assert_eq!(loaded.entries.len(), 1);
        assert_eq!(loaded.get("a.txt"), Some(&sample_entry()));
        assert!(loaded.updated_at > 0);
    }

    #[test]
    fn load_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path().to_path_buf());
        assert!(store.load("missing").is_none());
    }

    #[test]
    fn corrupt_manifest_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path().to_path_buf());
        std::fs::write(dir.path().join("bad.manifest.json"), b"not json").unwrap();

        assert!(store.load("bad").is_none());
        assert!(!dir.path().join("bad.manifest.json").exists());
    }

    #[test]
    fn pair_key_is_stable_and_distinct() {
        let key1 = ManifestStore::pair_key(Path::new("/data/docs"), "bucket/docs");
        let key2 = ManifestStore::pair_key(Path::new("/data/docs"), "bucket/docs");
        let key3 = ManifestStore::pair_key(Path::new("/data/docs"), "bucket/other");

        assert_eq!(key1, key2);
        assert_ne!(key1, key3);
        assert_eq!(key1.len(), 16);
    }
}
