use crate::error::SyncError;
use crate::storage::{FileEntry, Fingerprint, Storage};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info};

/// 清点结果：相对路径 → 条目，覆盖一个目录对的一侧
pub type Inventory = HashMap<String, FileEntry>;

/// 指纹保真模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FidelityMode {
    /// 完整内容哈希，权威（默认）
    Hash,
    /// 大小+修改时间代理。用正确性换速度，须显式开启
    Fast,
}

/// 计算内容的 BLAKE3 哈希（十六进制）
pub fn content_hash(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// 扫描器配置
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub fidelity: FidelityMode,
    /// 排除规则（glob patterns）
    pub exclude_patterns: Vec<String>,
    /// 最大文件大小（0 表示不限制）
    pub max_file_size: u64,
    /// 哈希计算并发数
    pub hash_concurrency: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            fidelity: FidelityMode::Hash,
            exclude_patterns: vec![
                ".git/**".to_string(),
                ".svn/**".to_string(),
                ".DS_Store".to_string(),
                "Thumbs.db".to_string(),
                "*.tmp".to_string(),
                "*.part".to_string(),
                "~*".to_string(),
            ],
            max_file_size: 0,
            hash_concurrency: 8,
        }
    }
}

/// 预编译的排除规则
#[derive(Debug, Clone)]
enum ExcludePattern {
    /// `a/**/b` 形式：前缀 + 后缀约束
    Bounded { prefix: String, suffix: String },
    /// 含 `*` 的一般模式
    Wildcard(Regex),
    /// 精确文件名或路径
    Exact(String),
}

impl ExcludePattern {
    fn compile(pattern: &str) -> Option<Self> {
        let pattern = pattern.to_lowercase();

        if let Some((prefix, suffix)) = pattern.split_once("**") {
            // 保留前缀的结尾斜杠，`.git/**` 不应吞掉 `.gitignore`
            return Some(ExcludePattern::Bounded {
                prefix: prefix.to_string(),
                suffix: suffix.trim_start_matches('/').to_string(),
            });
        }

        if pattern.contains('*') {
            let escaped = regex::escape(&pattern).replace("\\*", ".*");
            return Regex::new(&format!("^{}$", escaped))
                .ok()
                .map(ExcludePattern::Wildcard);
        }

        Some(ExcludePattern::Exact(pattern))
    }

    fn matches(&self, path: &str) -> bool {
        match self {
            ExcludePattern::Bounded { prefix, suffix } => {
                (prefix.is_empty() || path.starts_with(prefix.as_str()))
                    && (suffix.is_empty() || path.ends_with(suffix.as_str()))
            }
            ExcludePattern::Wildcard(re) => {
                // 模式对整条路径或最后一段生效
                re.is_match(path)
                    || path
                        .rsplit('/')
                        .next()
                        .map(|name| re.is_match(name))
                        .unwrap_or(false)
            }
            ExcludePattern::Exact(p) => path == p || path.ends_with(&format!("/{}", p)),
        }
    }
}

/// 清点扫描器：把一侧存储的列举结果整理成 Inventory
///
/// 只读，不产生任何副作用；本地侧在 Hash 模式下会读文件内容计算指纹。
pub struct InventoryScanner {
    config: ScanConfig,
    excludes: Vec<ExcludePattern>,
    cancel_flag: Option<Arc<AtomicBool>>,
}

impl InventoryScanner {
    pub fn new(config: ScanConfig) -> Self {
        let excludes = config
            .exclude_patterns
            .iter()
            .filter_map(|p| ExcludePattern::compile(p))
            .collect();
        Self {
            config,
            excludes,
            cancel_flag: None,
        }
    }

    pub fn with_cancel(mut self, cancel_flag: Arc<AtomicBool>) -> Self {
        self.cancel_flag = Some(cancel_flag);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_flag
            .as_ref()
            .map(|f| f.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    fn should_exclude(&self, path: &str) -> bool {
        let path = path.to_lowercase();
        self.excludes.iter().any(|p| p.matches(&path))
    }

    /// 扫描一侧存储，产出 Inventory
    ///
    /// 任何列举或读取失败都会使整侧扫描失败，不做部分清点。
    pub async fn scan(
        &self,
        storage: Arc<dyn Storage>,
        side: &'static str,
    ) -> Result<Inventory, SyncError> {
        if self.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        info!("开始扫描{}: {}", side, storage.name());

        let files = storage
            .list_files(None)
            .await
            .map_err(|source| SyncError::Scan { side, source })?;

        if self.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let mut inventory = Inventory::new();
        let mut excluded_count = 0usize;
        let mut dir_count = 0usize;

        for file in files {
            // 目录条目不参与差异对比
            if file.is_dir {
                dir_count += 1;
                continue;
            }

            if self.should_exclude(&file.path) {
                debug!("排除文件: {}", file.path);
                excluded_count += 1;
                continue;
            }

            if self.config.max_file_size > 0 && file.size > self.config.max_file_size {
                debug!("跳过大文件: {} ({})", file.path, file.size);
                excluded_count += 1;
                continue;
            }

            inventory.insert(file.path.clone(), file);
        }

        if self.config.fidelity == FidelityMode::Hash {
            self.upgrade_fingerprints(storage.clone(), &mut inventory, side)
                .await?;
        }

        info!(
            "扫描{}完成: {} 个文件, {} 个目录, {} 个被排除",
            side,
            inventory.len(),
            dir_count,
            excluded_count
        );

        Ok(inventory)
    }

    /// 把 Meta 代理指纹升级为内容哈希（仅本地条目会带 Meta 指纹）
    async fn upgrade_fingerprints(
        &self,
        storage: Arc<dyn Storage>,
        inventory: &mut Inventory,
        side: &'static str,
    ) -> Result<(), SyncError> {
        let to_hash: Vec<String> = inventory
            .values()
            .filter(|e| matches!(e.fingerprint, Fingerprint::Meta { .. }))
            .map(|e| e.path.clone())
            .collect();

        if to_hash.is_empty() {
            return Ok(());
        }

        debug!("计算 {} 个文件的内容哈希...", to_hash.len());

        let semaphore = Arc::new(Semaphore::new(self.config.hash_concurrency.max(1)));
        let mut handles = Vec::with_capacity(to_hash.len());

        for path in to_hash {
            if self.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore closed");
            let storage = storage.clone();

            let handle = tokio::spawn(async move {
                let result = storage.read(&path).await.map(|data| content_hash(&data));
                drop(permit);
                (path, result)
            });
            handles.push(handle);
        }

        for handle in handles {
            let (path, result) = handle
                .await
                .map_err(|e| SyncError::Scan {
                    side,
                    source: crate::error::StorageError::Io(std::io::Error::other(e)),
                })?;
            let hash = result.map_err(|source| SyncError::Scan { side, source })?;
            if let Some(entry) = inventory.get_mut(&path) {
                entry.fingerprint = Fingerprint::ContentHash(hash);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStorage;

    fn scanner(fidelity: FidelityMode) -> InventoryScanner {
        InventoryScanner::new(ScanConfig {
            fidelity,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn hash_mode_upgrades_local_fingerprints() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();

        let storage: Arc<dyn Storage> = Arc::new(LocalStorage::new(dir.path()));
        let inventory = scanner(FidelityMode::Hash)
            .scan(storage, "本地")
            .await
            .unwrap();

        let entry = &inventory["a.txt"];
        assert_eq!(
            entry.fingerprint,
            Fingerprint::ContentHash(content_hash(b"hello"))
        );
    }

    #[tokio::test]
    async fn fast_mode_keeps_meta_fingerprints() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();

        let storage: Arc<dyn Storage> = Arc::new(LocalStorage::new(dir.path()));
        let inventory = scanner(FidelityMode::Fast)
            .scan(storage, "本地")
            .await
            .unwrap();

        assert!(matches!(
            inventory["a.txt"].fingerprint,
            Fingerprint::Meta { size: 5, .. }
        ));
    }

    #[tokio::test]
    async fn directories_are_not_inventoried() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/a.txt"), b"x").unwrap();

        let storage: Arc<dyn Storage> = Arc::new(LocalStorage::new(dir.path()));
        let inventory = scanner(FidelityMode::Fast)
            .scan(storage, "本地")
            .await
            .unwrap();

        assert!(inventory.contains_key("sub/a.txt"));
        assert!(!inventory.contains_key("sub"));
    }

    #[tokio::test]
    async fn exclude_patterns_filter_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".git/objects")).unwrap();
        std::fs::write(dir.path().join(".git/objects/abc"), b"x").unwrap();
        std::fs::write(dir.path().join("keep.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("scratch.tmp"), b"x").unwrap();

        let storage: Arc<dyn Storage> = Arc::new(LocalStorage::new(dir.path()));
        let inventory = scanner(FidelityMode::Fast)
            .scan(storage, "本地")
            .await
            .unwrap();

        assert!(inventory.contains_key("keep.txt"));
        assert!(!inventory.contains_key(".git/objects/abc"));
        assert!(!inventory.contains_key("scratch.tmp"));
    }

    #[tokio::test]
    async fn missing_root_aborts_scan() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let storage: Arc<dyn Storage> = Arc::new(LocalStorage::new(&missing));

        let result = scanner(FidelityMode::Fast).scan(storage, "本地").await;
        assert!(matches!(result, Err(SyncError::Scan { .. })));
    }

    #[test]
    fn wildcard_pattern_matches_file_names() {
        let pattern = ExcludePattern::compile("*.tmp").unwrap();
        assert!(pattern.matches("a.tmp"));
        assert!(pattern.matches("deep/nested/b.tmp"));
        assert!(!pattern.matches("a.txt"));
    }

    #[test]
    fn bounded_pattern_matches_subtree() {
        let pattern = ExcludePattern::compile(".git/**").unwrap();
        assert!(pattern.matches(".git/objects/abc"));
        assert!(!pattern.matches("src/main.rs"));
        assert!(!pattern.matches(".gitignore"));
    }
}
