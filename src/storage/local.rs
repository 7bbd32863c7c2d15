use super::{FileEntry, FileMeta, Fingerprint, Storage};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use walkdir::WalkDir;

/// 本地目录存储
///
/// 列举产生 `Meta` 指纹；是否升级为内容哈希由扫描器按保真模式决定。
pub struct LocalStorage {
    base_path: PathBuf,
    name: String,
}

impl LocalStorage {
    pub fn new(path: &Path) -> Self {
        let name = format!("local:{}", path.display());
        Self {
            base_path: path.to_path_buf(),
            name,
        }
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        let path = path.trim_start_matches('/').trim_start_matches('\\');
        if path.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(path)
        }
    }

    /// 规范化路径分隔符（统一使用 /）
    fn normalize_path(path: &str) -> String {
        path.replace('\\', "/")
    }

    fn mtime_seconds(metadata: &std::fs::Metadata) -> std::io::Result<i64> {
        let modified = metadata.modified()?;
        let secs = modified
            .duration_since(std::time::UNIX_EPOCH)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?
            .as_secs();
        Ok(secs as i64)
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn list_files(&self, prefix: Option<&str>) -> StorageResult<Vec<FileEntry>> {
        let base = prefix.map_or_else(|| self.base_path.clone(), |p| self.resolve_path(p));

        if !base.exists() {
            return Err(StorageError::NotFound(base.display().to_string()));
        }

        let base_path = self.base_path.clone();

        // walkdir 是阻塞枚举，放到 spawn_blocking 避免卡住 runtime。
        // 枚举错误（权限不足等）直接使整次扫描失败，不做部分清点。
        let entries: StorageResult<Vec<FileEntry>> = tokio::task::spawn_blocking(move || {
            let mut files = Vec::new();
            for entry in WalkDir::new(&base).follow_links(false) {
                let entry = entry.map_err(|e| StorageError::Io(e.into()))?;
                let metadata = entry.metadata().map_err(|e| StorageError::Io(e.into()))?;

                // 只清点普通文件和目录，跳过符号链接等
                if !metadata.is_file() && !metadata.is_dir() {
                    continue;
                }

                let relative_path = match entry.path().strip_prefix(&base_path) {
                    Ok(p) => p.to_string_lossy().to_string(),
                    Err(_) => continue,
                };

                // 跳过根目录本身
                if relative_path.is_empty() {
                    continue;
                }

                let size = if metadata.is_dir() { 0 } else { metadata.len() };
                let modified = Self::mtime_seconds(&metadata)?;

                files.push(FileEntry {
                    path: Self::normalize_path(&relative_path),
                    size,
                    modified_time: modified,
                    is_dir: metadata.is_dir(),
                    fingerprint: Fingerprint::Meta {
                        size,
                        modified_time: modified,
                    },
                });
            }
            Ok(files)
        })
        .await
        .map_err(|e| StorageError::Io(std::io::Error::other(e)))?;

        entries
    }

    async fn stat(&self, path: &str) -> StorageResult<Option<FileMeta>> {
        let full_path = self.resolve_path(path);

        match fs::metadata(&full_path).await {
            Ok(metadata) => {
                let modified = Self::mtime_seconds(&metadata)?;
                Ok(Some(FileMeta {
                    size: if metadata.is_dir() { 0 } else { metadata.len() },
                    modified_time: modified,
                    is_dir: metadata.is_dir(),
                    etag: None,
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                Err(StorageError::PermissionDenied(full_path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read(&self, path: &str) -> StorageResult<Vec<u8>> {
        let full_path = self.resolve_path(path);
        match fs::read(&full_path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(full_path.display().to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                Err(StorageError::PermissionDenied(full_path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, path: &str, data: Vec<u8>) -> StorageResult<()> {
        let full_path = self.resolve_path(path);

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // 先写临时文件再原子重命名，最终路径上不会出现半写状态
        let file_name = full_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| StorageError::InvalidConfig(format!("非法写入路径: {:?}", path)))?;
        let temp_path = full_path.with_file_name(format!("{}.part", file_name));

        fs::write(&temp_path, data).await?;
        if let Err(e) = fs::rename(&temp_path, &full_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        Ok(())
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        let full_path = self.resolve_path(path);

        if !full_path.exists() {
            return Ok(());
        }

        if full_path.is_dir() {
            fs::remove_dir_all(&full_path).await?;
        } else {
            fs::remove_file(&full_path).await?;
        }

        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
