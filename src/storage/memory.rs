//! 内存存储：用于脱离磁盘和网络的引擎测试
//!
//! 模拟一个对象存储：列举产生 ETag 指纹（BLAKE3），
//! 并支持按路径注入失败和篡改，验证重试与校验逻辑。

use super::{FileEntry, FileMeta, Fingerprint, Storage};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

/// 注入的失败模式
#[derive(Debug, Clone)]
pub enum FailureMode {
    /// 瞬时失败 n 次后恢复
    Transient(u32),
    /// 永久失败
    Permanent,
}

#[derive(Debug, Clone)]
struct MemObject {
    data: Vec<u8>,
    modified_time: i64,
}

#[derive(Debug, Default)]
struct Faults {
    read_failures: HashMap<String, FailureMode>,
    write_failures: HashMap<String, FailureMode>,
    /// 写入时截断最后一个字节的剩余次数
    corrupt_writes: HashMap<String, u32>,
    /// 读取时截断最后一个字节的剩余次数
    corrupt_reads: HashMap<String, u32>,
}

/// 内存对象存储
#[derive(Debug)]
pub struct MemoryStorage {
    name: String,
    objects: RwLock<HashMap<String, MemObject>>,
    faults: RwLock<Faults>,
}

impl MemoryStorage {
    pub fn new(name: &str) -> Self {
        Self {
            name: format!("mem:{}", name),
            objects: RwLock::new(HashMap::new()),
            faults: RwLock::new(Faults::default()),
        }
    }

    /// 预置一个对象
    pub fn insert(&self, path: &str, data: &[u8], modified_time: i64) {
        self.objects.write().unwrap().insert(
            path.to_string(),
            MemObject {
                data: data.to_vec(),
                modified_time,
            },
        );
    }

    /// 读取当前内容（测试断言用）
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.objects.read().unwrap().get(path).map(|o| o.data.clone())
    }

    /// 当前所有路径（测试断言用）
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<_> = self.objects.read().unwrap().keys().cloned().collect();
        paths.sort();
        paths
    }

    /// 注入读取失败
    pub fn fail_reads(&self, path: &str, mode: FailureMode) {
        self.faults
            .write()
            .unwrap()
            .read_failures
            .insert(path.to_string(), mode);
    }

    /// 注入写入失败
    pub fn fail_writes(&self, path: &str, mode: FailureMode) {
        self.faults
            .write()
            .unwrap()
            .write_failures
            .insert(path.to_string(), mode);
    }

    /// 接下来 n 次写入该路径时截断内容，模拟传输损坏
    pub fn corrupt_writes(&self, path: &str, times: u32) {
        self.faults
            .write()
            .unwrap()
            .corrupt_writes
            .insert(path.to_string(), times);
    }

    /// 接下来 n 次读取该路径时截断内容，模拟传输损坏
    pub fn corrupt_reads(&self, path: &str, times: u32) {
        self.faults
            .write()
            .unwrap()
            .corrupt_reads
            .insert(path.to_string(), times);
    }

    fn etag(data: &[u8]) -> String {
        blake3::hash(data).to_hex().to_string()
    }

    /// 检查失败注入；瞬时失败递减计数
    fn check_failure(
        table: &mut HashMap<String, FailureMode>,
        path: &str,
    ) -> StorageResult<()> {
        match table.get_mut(path) {
            Some(FailureMode::Permanent) => Err(StorageError::PermissionDenied(path.to_string())),
            Some(FailureMode::Transient(remaining)) => {
                if *remaining == 0 {
                    table.remove(path);
                    return Ok(());
                }
                *remaining -= 1;
                Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("injected transient failure: {}", path),
                )))
            }
            None => Ok(()),
        }
    }

    fn take_corruption(table: &mut HashMap<String, u32>, path: &str) -> bool {
        match table.get_mut(path) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn list_files(&self, prefix: Option<&str>) -> StorageResult<Vec<FileEntry>> {
        let prefix = prefix.unwrap_or("");
        let objects = self.objects.read().unwrap();

        let mut files: Vec<FileEntry> = objects
            .iter()
            .filter(|(path, _)| path.starts_with(prefix))
            .map(|(path, obj)| FileEntry {
                path: path.clone(),
                size: obj.data.len() as u64,
                modified_time: obj.modified_time,
                is_dir: false,
                fingerprint: Fingerprint::ETag(Self::etag(&obj.data)),
            })
            .collect();

        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    async fn stat(&self, path: &str) -> StorageResult<Option<FileMeta>> {
        let objects = self.objects.read().unwrap();
        Ok(objects.get(path).map(|obj| FileMeta {
            size: obj.data.len() as u64,
            modified_time: obj.modified_time,
            is_dir: false,
            etag: Some(Self::etag(&obj.data)),
        }))
    }

    async fn read(&self, path: &str) -> StorageResult<Vec<u8>> {
        {
            let mut faults = self.faults.write().unwrap();
            Self::check_failure(&mut faults.read_failures, path)?;
        }

        let objects = self.objects.read().unwrap();
        let obj = objects
            .get(path)
            .ok_or_else(|| StorageError::NotFound(path.to_string()))?;

        let mut data = obj.data.clone();
        {
            let mut faults = self.faults.write().unwrap();
            if Self::take_corruption(&mut faults.corrupt_reads, path) {
                data.pop();
            }
        }
        Ok(data)
    }

    async fn write(&self, path: &str, data: Vec<u8>) -> StorageResult<()> {
        let mut data = data;
        {
            let mut faults = self.faults.write().unwrap();
            Self::check_failure(&mut faults.write_failures, path)?;
            if Self::take_corruption(&mut faults.corrupt_writes, path) {
                data.pop();
            }
        }

        let modified_time = chrono::Utc::now().timestamp();
        self.objects.write().unwrap().insert(
            path.to_string(),
            MemObject {
                data,
                modified_time,
            },
        );
        Ok(())
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        self.objects.write().unwrap().remove(path);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
