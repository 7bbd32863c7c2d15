pub mod local;
pub mod memory;
pub mod s3;

use crate::config::S3Settings;
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

pub use local::LocalStorage;
pub use memory::MemoryStorage;
pub use s3::S3Storage;

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- stat, delete 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- read, write 等
pub const IO_TIMEOUT_SECS: u64 = 300;

/// 内容指纹
///
/// 同类指纹可直接比较；跨类指纹（如本地哈希与远端 ETag）不可比，
/// 由规划器借助同步清单或时间戳裁决。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "value")]
pub enum Fingerprint {
    /// BLAKE3 内容哈希（权威）
    ContentHash(String),
    /// 对象存储提供的 ETag
    ETag(String),
    /// 快速模式代理：大小 + 修改时间
    Meta { size: u64, modified_time: i64 },
}

impl Fingerprint {
    /// 同类指纹比较内容是否一致；跨类返回 None
    pub fn matches(&self, other: &Fingerprint) -> Option<bool> {
        match (self, other) {
            (Fingerprint::ContentHash(a), Fingerprint::ContentHash(b)) => Some(a == b),
            (Fingerprint::ETag(a), Fingerprint::ETag(b)) => Some(a == b),
            (Fingerprint::Meta { .. }, Fingerprint::Meta { .. }) => Some(self == other),
            _ => None,
        }
    }
}

/// 文件条目：一次扫描的产物，产出后不再修改
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    /// 相对路径，统一使用 / 分隔
    pub path: String,
    pub size: u64,
    pub modified_time: i64,
    pub is_dir: bool,
    pub fingerprint: Fingerprint,
}

/// 文件元数据（stat 结果）
#[derive(Debug, Clone)]
pub struct FileMeta {
    pub size: u64,
    pub modified_time: i64,
    pub is_dir: bool,
    pub etag: Option<String>,
}

impl FileMeta {
    /// 元数据对应的指纹：优先 ETag，否则退化为大小+时间代理
    pub fn fingerprint(&self) -> Fingerprint {
        match &self.etag {
            Some(etag) => Fingerprint::ETag(etag.clone()),
            None => Fingerprint::Meta {
                size: self.size,
                modified_time: self.modified_time,
            },
        }
    }
}

/// 存储抽象接口
///
/// 扫描器和规划器只读；所有写入都经由执行器。
#[async_trait]
pub trait Storage: Send + Sync {
    /// 递归列出前缀下所有条目
    async fn list_files(&self, prefix: Option<&str>) -> StorageResult<Vec<FileEntry>>;

    /// 获取单个对象元数据，不存在返回 None
    async fn stat(&self, path: &str) -> StorageResult<Option<FileMeta>>;

    /// 读取整个对象
    async fn read(&self, path: &str) -> StorageResult<Vec<u8>>;

    /// 写入整个对象。本地实现须先写临时文件再原子重命名
    async fn write(&self, path: &str, data: Vec<u8>) -> StorageResult<()>;

    /// 删除对象；删除不存在的对象不报错
    async fn delete(&self, path: &str) -> StorageResult<()>;

    /// 检查对象是否存在
    async fn exists(&self, path: &str) -> StorageResult<bool> {
        Ok(self.stat(path).await?.is_some())
    }

    /// 存储名称（用于日志）
    fn name(&self) -> &str;
}

/// 解析 `bucket/prefix` 形式的远端 URI，可带 s3:// 前缀
pub fn parse_remote_uri(uri: &str) -> StorageResult<(String, Option<String>)> {
    let trimmed = uri
        .strip_prefix("s3://")
        .unwrap_or(uri)
        .trim_matches('/');

    let (bucket, prefix) = match trimmed.split_once('/') {
        Some((bucket, rest)) => (bucket, Some(rest.to_string())),
        None => (trimmed, None),
    };

    if bucket.is_empty() {
        return Err(StorageError::InvalidConfig(format!(
            "远端 URI 缺少 bucket: {:?}",
            uri
        )));
    }

    Ok((bucket.to_string(), prefix.filter(|p| !p.is_empty())))
}

/// 创建本地目录存储
pub fn create_local_storage(root: &Path) -> StorageResult<Arc<dyn Storage>> {
    tracing::info!("初始化本地存储: {}", root.display());
    Ok(Arc::new(LocalStorage::new(root)) as Arc<dyn Storage>)
}

/// 根据远端 URI 和 S3 连接设置创建远端存储
pub async fn create_remote_storage(
    uri: &str,
    settings: &S3Settings,
) -> StorageResult<Arc<dyn Storage>> {
    let (bucket, prefix) = parse_remote_uri(uri)?;
    tracing::info!("初始化S3存储: bucket={}, prefix={:?}", bucket, prefix);
    let storage = S3Storage::new(&bucket, prefix.as_deref(), settings).await?;
    Ok(Arc::new(storage) as Arc<dyn Storage>)
}
