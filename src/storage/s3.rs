use super::{FileEntry, FileMeta, Fingerprint, Storage, IO_TIMEOUT_SECS, OP_TIMEOUT_SECS};
use crate::config::S3Settings;
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use futures::TryStreamExt;
use opendal::{layers::TimeoutLayer, Metakey, Operator};
use std::time::Duration;

/// S3 对象存储，经由 opendal operator 访问
///
/// 认证与传输层重试由 opendal 负责；本层只做列举、读写和元数据映射。
pub struct S3Storage {
    operator: Operator,
    name: String,
}

impl S3Storage {
    pub async fn new(
        bucket: &str,
        prefix: Option<&str>,
        settings: &S3Settings,
    ) -> StorageResult<Self> {
        use opendal::services::S3;

        let region = settings.region.as_deref().unwrap_or("us-east-1");

        let mut builder = S3::default().bucket(bucket).region(region);

        if let Some(ref access_key) = settings.access_key {
            builder = builder.access_key_id(access_key);
        }
        if let Some(ref secret_key) = settings.secret_key {
            builder = builder.secret_access_key(secret_key);
        }
        if let Some(ref endpoint) = settings.endpoint {
            builder = builder.endpoint(endpoint);
        }
        if let Some(prefix) = prefix {
            builder = builder.root(prefix);
        }

        // 添加超时层
        let operator = Operator::new(builder)?
            .layer(
                TimeoutLayer::default()
                    .with_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
                    .with_io_timeout(Duration::from_secs(IO_TIMEOUT_SECS)),
            )
            .finish();

        let name = format!(
            "s3://{}{}",
            bucket,
            prefix.map(|p| format!("/{}", p)).unwrap_or_default()
        );

        Ok(Self { operator, name })
    }
}

#[async_trait]
impl Storage for S3Storage {
    async fn list_files(&self, prefix: Option<&str>) -> StorageResult<Vec<FileEntry>> {
        let mut files = Vec::new();
        let path = prefix.unwrap_or("");

        let mut lister = self
            .operator
            .lister_with(path)
            .recursive(true)
            .metakey(Metakey::ContentLength | Metakey::LastModified | Metakey::Mode)
            .await?;

        while let Some(entry) = lister.try_next().await? {
            let path_str = entry.path().to_string();

            // 跳过前缀根
            if path_str.is_empty() || path_str == "/" {
                continue;
            }

            let meta = entry.metadata();
            let size = meta.content_length();
            let modified_time = meta.last_modified().map_or(0, |t| t.timestamp());

            let fingerprint = match meta.etag() {
                Some(etag) => Fingerprint::ETag(etag.trim_matches('"').to_string()),
                None => Fingerprint::Meta {
                    size,
                    modified_time,
                },
            };

            files.push(FileEntry {
                path: path_str.trim_matches('/').to_string(),
                size,
                modified_time,
                is_dir: meta.is_dir(),
                fingerprint,
            });
        }

        Ok(files)
    }

    async fn stat(&self, path: &str) -> StorageResult<Option<FileMeta>> {
        match self.operator.stat(path).await {
            Ok(meta) => Ok(Some(FileMeta {
                size: meta.content_length(),
                modified_time: meta.last_modified().map_or(0, |t| t.timestamp()),
                is_dir: meta.is_dir(),
                etag: meta.etag().map(|s| s.trim_matches('"').to_string()),
            })),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read(&self, path: &str) -> StorageResult<Vec<u8>> {
        match self.operator.read(path).await {
            Ok(data) => Ok(data.to_vec()),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => {
                Err(StorageError::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, path: &str, data: Vec<u8>) -> StorageResult<()> {
        self.operator.write(path, data).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        // S3 删除不存在的对象不会报错
        self.operator.delete(path).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
