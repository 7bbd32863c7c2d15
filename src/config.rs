//! 应用配置模块
//!
//! 核心只消费解析好的 `SyncPair` 列表和选项，配置文件的读取和解析都在这里。

use crate::core::{EngineConfig, ExecutorConfig, FidelityMode, PlanConfig, RetryPolicy, ScanConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 同步目录对：本地根目录 ↔ `bucket/prefix`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPair {
    pub local_root: PathBuf,
    pub remote_uri: String,
}

/// S3 连接设置
///
/// 缺省的字段交给 opendal 按环境变量与默认凭证链解析。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct S3Settings {
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

/// 同步选项
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncOptions {
    /// 指纹保真模式，默认完整哈希
    pub fidelity: FidelityMode,
    /// 是否把一侧的删除传播到另一侧
    pub propagate_deletes: bool,
    /// 并行处理的目录对数量
    pub max_parallel_pairs: usize,
    /// 单个目录对内的并发传输数
    pub max_concurrent_transfers: usize,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    /// 扫描排除规则（glob patterns）
    pub exclude_patterns: Vec<String>,
    /// 最大文件大小（0 表示不限制）
    pub max_file_size: u64,
}

impl Default for SyncOptions {
    fn default() -> Self {
        let scan = ScanConfig::default();
        Self {
            fidelity: FidelityMode::Hash,
            propagate_deletes: false,
            max_parallel_pairs: 2,
            max_concurrent_transfers: 4,
            max_retries: 5,
            retry_base_delay_ms: 2000,
            exclude_patterns: scan.exclude_patterns,
            max_file_size: 0,
        }
    }
}

impl SyncOptions {
    /// 组装引擎配置
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            scan: ScanConfig {
                fidelity: self.fidelity,
                exclude_patterns: self.exclude_patterns.clone(),
                max_file_size: self.max_file_size,
                hash_concurrency: self.max_concurrent_transfers.max(1) * 2,
            },
            plan: PlanConfig {
                propagate_deletes: self.propagate_deletes,
            },
            executor: ExecutorConfig {
                max_concurrent_transfers: self.max_concurrent_transfers,
                retry: RetryPolicy {
                    max_retries: self.max_retries,
                    base_delay: Duration::from_millis(self.retry_base_delay_ms),
                },
                fidelity: self.fidelity,
            },
            max_parallel_pairs: self.max_parallel_pairs,
        }
    }
}

/// 应用配置文件
///
/// `mappings` 是本地目录到 bucket URI 的映射，其余均可省略。
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub mappings: HashMap<String, String>,
    #[serde(default)]
    pub s3: S3Settings,
    #[serde(default)]
    pub options: SyncOptions,
    #[serde(default)]
    pub log: crate::logging::LogConfig,
}

impl AppConfig {
    /// 从 JSON 配置文件加载
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("读取配置文件失败 {:?}: {}", path, e))?;
        let config: AppConfig = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("解析配置文件失败 {:?}: {}", path, e))?;

        if config.mappings.is_empty() {
            anyhow::bail!("配置文件没有任何目录映射");
        }

        Ok(config)
    }

    /// 展开成目录对列表，按本地路径排序保证顺序稳定
    pub fn sync_pairs(&self) -> Vec<SyncPair> {
        let mut pairs: Vec<SyncPair> = self
            .mappings
            .iter()
            .map(|(local, remote)| SyncPair {
                local_root: PathBuf::from(local),
                remote_uri: remote.clone(),
            })
            .collect();
        pairs.sort_by(|a, b| a.local_root.cmp(&b.local_root));
        pairs
    }
}
