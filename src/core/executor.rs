//! 传输执行器
//!
//! 消费规划器产出的动作序列并施加到两侧存储。
//! 单个动作失败只记录，不拖垮同批其余动作。

use crate::core::manifest::ManifestEntry;
use crate::core::planner::{Action, ConflictWarning, SyncPlan};
use crate::core::retry::{RetryPolicy, RetryState};
use crate::core::scanner::{content_hash, FidelityMode};
use crate::error::{StorageError, SyncError};
use crate::storage::{Fingerprint, Storage};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, error, warn};

/// 执行器配置
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// 单个目录对内的最大并发传输数
    pub max_concurrent_transfers: usize,
    pub retry: RetryPolicy,
    /// 决定清单中记录哪类本地指纹，须与扫描器一致
    pub fidelity: FidelityMode,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: 4,
            retry: RetryPolicy::default(),
            fidelity: FidelityMode::Hash,
        }
    }
}

/// 单个动作的失败记录
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionFailure {
    pub path: String,
    pub action: String,
    pub cause: String,
}

/// 一批动作的执行结果
#[derive(Debug, Default)]
pub struct ExecutionOutcome {
    pub uploaded: u32,
    pub downloaded: u32,
    pub deleted_local: u32,
    pub deleted_remote: u32,
    pub skipped: u32,
    /// 取消后未启动的动作数
    pub not_started: u32,
    pub bytes_transferred: u64,
    pub failures: Vec<ActionFailure>,
    pub conflicts: Vec<ConflictWarning>,
    /// 成功收敛路径的新清单条目
    pub manifest_updates: Vec<(String, ManifestEntry)>,
    /// 已删除、应从清单移除的路径
    pub deleted_paths: Vec<String>,
}

impl ExecutionOutcome {
    pub fn completed(&self) -> u32 {
        self.uploaded + self.downloaded + self.deleted_local + self.deleted_remote
    }
}

/// 单动作执行输出
struct ActionOutput {
    bytes: u64,
    manifest_update: Option<(String, ManifestEntry)>,
    deleted_path: Option<String>,
}

#[derive(Debug, Default)]
struct TransferStats {
    uploaded: AtomicU32,
    downloaded: AtomicU32,
    deleted_local: AtomicU32,
    deleted_remote: AtomicU32,
    bytes_transferred: AtomicU64,
}

/// 传输执行器
pub struct TransferExecutor {
    local: Arc<dyn Storage>,
    remote: Arc<dyn Storage>,
    config: ExecutorConfig,
    cancelled: Arc<AtomicBool>,
}

impl TransferExecutor {
    pub fn new(
        local: Arc<dyn Storage>,
        remote: Arc<dyn Storage>,
        config: ExecutorConfig,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            local,
            remote,
            config,
            cancelled,
        }
    }

    /// 执行整个计划
    ///
    /// 分两波：先传输后删除，两波之间有屏障，
    /// 删除不会先于任何依赖相同数据的传输发生。
    pub async fn execute(&self, plan: SyncPlan) -> ExecutionOutcome {
        let mut transfers = Vec::new();
        let mut deletions = Vec::new();
        let mut skipped = 0u32;
        let mut conflicts = Vec::new();

        for action in plan.actions {
            match action {
                Action::Skip { .. } => skipped += 1,
                Action::Conflict {
                    path,
                    local_time,
                    remote_time,
                } => {
                    warn!(
                        "模糊冲突，不覆盖: {} (本地 {} / 远端 {})",
                        path, local_time, remote_time
                    );
                    conflicts.push(ConflictWarning {
                        path,
                        local_time,
                        remote_time,
                    });
                }
                Action::Upload { .. } | Action::Download { .. } => transfers.push(action),
                Action::DeleteLocal { .. } | Action::DeleteRemote { .. } => deletions.push(action),
            }
        }

        let stats = Arc::new(TransferStats::default());
        let failures = Arc::new(RwLock::new(Vec::<ActionFailure>::new()));
        let manifest_updates = Arc::new(RwLock::new(Vec::<(String, ManifestEntry)>::new()));
        let deleted_paths = Arc::new(RwLock::new(Vec::<String>::new()));

        let mut not_started = self
            .run_wave(transfers, &stats, &failures, &manifest_updates, &deleted_paths)
            .await;

        if self.cancelled.load(Ordering::SeqCst) {
            not_started += deletions.len() as u32;
        } else {
            not_started += self
                .run_wave(deletions, &stats, &failures, &manifest_updates, &deleted_paths)
                .await;
        }

        let failures_out = failures.read().await.clone();
        let manifest_updates_out = manifest_updates.read().await.clone();
        let deleted_paths_out = deleted_paths.read().await.clone();

        ExecutionOutcome {
            uploaded: stats.uploaded.load(Ordering::Relaxed),
            downloaded: stats.downloaded.load(Ordering::Relaxed),
            deleted_local: stats.deleted_local.load(Ordering::Relaxed),
            deleted_remote: stats.deleted_remote.load(Ordering::Relaxed),
            skipped,
            not_started,
            bytes_transferred: stats.bytes_transferred.load(Ordering::Relaxed),
            failures: failures_out,
            conflicts,
            manifest_updates: manifest_updates_out,
            deleted_paths: deleted_paths_out,
        }
    }

    /// 并发执行一波动作，返回取消后未启动的数量
    async fn run_wave(
        &self,
        actions: Vec<Action>,
        stats: &Arc<TransferStats>,
        failures: &Arc<RwLock<Vec<ActionFailure>>>,
        manifest_updates: &Arc<RwLock<Vec<(String, ManifestEntry)>>>,
        deleted_paths: &Arc<RwLock<Vec<String>>>,
    ) -> u32 {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_transfers.max(1)));
        let mut handles = Vec::new();
        let mut not_started = 0u32;

        let mut iter = actions.into_iter();
        while let Some(action) = iter.next() {
            // 取消后不再启动新动作，已启动的跑完
            if self.cancelled.load(Ordering::SeqCst) {
                not_started += 1 + iter.len() as u32;
                break;
            }

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore closed");
            let local = self.local.clone();
            let remote = self.remote.clone();
            let config = self.config.clone();
            let cancelled = self.cancelled.clone();
            let stats = stats.clone();
            let failures = failures.clone();
            let manifest_updates = manifest_updates.clone();
            let deleted_paths = deleted_paths.clone();

            let handle = tokio::spawn(async move {
                let result = Self::apply_with_retry(
                    &action,
                    local.as_ref(),
                    remote.as_ref(),
                    &config,
                    &cancelled,
                )
                .await;

                match result {
                    Ok(output) => {
                        match &action {
                            Action::Upload { .. } => {
                                stats.uploaded.fetch_add(1, Ordering::Relaxed);
                            }
                            Action::Download { .. } => {
                                stats.downloaded.fetch_add(1, Ordering::Relaxed);
                            }
                            Action::DeleteLocal { .. } => {
                                stats.deleted_local.fetch_add(1, Ordering::Relaxed);
                            }
                            Action::DeleteRemote { .. } => {
                                stats.deleted_remote.fetch_add(1, Ordering::Relaxed);
                            }
                            _ => {}
                        }
                        stats
                            .bytes_transferred
                            .fetch_add(output.bytes, Ordering::Relaxed);

                        if let Some(update) = output.manifest_update {
                            manifest_updates.write().await.push(update);
                        }
                        if let Some(path) = output.deleted_path {
                            deleted_paths.write().await.push(path);
                        }
                    }
                    Err(failure) => {
                        failures.write().await.push(failure);
                    }
                }

                drop(permit);
            });

            handles.push(handle);
        }

        for handle in handles {
            let _ = handle.await;
        }

        not_started
    }

    /// 带重试的动作执行
    ///
    /// 瞬时错误按退避策略重试；校验失败额外重试一次；永久错误直接记为失败。
    async fn apply_with_retry(
        action: &Action,
        local: &dyn Storage,
        remote: &dyn Storage,
        config: &ExecutorConfig,
        cancelled: &AtomicBool,
    ) -> Result<ActionOutput, ActionFailure> {
        let mut state = RetryState::new();
        let mut corruption_retried = false;

        loop {
            match Self::apply(action, local, remote, config.fidelity).await {
                Ok(output) => return Ok(output),
                Err(e @ SyncError::Corruption { .. }) => {
                    if corruption_retried {
                        error!("校验再次失败: {}", e);
                        return Err(Self::failure(action, &e));
                    }
                    corruption_retried = true;
                    warn!("校验失败，重试一次: {}", e);
                }
                Err(e) if e.is_transient() => match state.record_failure(&config.retry) {
                    Some(delay) if !cancelled.load(Ordering::SeqCst) => {
                        warn!(
                            "操作失败，{}ms 后重试 ({}/{}): {}",
                            delay.as_millis(),
                            state.attempt(),
                            config.retry.max_retries,
                            e
                        );
                        tokio::time::sleep(delay).await;
                    }
                    _ => {
                        error!("操作最终失败 (已重试{}次): {}", state.attempt() - 1, e);
                        return Err(Self::failure(action, &e));
                    }
                },
                Err(e) => {
                    // 永久错误不重试
                    return Err(Self::failure(action, &e));
                }
            }
        }
    }

    fn failure(action: &Action, cause: &SyncError) -> ActionFailure {
        ActionFailure {
            path: action.path().to_string(),
            action: action.kind().to_string(),
            cause: cause.to_string(),
        }
    }

    /// 执行单个动作
    async fn apply(
        action: &Action,
        local: &dyn Storage,
        remote: &dyn Storage,
        fidelity: FidelityMode,
    ) -> Result<ActionOutput, SyncError> {
        match action {
            Action::Upload { entry } => {
                let data = local.read(&entry.path).await.map_err(|source| {
                    SyncError::Transfer {
                        path: entry.path.clone(),
                        source,
                    }
                })?;
                let size = data.len() as u64;
                let hash = content_hash(&data);

                remote.write(&entry.path, data).await.map_err(|source| {
                    SyncError::Transfer {
                        path: entry.path.clone(),
                        source,
                    }
                })?;

                // 校验：远端对象大小须与实际上传的字节数一致
                let meta = remote
                    .stat(&entry.path)
                    .await
                    .map_err(|source| SyncError::Transfer {
                        path: entry.path.clone(),
                        source,
                    })?
                    .ok_or_else(|| SyncError::Transfer {
                        path: entry.path.clone(),
                        source: StorageError::NotFound(entry.path.clone()),
                    })?;
                if meta.size != size {
                    return Err(SyncError::Corruption {
                        path: entry.path.clone(),
                        expected: size.to_string(),
                        actual: meta.size.to_string(),
                    });
                }

                let local_fingerprint = match fidelity {
                    FidelityMode::Hash => Fingerprint::ContentHash(hash),
                    FidelityMode::Fast => Fingerprint::Meta {
                        size: entry.size,
                        modified_time: entry.modified_time,
                    },
                };
                let manifest_entry = ManifestEntry {
                    size,
                    modified_time: entry.modified_time,
                    local_fingerprint,
                    remote_fingerprint: meta.fingerprint(),
                };

                debug!("上传完成: {} ({} 字节)", entry.path, size);
                Ok(ActionOutput {
                    bytes: size,
                    manifest_update: Some((entry.path.clone(), manifest_entry)),
                    deleted_path: None,
                })
            }

            Action::Download { entry } => {
                let data = remote.read(&entry.path).await.map_err(|source| {
                    SyncError::Transfer {
                        path: entry.path.clone(),
                        source,
                    }
                })?;
                let size = data.len() as u64;

                // 校验：字节数须与清点时的对象大小一致
                if size != entry.size {
                    return Err(SyncError::Corruption {
                        path: entry.path.clone(),
                        expected: entry.size.to_string(),
                        actual: size.to_string(),
                    });
                }
                let hash = content_hash(&data);
                if let Fingerprint::ContentHash(expected) = &entry.fingerprint {
                    if expected != &hash {
                        return Err(SyncError::Corruption {
                            path: entry.path.clone(),
                            expected: expected.clone(),
                            actual: hash,
                        });
                    }
                }

                // 本地写入走临时文件 + 原子重命名
                local.write(&entry.path, data).await.map_err(|source| {
                    SyncError::Transfer {
                        path: entry.path.clone(),
                        source,
                    }
                })?;

                let local_fingerprint = match fidelity {
                    FidelityMode::Hash => Fingerprint::ContentHash(hash),
                    FidelityMode::Fast => {
                        // 快速模式记录落盘后的实际元数据
                        let meta = local
                            .stat(&entry.path)
                            .await
                            .map_err(|source| SyncError::Transfer {
                                path: entry.path.clone(),
                                source,
                            })?
                            .ok_or_else(|| SyncError::Transfer {
                                path: entry.path.clone(),
                                source: StorageError::NotFound(entry.path.clone()),
                            })?;
                        Fingerprint::Meta {
                            size: meta.size,
                            modified_time: meta.modified_time,
                        }
                    }
                };
                let manifest_entry = ManifestEntry {
                    size,
                    modified_time: entry.modified_time,
                    local_fingerprint,
                    remote_fingerprint: entry.fingerprint.clone(),
                };

                debug!("下载完成: {} ({} 字节)", entry.path, size);
                Ok(ActionOutput {
                    bytes: size,
                    manifest_update: Some((entry.path.clone(), manifest_entry)),
                    deleted_path: None,
                })
            }

            Action::DeleteLocal { path } => {
                local
                    .delete(path)
                    .await
                    .map_err(|source| SyncError::Transfer {
                        path: path.clone(),
                        source,
                    })?;
                debug!("已删除本地: {}", path);
                Ok(ActionOutput {
                    bytes: 0,
                    manifest_update: None,
                    deleted_path: Some(path.clone()),
                })
            }

            Action::DeleteRemote { path } => {
                remote
                    .delete(path)
                    .await
                    .map_err(|source| SyncError::Transfer {
                        path: path.clone(),
                        source,
                    })?;
                debug!("已删除远端: {}", path);
                Ok(ActionOutput {
                    bytes: 0,
                    manifest_update: None,
                    deleted_path: Some(path.clone()),
                })
            }

            // Skip 和 Conflict 在 execute 中已被拦下
            Action::Skip { .. } | Action::Conflict { .. } => Ok(ActionOutput {
                bytes: 0,
                manifest_update: None,
                deleted_path: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::FailureMode;
    use crate::storage::{FileEntry, MemoryStorage};
    use std::time::Duration;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    fn executor(
        local: Arc<MemoryStorage>,
        remote: Arc<MemoryStorage>,
        cancelled: Arc<AtomicBool>,
    ) -> TransferExecutor {
        TransferExecutor::new(
            local,
            remote,
            ExecutorConfig {
                max_concurrent_transfers: 4,
                retry: fast_retry(),
                fidelity: FidelityMode::Hash,
            },
            cancelled,
        )
    }

    fn upload_action(path: &str, data: &[u8], mtime: i64) -> Action {
        Action::Upload {
            entry: FileEntry {
                path: path.to_string(),
                size: data.len() as u64,
                modified_time: mtime,
                is_dir: false,
                fingerprint: Fingerprint::ContentHash(content_hash(data)),
            },
        }
    }

    fn plan(actions: Vec<Action>) -> SyncPlan {
        SyncPlan { actions }
    }

    #[tokio::test]
    async fn one_permanent_failure_does_not_block_the_batch() {
        let local = Arc::new(MemoryStorage::new("local"));
        let remote = Arc::new(MemoryStorage::new("remote"));

        let mut actions = Vec::new();
        for i in 1..=5 {
            let path = format!("file{}.txt", i);
            let data = format!("content {}", i).into_bytes();
            local.insert(&path, &data, 100);
            actions.push(upload_action(&path, &data, 100));
        }
        remote.fail_writes("file3.txt", FailureMode::Permanent);

        let outcome = executor(local, remote.clone(), Arc::new(AtomicBool::new(false)))
            .execute(plan(actions))
            .await;

        assert_eq!(outcome.uploaded, 4);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].path, "file3.txt");
        assert_eq!(outcome.failures[0].action, "upload");
        assert_eq!(
            remote.paths(),
            vec!["file1.txt", "file2.txt", "file4.txt", "file5.txt"]
        );
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let local = Arc::new(MemoryStorage::new("local"));
        let remote = Arc::new(MemoryStorage::new("remote"));

        local.insert("a.txt", b"hello", 100);
        remote.fail_writes("a.txt", FailureMode::Transient(2));

        let outcome = executor(local, remote.clone(), Arc::new(AtomicBool::new(false)))
            .execute(plan(vec![upload_action("a.txt", b"hello", 100)]))
            .await;

        assert_eq!(outcome.uploaded, 1);
        assert!(outcome.failures.is_empty());
        assert_eq!(remote.contents("a.txt").unwrap(), b"hello");
    }

    #[tokio::test]
    async fn corruption_is_retried_exactly_once() {
        let local = Arc::new(MemoryStorage::new("local"));
        let remote = Arc::new(MemoryStorage::new("remote"));

        local.insert("a.txt", b"hello", 100);
        // 第一次写入被截断，重试一次后成功
        remote.corrupt_writes("a.txt", 1);

        let outcome = executor(
            local.clone(),
            remote.clone(),
            Arc::new(AtomicBool::new(false)),
        )
        .execute(plan(vec![upload_action("a.txt", b"hello", 100)]))
        .await;

        assert_eq!(outcome.uploaded, 1);
        assert!(outcome.failures.is_empty());
        assert_eq!(remote.contents("a.txt").unwrap(), b"hello");

        // 连续两次损坏：重试一次后放弃
        local.insert("b.txt", b"world", 100);
        remote.corrupt_writes("b.txt", 2);

        let outcome = executor(local, remote, Arc::new(AtomicBool::new(false)))
            .execute(plan(vec![upload_action("b.txt", b"world", 100)]))
            .await;

        assert_eq!(outcome.uploaded, 0);
        assert_eq!(outcome.failures.len(), 1);
        assert!(outcome.failures[0].cause.contains("校验失败"));
    }

    #[tokio::test]
    async fn corrupted_download_never_reaches_final_path() {
        let local = Arc::new(MemoryStorage::new("local"));
        let remote = Arc::new(MemoryStorage::new("remote"));

        remote.insert("a.txt", b"hello", 100);
        remote.corrupt_reads("a.txt", 2);

        let entry = FileEntry {
            path: "a.txt".to_string(),
            size: 5,
            modified_time: 100,
            is_dir: false,
            fingerprint: Fingerprint::ETag("whatever".to_string()),
        };
        let outcome = executor(local.clone(), remote, Arc::new(AtomicBool::new(false)))
            .execute(plan(vec![Action::Download { entry }]))
            .await;

        assert_eq!(outcome.downloaded, 0);
        assert_eq!(outcome.failures.len(), 1);
        // 损坏的数据没有写到目标路径
        assert!(local.contents("a.txt").is_none());
    }

    #[tokio::test]
    async fn cancellation_starts_no_new_actions() {
        let local = Arc::new(MemoryStorage::new("local"));
        let remote = Arc::new(MemoryStorage::new("remote"));

        let mut actions = Vec::new();
        for i in 1..=3 {
            let path = format!("file{}.txt", i);
            let data = b"data".to_vec();
            local.insert(&path, &data, 100);
            actions.push(upload_action(&path, &data, 100));
        }

        let cancelled = Arc::new(AtomicBool::new(true));
        let outcome = executor(local, remote.clone(), cancelled)
            .execute(plan(actions))
            .await;

        assert_eq!(outcome.uploaded, 0);
        assert_eq!(outcome.not_started, 3);
        assert!(remote.paths().is_empty());
    }

    #[tokio::test]
    async fn deletions_run_after_transfers() {
        let local = Arc::new(MemoryStorage::new("local"));
        let remote = Arc::new(MemoryStorage::new("remote"));

        local.insert("keep.txt", b"keep", 100);
        remote.insert("gone.txt", b"gone", 100);

        let actions = vec![
            upload_action("keep.txt", b"keep", 100),
            Action::DeleteRemote {
                path: "gone.txt".to_string(),
            },
        ];

        let outcome = executor(local, remote.clone(), Arc::new(AtomicBool::new(false)))
            .execute(plan(actions))
            .await;

        assert_eq!(outcome.uploaded, 1);
        assert_eq!(outcome.deleted_remote, 1);
        assert_eq!(outcome.deleted_paths, vec!["gone.txt".to_string()]);
        assert_eq!(remote.paths(), vec!["keep.txt"]);
    }

    #[tokio::test]
    async fn skips_and_conflicts_are_counted_not_executed() {
        let local = Arc::new(MemoryStorage::new("local"));
        let remote = Arc::new(MemoryStorage::new("remote"));

        let actions = vec![
            Action::Skip {
                path: "same.txt".to_string(),
            },
            Action::Conflict {
                path: "both.txt".to_string(),
                local_time: 100,
                remote_time: 100,
            },
        ];

        let outcome = executor(local, remote, Arc::new(AtomicBool::new(false)))
            .execute(plan(actions))
            .await;

        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts[0].path, "both.txt");
        assert_eq!(outcome.completed(), 0);
        assert!(outcome.failures.is_empty());
    }
}
