//! 同步编排
//!
//! 每个目录对一次会话：扫描 → 规划 → 执行 → 汇总。
//! 多个目录对之间由工作池并行，互不阻塞。

use crate::config::SyncPair;
use crate::core::executor::{ActionFailure, ExecutorConfig, TransferExecutor};
use crate::core::manifest::{ManifestStore, SyncManifest};
use crate::core::planner::{ConflictWarning, DiffPlanner, PlanConfig};
use crate::core::scanner::{FidelityMode, Inventory, InventoryScanner, ScanConfig};
use crate::error::SyncError;
use crate::storage::Storage;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// 每对目录的同步状态机：
/// Scanning → Planning → Executing → (Completed | CompletedWithErrors)，
/// 扫描或规划阶段失败以及取消进入 Aborted。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Scanning,
    Planning,
    Executing,
    Completed,
    CompletedWithErrors,
    Aborted,
}

/// 单个目录对的同步结果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub session_id: String,
    pub local_root: String,
    pub remote_uri: String,
    pub status: SyncStatus,
    pub started_at: i64,
    pub finished_at: i64,
    pub files_scanned: u32,
    pub uploaded: u32,
    pub downloaded: u32,
    pub deleted_local: u32,
    pub deleted_remote: u32,
    pub skipped: u32,
    pub failed: u32,
    /// 取消后未启动的动作数
    pub not_started: u32,
    pub bytes_transferred: u64,
    pub conflicts: Vec<ConflictWarning>,
    pub failures: Vec<ActionFailure>,
    /// 扫描/规划阶段的中止原因
    pub errors: Vec<String>,
}

impl SyncResult {
    fn begin(pair: &SyncPair) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            local_root: pair.local_root.display().to_string(),
            remote_uri: pair.remote_uri.clone(),
            status: SyncStatus::Scanning,
            started_at: chrono::Utc::now().timestamp(),
            finished_at: 0,
            files_scanned: 0,
            uploaded: 0,
            downloaded: 0,
            deleted_local: 0,
            deleted_remote: 0,
            skipped: 0,
            failed: 0,
            not_started: 0,
            bytes_transferred: 0,
            conflicts: Vec::new(),
            failures: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn abort(mut self, error: Option<String>) -> Self {
        self.status = SyncStatus::Aborted;
        self.finished_at = chrono::Utc::now().timestamp();
        if let Some(error) = error {
            self.errors.push(error);
        }
        self
    }

    pub fn duration_secs(&self) -> i64 {
        (self.finished_at - self.started_at).max(0)
    }
}

/// 引擎配置
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub scan: ScanConfig,
    pub plan: PlanConfig,
    pub executor: ExecutorConfig,
    /// 并行处理的目录对数量上限
    pub max_parallel_pairs: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scan: ScanConfig::default(),
            plan: PlanConfig::default(),
            executor: ExecutorConfig::default(),
            max_parallel_pairs: 2,
        }
    }
}

/// 同步引擎
#[derive(Clone)]
pub struct SyncEngine {
    config: EngineConfig,
    state_dir: PathBuf,
    cancelled: Arc<AtomicBool>,
}

impl SyncEngine {
    pub fn new(config: EngineConfig, state_dir: PathBuf) -> Self {
        Self {
            config,
            state_dir,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 请求取消：执行中的动作跑完，不再启动新动作
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// 并行同步多个目录对，结果按输入顺序返回
    pub async fn run_all(
        &self,
        jobs: Vec<(SyncPair, Arc<dyn Storage>, Arc<dyn Storage>)>,
    ) -> Vec<SyncResult> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_pairs.max(1)));
        let mut handles = Vec::with_capacity(jobs.len());

        for (pair, local, remote) in jobs {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore closed");
            let engine = self.clone();

            handles.push(tokio::spawn(async move {
                let result = engine.sync_pair(&pair, local, remote).await;
                drop(permit);
                result
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => warn!("同步任务崩溃: {}", e),
            }
        }
        results
    }

    /// 同步一个目录对
    pub async fn sync_pair(
        &self,
        pair: &SyncPair,
        local: Arc<dyn Storage>,
        remote: Arc<dyn Storage>,
    ) -> SyncResult {
        let mut result = SyncResult::begin(pair);
        info!(
            "开始同步: {} <-> {} ({})",
            result.local_root, result.remote_uri, result.session_id
        );

        if self.is_cancelled() {
            return result.abort(None);
        }

        // ---- Scanning：两侧各取一份独立的只读快照，背靠背进行 ----
        result.status = SyncStatus::Scanning;

        let local_scanner = InventoryScanner::new(self.config.scan.clone())
            .with_cancel(self.cancelled.clone());
        // 远端只做列举，不回读内容
        let remote_scanner = InventoryScanner::new(ScanConfig {
            fidelity: FidelityMode::Fast,
            ..self.config.scan.clone()
        })
        .with_cancel(self.cancelled.clone());

        let (local_inventory, remote_inventory) = match tokio::join!(
            local_scanner.scan(local.clone(), "本地"),
            remote_scanner.scan(remote.clone(), "远端"),
        ) {
            (Ok(l), Ok(r)) => (l, r),
            (Err(SyncError::Cancelled), _) | (_, Err(SyncError::Cancelled)) => {
                return result.abort(None);
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!("扫描失败，目录对中止: {}", e);
                return result.abort(Some(e.to_string()));
            }
        };

        result.files_scanned = (local_inventory.len() + remote_inventory.len()) as u32;
        debug!(
            "扫描完成: 本地 {} 文件, 远端 {} 文件",
            local_inventory.len(),
            remote_inventory.len()
        );

        if self.is_cancelled() {
            return result.abort(None);
        }

        // ---- Planning ----
        result.status = SyncStatus::Planning;

        let manifests = ManifestStore::new(self.state_dir.clone());
        let pair_key = ManifestStore::pair_key(&pair.local_root, &pair.remote_uri);
        let manifest = manifests.load(&pair_key);
        if manifest.is_none() {
            debug!("无同步清单，按首次同步处理（不传播删除）");
        }

        let planner = DiffPlanner::new(self.config.plan);
        let plan = planner.plan(&local_inventory, &remote_inventory, manifest.as_ref());
        let summary = plan.summary();
        info!(
            "规划完成: {} 上传, {} 下载, {} 删除, {} 跳过, {} 冲突",
            summary.upload_count,
            summary.download_count,
            summary.delete_local_count + summary.delete_remote_count,
            summary.skip_count,
            summary.conflict_count
        );

        if self.is_cancelled() {
            return result.abort(None);
        }

        // ---- Executing ----
        result.status = SyncStatus::Executing;

        let executor = TransferExecutor::new(
            local,
            remote,
            self.config.executor.clone(),
            self.cancelled.clone(),
        );
        let skip_paths: Vec<String> = plan
            .actions
            .iter()
            .filter_map(|a| match a {
                crate::core::planner::Action::Skip { path } => Some(path.clone()),
                _ => None,
            })
            .collect();
        let outcome = executor.execute(plan).await;

        // ---- 清单折叠与落盘 ----
        let next_manifest = Self::fold_manifest(
            manifest,
            &local_inventory,
            &remote_inventory,
            &skip_paths,
            &outcome.manifest_updates,
            &outcome.deleted_paths,
        );
        if let Err(e) = manifests.save(&pair_key, &next_manifest) {
            warn!("保存清单失败: {}", e);
        }

        // ---- 汇总 ----
        result.uploaded = outcome.uploaded;
        result.downloaded = outcome.downloaded;
        result.deleted_local = outcome.deleted_local;
        result.deleted_remote = outcome.deleted_remote;
        result.skipped = outcome.skipped;
        result.failed = outcome.failures.len() as u32;
        result.not_started = outcome.not_started;
        result.bytes_transferred = outcome.bytes_transferred;
        result.conflicts = outcome.conflicts;
        result.failures = outcome.failures;
        result.finished_at = chrono::Utc::now().timestamp();

        result.status = if outcome.not_started > 0 {
            SyncStatus::Aborted
        } else if result.failed > 0 {
            SyncStatus::CompletedWithErrors
        } else {
            SyncStatus::Completed
        };

        info!(
            "同步结束: {} - 上传 {}, 下载 {}, 删除 {}, 跳过 {}, 失败 {} ({:?})",
            result.session_id,
            result.uploaded,
            result.downloaded,
            result.deleted_local + result.deleted_remote,
            result.skipped,
            result.failed,
            result.status
        );

        result
    }

    /// 把执行结果折叠进新清单
    ///
    /// 跳过的路径按本次清点刷新；传输成功的取执行器产出的条目；
    /// 已删除的移除；失败与冲突的保留上次条目，不声称已收敛。
    /// 两侧都消失的路径一并清掉。
    fn fold_manifest(
        previous: Option<SyncManifest>,
        local_inventory: &Inventory,
        remote_inventory: &Inventory,
        skip_paths: &[String],
        manifest_updates: &[(String, crate::core::manifest::ManifestEntry)],
        deleted_paths: &[String],
    ) -> SyncManifest {
        let mut manifest = previous.unwrap_or_default();

        for path in skip_paths {
            if let (Some(l), Some(r)) = (local_inventory.get(path), remote_inventory.get(path)) {
                manifest.insert(
                    path.clone(),
                    crate::core::manifest::ManifestEntry {
                        size: l.size,
                        modified_time: l.modified_time,
                        local_fingerprint: l.fingerprint.clone(),
                        remote_fingerprint: r.fingerprint.clone(),
                    },
                );
            }
        }

        for (path, entry) in manifest_updates {
            manifest.insert(path.clone(), entry.clone());
        }

        for path in deleted_paths {
            manifest.remove(path);
        }

        // 两侧都不存在且本次未收敛的残留条目没有意义
        let fresh: std::collections::HashSet<&String> =
            manifest_updates.iter().map(|(p, _)| p).collect();
        manifest.entries.retain(|path, _| {
            local_inventory.contains_key(path)
                || remote_inventory.contains_key(path)
                || fresh.contains(path)
        });

        manifest
    }
}
