//! 差异规划器
//!
//! 纯函数：对固定的两份 Inventory 和清单，输出总是相同的动作序列。
//! 不读时钟，不碰存储。

use crate::core::manifest::SyncManifest;
use crate::core::scanner::Inventory;
use crate::storage::FileEntry;
use serde::Serialize;
use std::collections::BTreeSet;

/// 同步动作
///
/// Upload/Download 携带来源侧的扫描条目，执行器据此校验和更新清单。
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// 本地 → 远端
    Upload { entry: FileEntry },
    /// 远端 → 本地
    Download { entry: FileEntry },
    DeleteLocal { path: String },
    DeleteRemote { path: String },
    /// 双方一致，无需传输
    Skip { path: String },
    /// 时间戳相同但内容不同：只报告，不覆盖
    Conflict {
        path: String,
        local_time: i64,
        remote_time: i64,
    },
}

impl Action {
    pub fn path(&self) -> &str {
        match self {
            Action::Upload { entry } | Action::Download { entry } => &entry.path,
            Action::DeleteLocal { path }
            | Action::DeleteRemote { path }
            | Action::Skip { path }
            | Action::Conflict { path, .. } => path,
        }
    }

    /// 动作种类（用于失败记录和日志）
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Upload { .. } => "upload",
            Action::Download { .. } => "download",
            Action::DeleteLocal { .. } => "delete_local",
            Action::DeleteRemote { .. } => "delete_remote",
            Action::Skip { .. } => "skip",
            Action::Conflict { .. } => "conflict",
        }
    }
}

/// 模糊冲突警告：时钟偏差或两侧同时编辑
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictWarning {
    pub path: String,
    pub local_time: i64,
    pub remote_time: i64,
}

/// 规划配置
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanConfig {
    /// 是否传播删除。关闭时清单中缺失的一侧按重新传输处理
    pub propagate_deletes: bool,
}

/// 动作统计
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSummary {
    pub upload_count: usize,
    pub upload_bytes: u64,
    pub download_count: usize,
    pub download_bytes: u64,
    pub delete_local_count: usize,
    pub delete_remote_count: usize,
    pub skip_count: usize,
    pub conflict_count: usize,
}

/// 规划结果：已按执行顺序排序的动作序列
#[derive(Debug, Clone)]
pub struct SyncPlan {
    pub actions: Vec<Action>,
}

impl SyncPlan {
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for action in &self.actions {
            match action {
                Action::Upload { entry } => {
                    summary.upload_count += 1;
                    summary.upload_bytes += entry.size;
                }
                Action::Download { entry } => {
                    summary.download_count += 1;
                    summary.download_bytes += entry.size;
                }
                Action::DeleteLocal { .. } => summary.delete_local_count += 1,
                Action::DeleteRemote { .. } => summary.delete_remote_count += 1,
                Action::Skip { .. } => summary.skip_count += 1,
                Action::Conflict { .. } => summary.conflict_count += 1,
            }
        }
        summary
    }
}

/// 差异规划器
pub struct DiffPlanner {
    config: PlanConfig,
}

impl DiffPlanner {
    pub fn new(config: PlanConfig) -> Self {
        Self { config }
    }

    /// 对比两份清点结果，产出动作序列
    ///
    /// manifest 为 None 时视作首次同步：删除无法与「从未存在」区分，只做传输。
    pub fn plan(
        &self,
        local: &Inventory,
        remote: &Inventory,
        manifest: Option<&SyncManifest>,
    ) -> SyncPlan {
        let all_paths: BTreeSet<&String> = local.keys().chain(remote.keys()).collect();
        let mut actions = Vec::with_capacity(all_paths.len());

        for path in all_paths {
            let previously_synced = manifest.map_or(false, |m| m.contains(path));

            let action = match (local.get(path), remote.get(path)) {
                (Some(l), Some(r)) => self.plan_both(l, r, manifest),

                // 仅本地存在：清单记录过则说明远端删除了它
                (Some(l), None) => {
                    if self.config.propagate_deletes && previously_synced {
                        Action::DeleteLocal { path: path.clone() }
                    } else {
                        Action::Upload { entry: l.clone() }
                    }
                }

                // 仅远端存在：清单记录过则说明本地删除了它
                (None, Some(r)) => {
                    if self.config.propagate_deletes && previously_synced {
                        Action::DeleteRemote { path: path.clone() }
                    } else {
                        Action::Download { entry: r.clone() }
                    }
                }

                (None, None) => unreachable!(),
            };

            actions.push(action);
        }

        Self::sort_actions(&mut actions);
        SyncPlan { actions }
    }

    fn plan_both(
        &self,
        local: &FileEntry,
        remote: &FileEntry,
        manifest: Option<&SyncManifest>,
    ) -> Action {
        match local.fingerprint.matches(&remote.fingerprint) {
            Some(true) => Action::Skip {
                path: local.path.clone(),
            },
            Some(false) => Self::tie_break(local, remote),
            // 跨类指纹（本地哈希 vs 远端 ETag）：大小不同必然不同，
            // 否则看双方是否都和上次收敛时一致
            None => {
                if local.size != remote.size {
                    return Self::tie_break(local, remote);
                }

                if let Some(prev) = manifest.and_then(|m| m.get(&local.path)) {
                    let local_unchanged =
                        local.fingerprint.matches(&prev.local_fingerprint) == Some(true);
                    let remote_unchanged =
                        remote.fingerprint.matches(&prev.remote_fingerprint) == Some(true);
                    if local_unchanged && remote_unchanged {
                        return Action::Skip {
                            path: local.path.clone(),
                        };
                    }
                }

                Self::tie_break(local, remote)
            }
        }
    }

    /// 新者胜；时间戳相同按模糊冲突上报
    fn tie_break(local: &FileEntry, remote: &FileEntry) -> Action {
        if local.modified_time > remote.modified_time {
            Action::Upload {
                entry: local.clone(),
            }
        } else if remote.modified_time > local.modified_time {
            Action::Download {
                entry: remote.clone(),
            }
        } else {
            Action::Conflict {
                path: local.path.clone(),
                local_time: local.modified_time,
                remote_time: remote.modified_time,
            }
        }
    }

    /// 传输在前，删除殿后；删除按路径倒序（先子后父）
    fn sort_actions(actions: &mut [Action]) {
        fn order(action: &Action) -> u8 {
            match action {
                Action::Upload { .. } | Action::Download { .. } => 0,
                Action::Conflict { .. } => 1,
                Action::DeleteLocal { .. } | Action::DeleteRemote { .. } => 2,
                Action::Skip { .. } => 3,
            }
        }

        actions.sort_by(|a, b| {
            order(a).cmp(&order(b)).then_with(|| {
                if order(a) == 2 {
                    b.path().cmp(a.path())
                } else {
                    a.path().cmp(b.path())
                }
            })
        });
    }
}
