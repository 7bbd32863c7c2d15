//! 端到端同步测试：收敛、幂等、删除传播与故障隔离

use bucketsync::config::SyncPair;
use bucketsync::core::{EngineConfig, ExecutorConfig, PlanConfig, RetryPolicy, SyncEngine};
use bucketsync::storage::memory::FailureMode;
use bucketsync::storage::{LocalStorage, MemoryStorage, Storage};
use bucketsync::SyncStatus;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn engine_config(propagate_deletes: bool) -> EngineConfig {
    EngineConfig {
        plan: PlanConfig { propagate_deletes },
        executor: ExecutorConfig {
            retry: RetryPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
            },
            ..Default::default()
        },
        ..Default::default()
    }
}

fn engine(state_dir: &Path, propagate_deletes: bool) -> SyncEngine {
    SyncEngine::new(engine_config(propagate_deletes), state_dir.to_path_buf())
}

fn pair(local_root: &Path, remote_uri: &str) -> SyncPair {
    SyncPair {
        local_root: local_root.to_path_buf(),
        remote_uri: remote_uri.to_string(),
    }
}

#[tokio::test]
async fn one_sided_files_converge_both_ways() {
    let state = tempfile::tempdir().unwrap();
    let local = Arc::new(MemoryStorage::new("local"));
    let remote = Arc::new(MemoryStorage::new("remote"));

    local.insert("a.txt", b"local only", 100);
    remote.insert("b.txt", b"remote only", 100);

    let engine = engine(state.path(), false);
    let result = engine
        .sync_pair(
            &pair(Path::new("/mem/local"), "bucket/prefix"),
            local.clone(),
            remote.clone(),
        )
        .await;

    assert_eq!(result.status, SyncStatus::Completed);
    assert_eq!(result.uploaded, 1);
    assert_eq!(result.downloaded, 1);
    assert_eq!(result.failed, 0);

    // 双方键集一致，内容一致
    assert_eq!(local.paths(), vec!["a.txt", "b.txt"]);
    assert_eq!(remote.paths(), vec!["a.txt", "b.txt"]);
    assert_eq!(remote.contents("a.txt").unwrap(), b"local only");
    assert_eq!(local.contents("b.txt").unwrap(), b"remote only");
}

#[tokio::test]
async fn second_run_is_all_skips() {
    // 本地真实文件系统（内容哈希指纹）对内存远端（ETag 指纹）：
    // 跨类指纹的幂等只能靠清单成立
    let state = tempfile::tempdir().unwrap();
    let local_dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(local_dir.path().join("sub")).unwrap();
    std::fs::write(local_dir.path().join("a.txt"), b"alpha").unwrap();
    std::fs::write(local_dir.path().join("sub/b.txt"), b"beta").unwrap();

    let local: Arc<dyn Storage> = Arc::new(LocalStorage::new(local_dir.path()));
    let remote = Arc::new(MemoryStorage::new("remote"));
    let sync_pair = pair(local_dir.path(), "bucket/docs");

    let engine = engine(state.path(), false);

    let first = engine
        .sync_pair(&sync_pair, local.clone(), remote.clone())
        .await;
    assert_eq!(first.status, SyncStatus::Completed);
    assert_eq!(first.uploaded, 2);
    assert_eq!(remote.paths(), vec!["a.txt", "sub/b.txt"]);

    let second = engine
        .sync_pair(&sync_pair, local.clone(), remote.clone())
        .await;
    assert_eq!(second.status, SyncStatus::Completed);
    assert_eq!(second.uploaded, 0);
    assert_eq!(second.downloaded, 0);
    assert_eq!(second.skipped, 2);
}

#[tokio::test]
async fn local_edit_reuploads_after_convergence() {
    let state = tempfile::tempdir().unwrap();
    let local = Arc::new(MemoryStorage::new("local"));
    let remote = Arc::new(MemoryStorage::new("remote"));
    let sync_pair = pair(Path::new("/mem/local"), "bucket/edits");

    local.insert("a.txt", b"v1", 100);

    let engine = engine(state.path(), false);
    engine
        .sync_pair(&sync_pair, local.clone(), remote.clone())
        .await;
    assert_eq!(remote.contents("a.txt").unwrap(), b"v1");

    // 本地再次编辑，时间戳晚于远端的写入时间
    let future = chrono::Utc::now().timestamp() + 1000;
    local.insert("a.txt", b"version two", future);

    let result = engine
        .sync_pair(&sync_pair, local.clone(), remote.clone())
        .await;
    assert_eq!(result.uploaded, 1);
    assert_eq!(remote.contents("a.txt").unwrap(), b"version two");
}

#[tokio::test]
async fn deletion_propagates_only_with_flag_and_manifest() {
    let state = tempfile::tempdir().unwrap();
    let local_dir = tempfile::tempdir().unwrap();
    std::fs::write(local_dir.path().join("a.txt"), b"alpha").unwrap();
    std::fs::write(local_dir.path().join("b.txt"), b"beta").unwrap();

    let local: Arc<dyn Storage> = Arc::new(LocalStorage::new(local_dir.path()));
    let remote = Arc::new(MemoryStorage::new("remote"));
    let sync_pair = pair(local_dir.path(), "bucket/docs");

    // 先收敛，建立清单
    let converge = engine(state.path(), true);
    converge
        .sync_pair(&sync_pair, local.clone(), remote.clone())
        .await;
    assert_eq!(remote.paths(), vec!["a.txt", "b.txt"]);

    // 本地删除 a.txt，开启传播：远端随之删除
    std::fs::remove_file(local_dir.path().join("a.txt")).unwrap();
    let result = converge
        .sync_pair(&sync_pair, local.clone(), remote.clone())
        .await;
    assert_eq!(result.status, SyncStatus::Completed);
    assert_eq!(result.deleted_remote, 1);
    assert_eq!(remote.paths(), vec!["b.txt"]);

    // 再跑一次：清单已清理，无事可做
    let again = converge
        .sync_pair(&sync_pair, local.clone(), remote.clone())
        .await;
    assert_eq!(again.deleted_remote, 0);
    assert_eq!(again.skipped, 1);
}

#[tokio::test]
async fn deletion_without_flag_restores_the_file() {
    let state = tempfile::tempdir().unwrap();
    let local_dir = tempfile::tempdir().unwrap();
    std::fs::write(local_dir.path().join("a.txt"), b"alpha").unwrap();

    let local: Arc<dyn Storage> = Arc::new(LocalStorage::new(local_dir.path()));
    let remote = Arc::new(MemoryStorage::new("remote"));
    let sync_pair = pair(local_dir.path(), "bucket/docs");

    let engine = engine(state.path(), false);
    engine
        .sync_pair(&sync_pair, local.clone(), remote.clone())
        .await;

    // 未开启删除传播：本地删掉的文件会从远端拉回来
    std::fs::remove_file(local_dir.path().join("a.txt")).unwrap();
    let result = engine
        .sync_pair(&sync_pair, local.clone(), remote.clone())
        .await;

    assert_eq!(result.downloaded, 1);
    assert_eq!(result.deleted_remote, 0);
    assert_eq!(
        std::fs::read(local_dir.path().join("a.txt")).unwrap(),
        b"alpha"
    );
}

#[tokio::test]
async fn equal_mtime_different_content_reports_conflict() {
    let state = tempfile::tempdir().unwrap();
    let local = Arc::new(MemoryStorage::new("local"));
    let remote = Arc::new(MemoryStorage::new("remote"));

    // 时间戳相同、内容不同：只告警，双方都不被覆盖
    local.insert("doc.txt", b"edited here", 500);
    remote.insert("doc.txt", b"edited there", 500);

    let engine = engine(state.path(), false);
    let result = engine
        .sync_pair(
            &pair(Path::new("/mem/local"), "bucket/conflict"),
            local.clone(),
            remote.clone(),
        )
        .await;

    assert_eq!(result.status, SyncStatus::Completed);
    assert_eq!(result.uploaded, 0);
    assert_eq!(result.downloaded, 0);
    assert_eq!(result.conflicts.len(), 1);
    assert_eq!(result.conflicts[0].path, "doc.txt");
    assert_eq!(local.contents("doc.txt").unwrap(), b"edited here");
    assert_eq!(remote.contents("doc.txt").unwrap(), b"edited there");
}

#[tokio::test]
async fn newer_side_wins_after_divergence() {
    let state = tempfile::tempdir().unwrap();
    let local = Arc::new(MemoryStorage::new("local"));
    let remote = Arc::new(MemoryStorage::new("remote"));

    // 同一路径，本地更新（时间戳更晚）：上传覆盖远端
    local.insert("doc.txt", b"newer", 900);
    remote.insert("doc.txt", b"older", 100);

    let engine = engine(state.path(), false);
    let result = engine
        .sync_pair(
            &pair(Path::new("/mem/local"), "bucket/newest"),
            local.clone(),
            remote.clone(),
        )
        .await;

    assert_eq!(result.uploaded, 1);
    assert_eq!(result.downloaded, 0);
    assert_eq!(remote.contents("doc.txt").unwrap(), b"newer");
}

#[tokio::test]
async fn one_bad_file_does_not_block_the_pair() {
    let state = tempfile::tempdir().unwrap();
    let local = Arc::new(MemoryStorage::new("local"));
    let remote = Arc::new(MemoryStorage::new("remote"));

    for i in 1..=5 {
        local.insert(&format!("file{}.txt", i), b"data", 100);
    }
    remote.fail_writes("file3.txt", FailureMode::Permanent);

    let engine = engine(state.path(), false);
    let result = engine
        .sync_pair(
            &pair(Path::new("/mem/local"), "bucket/faulty"),
            local.clone(),
            remote.clone(),
        )
        .await;

    assert_eq!(result.status, SyncStatus::CompletedWithErrors);
    assert_eq!(result.uploaded, 4);
    assert_eq!(result.failed, 1);
    assert_eq!(result.failures[0].path, "file3.txt");
    assert_eq!(
        remote.paths(),
        vec!["file1.txt", "file2.txt", "file4.txt", "file5.txt"]
    );
}

#[tokio::test]
async fn missing_local_root_aborts_the_pair() {
    let state = tempfile::tempdir().unwrap();
    let missing = state.path().join("does-not-exist");
    let local: Arc<dyn Storage> = Arc::new(LocalStorage::new(&missing));
    let remote = Arc::new(MemoryStorage::new("remote"));
    remote.insert("a.txt", b"data", 100);

    let engine = engine(state.path(), false);
    let result = engine
        .sync_pair(&pair(&missing, "bucket/missing"), local, remote.clone())
        .await;

    assert_eq!(result.status, SyncStatus::Aborted);
    assert!(!result.errors.is_empty());
    // 扫描失败不做任何传输
    assert_eq!(result.uploaded, 0);
    assert_eq!(result.downloaded, 0);
}

#[tokio::test]
async fn cancelled_engine_starts_nothing() {
    let state = tempfile::tempdir().unwrap();
    let local = Arc::new(MemoryStorage::new("local"));
    let remote = Arc::new(MemoryStorage::new("remote"));
    local.insert("a.txt", b"data", 100);

    let engine = engine(state.path(), false);
    engine.cancel();

    let result = engine
        .sync_pair(
            &pair(Path::new("/mem/local"), "bucket/cancelled"),
            local,
            remote.clone(),
        )
        .await;

    assert_eq!(result.status, SyncStatus::Aborted);
    assert!(remote.paths().is_empty());
}

#[tokio::test]
async fn run_all_reports_every_pair() {
    let state = tempfile::tempdir().unwrap();

    let mut jobs: Vec<(SyncPair, Arc<dyn Storage>, Arc<dyn Storage>)> = Vec::new();
    let mut remotes = Vec::new();
    for i in 0..3 {
        let local = Arc::new(MemoryStorage::new("local"));
        local.insert("only.txt", format!("pair {}", i).as_bytes(), 100);
        let remote = Arc::new(MemoryStorage::new("remote"));
        jobs.push((
            pair(
                Path::new(&format!("/mem/local{}", i)),
                &format!("bucket/p{}", i),
            ),
            local,
            remote.clone(),
        ));
        remotes.push(remote);
    }

    let engine = engine(state.path(), false);
    let results = engine.run_all(jobs).await;

    assert_eq!(results.len(), 3);
    for (i, result) in results.iter().enumerate() {
        assert_eq!(result.status, SyncStatus::Completed);
        assert_eq!(result.uploaded, 1);
        assert_eq!(
            remotes[i].contents("only.txt").unwrap(),
            format!("pair {}", i).as_bytes()
        );
    }
}
