use bucketsync::config::AppConfig;
use bucketsync::core::SyncEngine;
use bucketsync::logging;
use bucketsync::storage::{create_local_storage, create_remote_storage};
use bucketsync::{SyncResult, SyncStatus};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};

/// 把本地目录镜像到对象存储的增量备份工具
#[derive(Debug, Parser)]
#[command(name = "bucketsync", version, about)]
struct Cli {
    /// 配置文件路径（JSON，含本地目录到 bucket URI 的映射）
    #[arg(short, long, default_value = "bucketsync.json")]
    config: PathBuf,

    /// 状态目录，存放各目录对的同步清单
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// 本次运行启用删除传播（覆盖配置文件）
    #[arg(long)]
    propagate_deletes: bool,

    /// 日志级别（覆盖配置文件）
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let exit_code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            // 日志可能尚未初始化，直接写到 stderr
            eprintln!("bucketsync: {:#}", e);
            2
        }
    };

    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = AppConfig::load(&cli.config)?;

    let mut log_config = config.log.clone();
    if let Some(level) = &cli.log_level {
        log_config.level = level.clone();
    }
    let _log_guard = logging::init(&log_config);

    let mut options = config.options.clone();
    if cli.propagate_deletes {
        options.propagate_deletes = true;
    }

    let state_dir = cli.state_dir.unwrap_or_else(bucketsync::dirs::state_dir);
    let engine = SyncEngine::new(options.engine_config(), state_dir);

    // Ctrl-C 后执行中的动作跑完，不再启动新动作
    {
        let engine = engine.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("收到中断信号，正在停止...");
                engine.cancel();
            }
        });
    }

    let mut jobs = Vec::new();
    for pair in config.sync_pairs() {
        let local = create_local_storage(&pair.local_root)?;
        let remote = create_remote_storage(&pair.remote_uri, &config.s3).await?;
        jobs.push((pair, local, remote));
    }

    let results = engine.run_all(jobs).await;
    report(&results);

    Ok(exit_code(&results))
}

fn report(results: &[SyncResult]) {
    for result in results {
        info!(
            "{} -> {}: {:?} (上传 {}, 下载 {}, 删除 {}, 跳过 {}, 失败 {}, {} 字节, {}s)",
            result.local_root,
            result.remote_uri,
            result.status,
            result.uploaded,
            result.downloaded,
            result.deleted_local + result.deleted_remote,
            result.skipped,
            result.failed,
            result.bytes_transferred,
            result.duration_secs()
        );
        for conflict in &result.conflicts {
            warn!(
                "冲突未处理: {} (本地 {} / 远端 {})",
                conflict.path, conflict.local_time, conflict.remote_time
            );
        }
        for failure in &result.failures {
            warn!("失败: {} [{}] {}", failure.path, failure.action, failure.cause);
        }
        for error in &result.errors {
            warn!("中止原因: {}", error);
        }
    }
}

/// 进程退出码：0 全部成功，1 有失败动作，2 有目录对中止
fn exit_code(results: &[SyncResult]) -> i32 {
    if results.iter().any(|r| r.status == SyncStatus::Aborted) {
        2
    } else if results
        .iter()
        .any(|r| r.status == SyncStatus::CompletedWithErrors)
    {
        1
    } else {
        0
    }
}
