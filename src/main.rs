use anyhow::Context;
use s3_parallel_transfer::{
    config::AppConfig,
    logging,
    store::build_http_client,
    transfer::{endpoint_comparisons, HttpConnector, TransferManager, TransferResult},
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const CONFIG_PATH: &str = "config/app.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 配置加载失败时使用默认配置（此时日志尚未初始化，错误输出到 stderr）
    let config = match AppConfig::load_from_file(CONFIG_PATH).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("加载配置文件 {} 失败，使用默认配置: {}", CONFIG_PATH, e);
            AppConfig::default()
        }
    };

    // 初始化日志系统（必须保持 _log_guard 存活）
    let _log_guard = logging::init_logging(&config.log);

    info!("S3 Parallel Transfer v{} 启动中...", env!("CARGO_PKG_VERSION"));

    if config.jobs.is_empty() {
        warn!("配置文件中没有 [[jobs]]，无事可做");
        return Ok(());
    }

    // 所有任务共用一个连接池
    let client = build_http_client(&config.store, config.transfer.max_concurrency())
        .context("创建 HTTP 客户端失败")?;
    let connector = Arc::new(HttpConnector::new(client, config.store.credentials()));

    let cancel = CancellationToken::new();
    let manager = TransferManager::from_config(&config, connector, cancel.clone())
        .context("传输配置无效")?;

    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("收到 Ctrl+C，取消当前任务...");
            signal_token.cancel();
        }
    });

    let jobs = manager.planned_jobs(&config.jobs);
    manager.provision(&jobs).await.context("准备桶失败")?;

    let results = manager.run_all(&jobs).await;

    let mut failed = 0;
    for (job, result) in jobs.iter().zip(&results) {
        match result {
            Ok(r) => info!(
                "✓ {} {}: {} bytes, {:.2}s, {:.2} MB/s, {} 个分片, 重试 {} 次, 端点 {}",
                r.direction,
                r.key,
                r.bytes_transferred,
                r.elapsed.as_secs_f64(),
                r.throughput_mbps(),
                r.chunk_count,
                r.total_retries,
                r.endpoint_url
            ),
            Err(e) => {
                failed += 1;
                error!("✗ {} {}: {}", job.direction, job.key, e);
            }
        }
    }

    let succeeded: Vec<TransferResult> = results
        .iter()
        .filter_map(|r| r.as_ref().ok().cloned())
        .collect();
    for c in endpoint_comparisons(&succeeded) {
        match c.speedup_percent() {
            Some(speedup) => info!(
                "[对比] {} {}: 直连 {:.2} MB/s, 加速 {:.2} MB/s ({:+.2}%)",
                c.direction, c.key, c.direct_mbps, c.accelerated_mbps, speedup
            ),
            None => info!(
                "[对比] {} {}: 直连 {:.2} MB/s, 加速 {:.2} MB/s",
                c.direction, c.key, c.direct_mbps, c.accelerated_mbps
            ),
        }
    }

    let deleted = manager.cleanup(&jobs).await;
    if deleted > 0 {
        info!("清理完成: 删除 {} 个对象", deleted);
    }

    let skipped = jobs.len() - results.len();
    info!(
        "全部结束: 成功 {}, 失败 {}, 跳过 {}",
        results.len() - failed,
        failed,
        skipped
    );

    if failed > 0 || skipped > 0 {
        anyhow::bail!("{} 个任务未成功完成", failed + skipped);
    }
    Ok(())
}
