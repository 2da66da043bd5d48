// 传输管理器
//
// 把配置中的任务解析为 TransferJob，任务开始时选定端点并建立连接，
// 各任务之间不共享状态（共享的只有 HTTP 连接池）
//
// 可选流程：开始前创建桶并开启传输加速，按两种端点对比执行，结束后清理对象

use crate::config::{AppConfig, JobConfig, RunConfig, StoreConfig, TransferConfig};
use crate::endpoint::{Endpoint, EndpointMode, EndpointSelector};
use crate::error::{Result, TransferError};
use crate::store::{Credentials, ObjectStore, S3Client};
use crate::transfer::engine::TransferEngine;
use crate::transfer::io::{DownloadSink, UploadSource};
use crate::transfer::job::{Direction, TransferJob, TransferResult};
use crate::transfer::progress::ProgressCallback;
use crate::transfer::retry::call_with_retry;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 按端点创建存储连接
pub trait StoreConnector: Send + Sync {
    fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn ObjectStore>>;
}

/// 基于共享 reqwest::Client 的 S3 连接
#[derive(Debug, Clone)]
pub struct HttpConnector {
    client: reqwest::Client,
    credentials: Option<Credentials>,
}

impl HttpConnector {
    pub fn new(client: reqwest::Client, credentials: Option<Credentials>) -> Self {
        Self {
            client,
            credentials,
        }
    }
}

impl StoreConnector for HttpConnector {
    fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn ObjectStore>> {
        Ok(Arc::new(S3Client::new(
            self.client.clone(),
            endpoint.clone(),
            self.credentials.clone(),
        )))
    }
}

/// 同一任务在直连和加速端点下的吞吐对比
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointComparison {
    pub direction: Direction,
    pub key: String,
    pub direct_mbps: f64,
    pub accelerated_mbps: f64,
}

impl EndpointComparison {
    /// 加速相对直连的提升百分比
    pub fn speedup_percent(&self) -> Option<f64> {
        (self.direct_mbps > 0.0)
            .then(|| (self.accelerated_mbps - self.direct_mbps) / self.direct_mbps * 100.0)
    }
}

/// 按方向和 key 配对直连与加速结果
pub fn endpoint_comparisons(results: &[TransferResult]) -> Vec<EndpointComparison> {
    let mut comparisons: Vec<EndpointComparison> = Vec::new();
    for direct in results
        .iter()
        .filter(|r| r.endpoint_mode == EndpointMode::Direct)
    {
        let seen = comparisons
            .iter()
            .any(|c| c.direction == direct.direction && c.key == direct.key);
        if seen {
            continue;
        }
        let accelerated = results.iter().find(|r| {
            r.endpoint_mode == EndpointMode::Accelerated
                && r.direction == direct.direction
                && r.key == direct.key
        });
        if let Some(accelerated) = accelerated {
            comparisons.push(EndpointComparison {
                direction: direct.direction,
                key: direct.key.clone(),
                direct_mbps: direct.throughput_mbps(),
                accelerated_mbps: accelerated.throughput_mbps(),
            });
        }
    }
    comparisons
}

/// 传输管理器
pub struct TransferManager {
    transfer: TransferConfig,
    run: RunConfig,
    selector: EndpointSelector,
    connector: Arc<dyn StoreConnector>,
    cancel: CancellationToken,
    progress_callback: Option<ProgressCallback>,
}

impl TransferManager {
    pub fn new(
        store: &StoreConfig,
        transfer: &TransferConfig,
        connector: Arc<dyn StoreConnector>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        transfer.validate()?;
        Ok(Self {
            transfer: transfer.clone(),
            run: RunConfig::default(),
            selector: EndpointSelector::new(store),
            connector,
            cancel,
            progress_callback: None,
        })
    }

    pub fn from_config(
        config: &AppConfig,
        connector: Arc<dyn StoreConnector>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        Ok(Self::new(&config.store, &config.transfer, connector, cancel)?
            .with_run_config(config.run.clone()))
    }

    pub fn with_run_config(mut self, run: RunConfig) -> Self {
        self.run = run;
        self
    }

    pub fn with_progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// 按配置生成传输任务
    pub fn job_for(&self, key: &str, direction: Direction) -> TransferJob {
        TransferJob::new(key.trim_start_matches('/'), direction)
            .with_chunk_size(self.transfer.chunk_size_bytes())
            .with_multipart_threshold(self.transfer.multipart_threshold_bytes())
            .with_concurrency(self.transfer.concurrency_for(direction))
            .with_endpoint_mode(self.transfer.endpoint_mode)
            .with_retry(self.transfer.retry.to_policy())
    }

    /// 端点只在任务开始时选择一次
    fn engine_for(&self, job: &TransferJob) -> Result<TransferEngine> {
        let endpoint = self.selector.select(job.endpoint_mode)?;
        let store = self.connector.connect(&endpoint)?;
        let engine = TransferEngine::new(store, endpoint, self.cancel.clone());
        Ok(match &self.progress_callback {
            Some(callback) => engine.with_progress_callback(Arc::clone(callback)),
            None => engine,
        })
    }

    pub async fn upload(&self, job: &TransferJob, source: UploadSource) -> Result<TransferResult> {
        self.engine_for(job)?.upload(job, source).await
    }

    pub async fn download(&self, job: &TransferJob, sink: DownloadSink) -> Result<TransferResult> {
        self.engine_for(job)?.download(job, sink).await
    }

    /// 执行配置中的单个任务
    pub async fn run_job(&self, config: &JobConfig) -> Result<TransferResult> {
        let mut job = self.job_for(&config.key, config.direction);
        if let Some(mode) = config.endpoint_mode {
            job = job.with_endpoint_mode(mode);
        }

        info!(
            "开始任务 {}: {} {} <-> {:?} (端点模式: {})",
            job.id, job.direction, job.key, config.local_path, job.endpoint_mode
        );

        match job.direction {
            Direction::Upload => {
                self.upload(&job, UploadSource::file(&config.local_path))
                    .await
            }
            Direction::Download => {
                self.download(&job, DownloadSink::file(&config.local_path))
                    .await
            }
        }
    }

    fn effective_mode(&self, job: &JobConfig) -> EndpointMode {
        job.endpoint_mode.unwrap_or(self.transfer.endpoint_mode)
    }

    /// 展开任务列表：开启端点对比时每个任务先直连、后加速各执行一次
    pub fn planned_jobs(&self, jobs: &[JobConfig]) -> Vec<JobConfig> {
        if !self.run.compare_endpoints {
            return jobs.to_vec();
        }
        jobs.iter()
            .flat_map(|job| {
                [EndpointMode::Direct, EndpointMode::Accelerated]
                    .into_iter()
                    .map(move |mode| JobConfig {
                        endpoint_mode: Some(mode),
                        ..job.clone()
                    })
            })
            .collect()
    }

    /// 准备桶：创建桶，有加速任务时开启传输加速并等待生效
    ///
    /// 桶级请求始终走直连端点
    pub async fn provision(&self, jobs: &[JobConfig]) -> Result<()> {
        if !self.run.provision_bucket {
            return Ok(());
        }

        let needs_accelerate = jobs
            .iter()
            .any(|job| self.effective_mode(job) == EndpointMode::Accelerated);
        if needs_accelerate {
            // 不支持加速的桶或端点在建桶前报错
            self.selector.select(EndpointMode::Accelerated)?;
        }

        let endpoint = self.selector.select(EndpointMode::Direct)?;
        let store = self.connector.connect(&endpoint)?;
        let store = store.as_ref();
        let policy = self.transfer.retry.to_policy();

        info!("创建桶: {}", endpoint.bucket);
        call_with_retry(&policy, &self.cancel, "创建桶", move || store.create_bucket()).await?;

        if needs_accelerate {
            info!("开启传输加速: {}", endpoint.bucket);
            call_with_retry(&policy, &self.cancel, "开启传输加速", move || {
                store.put_bucket_accelerate(true)
            })
            .await?;

            let wait = self.run.acceleration_wait();
            if !wait.is_zero() {
                info!("等待传输加速生效 ({:?})...", wait);
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }
        Ok(())
    }

    /// 删除上传任务写入的对象，返回成功删除的数量
    ///
    /// 任务取消后也会执行；失败只记录日志
    pub async fn cleanup(&self, jobs: &[JobConfig]) -> usize {
        if !self.run.cleanup {
            return 0;
        }

        let store = match self
            .selector
            .select(EndpointMode::Direct)
            .and_then(|endpoint| self.connector.connect(&endpoint))
        {
            Ok(store) => store,
            Err(e) => {
                warn!("清理失败，无法连接存储: {}", e);
                return 0;
            }
        };

        let mut keys: Vec<&str> = jobs
            .iter()
            .filter(|job| job.direction == Direction::Upload)
            .map(|job| job.key.trim_start_matches('/'))
            .collect();
        keys.sort_unstable();
        keys.dedup();

        let mut deleted = 0;
        for key in keys {
            match store.delete_object(key).await {
                Ok(()) => {
                    deleted += 1;
                    info!("已删除对象: {}", key);
                }
                Err(e) => warn!("删除对象失败: {}, 错误: {}", key, e),
            }
        }

        if self.run.delete_bucket {
            match store.delete_bucket().await {
                Ok(()) => info!("已删除桶"),
                Err(e) => warn!("删除桶失败: {}", e),
            }
        }
        deleted
    }

    /// 依次执行所有任务，取消后不再启动后续任务
    pub async fn run_all(&self, jobs: &[JobConfig]) -> Vec<Result<TransferResult>> {
        let mut results = Vec::with_capacity(jobs.len());
        for job in jobs {
            if self.cancel.is_cancelled() {
                info!("任务已取消，跳过剩余 {} 个任务", jobs.len() - results.len());
                break;
            }
            let result = self.run_job(job).await;
            if let Err(e) = &result {
                error!("任务失败 {}: {}", job.key, e);
            }
            results.push(result);
        }
        results
    }
}
