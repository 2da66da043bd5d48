// 传输引擎
//
// 上传流程：
// 1. 确定数据源大小，小于阈值或只有一个分片时单次 PUT
// 2. 初始化分片上传，并发上传所有分片
// 3. 按分片号升序完成上传；任一分片失败或任务取消时取消分片上传
//
// 下载流程：
// 1. HEAD 获取对象大小，预分配目标文件
// 2. 并发按范围下载，每个分片写入自身偏移
// 3. 全部写入后校验大小；失败或取消时删除不完整文件

use crate::endpoint::Endpoint;
use crate::error::{Result, TransferError};
use crate::store::ObjectStore;
use crate::transfer::assembler::{DownloadAssembler, PartResult, UploadAssembler};
use crate::transfer::chunk::{use_multipart, ChunkManager};
use crate::transfer::dispatcher::{DispatchReport, Dispatcher};
use crate::transfer::io::{DownloadSink, UploadSource};
use crate::transfer::job::{Direction, TransferJob, TransferResult};
use crate::transfer::progress::{ProgressCallback, TransferProgress};
use crate::transfer::retry::call_with_retry;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 传输引擎
///
/// 持有共享的存储连接和取消令牌，每次调用执行一个任务
pub struct TransferEngine {
    store: Arc<dyn ObjectStore>,
    endpoint: Endpoint,
    cancel: CancellationToken,
    progress_callback: Option<ProgressCallback>,
}

impl TransferEngine {
    pub fn new(store: Arc<dyn ObjectStore>, endpoint: Endpoint, cancel: CancellationToken) -> Self {
        Self {
            store,
            endpoint,
            cancel,
            progress_callback: None,
        }
    }

    pub fn with_progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn progress(&self, job: &TransferJob, total: u64) -> Arc<TransferProgress> {
        Arc::new(
            TransferProgress::new(job.key.clone(), total)
                .with_callback(self.progress_callback.clone()),
        )
    }

    fn result(
        &self,
        job: &TransferJob,
        total: u64,
        started: Instant,
        chunk_count: usize,
        multipart: bool,
        report: DispatchReport,
    ) -> TransferResult {
        TransferResult {
            job_id: job.id.clone(),
            key: job.key.clone(),
            direction: job.direction,
            bytes_transferred: total,
            elapsed: started.elapsed(),
            chunk_retries: report.chunk_retries,
            total_retries: report.total_retries,
            chunk_count,
            multipart,
            endpoint_mode: self.endpoint.mode,
            endpoint_url: self.endpoint.base_url.clone(),
        }
    }

    /// 上传对象
    pub async fn upload(&self, job: &TransferJob, source: UploadSource) -> Result<TransferResult> {
        job.validate()?;
        if job.direction != Direction::Upload {
            return Err(TransferError::invalid_config("任务方向不是上传"));
        }

        let total = source.size().await?;
        if let Some(expected) = job.total_size {
            if expected != total {
                return Err(TransferError::invalid_config(format!(
                    "上传源大小 {} 与任务声明的 {} 不一致",
                    total, expected
                )));
            }
        }

        let started = Instant::now();
        let dispatcher = Dispatcher::new(job.concurrency, job.retry.clone(), self.cancel.clone())?;

        if !use_multipart(total, job.multipart_threshold, job.chunk_size) {
            info!(
                "[上传] {} 单次上传: {} bytes (阈值 {} bytes)",
                job.key, total, job.multipart_threshold
            );
            let report = self.upload_single(job, &dispatcher, source, total).await?;
            return Ok(self.result(job, total, started, 1, false, report));
        }

        let mut manager =
            ChunkManager::for_upload(total, job.chunk_size, self.store.min_part_size())?;
        let chunk_count = manager.chunk_count();

        let upload_id = call_with_retry(&job.retry, &self.cancel, "初始化分片上传", move || {
            self.store.create_multipart_upload(&job.key)
        })
        .await?;
        info!(
            "[上传] {} 分片上传: upload_id={}, {} 个分片, 分片大小 {} bytes",
            job.key, upload_id, chunk_count, job.chunk_size
        );

        let progress = self.progress(job, total);
        let mut assembler = UploadAssembler::new(chunk_count);

        let store = Arc::clone(&self.store);
        let key = job.key.clone();
        let id = upload_id.clone();
        let dispatched = dispatcher
            .run(
                &mut manager,
                |chunk| {
                    let store = Arc::clone(&store);
                    let source = source.clone();
                    let key = key.clone();
                    let upload_id = id.clone();
                    async move {
                        let body = source.read_range(chunk.range.clone()).await?;
                        store
                            .upload_part(&key, &upload_id, chunk.index as u32 + 1, body)
                            .await
                    }
                },
                |chunk, etag| {
                    assembler.record(PartResult {
                        index: chunk.index,
                        etag,
                        size: chunk.size(),
                    })?;
                    progress.add(chunk.size());
                    Ok(())
                },
            )
            .await;

        let finished = match dispatched {
            Ok(report) => self
                .finish_multipart(job, &upload_id, &assembler)
                .await
                .map(|_| report),
            Err(e) => Err(e),
        };

        match finished {
            Ok(report) => {
                let result = self.result(job, total, started, chunk_count, true, report);
                info!(
                    "[上传] {} 完成: {} bytes, 耗时 {:.2}s, {:.2} MB/s, 重试 {} 次",
                    job.key,
                    total,
                    result.elapsed.as_secs_f64(),
                    result.throughput_mbps(),
                    result.total_retries
                );
                Ok(result)
            }
            Err(e) => {
                error!("[上传] {} 失败: {}", job.key, e);
                self.abort_multipart(&job.key, &upload_id).await;
                Err(e)
            }
        }
    }

    async fn upload_single(
        &self,
        job: &TransferJob,
        dispatcher: &Dispatcher,
        source: UploadSource,
        total: u64,
    ) -> Result<DispatchReport> {
        let mut manager = ChunkManager::single(total);
        let progress = self.progress(job, total);
        let store = Arc::clone(&self.store);
        let key = job.key.clone();

        dispatcher
            .run(
                &mut manager,
                |chunk| {
                    let store = Arc::clone(&store);
                    let source = source.clone();
                    let key = key.clone();
                    async move {
                        let body = source.read_range(chunk.range.clone()).await?;
                        store.put_object(&key, body).await
                    }
                },
                |chunk, _etag| {
                    progress.add(chunk.size());
                    Ok(())
                },
            )
            .await
    }

    async fn finish_multipart(
        &self,
        job: &TransferJob,
        upload_id: &str,
        assembler: &UploadAssembler,
    ) -> Result<String> {
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let parts = assembler.completed_parts()?;
        let parts = parts.as_slice();
        call_with_retry(&job.retry, &self.cancel, "完成分片上传", move || {
            self.store.complete_multipart_upload(&job.key, upload_id, parts)
        })
        .await
    }

    /// 取消分片上传（失败只记录日志）
    async fn abort_multipart(&self, key: &str, upload_id: &str) {
        match self.store.abort_multipart_upload(key, upload_id).await {
            Ok(()) => info!("[上传] 已取消分片上传: upload_id={}", upload_id),
            Err(e) => warn!("[上传] 取消分片上传失败: upload_id={}, 错误: {}", upload_id, e),
        }
    }

    /// 下载对象
    pub async fn download(&self, job: &TransferJob, sink: DownloadSink) -> Result<TransferResult> {
        job.validate()?;
        if job.direction != Direction::Download {
            return Err(TransferError::invalid_config("任务方向不是下载"));
        }

        let started = Instant::now();
        let dispatcher = Dispatcher::new(job.concurrency, job.retry.clone(), self.cancel.clone())?;

        let meta = call_with_retry(&job.retry, &self.cancel, "获取对象信息", move || {
            self.store.head_object(&job.key)
        })
        .await?;
        let total = meta.size;
        if let Some(expected) = job.total_size {
            if expected != total {
                warn!(
                    "[下载] {} 对象大小 {} 与任务声明的 {} 不一致，按实际大小下载",
                    job.key, total, expected
                );
            }
        }

        let mut manager = ChunkManager::new(total, job.chunk_size)?;
        let chunk_count = manager.chunk_count();
        info!(
            "[下载] {}: {} bytes, {} 个分片, 并发数 {}",
            job.key, total, chunk_count, job.concurrency
        );

        let verified = match sink.prepare(total).await {
            Ok(()) => match self
                .download_chunks(job, &dispatcher, &mut manager, &sink, total)
                .await
            {
                Ok(report) => sink.verify(total).await.map(|_| report),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        match verified {
            Ok(report) => {
                let result = self.result(job, total, started, chunk_count, false, report);
                info!(
                    "[下载] {} 完成: {} bytes, 耗时 {:.2}s, {:.2} MB/s, 重试 {} 次",
                    job.key,
                    total,
                    result.elapsed.as_secs_f64(),
                    result.throughput_mbps(),
                    result.total_retries
                );
                Ok(result)
            }
            Err(e) => {
                error!("[下载] {} 失败: {}", job.key, e);
                sink.discard().await;
                Err(e)
            }
        }
    }

    async fn download_chunks(
        &self,
        job: &TransferJob,
        dispatcher: &Dispatcher,
        manager: &mut ChunkManager,
        sink: &DownloadSink,
        total: u64,
    ) -> Result<DispatchReport> {
        let progress = self.progress(job, total);
        let mut assembler = DownloadAssembler::new(manager.chunks());
        let store = Arc::clone(&self.store);
        let key = job.key.clone();

        let report = dispatcher
            .run(
                manager,
                |chunk| {
                    let store = Arc::clone(&store);
                    let sink = sink.clone();
                    let key = key.clone();
                    async move {
                        // 空对象不发请求
                        if chunk.size() == 0 {
                            return Ok(0);
                        }
                        let data = store.get_object_range(&key, chunk.range.clone()).await?;
                        DownloadAssembler::check_length(&chunk, data.len())?;
                        let written = data.len() as u64;
                        sink.write_at(chunk.offset(), data).await?;
                        Ok(written)
                    }
                },
                |chunk, written| {
                    assembler.record(chunk.index, written)?;
                    progress.add(written);
                    Ok(())
                },
            )
            .await?;

        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        assembler.finish()?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::RetryPolicy;
    use crate::config::StoreConfig;
    use crate::endpoint::{EndpointMode, EndpointSelector};
    use crate::store::{FaultRule, InMemoryStore, StoreCall, StoreOp};
    use std::time::Duration;
    use tempfile::TempDir;

    const MB: u64 = 1024 * 1024;

    fn endpoint() -> Endpoint {
        EndpointSelector::new(&StoreConfig {
            bucket: "test-bucket".to_string(),
            ..StoreConfig::default()
        })
        .select(EndpointMode::Direct)
        .unwrap()
    }

    fn engine(store: &Arc<InMemoryStore>) -> TransferEngine {
        TransferEngine::new(store.clone(), endpoint(), CancellationToken::new())
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn upload_job(chunk_size: u64, concurrency: usize) -> TransferJob {
        TransferJob::new("optimized-test/test.zip", Direction::Upload)
            .with_chunk_size(chunk_size)
            .with_multipart_threshold(chunk_size)
            .with_concurrency(concurrency)
            .with_retry(RetryPolicy::immediate(3))
    }

    fn download_job(chunk_size: u64, concurrency: usize) -> TransferJob {
        TransferJob::new("optimized-test/test.zip", Direction::Download)
            .with_chunk_size(chunk_size)
            .with_concurrency(concurrency)
            .with_retry(RetryPolicy::immediate(3))
    }

    fn has_complete(calls: &[StoreCall]) -> bool {
        calls.iter().any(|c| matches!(c, StoreCall::Complete(_)))
    }

    fn has_abort(calls: &[StoreCall]) -> bool {
        calls.iter().any(|c| matches!(c, StoreCall::Abort(_)))
    }

    #[tokio::test]
    async fn test_multipart_upload() {
        let store = Arc::new(InMemoryStore::new().with_latency(Duration::from_millis(2)));
        let data = pattern(1000);

        let result = engine(&store)
            .upload(&upload_job(100, 3), UploadSource::memory(data.clone()))
            .await
            .unwrap();

        assert!(result.multipart);
        assert_eq!(result.chunk_count, 10);
        assert_eq!(result.bytes_transferred, 1000);
        assert_eq!(result.chunk_retries, vec![0; 10]);
        assert_eq!(store.object("optimized-test/test.zip").unwrap(), data);
        assert!(store.max_in_flight() <= 3);

        let calls = store.calls();
        assert!(calls.contains(&StoreCall::Complete((1..=10).collect())));
        assert!(!has_abort(&calls));
    }

    #[tokio::test]
    async fn test_small_object_single_put() {
        let store = Arc::new(InMemoryStore::new());
        let job = upload_job(100, 3).with_multipart_threshold(1000);

        let result = engine(&store)
            .upload(&job, UploadSource::memory(pattern(500)))
            .await
            .unwrap();

        assert!(!result.multipart);
        assert_eq!(result.chunk_count, 1);
        let calls = store.calls();
        assert_eq!(calls, vec![StoreCall::Put("optimized-test/test.zip".to_string())]);
        assert_eq!(store.object("optimized-test/test.zip").unwrap(), pattern(500));
    }

    #[tokio::test]
    async fn test_upload_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.zip");
        std::fs::write(&path, pattern(2500)).unwrap();

        let store = Arc::new(InMemoryStore::new());
        let result = engine(&store)
            .upload(
                &upload_job(1000, 2).with_total_size(2500),
                UploadSource::file(&path),
            )
            .await
            .unwrap();

        assert_eq!(result.chunk_count, 3);
        assert_eq!(store.object("optimized-test/test.zip").unwrap(), pattern(2500));
    }

    #[tokio::test]
    async fn test_upload_part_retried_then_succeeds() {
        // K=3：分片号 2 失败 2 次
        let store = Arc::new(InMemoryStore::new());
        store.inject(FaultRule::throttle(StoreOp::UploadPart, Some(2), 2));

        let result = engine(&store)
            .upload(&upload_job(100, 2), UploadSource::memory(pattern(400)))
            .await
            .unwrap();

        assert_eq!(result.chunk_retries, vec![0, 2, 0, 0]);
        assert_eq!(result.total_retries, 2);
        assert_eq!(store.object("optimized-test/test.zip").unwrap(), pattern(400));
    }

    #[tokio::test]
    async fn test_upload_part_exhausts_attempts() {
        // K=3：分片号 2 失败 3 次
        let store = Arc::new(InMemoryStore::new());
        store.inject(FaultRule::network(StoreOp::UploadPart, Some(2), 3));

        let err = engine(&store)
            .upload(&upload_job(100, 2), UploadSource::memory(pattern(400)))
            .await
            .unwrap_err();

        assert_eq!(err.chunk_index(), Some(1));
        let calls = store.calls();
        assert!(!has_complete(&calls));
        assert!(has_abort(&calls));
        assert_eq!(store.pending_uploads(), 0);
        assert!(store.object("optimized-test/test.zip").is_none());
    }

    #[tokio::test]
    async fn test_upload_permanent_failure_aborts() {
        let store = Arc::new(InMemoryStore::new());
        store.inject(FaultRule::forbidden(StoreOp::UploadPart, Some(3)));

        let err = engine(&store)
            .upload(&upload_job(100, 1), UploadSource::memory(pattern(500)))
            .await
            .unwrap_err();

        assert_eq!(err.chunk_index(), Some(2));
        assert!(matches!(err.root(), TransferError::PermanentRequest { status: Some(403), .. }));
        // 不可重试：分片号 3 只请求一次
        let part3 = store
            .calls()
            .iter()
            .filter(|c| **c == StoreCall::UploadPart(3))
            .count();
        assert_eq!(part3, 1);
        assert!(has_abort(&store.calls()));
    }

    #[tokio::test]
    async fn test_upload_cancel_after_some_parts() {
        let store = Arc::new(InMemoryStore::new().with_latency(Duration::from_millis(5)));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let engine = TransferEngine::new(store.clone(), endpoint(), cancel).with_progress_callback(
            Arc::new(move |snapshot| {
                if snapshot.transferred >= 300 {
                    trigger.cancel();
                }
            }),
        );

        let err = engine
            .upload(&upload_job(100, 1), UploadSource::memory(pattern(1000)))
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::Cancelled));
        let calls = store.calls();
        assert!(!has_complete(&calls));
        assert!(has_abort(&calls));
        let parts = calls
            .iter()
            .filter(|c| matches!(c, StoreCall::UploadPart(_)))
            .count();
        assert!(parts < 10);
        assert_eq!(store.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn test_download_hundred_mb_with_two_workers() {
        let store = Arc::new(InMemoryStore::new().with_latency(Duration::from_millis(1)));
        let size = (100 * MB) as usize;
        store.insert_object("optimized-test/test.zip", pattern(size));

        let (sink, buffer) = DownloadSink::memory();
        let result = engine(&store)
            .download(&download_job(25 * MB, 2), sink)
            .await
            .unwrap();

        assert_eq!(result.chunk_count, 4);
        assert_eq!(result.bytes_transferred, 100 * MB);
        assert_eq!(store.max_in_flight(), 2);

        let buffer = buffer.lock();
        assert_eq!(buffer.len(), size);
        assert!(buffer.iter().enumerate().all(|(i, b)| *b == (i % 251) as u8));
    }

    #[tokio::test]
    async fn test_download_to_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("downloaded.zip");
        let store = Arc::new(InMemoryStore::new().with_latency(Duration::from_millis(1)));
        store.insert_object("optimized-test/test.zip", pattern(1050));

        let result = engine(&store)
            .download(&download_job(100, 4), DownloadSink::file(&path))
            .await
            .unwrap();

        assert_eq!(result.chunk_count, 11);
        assert_eq!(std::fs::read(&path).unwrap(), pattern(1050));
        assert!(store.max_in_flight() <= 4);
    }

    #[tokio::test]
    async fn test_download_empty_object() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.bin");
        let store = Arc::new(InMemoryStore::new());
        store.insert_object("optimized-test/test.zip", Vec::new());

        let result = engine(&store)
            .download(&download_job(100, 4), DownloadSink::file(&path))
            .await
            .unwrap();

        assert_eq!(result.chunk_count, 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
        assert!(!store
            .calls()
            .iter()
            .any(|c| matches!(c, StoreCall::GetRange(_))));
    }

    #[tokio::test]
    async fn test_download_retries_then_succeeds() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_object("optimized-test/test.zip", pattern(300));
        store.inject(FaultRule::throttle(StoreOp::GetRange, Some(100), 2));
        store.inject(FaultRule::network(StoreOp::Head, None, 1));

        let (sink, buffer) = DownloadSink::memory();
        let result = engine(&store)
            .download(&download_job(100, 3), sink)
            .await
            .unwrap();

        assert_eq!(result.chunk_retries, vec![0, 2, 0]);
        assert_eq!(*buffer.lock(), pattern(300));
    }

    #[tokio::test]
    async fn test_download_failure_removes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("downloaded.zip");
        let store = Arc::new(InMemoryStore::new());
        store.insert_object("optimized-test/test.zip", pattern(300));
        store.inject(FaultRule::network(StoreOp::GetRange, Some(200), 3));

        let err = engine(&store)
            .download(&download_job(100, 3), DownloadSink::file(&path))
            .await
            .unwrap_err();

        assert_eq!(err.chunk_index(), Some(2));
        assert!(err.is_transient());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_download_missing_object() {
        let store = Arc::new(InMemoryStore::new());
        let (sink, _) = DownloadSink::memory();
        let err = engine(&store)
            .download(&download_job(100, 3), sink)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::PermanentRequest { status: Some(404), .. }));
        // 不可重试：只请求一次
        assert_eq!(store.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_download_cancel_removes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("downloaded.zip");
        let store = Arc::new(InMemoryStore::new().with_latency(Duration::from_millis(5)));
        store.insert_object("optimized-test/test.zip", pattern(1000));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let engine = TransferEngine::new(store.clone(), endpoint(), cancel).with_progress_callback(
            Arc::new(move |snapshot| {
                if snapshot.transferred >= 200 {
                    trigger.cancel();
                }
            }),
        );

        let err = engine
            .download(&download_job(100, 1), DownloadSink::file(&path))
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::Cancelled));
        assert!(!path.exists());
        let ranges = store
            .calls()
            .iter()
            .filter(|c| matches!(c, StoreCall::GetRange(_)))
            .count();
        assert!(ranges < 10);
    }

    #[tokio::test]
    async fn test_upload_parts_below_store_minimum_rejected() {
        let store = Arc::new(InMemoryStore::new().with_min_part_size(5 * MB));

        let err = engine(&store)
            .upload(&upload_job(MB, 2), UploadSource::memory(pattern((3 * MB) as usize)))
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::InvalidConfiguration(_)));
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_download_prepare_failure_is_partial_write() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();
        let store = Arc::new(InMemoryStore::new());
        store.insert_object("optimized-test/test.zip", pattern(300));

        let err = engine(&store)
            .download(&download_job(100, 2), DownloadSink::file(blocker.join("out.bin")))
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::PartialWrite(_)));
        assert!(!store
            .calls()
            .iter()
            .any(|c| matches!(c, StoreCall::GetRange(_))));
    }

    #[tokio::test]
    async fn test_download_write_failure_is_partial_write() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("nested");
        let path = nested.join("downloaded.zip");
        let store = Arc::new(InMemoryStore::new().with_latency(Duration::from_millis(1)));
        store.insert_object("optimized-test/test.zip", pattern(500));

        // 第一个分片写入后删除目标目录
        let removed = nested.clone();
        let engine = TransferEngine::new(store.clone(), endpoint(), CancellationToken::new())
            .with_progress_callback(Arc::new(move |snapshot| {
                if snapshot.transferred >= 100 {
                    std::fs::remove_dir_all(&removed).ok();
                }
            }));

        let err = engine
            .download(&download_job(100, 1), DownloadSink::file(&path))
            .await
            .unwrap_err();

        assert!(matches!(err.root(), TransferError::PartialWrite(_)));
        assert!(!err.is_transient());
        assert!(!path.exists());
        // 写入失败不重试
        let ranges = store
            .calls()
            .iter()
            .filter(|c| matches!(c, StoreCall::GetRange(_)))
            .count();
        assert_eq!(ranges, 2);
    }

    #[tokio::test]
    async fn test_wrong_direction_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let (sink, _) = DownloadSink::memory();
        let err = engine(&store)
            .download(&upload_job(100, 1), sink)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidConfiguration(_)));
        assert!(store.calls().is_empty());
    }
}
