// 分片调度器
//
// - Semaphore 限制同时进行中的分片数，许可随请求任务一起释放
// - JoinSet 收集请求结果和重试定时器
// - 重试等待不占用并发许可
// - 每次派发前检查取消；进行中的请求通过 select! 响应取消

use crate::error::{Result, TransferError};
use crate::transfer::chunk::{Chunk, ChunkManager};
use crate::transfer::retry::{GiveUpReason, RetryController, RetryDecision, RetryPolicy};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 调度结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    /// 每个分片的重试次数
    pub chunk_retries: Vec<u32>,
    pub total_retries: u32,
}

enum Event<T> {
    /// 一次请求结束
    Finished {
        index: usize,
        attempt: u32,
        result: Result<T>,
    },
    /// 退避结束，分片可重新派发
    RetryReady(usize),
}

/// 分片调度器
#[derive(Debug, Clone)]
pub struct Dispatcher {
    concurrency: usize,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(concurrency: usize, retry: RetryPolicy, cancel: CancellationToken) -> Result<Self> {
        if concurrency == 0 {
            return Err(TransferError::invalid_config("并发数必须大于 0"));
        }
        retry.validate()?;
        Ok(Self {
            concurrency,
            retry,
            cancel,
        })
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// 执行所有分片
    ///
    /// `work` 为每次尝试生成一个请求；成功后在调度循环中调用 `on_complete`。
    /// 任一分片最终失败、全局重试预算耗尽或任务取消时，
    /// 等待所有进行中请求结束后返回错误
    pub async fn run<T, W, Fut, C>(
        &self,
        manager: &mut ChunkManager,
        mut work: W,
        mut on_complete: C,
    ) -> Result<DispatchReport>
    where
        T: Send + 'static,
        W: FnMut(Chunk) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        C: FnMut(&Chunk, T) -> Result<()>,
    {
        let chunk_count = manager.chunk_count();
        info!(
            "[调度] 开始传输 {} 个分片，并发数: {}",
            chunk_count, self.concurrency
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut join_set: JoinSet<Event<T>> = JoinSet::new();
        let mut pending: VecDeque<usize> = (0..chunk_count).collect();
        let mut controller = RetryController::new(self.retry.clone());

        loop {
            // 填满空闲许可
            while !pending.is_empty() && !self.cancel.is_cancelled() {
                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let Some(index) = pending.pop_front() else {
                    break;
                };

                let attempt = manager.begin_attempt(index)?;
                let chunk = manager
                    .get(index)
                    .cloned()
                    .ok_or_else(|| TransferError::Internal(format!("分片 #{} 不存在", index)))?;
                debug!("[调度] 派发分片 #{} (第 {} 次)", index, attempt);

                let request = work(chunk);
                let cancel = self.cancel.clone();
                join_set.spawn(async move {
                    let result = tokio::select! {
                        _ = cancel.cancelled() => Err(TransferError::Cancelled),
                        result = request => result,
                    };
                    drop(permit);
                    Event::Finished {
                        index,
                        attempt,
                        result,
                    }
                });
            }

            if self.cancel.is_cancelled() {
                return Err(self.cancelled(&mut join_set, manager).await);
            }

            if join_set.is_empty() {
                break;
            }

            let next = tokio::select! {
                _ = self.cancel.cancelled() => None,
                next = join_set.join_next() => next,
            };
            let Some(joined) = next else {
                return Err(self.cancelled(&mut join_set, manager).await);
            };

            let event = match joined {
                Ok(event) => event,
                Err(e) => {
                    error!("[调度] 分片任务异常: {}", e);
                    join_set.shutdown().await;
                    return Err(TransferError::Internal(format!("分片任务异常: {}", e)));
                }
            };

            match event {
                Event::RetryReady(index) => pending.push_back(index),
                Event::Finished {
                    index,
                    attempt,
                    result: Ok(value),
                } => {
                    manager.mark_completed(index)?;
                    let chunk = manager
                        .get(index)
                        .ok_or_else(|| TransferError::Internal(format!("分片 #{} 不存在", index)))?;
                    if let Err(e) = on_complete(chunk, value) {
                        error!("[调度] 分片 #{} 处理结果失败: {}", index, e);
                        join_set.shutdown().await;
                        return Err(e.in_chunk(index, attempt));
                    }
                    debug!(
                        "[调度] 分片 #{} 完成 ({}/{})",
                        index,
                        manager.completed_count(),
                        chunk_count
                    );
                }
                Event::Finished {
                    result: Err(TransferError::Cancelled),
                    ..
                } => {
                    return Err(self.cancelled(&mut join_set, manager).await);
                }
                Event::Finished {
                    index,
                    attempt,
                    result: Err(e),
                } => {
                    manager.mark_failed(index)?;

                    match controller.decide(&e, attempt) {
                        RetryDecision::Retry { delay } => {
                            warn!(
                                "[调度] 分片 #{} 第 {} 次失败，{:?} 后重试: {}",
                                index, attempt, delay, e
                            );
                            join_set.spawn(async move {
                                tokio::time::sleep(delay).await;
                                Event::RetryReady(index)
                            });
                        }
                        RetryDecision::GiveUp(reason) => {
                            error!(
                                "[调度] 分片 #{} 失败 (尝试 {} 次, {:?}): {}",
                                index, attempt, reason, e
                            );
                            join_set.shutdown().await;
                            return Err(match reason {
                                GiveUpReason::BudgetExhausted { used, budget } => {
                                    TransferError::RetryBudgetExhausted { used, budget }
                                }
                                GiveUpReason::NotRetriable | GiveUpReason::AttemptsExhausted => {
                                    e.in_chunk(index, attempt)
                                }
                            });
                        }
                    }
                }
            }
        }

        info!(
            "[调度] 所有 {} 个分片完成，重试 {} 次",
            chunk_count,
            controller.total_retries()
        );

        Ok(DispatchReport {
            chunk_retries: manager.retry_counts(),
            total_retries: controller.total_retries(),
        })
    }

    async fn cancelled<T: 'static>(
        &self,
        join_set: &mut JoinSet<Event<T>>,
        manager: &ChunkManager,
    ) -> TransferError {
        warn!(
            "[调度] 任务已取消，已完成 {}/{} 个分片",
            manager.completed_count(),
            manager.chunk_count()
        );
        join_set.shutdown().await;
        TransferError::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RequestErrorKind;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn transient() -> TransferError {
        TransferError::request(RequestErrorKind::ServerError, Some(500), "InternalError")
    }

    /// 按分片索引注入的失败次数
    #[derive(Clone, Default)]
    struct Script {
        failures: Arc<Mutex<HashMap<usize, (u32, bool)>>>,
    }

    impl Script {
        fn fail(&self, index: usize, times: u32, transient: bool) {
            self.failures.lock().insert(index, (times, transient));
        }

        fn next(&self, index: usize) -> Result<()> {
            let mut failures = self.failures.lock();
            match failures.get_mut(&index) {
                Some((times, retriable)) if *times > 0 => {
                    *times -= 1;
                    if *retriable {
                        Err(transient())
                    } else {
                        Err(TransferError::request(
                            RequestErrorKind::Forbidden,
                            Some(403),
                            "AccessDenied",
                        ))
                    }
                }
                _ => Ok(()),
            }
        }
    }

    fn dispatcher(concurrency: usize, max_attempts: u32) -> Dispatcher {
        Dispatcher::new(
            concurrency,
            RetryPolicy::immediate(max_attempts),
            CancellationToken::new(),
        )
        .unwrap()
    }

    async fn run_scripted(
        dispatcher: &Dispatcher,
        manager: &mut ChunkManager,
        script: &Script,
    ) -> Result<(DispatchReport, Vec<usize>)> {
        let mut completed = Vec::new();
        let report = dispatcher
            .run(
                manager,
                |chunk| {
                    let script = script.clone();
                    async move {
                        script.next(chunk.index)?;
                        Ok(chunk.size())
                    }
                },
                |chunk, size| {
                    assert_eq!(chunk.size(), size);
                    completed.push(chunk.index);
                    Ok(())
                },
            )
            .await?;
        Ok((report, completed))
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = Dispatcher::new(0, RetryPolicy::default(), CancellationToken::new()).unwrap_err();
        assert!(matches!(err, TransferError::InvalidConfiguration(_)));
    }

    #[tokio::test]
    async fn test_concurrency_bound() {
        let dispatcher = dispatcher(2, 1);
        let mut manager = ChunkManager::new(800, 100).unwrap();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let report = dispatcher
            .run(
                &mut manager,
                |_chunk| {
                    let in_flight = Arc::clone(&in_flight);
                    let peak = Arc::clone(&peak);
                    async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
                |_, _| Ok(()),
            )
            .await
            .unwrap();

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert!(manager.is_completed());
        assert_eq!(report.chunk_retries, vec![0; 8]);
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        // K=3：失败 2 次后成功
        let script = Script::default();
        script.fail(1, 2, true);
        let mut manager = ChunkManager::new(300, 100).unwrap();

        let (report, mut completed) = run_scripted(&dispatcher(2, 3), &mut manager, &script)
            .await
            .unwrap();
        completed.sort();
        assert_eq!(completed, vec![0, 1, 2]);
        assert_eq!(report.chunk_retries, vec![0, 2, 0]);
        assert_eq!(report.total_retries, 2);
    }

    #[tokio::test]
    async fn test_retry_budget_per_chunk_exhausted() {
        // K=3：连续失败 3 次
        let script = Script::default();
        script.fail(1, 3, true);
        let mut manager = ChunkManager::new(300, 100).unwrap();

        let err = run_scripted(&dispatcher(2, 3), &mut manager, &script)
            .await
            .unwrap_err();
        match err {
            TransferError::Chunk { index, attempts, ref source } => {
                assert_eq!(index, 1);
                assert_eq!(attempts, 3);
                assert!(source.is_transient());
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_permanent_error_fails_immediately() {
        let script = Script::default();
        script.fail(0, 1, false);
        let mut manager = ChunkManager::new(300, 100).unwrap();

        let err = run_scripted(&dispatcher(1, 10), &mut manager, &script)
            .await
            .unwrap_err();
        assert_eq!(err.chunk_index(), Some(0));
        assert!(!err.is_transient());
        assert_eq!(manager.get(0).unwrap().attempts(), 1);
    }

    #[tokio::test]
    async fn test_global_retry_budget() {
        let script = Script::default();
        script.fail(0, 2, true);
        script.fail(1, 2, true);
        let dispatcher = Dispatcher::new(
            1,
            RetryPolicy {
                max_total_retries: Some(3),
                ..RetryPolicy::immediate(10)
            },
            CancellationToken::new(),
        )
        .unwrap();
        let mut manager = ChunkManager::new(300, 100).unwrap();

        let err = run_scripted(&dispatcher, &mut manager, &script)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::RetryBudgetExhausted { used: 3, budget: 3 }
        ));
    }

    #[tokio::test]
    async fn test_retry_delay_does_not_hold_slot() {
        let script = Script::default();
        script.fail(0, 1, true);
        let dispatcher = Dispatcher::new(
            1,
            RetryPolicy {
                base_delay: Duration::from_millis(200),
                max_delay: Duration::from_millis(200),
                ..RetryPolicy::immediate(3)
            },
            CancellationToken::new(),
        )
        .unwrap();
        let mut manager = ChunkManager::new(400, 100).unwrap();

        let (_, completed) = run_scripted(&dispatcher, &mut manager, &script)
            .await
            .unwrap();
        // 分片 0 退避期间其他分片继续执行
        assert_eq!(completed, vec![1, 2, 3, 0]);
    }

    #[tokio::test]
    async fn test_cancel_stops_dispatch() {
        let cancel = CancellationToken::new();
        let dispatcher =
            Dispatcher::new(1, RetryPolicy::immediate(1), cancel.clone()).unwrap();
        let mut manager = ChunkManager::new(1000, 100).unwrap();
        let started = Arc::new(AtomicUsize::new(0));

        let err = dispatcher
            .run(
                &mut manager,
                |_chunk| {
                    let started = Arc::clone(&started);
                    async move {
                        started.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        Ok(())
                    }
                },
                |chunk, _| {
                    if chunk.index == 2 {
                        cancel.cancel();
                    }
                    Ok(())
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::Cancelled));
        assert_eq!(manager.completed_count(), 3);
        assert_eq!(started.load(Ordering::SeqCst), 3);
        assert!(!manager.is_completed());
    }

    #[tokio::test]
    async fn test_cancel_aborts_in_flight() {
        let cancel = CancellationToken::new();
        let dispatcher =
            Dispatcher::new(4, RetryPolicy::immediate(1), cancel.clone()).unwrap();
        let mut manager = ChunkManager::new(400, 100).unwrap();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = dispatcher
            .run(
                &mut manager,
                |_chunk| async move {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(())
                },
                |_, _| Ok(()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
        assert_eq!(manager.completed_count(), 0);
    }
}
