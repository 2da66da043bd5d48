// 重试与退避控制
//
// - 每个分片独立的尝试次数上限（max_attempts）
// - 可选的全局重试预算（max_total_retries），超出后整个任务中止
// - 指数退避 + 随机抖动，随机数可指定种子（测试可复现）
// - 限流错误至少等待 throttle_delay

use crate::error::TransferError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// 默认最大尝试次数
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// 初始退避延迟（毫秒）
pub const DEFAULT_BASE_DELAY_MS: u64 = 100;

/// 最大退避延迟（毫秒）
pub const DEFAULT_MAX_DELAY_MS: u64 = 20_000;

/// 限流时的最小等待时间（毫秒）
pub const DEFAULT_THROTTLE_DELAY_MS: u64 = 1_000;

/// 重试策略
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// 单个分片最大尝试次数（包含首次请求）
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub throttle_delay: Duration,
    /// 整个任务允许的重试总数，None 表示不限制
    pub max_total_retries: Option<u32>,
    /// 是否启用随机抖动
    pub jitter: bool,
    /// 抖动随机数种子，None 表示使用系统熵
    pub jitter_seed: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            throttle_delay: Duration::from_millis(DEFAULT_THROTTLE_DELAY_MS),
            max_total_retries: None,
            jitter: true,
            jitter_seed: None,
        }
    }
}

impl RetryPolicy {
    /// 不等待、不抖动的策略（测试用）
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            throttle_delay: Duration::ZERO,
            max_total_retries: None,
            jitter: false,
            jitter_seed: None,
        }
    }

    pub fn validate(&self) -> Result<(), TransferError> {
        if self.max_attempts == 0 {
            return Err(TransferError::invalid_config("max_attempts 必须大于 0"));
        }
        if self.base_delay > self.max_delay {
            return Err(TransferError::invalid_config(format!(
                "base_delay ({:?}) 不能大于 max_delay ({:?})",
                self.base_delay, self.max_delay
            )));
        }
        if self.throttle_delay > self.max_delay {
            return Err(TransferError::invalid_config(format!(
                "throttle_delay ({:?}) 不能大于 max_delay ({:?})",
                self.throttle_delay, self.max_delay
            )));
        }
        Ok(())
    }
}

/// 计算指数退避延迟
///
/// `attempt` 为刚刚失败的尝试序号（从 1 开始），`jitter` 取值 [0, 1]。
///
/// # 延迟序列（jitter = 1.0, base = 100ms）
/// - attempt=1: 100ms
/// - attempt=2: 200ms
/// - attempt=3: 400ms
/// - 最大: cap
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration, jitter: f64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32) as i32;
    let secs = base.as_secs_f64() * 2f64.powi(exponent) * jitter.clamp(0.0, 1.0);
    Duration::from_secs_f64(secs.min(cap.as_secs_f64()))
}

/// 放弃重试的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GiveUpReason {
    /// 不可重试的错误
    NotRetriable,
    /// 分片尝试次数已达上限
    AttemptsExhausted,
    /// 全局重试预算耗尽
    BudgetExhausted { used: u32, budget: u32 },
}

/// 重试决策
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp(GiveUpReason),
}

/// 重试控制器
///
/// 由调度循环独占，无需加锁
#[derive(Debug)]
pub struct RetryController {
    policy: RetryPolicy,
    rng: StdRng,
    total_retries: u32,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        let rng = match policy.jitter_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            policy,
            rng,
            total_retries: 0,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// 已消耗的重试次数
    pub fn total_retries(&self) -> u32 {
        self.total_retries
    }

    /// 根据错误和已尝试次数决定是否重试
    pub fn decide(&mut self, error: &TransferError, attempts: u32) -> RetryDecision {
        if !error.is_transient() {
            return RetryDecision::GiveUp(GiveUpReason::NotRetriable);
        }

        if attempts >= self.policy.max_attempts {
            return RetryDecision::GiveUp(GiveUpReason::AttemptsExhausted);
        }

        if let Some(budget) = self.policy.max_total_retries {
            if self.total_retries >= budget {
                return RetryDecision::GiveUp(GiveUpReason::BudgetExhausted {
                    used: self.total_retries,
                    budget,
                });
            }
        }

        self.total_retries += 1;

        let jitter = if self.policy.jitter {
            self.rng.gen::<f64>()
        } else {
            1.0
        };
        let mut delay = backoff_delay(
            attempts,
            self.policy.base_delay,
            self.policy.max_delay,
            jitter,
        );

        // 限流时使用更长的等待时间
        if error.is_throttling() {
            delay = delay
                .max(self.policy.throttle_delay)
                .min(self.policy.max_delay);
        }

        debug!(
            "重试决策: attempt={}, delay={:?}, total_retries={}",
            attempts, delay, self.total_retries
        );

        RetryDecision::Retry { delay }
    }
}

/// 带重试的单次请求（不分片的控制请求）
///
/// 退避等待期间响应取消
pub async fn call_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut call: F,
) -> Result<T, TransferError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransferError>>,
{
    let mut controller = RetryController::new(policy.clone());
    let mut attempt = 0;

    loop {
        attempt += 1;
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
            result = call() => result,
        };

        let e = match result {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        if matches!(e, TransferError::Cancelled) {
            return Err(e);
        }

        match controller.decide(&e, attempt) {
            RetryDecision::Retry { delay } => {
                warn!("{} 第 {} 次失败，{:?} 后重试: {}", what, attempt, delay, e);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            RetryDecision::GiveUp(reason) => {
                error!("{} 失败 (尝试 {} 次, {:?}): {}", what, attempt, reason, e);
                return Err(match reason {
                    GiveUpReason::BudgetExhausted { used, budget } => {
                        TransferError::RetryBudgetExhausted { used, budget }
                    }
                    _ => e,
                });
            }
        }
    }
}
