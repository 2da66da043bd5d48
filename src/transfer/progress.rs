use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// 默认进度输出间隔
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// 进度快照
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub transferred: u64,
    pub total: u64,
    pub elapsed: Duration,
}

impl ProgressSnapshot {
    /// 完成百分比
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.transferred as f64 / self.total as f64 * 100.0
    }

    /// 平均速度 (MB/s)
    pub fn speed_mbps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.transferred as f64 / 1024.0 / 1024.0 / secs
    }
}

pub type ProgressCallback = Arc<dyn Fn(ProgressSnapshot) + Send + Sync>;

/// 传输进度
///
/// 分片完成时累加字节数，按间隔节流输出日志
pub struct TransferProgress {
    key: String,
    total: u64,
    transferred: AtomicU64,
    started: Instant,
    last_report: Mutex<Option<Instant>>,
    interval: Duration,
    callback: Option<ProgressCallback>,
}

impl TransferProgress {
    pub fn new(key: impl Into<String>, total: u64) -> Self {
        Self {
            key: key.into(),
            total,
            transferred: AtomicU64::new(0),
            started: Instant::now(),
            last_report: Mutex::new(None),
            interval: DEFAULT_REPORT_INTERVAL,
            callback: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_callback(mut self, callback: Option<ProgressCallback>) -> Self {
        self.callback = callback;
        self
    }

    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            transferred: self.transferred(),
            total: self.total,
            elapsed: self.started.elapsed(),
        }
    }

    /// 累加已传输字节
    pub fn add(&self, bytes: u64) {
        let transferred = self.transferred.fetch_add(bytes, Ordering::SeqCst) + bytes;
        let snapshot = ProgressSnapshot {
            transferred,
            total: self.total,
            elapsed: self.started.elapsed(),
        };

        if let Some(callback) = &self.callback {
            callback(snapshot);
        }

        let due = {
            let mut last = self.last_report.lock();
            let now = Instant::now();
            let due = transferred >= self.total
                || last.map_or(true, |t| now.duration_since(t) >= self.interval);
            if due {
                *last = Some(now);
            }
            due
        };

        if due {
            info!(
                "[{}] progress: {}/{} bytes ({:.1}%) - {:.2} MB/s",
                self.key,
                snapshot.transferred,
                snapshot.total,
                snapshot.percent(),
                snapshot.speed_mbps()
            );
        }
    }
}

impl std::fmt::Debug for TransferProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferProgress")
            .field("key", &self.key)
            .field("total", &self.total)
            .field("transferred", &self.transferred())
            .finish()
    }
}
