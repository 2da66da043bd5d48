use crate::endpoint::EndpointMode;
use crate::error::{Result, TransferError};
use crate::transfer::chunk::{DEFAULT_CHUNK_SIZE, DEFAULT_MULTIPART_THRESHOLD};
use crate::transfer::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// 传输方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upload,
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upload => write!(f, "upload"),
            Direction::Download => write!(f, "download"),
        }
    }
}

/// 传输任务
///
/// 创建后不可修改，引擎按此执行一次完整传输
#[derive(Debug, Clone)]
pub struct TransferJob {
    /// 任务ID
    pub id: String,
    /// 对象 key
    pub key: String,
    pub direction: Direction,
    /// 对象大小（上传时由数据源确定，下载时由 HEAD 确定）
    pub total_size: Option<u64>,
    /// 分片大小
    pub chunk_size: u64,
    /// 同时进行中的分片数上限
    pub concurrency: usize,
    pub endpoint_mode: EndpointMode,
    /// 达到该大小才使用分片上传
    pub multipart_threshold: u64,
    pub retry: RetryPolicy,
}

impl TransferJob {
    pub fn new(key: impl Into<String>, direction: Direction) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            key: key.into(),
            direction,
            total_size: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrency: match direction {
                Direction::Upload => 15,
                Direction::Download => 20,
            },
            endpoint_mode: EndpointMode::default(),
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_endpoint_mode(mut self, mode: EndpointMode) -> Self {
        self.endpoint_mode = mode;
        self
    }

    pub fn with_multipart_threshold(mut self, threshold: u64) -> Self {
        self.multipart_threshold = threshold;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_total_size(mut self, size: u64) -> Self {
        self.total_size = Some(size);
        self
    }

    /// 检查任务参数
    pub fn validate(&self) -> Result<()> {
        if self.key.trim_matches('/').is_empty() {
            return Err(TransferError::invalid_config("对象 key 不能为空"));
        }
        if self.chunk_size == 0 {
            return Err(TransferError::invalid_config("分片大小必须大于 0"));
        }
        if self.concurrency == 0 {
            return Err(TransferError::invalid_config("并发数必须大于 0"));
        }
        self.retry.validate()
    }
}

/// 传输结果
#[derive(Debug, Clone, Serialize)]
pub struct TransferResult {
    pub job_id: String,
    pub key: String,
    pub direction: Direction,
    pub bytes_transferred: u64,
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
    /// 每个分片的重试次数（按分片索引）
    pub chunk_retries: Vec<u32>,
    pub total_retries: u32,
    pub chunk_count: usize,
    /// 是否使用了分片上传
    pub multipart: bool,
    pub endpoint_mode: EndpointMode,
    pub endpoint_url: String,
}

impl TransferResult {
    /// 平均速度 (MB/s)
    pub fn throughput_mbps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.bytes_transferred as f64 / 1024.0 / 1024.0 / secs
    }
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}
