// 配置管理模块

use crate::endpoint::EndpointMode;
use crate::error::{Result, TransferError};
use crate::store::{Credentials, MIN_PART_SIZE};
use crate::transfer::{Direction, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

const MB: u64 = 1024 * 1024;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
    /// 对象存储配置
    #[serde(default)]
    pub store: StoreConfig,
    /// 传输配置
    #[serde(default)]
    pub transfer: TransferConfig,
    /// 运行流程配置
    #[serde(default)]
    pub run: RunConfig,
    /// 待执行的传输任务
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 对象存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// 桶名称
    #[serde(default)]
    pub bucket: String,
    /// 区域
    #[serde(default = "default_region")]
    pub region: String,
    /// 自定义 endpoint（MinIO 等兼容存储），设置后使用路径寻址
    #[serde(default)]
    pub endpoint: Option<String>,
    /// 是否使用双栈端点
    #[serde(default)]
    pub dualstack: bool,
    /// 访问密钥，未配置时读取 AWS_ACCESS_KEY_ID
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default)]
    pub session_token: Option<String>,
    /// 连接超时（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// 单次请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    300
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            region: default_region(),
            endpoint: None,
            dualstack: false,
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl StoreConfig {
    /// 获取访问凭证
    ///
    /// 优先使用配置文件，其次读取环境变量；都没有时返回 None（匿名访问）
    pub fn credentials(&self) -> Option<Credentials> {
        let from_config = match (&self.access_key_id, &self.secret_access_key) {
            (Some(id), Some(secret)) => Some(Credentials {
                access_key_id: id.clone(),
                secret_access_key: secret.clone(),
                session_token: self.session_token.clone(),
            }),
            _ => None,
        };

        from_config.or_else(|| {
            let id = std::env::var("AWS_ACCESS_KEY_ID").ok()?;
            let secret = std::env::var("AWS_SECRET_ACCESS_KEY").ok()?;
            Some(Credentials {
                access_key_id: id,
                secret_access_key: secret,
                session_token: std::env::var("AWS_SESSION_TOKEN").ok(),
            })
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// 传输配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// 分片大小 (MB)
    #[serde(default = "default_chunk_size_mb")]
    pub chunk_size_mb: u64,
    /// 分片上传阈值 (MB)，小于该大小的对象单次 PUT
    #[serde(default = "default_multipart_threshold_mb")]
    pub multipart_threshold_mb: u64,
    /// 上传并发分片数
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,
    /// 下载并发分片数
    #[serde(default = "default_download_concurrency")]
    pub download_concurrency: usize,
    /// 默认端点模式
    #[serde(default)]
    pub endpoint_mode: EndpointMode,
    /// 重试配置
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_chunk_size_mb() -> u64 {
    25
}

fn default_multipart_threshold_mb() -> u64 {
    25
}

fn default_upload_concurrency() -> usize {
    15
}

fn default_download_concurrency() -> usize {
    20
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size_mb: default_chunk_size_mb(),
            multipart_threshold_mb: default_multipart_threshold_mb(),
            upload_concurrency: default_upload_concurrency(),
            download_concurrency: default_download_concurrency(),
            endpoint_mode: EndpointMode::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl TransferConfig {
    pub fn chunk_size_bytes(&self) -> u64 {
        self.chunk_size_mb.saturating_mul(MB)
    }

    pub fn multipart_threshold_bytes(&self) -> u64 {
        self.multipart_threshold_mb.saturating_mul(MB)
    }

    /// 按方向获取并发数
    pub fn concurrency_for(&self, direction: Direction) -> usize {
        match direction {
            Direction::Upload => self.upload_concurrency,
            Direction::Download => self.download_concurrency,
        }
    }

    /// 所有方向中最大的并发数（用于确定连接池大小）
    pub fn max_concurrency(&self) -> usize {
        self.upload_concurrency.max(self.download_concurrency)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size_mb == 0 {
            return Err(TransferError::invalid_config("chunk_size_mb 必须大于 0"));
        }
        if self.chunk_size_bytes() < MIN_PART_SIZE {
            return Err(TransferError::invalid_config(format!(
                "chunk_size_mb = {} 小于分片上传下限 {} MB",
                self.chunk_size_mb,
                MIN_PART_SIZE / MB
            )));
        }
        if self.upload_concurrency == 0 || self.download_concurrency == 0 {
            return Err(TransferError::invalid_config("并发数必须大于 0"));
        }
        self.retry.to_policy().validate()
    }
}

/// 重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 单个分片最大尝试次数
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// 初始退避延迟（毫秒）
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// 最大退避延迟（毫秒）
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// 限流时最小等待（毫秒）
    #[serde(default = "default_throttle_delay_ms")]
    pub throttle_delay_ms: u64,
    /// 全局重试预算
    #[serde(default)]
    pub max_total_retries: Option<u32>,
    /// 是否启用随机抖动
    #[serde(default = "default_jitter")]
    pub jitter: bool,
    /// 抖动随机数种子
    #[serde(default)]
    pub jitter_seed: Option<u64>,
}

fn default_max_attempts() -> u32 {
    crate::transfer::retry::DEFAULT_MAX_ATTEMPTS
}

fn default_base_delay_ms() -> u64 {
    crate::transfer::retry::DEFAULT_BASE_DELAY_MS
}

fn default_max_delay_ms() -> u64 {
    crate::transfer::retry::DEFAULT_MAX_DELAY_MS
}

fn default_throttle_delay_ms() -> u64 {
    crate::transfer::retry::DEFAULT_THROTTLE_DELAY_MS
}

fn default_jitter() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            throttle_delay_ms: default_throttle_delay_ms(),
            max_total_retries: None,
            jitter: default_jitter(),
            jitter_seed: None,
        }
    }
}

impl RetryConfig {
    /// 转换为重试策略
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            throttle_delay: Duration::from_millis(self.throttle_delay_ms),
            max_total_retries: self.max_total_retries,
            jitter: self.jitter,
            jitter_seed: self.jitter_seed,
        }
    }
}

/// 运行流程配置
///
/// 任务开始前准备桶，结束后清理上传的对象
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// 创建桶，有加速任务时开启传输加速
    #[serde(default)]
    pub provision_bucket: bool,
    /// 开启加速后的等待时间（秒），等待配置生效
    #[serde(default = "default_acceleration_wait_secs")]
    pub acceleration_wait_secs: u64,
    /// 每个任务分别以直连和加速端点各执行一次
    #[serde(default)]
    pub compare_endpoints: bool,
    /// 结束后删除上传任务写入的对象
    #[serde(default)]
    pub cleanup: bool,
    /// 清理时同时删除桶
    #[serde(default)]
    pub delete_bucket: bool,
}

fn default_acceleration_wait_secs() -> u64 {
    10
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            provision_bucket: false,
            acceleration_wait_secs: default_acceleration_wait_secs(),
            compare_endpoints: false,
            cleanup: false,
            delete_bucket: false,
        }
    }
}

impl RunConfig {
    pub fn acceleration_wait(&self) -> Duration {
        Duration::from_secs(self.acceleration_wait_secs)
    }
}

/// 单个传输任务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// 传输方向
    pub direction: Direction,
    /// 对象 key
    pub key: String,
    /// 本地文件路径（上传源 / 下载目标）
    pub local_path: PathBuf,
    /// 覆盖默认端点模式
    #[serde(default)]
    pub endpoint_mode: Option<EndpointMode>,
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).await?;

        let config: AppConfig = toml::from_str(&content).map_err(|e| {
            TransferError::invalid_config(format!("解析配置文件失败 {:?}: {}", path, e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)
            .map_err(|e| TransferError::Internal(format!("序列化配置失败: {}", e)))?;

        // 确保父目录存在
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        fs::write(path, content).await?;
        tracing::info!("✓ 配置已保存: {:?}", path);
        Ok(())
    }

    /// 加载配置，失败时使用默认配置
    pub async fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {:?}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {}", e);
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.transfer.validate()?;
        if self.run.delete_bucket && !self.run.cleanup {
            return Err(TransferError::invalid_config("delete_bucket 需要同时开启 cleanup"));
        }
        for job in &self.jobs {
            if job.key.trim_matches('/').is_empty() {
                return Err(TransferError::invalid_config("任务的对象 key 不能为空"));
            }
        }
        Ok(())
    }
}
