// 传输错误定义
//
// 错误分类：
// - InvalidConfiguration：配置错误，立即失败
// - TransientTransport：网络/超时/限流/5xx，按退避策略重试
// - PermanentRequest：鉴权/不存在/其他4xx，立即失败并触发清理
// - PartialWrite：下载组装失败，立即失败并删除不完整文件

use thiserror::Error;

pub type Result<T, E = TransferError> = std::result::Result<T, E>;

/// 请求错误类型（由对象存储实现负责归类）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestErrorKind {
    /// 网络错误（可重试）
    Network,
    /// 超时（可重试）
    Timeout,
    /// 限流（可重试，需要更长等待时间）
    Throttled,
    /// 服务器错误（可重试）
    ServerError,
    /// 未认证（不可重试）
    Unauthorized,
    /// 权限不足（不可重试）
    Forbidden,
    /// 对象或上传不存在（不可重试）
    NotFound,
    /// 参数错误（不可重试）
    BadRequest,
    /// 未知错误
    Unknown,
}

impl RequestErrorKind {
    /// 是否可重试
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            RequestErrorKind::Network
                | RequestErrorKind::Timeout
                | RequestErrorKind::Throttled
                | RequestErrorKind::ServerError
        )
    }

    /// 从 HTTP 状态码转换
    pub fn from_status(status: u16) -> Self {
        match status {
            408 => RequestErrorKind::Timeout,
            429 | 503 => RequestErrorKind::Throttled,
            500 | 502 | 504 => RequestErrorKind::ServerError,
            401 => RequestErrorKind::Unauthorized,
            403 => RequestErrorKind::Forbidden,
            404 => RequestErrorKind::NotFound,
            400..=499 => RequestErrorKind::BadRequest,
            _ => RequestErrorKind::Unknown,
        }
    }

    /// 从 S3 错误码转换（部分错误以 200 响应体返回）
    pub fn from_s3_code(code: &str) -> Self {
        match code {
            "SlowDown" | "Throttling" | "ThrottlingException" | "RequestLimitExceeded" => {
                RequestErrorKind::Throttled
            }
            "InternalError" | "ServiceUnavailable" => RequestErrorKind::ServerError,
            "RequestTimeout" => RequestErrorKind::Timeout,
            "AccessDenied" | "SignatureDoesNotMatch" | "InvalidAccessKeyId" => {
                RequestErrorKind::Forbidden
            }
            "NoSuchKey" | "NoSuchBucket" | "NoSuchUpload" => RequestErrorKind::NotFound,
            "InvalidPart" | "InvalidPartOrder" | "EntityTooSmall" | "MalformedXML" => {
                RequestErrorKind::BadRequest
            }
            _ => RequestErrorKind::Unknown,
        }
    }
}

/// 传输引擎错误
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("配置无效: {0}")]
    InvalidConfiguration(String),

    #[error("传输错误（可重试, {kind:?}）: {message}")]
    TransientTransport {
        kind: RequestErrorKind,
        message: String,
    },

    #[error("请求失败（不可重试, {kind:?}, status={status:?}）: {message}")]
    PermanentRequest {
        kind: RequestErrorKind,
        status: Option<u16>,
        message: String,
    },

    #[error("写入目标失败: {0}")]
    PartialWrite(String),

    #[error("传输已取消")]
    Cancelled,

    #[error("全局重试预算已耗尽 ({used}/{budget})")]
    RetryBudgetExhausted { used: u32, budget: u32 },

    /// 携带出错分片上下文的错误
    #[error("分片 #{index} 失败 (尝试 {attempts} 次): {source}")]
    Chunk {
        index: usize,
        attempts: u32,
        #[source]
        source: Box<TransferError>,
    },

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl TransferError {
    /// 按错误类型构造请求错误（可重试 -> TransientTransport，否则 PermanentRequest）
    pub fn request(kind: RequestErrorKind, status: Option<u16>, message: impl Into<String>) -> Self {
        let message = message.into();
        if kind.is_retriable() {
            TransferError::TransientTransport { kind, message }
        } else {
            TransferError::PermanentRequest {
                kind,
                status,
                message,
            }
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        TransferError::InvalidConfiguration(message.into())
    }

    /// 附加分片上下文（已带上下文的错误不再重复包装）
    pub fn in_chunk(self, index: usize, attempts: u32) -> Self {
        match self {
            TransferError::Chunk { .. } | TransferError::Cancelled => self,
            other => TransferError::Chunk {
                index,
                attempts,
                source: Box::new(other),
            },
        }
    }

    /// 去掉分片上下文后的原始错误
    pub fn root(&self) -> &TransferError {
        match self {
            TransferError::Chunk { source, .. } => source.root(),
            other => other,
        }
    }

    /// 是否可由重试控制器恢复
    pub fn is_transient(&self) -> bool {
        matches!(self.root(), TransferError::TransientTransport { .. })
    }

    /// 是否为限流错误
    pub fn is_throttling(&self) -> bool {
        matches!(
            self.root(),
            TransferError::TransientTransport {
                kind: RequestErrorKind::Throttled,
                ..
            }
        )
    }

    /// 出错分片索引（如果有）
    pub fn chunk_index(&self) -> Option<usize> {
        match self {
            TransferError::Chunk { index, .. } => Some(*index),
            _ => None,
        }
    }
}
