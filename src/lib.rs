// S3 Parallel Transfer Library
// S3 并行分片传输核心库

// 配置管理模块
pub mod config;

// 错误类型
pub mod error;

// 端点选择
pub mod endpoint;

// 日志系统
pub mod logging;

// 对象存储接口
pub mod store;

// 分片传输引擎
pub mod transfer;

// 导出常用类型
pub use config::AppConfig;
pub use endpoint::{Endpoint, EndpointMode, EndpointSelector};
pub use error::{RequestErrorKind, Result, TransferError};
pub use store::{InMemoryStore, ObjectStore, S3Client};
pub use transfer::{
    Direction, DownloadSink, RetryPolicy, TransferEngine, TransferJob, TransferManager,
    TransferResult, UploadSource,
};
